//! The subscribing half of component C. A `Subscriber` connects to N
//! publisher endpoints, filters incoming values by `(slaveID,
//! variableID)` interest, and exposes the `Update`/`Value`
//! synchronisation primitive described in §4.3.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::CoreResult;
use crate::model::{Endpoint, ScalarValue, StepID, Variable};
use crate::wire::pubsub_frame::PubSubFrameCodec;

type Incoming = (Variable, StepID, ScalarValue);

pub struct Subscriber {
    tx: mpsc::UnboundedSender<Incoming>,
    rx: mpsc::UnboundedReceiver<Incoming>,
    connections: Vec<JoinHandle<()>>,
    interest: HashSet<Variable>,
    /// Values not yet consumed by a successful `Update`. A variable's
    /// entry outlives `unsubscribe()` -- a message already buffered for
    /// a future step is never discarded just because interest in its
    /// variable later lapses (see `DESIGN.md`'s open-question note).
    buffers: HashMap<Variable, VecDeque<(StepID, ScalarValue)>>,
    /// Populated by the most recent successful (or partial) `update()`;
    /// cleared at the start of the next call, matching "`Value(v)`
    /// returns a reference valid until the next `Update`".
    filled: HashMap<Variable, ScalarValue>,
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriber {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            connections: Vec::new(),
            interest: HashSet::new(),
            buffers: HashMap::new(),
            filled: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, variable: Variable) {
        self.interest.insert(variable);
    }

    pub fn unsubscribe(&mut self, variable: Variable) {
        self.interest.remove(&variable);
        self.filled.remove(&variable);
    }

    /// Tears down every current publisher connection and opens fresh
    /// ones to `endpoints` (§4.9's `SET_PEERS`: "replacing previous
    /// connections wholesale").
    pub async fn set_peers(&mut self, endpoints: &[Endpoint]) -> CoreResult<()> {
        for handle in self.connections.drain(..) {
            handle.abort();
        }
        for endpoint in endpoints {
            let addr: SocketAddr = endpoint
                .address
                .parse()
                .map_err(|_| crate::error::ProtocolError::Violation(format!("bad endpoint address: {}", endpoint.address)))?;
            let stream = TcpStream::connect(addr)
                .await
                .map_err(crate::error::SystemError::Io)?;
            let tx = self.tx.clone();
            self.connections.push(tokio::spawn(read_loop(stream, addr, tx)));
        }
        Ok(())
    }

    /// Blocks (cooperatively) until every subscribed variable has a
    /// value for `target_step`, or `timeout` elapses first. Stale
    /// values (`stepID < target_step`) are discarded as they are
    /// encountered; values for a later step are left buffered.
    pub async fn update(&mut self, target_step: StepID, timeout: Duration) -> CoreResult<bool> {
        self.filled.clear();
        let deadline = Instant::now() + timeout;
        self.try_fill(target_step);
        loop {
            if self.is_fully_filled() {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some((variable, step, value))) => {
                    self.ingest(variable, step, value);
                    self.try_fill(target_step);
                }
                // Unreachable in practice: `self.tx` always holds a live
                // sender, so the channel never actually closes while the
                // subscriber itself is alive.
                Ok(None) => return Ok(false),
                Err(_) => return Ok(false),
            }
        }
    }

    pub fn value(&self, variable: Variable) -> Option<&ScalarValue> {
        self.filled.get(&variable)
    }

    fn ingest(&mut self, variable: Variable, step: StepID, value: ScalarValue) {
        if !self.interest.contains(&variable) && !self.buffers.contains_key(&variable) {
            return;
        }
        self.buffers.entry(variable).or_default().push_back((step, value));
    }

    fn try_fill(&mut self, target_step: StepID) {
        for &variable in &self.interest {
            if self.filled.contains_key(&variable) {
                continue;
            }
            let Some(buf) = self.buffers.get_mut(&variable) else {
                continue;
            };
            while matches!(buf.front(), Some((step, _)) if *step < target_step) {
                buf.pop_front();
            }
            if matches!(buf.front(), Some((step, _)) if *step == target_step) {
                let (_, value) = buf.pop_front().expect("front checked above");
                self.filled.insert(variable, value);
            }
        }
    }

    fn is_fully_filled(&self) -> bool {
        self.interest.iter().all(|v| self.filled.contains_key(v))
    }
}

async fn read_loop(stream: TcpStream, peer: SocketAddr, tx: mpsc::UnboundedSender<Incoming>) {
    let mut framed = Framed::new(stream, PubSubFrameCodec);
    while let Some(item) = framed.next().await {
        match item {
            Ok(message) => {
                if tx.send(message).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "pub/sub subscriber connection error");
                return;
            }
        }
    }
    debug!(%peer, "pub/sub publisher connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SlaveID;
    use crate::model::VariableID;
    use crate::pubsub::publisher::Publisher;

    #[tokio::test]
    async fn update_fills_exact_step_and_discards_stale() {
        let publisher = Publisher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut subscriber = Subscriber::new();
        let variable = Variable::new(SlaveID(1), VariableID(1));
        subscriber.subscribe(variable);
        subscriber
            .set_peers(&[Endpoint::tcp(publisher.local_addr().to_string())])
            .await
            .unwrap();
        // give the TCP connect/accept a moment to complete
        tokio::time::sleep(Duration::from_millis(20)).await;

        publisher.publish(StepID(0), variable, &ScalarValue::Real(1.0));
        publisher.publish(StepID(1), variable, &ScalarValue::Real(2.0));

        let ok = subscriber
            .update(StepID(1), Duration::from_millis(500))
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(subscriber.value(variable), Some(&ScalarValue::Real(2.0)));
    }

    #[tokio::test]
    async fn update_times_out_when_value_missing() {
        let mut subscriber = Subscriber::new();
        let variable = Variable::new(SlaveID(2), VariableID(1));
        subscriber.subscribe(variable);
        let ok = subscriber
            .update(StepID(0), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(!ok);
        assert!(subscriber.value(variable).is_none());
    }

    #[tokio::test]
    async fn future_value_is_buffered_for_later_update() {
        let publisher = Publisher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut subscriber = Subscriber::new();
        let variable = Variable::new(SlaveID(3), VariableID(1));
        subscriber.subscribe(variable);
        subscriber
            .set_peers(&[Endpoint::tcp(publisher.local_addr().to_string())])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        publisher.publish(StepID(1), variable, &ScalarValue::Integer(7));
        // Give the message time to arrive and be buffered as "future".
        tokio::time::sleep(Duration::from_millis(20)).await;
        let ok0 = subscriber
            .update(StepID(0), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!ok0);

        let ok1 = subscriber
            .update(StepID(1), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(ok1);
        assert_eq!(subscriber.value(variable), Some(&ScalarValue::Integer(7)));
    }
}
