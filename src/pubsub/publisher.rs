//! The publishing half of component C. A `Publisher` binds one TCP
//! endpoint and fans every `publish()` call out to whichever
//! subscribers happen to be connected at that moment -- it keeps no
//! subscriber list and no history, so a subscriber that connects late
//! simply misses everything published before it connected (§4.3
//! rationale: priming is the master's job via `ResendVars`, not the
//! publisher's).

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{CoreResult, SystemError};
use crate::model::{ScalarValue, StepID, Variable};
use crate::wire::pubsub_frame::encode_message;

/// Bounded so a publisher that wildly outpaces every subscriber cannot
/// grow memory without limit; a lagging subscriber drops the messages
/// it fell behind on rather than the publisher blocking or buffering
/// forever, matching the "no retained log" design.
const CHANNEL_CAPACITY: usize = 4096;

pub struct Publisher {
    tx: broadcast::Sender<Bytes>,
    local_addr: SocketAddr,
}

impl Publisher {
    pub async fn bind(addr: SocketAddr) -> CoreResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(SystemError::Io)?;
        let local_addr = listener.local_addr().map_err(SystemError::Io)?;
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        let accept_tx = tx.clone();
        tokio::spawn(accept_loop(listener, accept_tx));
        Ok(Self { tx, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Emits one message for `variable` at `step`. Returns immediately;
    /// delivery to any particular subscriber is best-effort.
    pub fn publish(&self, step: StepID, variable: Variable, value: &ScalarValue) {
        let message = encode_message(variable, step, value);
        // `send` only errors when there are no receivers at all, which is
        // an unremarkable state (no one has subscribed yet).
        let _ = self.tx.send(message);
    }
}

async fn accept_loop(listener: TcpListener, tx: broadcast::Sender<Bytes>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "pub/sub subscriber connected");
                tokio::spawn(serve_subscriber(stream, peer, tx.subscribe()));
            }
            Err(e) => {
                warn!(error = %e, "pub/sub publisher accept loop stopped");
                return;
            }
        }
    }
}

async fn serve_subscriber(mut stream: TcpStream, peer: SocketAddr, mut rx: broadcast::Receiver<Bytes>) {
    loop {
        match rx.recv().await {
            Ok(message) => {
                if let Err(e) = stream.write_all(&message).await {
                    debug!(%peer, error = %e, "pub/sub subscriber connection closed");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%peer, skipped, "pub/sub subscriber fell behind; skipped messages are not retransmitted");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SlaveID, VariableID};
    use crate::wire::pubsub_frame::decode_message;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn late_subscriber_misses_earlier_publishes() {
        let publisher = Publisher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let variable = Variable::new(SlaveID(1), VariableID(1));
        publisher.publish(StepID(0), variable, &ScalarValue::Real(1.0));

        // give the (nonexistent) subscriber a moment to have missed it
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let mut stream = TcpStream::connect(publisher.local_addr()).await.unwrap();
        publisher.publish(StepID(1), variable, &ScalarValue::Real(2.0));

        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let (_, step, value) = decode_message(Bytes::copy_from_slice(&buf[..n])).unwrap();
        assert_eq!(step, StepID(1));
        assert_eq!(value, ScalarValue::Real(2.0));
    }
}
