//! Component A: a single-threaded event loop multiplexing timers and raw
//! (UDP) sockets, dispatching to registered handlers one at a time.
//!
//! The "single-threaded" guarantee is literal here, not just a style
//! choice: a `Reactor` is always driven to completion by one call to
//! `run()` on one task, and every handler it invokes runs on that same
//! call stack, so no two handlers ever execute concurrently and no
//! synchronization is needed on state a `Reactor` owns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::error::{CoreResult, SystemError};

pub type TimerHandler = Box<dyn FnMut() -> CoreResult<()> + Send>;
pub type SocketHandler = Box<dyn FnMut(Vec<u8>, SocketAddr) -> CoreResult<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

enum Event {
    Timer(TimerId),
    Socket(SourceId, Vec<u8>, SocketAddr),
    SourceError(SourceId, std::io::Error),
}

struct TimerSlot {
    handler: TimerHandler,
    _task: JoinHandle<()>,
}

struct SocketSlot {
    handler: SocketHandler,
    _task: JoinHandle<()>,
}

/// The reactor's event loop. Construct one, register timers/sockets,
/// then call `run()`. Dropping the reactor aborts every producer task.
pub struct Reactor {
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    timers: HashMap<TimerId, TimerSlot>,
    sockets: HashMap<SourceId, SocketSlot>,
    next_timer_id: u64,
    next_source_id: u64,
    stop_flag: Arc<AtomicBool>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            timers: HashMap::new(),
            sockets: HashMap::new(),
            next_timer_id: 1,
            next_source_id: 1,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A cheap handle that can be used to `stop()` the reactor from
    /// outside of it (e.g. from another task that holds a clone).
    pub fn stopper(&self) -> ReactorStopper {
        ReactorStopper {
            flag: self.stop_flag.clone(),
        }
    }

    /// Registers a one-shot timer whose deadline can be pushed back from
    /// outside the reactor via the returned `TimerResetter`: every
    /// `reset()` moves the fire time to `now + interval` again. Used for
    /// inactivity timeouts, where the deadline must be extended by
    /// events (e.g. inbound messages) the reactor itself has no other
    /// reason to observe.
    pub fn register_timer_with_reset(
        &mut self,
        interval: Duration,
        handler: TimerHandler,
    ) -> (TimerId, TimerResetter) {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        let tx = self.tx.clone();
        let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<()>();
        let task = tokio::spawn(async move {
            let mut deadline = time::Instant::now() + interval;
            loop {
                tokio::select! {
                    () = time::sleep_until(deadline) => {
                        let _ = tx.send(Event::Timer(id));
                        return;
                    }
                    reset = reset_rx.recv() => {
                        match reset {
                            Some(()) => deadline = time::Instant::now() + interval,
                            None => return,
                        }
                    }
                }
            }
        });
        self.timers.insert(
            id,
            TimerSlot {
                handler,
                _task: task,
            },
        );
        (id, TimerResetter { tx: reset_tx })
    }

    /// Registers a timer. `remaining_fires = -1` repeats forever; a
    /// positive value fires that many times then auto-removes itself.
    /// Fires are scheduled at `previous_fire + interval`, not relative
    /// to handler completion, so a slow handler does not cause drift.
    pub fn register_timer(
        &mut self,
        interval: Duration,
        remaining_fires: i64,
        handler: TimerHandler,
    ) -> TimerId {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            ticker.tick().await; // first tick fires immediately; consume it
            let mut remaining = remaining_fires;
            loop {
                ticker.tick().await;
                if tx.send(Event::Timer(id)).is_err() {
                    return;
                }
                if remaining >= 0 {
                    remaining -= 1;
                    if remaining < 0 {
                        return;
                    }
                }
            }
        });
        self.timers.insert(
            id,
            TimerSlot {
                handler,
                _task: task,
            },
        );
        id
    }

    /// Removes a timer. Safe to call from inside a handler (including
    /// the handler of the timer being removed).
    pub fn remove_timer(&mut self, id: TimerId) {
        if let Some(slot) = self.timers.remove(&id) {
            slot._task.abort();
        }
    }

    /// Registers a bound UDP socket: every inbound datagram is
    /// delivered to `handler(payload, from)`.
    pub fn register_udp_socket(
        &mut self,
        socket: Arc<UdpSocket>,
        handler: SocketHandler,
    ) -> SourceId {
        let id = SourceId(self.next_source_id);
        self.next_source_id += 1;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        if tx.send(Event::Socket(id, buf[..n].to_vec(), from)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Event::SourceError(id, e));
                        return;
                    }
                }
            }
        });
        self.sockets.insert(
            id,
            SocketSlot {
                handler,
                _task: task,
            },
        );
        id
    }

    pub fn remove_socket(&mut self, id: SourceId) {
        if let Some(slot) = self.sockets.remove(&id) {
            slot._task.abort();
        }
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Drives the event loop until `stop()` is called or a handler
    /// returns an error (which propagates out of `run()` and ends the
    /// loop -- the reactor does not catch handler errors).
    pub async fn run(&mut self) -> CoreResult<()> {
        self.stop_flag.store(false, Ordering::SeqCst);
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                return Ok(());
            }
            let Some(event) = self.rx.recv().await else {
                return Ok(());
            };
            match event {
                Event::Timer(id) => {
                    if let Some(slot) = self.timers.get_mut(&id) {
                        (slot.handler)()?;
                    }
                }
                Event::Socket(id, payload, from) => {
                    if let Some(slot) = self.sockets.get_mut(&id) {
                        (slot.handler)(payload, from)?;
                    }
                }
                Event::SourceError(id, err) => {
                    self.sockets.remove(&id);
                    return Err(SystemError::Io(err).into());
                }
            }
            if self.stop_flag.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }
}

/// A handle that can request a running `Reactor` to stop from outside
/// of its own handlers.
#[derive(Clone)]
pub struct ReactorStopper {
    flag: Arc<AtomicBool>,
}

impl ReactorStopper {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// A handle that pushes a `register_timer_with_reset` timer's deadline
/// back out. Cheap to clone; dropping every clone lets the timer's
/// background task notice and exit instead of leaking.
#[derive(Clone)]
pub struct TimerResetter {
    tx: mpsc::UnboundedSender<()>,
}

impl TimerResetter {
    pub fn reset(&self) {
        let _ = self.tx.send(());
    }
}

/// Suspends the caller for `duration`, driven by a throwaway `Reactor`
/// timer rather than a bare `tokio::time::sleep` (§4.6's retry
/// back-off: "driven by the Reactor's timer").
pub async fn delay(duration: Duration) {
    let mut reactor = Reactor::new();
    let stopper = reactor.stopper();
    reactor.register_timer(
        duration,
        1,
        Box::new(move || {
            stopper.stop();
            Ok(())
        }),
    );
    let _ = reactor.run().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn timer_fires_requested_number_of_times() {
        let mut reactor = Reactor::new();
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        let stopper = reactor.stopper();
        reactor.register_timer(
            Duration::from_millis(5),
            3,
            Box::new(move || {
                let n = count2.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 3 {
                    stopper.stop();
                }
                Ok(())
            }),
        );
        reactor.run().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stop_ends_run_after_current_handler() {
        let mut reactor = Reactor::new();
        let stopper = reactor.stopper();
        reactor.register_timer(
            Duration::from_millis(1),
            -1,
            Box::new(move || {
                stopper.stop();
                Ok(())
            }),
        );
        // run() must return even though the timer would otherwise fire forever.
        tokio::time::timeout(Duration::from_secs(1), reactor.run())
            .await
            .expect("run() should return promptly after stop()")
            .unwrap();
    }

    #[tokio::test]
    async fn reset_timer_only_fires_once_resets_stop_arriving() {
        let mut reactor = Reactor::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let stopper = reactor.stopper();
        let (_id, resetter) = reactor.register_timer_with_reset(
            Duration::from_millis(30),
            Box::new(move || {
                fired2.store(true, Ordering::SeqCst);
                stopper.stop();
                Ok(())
            }),
        );
        let resetter2 = resetter.clone();
        tokio::spawn(async move {
            // Keep pushing the deadline back for a while, then let it
            // lapse by simply ending the task.
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                resetter2.reset();
            }
        });
        tokio::time::timeout(Duration::from_secs(2), reactor.run())
            .await
            .expect("run() should return once the timer fires after resets stop arriving")
            .unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn delay_suspends_for_roughly_the_requested_duration() {
        let start = std::time::Instant::now();
        delay(Duration::from_millis(20)).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
