//! Component K: the UDP service-discovery layer. `Beacon` periodically
//! broadcasts a service's existence; `Tracker` listens for those
//! broadcasts and fires `appeared`/`payload_changed`/`disappeared`
//! events as services come, change and go silent (§4.10, §6.1
//! "Discovery UDP format").

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CoreResult, SystemError};
use crate::wire::discovery::{Announcement, decode, encode};

const MAX_DATAGRAM_LEN: usize = 2048;

async fn bind_broadcast(port: u16) -> CoreResult<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await.map_err(SystemError::Io)?;
    socket.set_broadcast(true).map_err(SystemError::Io)?;
    Ok(socket)
}

/// Broadcasts one service's existence on `broadcast_port` every `period`
/// until dropped.
pub struct Beacon {
    stop: CancellationToken,
}

impl Beacon {
    pub async fn start(
        partition_id: u32,
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        payload: Bytes,
        broadcast_port: u16,
        period: Duration,
    ) -> CoreResult<Self> {
        let socket = bind_broadcast(0).await?;
        let announcement = Announcement {
            partition_id,
            service_type: service_type.into(),
            service_id: service_id.into(),
            payload,
        };
        let datagram = encode(&announcement)?;
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let dest: SocketAddr = ([255, 255, 255, 255], broadcast_port).into();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    () = task_stop.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = socket.send_to(&datagram, dest).await {
                            warn!(error = %e, "beacon failed to broadcast");
                        }
                    }
                }
            }
        });

        Ok(Self { stop })
    }
}

impl Drop for Beacon {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    last_seen: Instant,
    addr: SocketAddr,
    payload: Bytes,
}

/// Handlers a `Tracker` invokes as services of its registered types come
/// and go. Invoked serially on the tracker's own task, mirroring the
/// single-threaded-reactor model the rest of the core follows. `addr` is
/// the datagram's source address -- the announcement payload itself
/// only carries whatever the service chose to put in it (for a slave
/// provider, its catalog port), so the source IP is how a caller learns
/// *which host* that port is on.
pub trait TrackerHandler: Send + Sync {
    fn appeared(&self, service_type: &str, service_id: &str, addr: SocketAddr, payload: &[u8]) {
        let _ = (service_type, service_id, addr, payload);
    }
    fn payload_changed(&self, service_type: &str, service_id: &str, addr: SocketAddr, payload: &[u8]) {
        let _ = (service_type, service_id, addr, payload);
    }
    fn disappeared(&self, service_type: &str, service_id: &str) {
        let _ = (service_type, service_id);
    }
}

struct TrackedType {
    timeout: Duration,
    handler: Arc<dyn TrackerHandler>,
    entries: HashMap<String, Entry>,
}

/// Listens for `Beacon` broadcasts and maintains a `service_id ->
/// (last_seen, payload)` table per registered `service_type`, timing out
/// entries independently per type (§4.10).
pub struct Tracker {
    types: Arc<Mutex<HashMap<String, TrackedType>>>,
    stop: CancellationToken,
}

impl Tracker {
    /// Binds the shared discovery port and starts listening immediately;
    /// call `register` for each service type of interest before relying
    /// on its events.
    pub async fn bind(partition_id: u32, broadcast_port: u16, sweep_interval: Duration) -> CoreResult<Self> {
        let socket = bind_broadcast(broadcast_port).await?;
        let types: Arc<Mutex<HashMap<String, TrackedType>>> = Arc::new(Mutex::new(HashMap::new()));
        let stop = CancellationToken::new();

        let recv_types = types.clone();
        let recv_stop = stop.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            loop {
                let read = tokio::select! {
                    biased;
                    () = recv_stop.cancelled() => return,
                    r = socket.recv_from(&mut buf) => r,
                };
                let (n, peer) = match read {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "tracker UDP receive failed");
                        continue;
                    }
                };
                let announcement = match decode(Bytes::copy_from_slice(&buf[..n])) {
                    Ok(a) => a,
                    Err(_) => continue, // not our datagram format; ignore silently
                };
                if announcement.partition_id != partition_id {
                    continue;
                }
                Self::ingest(&recv_types, announcement, peer).await;
            }
        });

        let sweep_types = types.clone();
        let sweep_stop = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    biased;
                    () = sweep_stop.cancelled() => return,
                    _ = ticker.tick() => Self::sweep(&sweep_types).await,
                }
            }
        });

        Ok(Self { types, stop })
    }

    /// Starts tracking `service_type`, firing `handler`'s callbacks for
    /// every subsequent `appeared`/`payload_changed`/`disappeared` event.
    pub async fn register(&self, service_type: impl Into<String>, timeout: Duration, handler: Arc<dyn TrackerHandler>) {
        let mut types = self.types.lock().await;
        types.insert(
            service_type.into(),
            TrackedType {
                timeout,
                handler,
                entries: HashMap::new(),
            },
        );
    }

    async fn ingest(types: &Arc<Mutex<HashMap<String, TrackedType>>>, announcement: Announcement, peer: SocketAddr) {
        let mut types = types.lock().await;
        let Some(tracked) = types.get_mut(&announcement.service_type) else {
            return; // not a service type we're registered for
        };
        let now = Instant::now();
        match tracked.entries.get_mut(&announcement.service_id) {
            Some(entry) => {
                entry.last_seen = now;
                entry.addr = peer;
                if entry.payload != announcement.payload {
                    entry.payload = announcement.payload.clone();
                    tracked.handler.payload_changed(
                        &announcement.service_type,
                        &announcement.service_id,
                        peer,
                        &announcement.payload,
                    );
                }
            }
            None => {
                tracked.entries.insert(
                    announcement.service_id.clone(),
                    Entry {
                        last_seen: now,
                        addr: peer,
                        payload: announcement.payload.clone(),
                    },
                );
                debug!(service_type = %announcement.service_type, service_id = %announcement.service_id, %peer, "service appeared");
                tracked
                    .handler
                    .appeared(&announcement.service_type, &announcement.service_id, peer, &announcement.payload);
            }
        }
    }

    async fn sweep(types: &Arc<Mutex<HashMap<String, TrackedType>>>) {
        let mut types = types.lock().await;
        for (service_type, tracked) in types.iter_mut() {
            let timeout = tracked.timeout;
            let expired: Vec<String> = tracked
                .entries
                .iter()
                .filter(|(_, entry)| entry.last_seen.elapsed() >= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for service_id in expired {
                tracked.entries.remove(&service_id);
                tracked.handler.disappeared(service_type, &service_id);
            }
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        appeared: AtomicUsize,
        payload_changed: AtomicUsize,
        disappeared: AtomicUsize,
    }

    impl TrackerHandler for CountingHandler {
        fn appeared(&self, _service_type: &str, _service_id: &str, _addr: SocketAddr, _payload: &[u8]) {
            self.appeared.fetch_add(1, Ordering::SeqCst);
        }
        fn payload_changed(&self, _service_type: &str, _service_id: &str, _addr: SocketAddr, _payload: &[u8]) {
            self.payload_changed.fetch_add(1, Ordering::SeqCst);
        }
        fn disappeared(&self, _service_type: &str, _service_id: &str) {
            self.disappeared.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_peer() -> SocketAddr {
        ([127, 0, 0, 1], 9000).into()
    }

    fn announce(service_id: &str, payload: &[u8]) -> Announcement {
        Announcement {
            partition_id: 1,
            service_type: "slave_provider".into(),
            service_id: service_id.into(),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Exercises `ingest`/`sweep` directly rather than through a real
    /// Beacon/UDP round trip: appearance, payload change and timeout
    /// detection are internal table-bookkeeping concerns, independent of
    /// whether the datagram that triggered them actually crossed the
    /// network.
    #[tokio::test]
    async fn appeared_payload_changed_and_disappeared_fire_in_order() {
        let handler = Arc::new(CountingHandler::default());
        let mut table = HashMap::new();
        table.insert(
            "slave_provider".to_string(),
            TrackedType {
                timeout: Duration::from_millis(30),
                handler: handler.clone(),
                entries: HashMap::new(),
            },
        );
        let types = Arc::new(Mutex::new(table));

        Tracker::ingest(&types, announce("provider-1", b"10274"), test_peer()).await;
        assert_eq!(handler.appeared.load(Ordering::SeqCst), 1);

        Tracker::ingest(&types, announce("provider-1", b"10274"), test_peer()).await;
        assert_eq!(handler.payload_changed.load(Ordering::SeqCst), 0, "unchanged payload must not re-fire");

        Tracker::ingest(&types, announce("provider-1", b"10999"), test_peer()).await;
        assert_eq!(handler.payload_changed.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        Tracker::sweep(&types).await;
        assert_eq!(handler.disappeared.load(Ordering::SeqCst), 1);

        Tracker::ingest(&types, announce("provider-1", b"10999"), test_peer()).await;
        assert_eq!(handler.appeared.load(Ordering::SeqCst), 2, "re-appearance after silence fires appeared again");
    }

    #[tokio::test]
    async fn unregistered_service_type_is_ignored() {
        let types = Arc::new(Mutex::new(HashMap::new()));
        // No panic, no entry created: nothing is registered for this type.
        Tracker::ingest(&types, announce("provider-1", b"x"), test_peer()).await;
        assert!(types.lock().await.is_empty());
    }
}
