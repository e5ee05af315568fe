//! Component L: the provider-cluster client. The master-side aggregate
//! over every `SlaveProvider` (J) visible on the network: it tracks
//! `service_type = "slave_provider"` announcements via a `Tracker` (K),
//! opens a short-lived request/reply `Client` to each one it discovers
//! to enumerate its catalog, and merges the results into a
//! `uuid -> SlaveType` table so a caller can shop across every provider
//! for a given slave type without knowing which one offers it (§4.10).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::discovery::{Tracker, TrackerHandler};
use crate::error::{CoreResult, GenericError, ProtocolError};
use crate::model::{SlaveLocator, SlaveTypeDescription};
use crate::transport::reqrep::Client;
use crate::wire::codec::{NormalFrame, provider_msg_type};
use crate::wire::messages::{GetSlaveTypeBody, InstantiateSlaveBody, SlaveLocatorBody, SlaveTypeBody, SlaveTypeCountBody};

/// A stable handle to one discovered provider: an index into the
/// cluster's provider table. Kept small and copyable so the tracker's
/// callbacks can carry it without holding a reference back into the
/// cluster itself (see `ClusterHandler` below).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderId(usize);

struct ProviderRecord {
    service_id: String,
    control_addr: SocketAddr,
    /// `None` while its catalog is still being fetched, or after it has
    /// disappeared and the slot has been vacated.
    types: Option<Vec<SlaveTypeDescription>>,
}

/// One slave type as seen across the cluster: its description (taken
/// from whichever provider reported it first) and every provider known
/// to offer it.
#[derive(Debug, Clone)]
pub struct SlaveType {
    pub description: SlaveTypeDescription,
    pub providers: Vec<ProviderId>,
}

struct ClusterInner {
    client_max_version: u16,
    catalog_timeout: Duration,
    providers: Mutex<Vec<ProviderRecord>>,
    by_service_id: Mutex<BTreeMap<String, ProviderId>>,
}

impl ClusterInner {
    async fn fetch_catalog(&self, provider: ProviderId, control_addr: SocketAddr) -> CoreResult<Vec<SlaveTypeDescription>> {
        let mut client = Client::new(control_addr, self.client_max_version, self.catalog_timeout);

        let reply = client.request(NormalFrame::empty(provider_msg_type::GET_SLAVE_TYPE_COUNT)).await?;
        let count: SlaveTypeCountBody = reply.decode_body()?;

        let mut types = Vec::with_capacity(count.count as usize);
        for index in 0..count.count {
            let reply = client
                .request(NormalFrame::with_body(provider_msg_type::GET_SLAVE_TYPE, GetSlaveTypeBody { index }))
                .await?;
            let body: SlaveTypeBody = reply.decode_body()?;
            let proto = body
                .type_description
                .ok_or_else(|| ProtocolError::Violation("slave type reply carried no description".into()))?;
            types.push(proto.try_into()?);
        }
        debug!(?provider, count = types.len(), "fetched provider catalog");
        Ok(types)
    }
}

/// Receives `Tracker` events on behalf of a `ProviderClusterClient` without
/// holding a strong reference to it: the cluster owns the tracker, the
/// tracker owns this handler, so a strong handler -> cluster edge would
/// be a reference cycle neither side could ever tear down. The `Weak`
/// link means a dropped cluster simply stops reacting to further events.
struct ClusterHandler {
    inner: Weak<ClusterInner>,
}

impl TrackerHandler for ClusterHandler {
    fn appeared(&self, _service_type: &str, service_id: &str, addr: SocketAddr, payload: &[u8]) {
        let Some(inner) = self.inner.upgrade() else { return };
        let Some(control_addr) = decode_control_addr(addr, payload) else {
            warn!(service_id, "slave-provider announcement carried an unparsable payload");
            return;
        };
        let service_id = service_id.to_string();
        tokio::spawn(async move { register_provider(inner, service_id, control_addr).await });
    }

    fn payload_changed(&self, _service_type: &str, service_id: &str, addr: SocketAddr, payload: &[u8]) {
        // A provider's control port can only change behind the same
        // service_id if it restarted; treat it exactly like a fresh
        // appearance so its catalog gets re-fetched from the new port.
        self.appeared(_service_type, service_id, addr, payload);
    }

    fn disappeared(&self, _service_type: &str, service_id: &str) {
        let Some(inner) = self.inner.upgrade() else { return };
        let service_id = service_id.to_string();
        tokio::spawn(async move { unregister_provider(inner, service_id).await });
    }
}

/// A provider's discovery payload is its catalog port, little-endian
/// `u16` (see `SlaveProvider::advertise`); the provider's host is simply
/// the announcement's source address.
fn decode_control_addr(source: SocketAddr, payload: &[u8]) -> Option<SocketAddr> {
    let port = u16::from_le_bytes(payload.try_into().ok()?);
    Some(SocketAddr::new(source.ip(), port))
}

async fn register_provider(inner: Arc<ClusterInner>, service_id: String, control_addr: SocketAddr) {
    let id = {
        let mut providers = inner.providers.lock().await;
        let mut by_service_id = inner.by_service_id.lock().await;
        match by_service_id.get(&service_id).copied() {
            Some(id) => {
                providers[id.0].control_addr = control_addr;
                providers[id.0].types = None;
                id
            }
            None => {
                let id = ProviderId(providers.len());
                providers.push(ProviderRecord {
                    service_id: service_id.clone(),
                    control_addr,
                    types: None,
                });
                by_service_id.insert(service_id.clone(), id);
                id
            }
        }
    };

    match inner.fetch_catalog(id, control_addr).await {
        Ok(types) => {
            let mut providers = inner.providers.lock().await;
            if providers[id.0].service_id == service_id {
                providers[id.0].types = Some(types);
            }
        }
        Err(e) => warn!(service_id, %control_addr, error = %e, "failed to fetch provider catalog"),
    }
}

async fn unregister_provider(inner: Arc<ClusterInner>, service_id: String) {
    let mut providers = inner.providers.lock().await;
    let mut by_service_id = inner.by_service_id.lock().await;
    if let Some(id) = by_service_id.remove(&service_id) {
        providers[id.0].types = None;
    }
}

/// Tracks every slave provider on the network and aggregates their
/// catalogs. Dropping this drops the underlying `Tracker`, which stops
/// listening for further announcements.
pub struct ProviderClusterClient {
    inner: Arc<ClusterInner>,
    _tracker: Tracker,
}

impl ProviderClusterClient {
    /// Starts listening for `slave_provider` announcements on
    /// `broadcast_port` and begins fetching catalogs as providers
    /// appear. `provider_timeout` is both the tracker's silence timeout
    /// for a provider and the per-request timeout used while fetching
    /// its catalog.
    pub async fn start(
        partition_id: u32,
        broadcast_port: u16,
        provider_timeout: Duration,
        client_max_version: u16,
    ) -> CoreResult<Self> {
        let inner = Arc::new(ClusterInner {
            client_max_version,
            catalog_timeout: provider_timeout,
            providers: Mutex::new(Vec::new()),
            by_service_id: Mutex::new(BTreeMap::new()),
        });

        let sweep_interval = provider_timeout / 4;
        let tracker = Tracker::bind(partition_id, broadcast_port, sweep_interval.max(Duration::from_millis(50))).await?;
        let handler = Arc::new(ClusterHandler {
            inner: Arc::downgrade(&inner),
        });
        tracker.register("slave_provider", provider_timeout, handler).await;

        Ok(Self { inner, _tracker: tracker })
    }

    /// The control endpoint of a still-known provider, or `None` if it
    /// has disappeared or was never seen.
    pub async fn provider_addr(&self, id: ProviderId) -> Option<SocketAddr> {
        let providers = self.inner.providers.lock().await;
        providers.get(id.0).map(|p| p.control_addr)
    }

    /// Every slave type currently offered by at least one live provider,
    /// merged by UUID.
    pub async fn slave_types(&self) -> Vec<SlaveType> {
        let providers = self.inner.providers.lock().await;
        let mut merged: BTreeMap<Uuid, SlaveType> = BTreeMap::new();
        for (index, record) in providers.iter().enumerate() {
            let Some(types) = &record.types else { continue };
            let id = ProviderId(index);
            for description in types {
                merged
                    .entry(description.uuid)
                    .or_insert_with(|| SlaveType {
                        description: description.clone(),
                        providers: Vec::new(),
                    })
                    .providers
                    .push(id);
            }
        }
        merged.into_values().collect()
    }

    /// Asks `provider` to instantiate a slave of type `uuid`, granting it
    /// up to `timeout` to accept the master's handshake once bound.
    pub async fn instantiate_slave(&self, provider: ProviderId, uuid: Uuid, timeout: Duration) -> CoreResult<SlaveLocator> {
        let control_addr = self
            .provider_addr(provider)
            .await
            .ok_or_else(|| GenericError::InvalidArgument(format!("no such provider: {provider:?}")))?;

        let mut client = Client::new(control_addr, self.inner.client_max_version, self.inner.catalog_timeout);
        let reply = client
            .request(NormalFrame::with_body(
                provider_msg_type::INSTANTIATE_SLAVE,
                InstantiateSlaveBody {
                    uuid: uuid.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                },
            ))
            .await?;
        let body: SlaveLocatorBody = reply.decode_body()?;
        Ok(SlaveLocator {
            control_endpoint: body.control_endpoint.parse()?,
            data_pub_endpoint: body.data_pub_endpoint.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_control_addr_reads_little_endian_port() {
        let source: SocketAddr = ([10, 0, 0, 5], 9000).into();
        let addr = decode_control_addr(source, &10274u16.to_le_bytes()).unwrap();
        assert_eq!(addr, SocketAddr::new(source.ip(), 10274));
    }

    #[test]
    fn decode_control_addr_rejects_wrong_length_payload() {
        let source: SocketAddr = ([10, 0, 0, 5], 9000).into();
        assert!(decode_control_addr(source, b"x").is_none());
    }

    #[tokio::test]
    async fn slave_types_is_empty_before_any_provider_is_seen() {
        let cluster = ProviderClusterClient::start(1, 0, Duration::from_millis(200), 1).await.unwrap();
        assert!(cluster.slave_types().await.is_empty());
    }

    #[tokio::test]
    async fn register_and_unregister_provider_updates_the_table() {
        let inner = Arc::new(ClusterInner {
            client_max_version: 1,
            catalog_timeout: Duration::from_secs(1),
            providers: Mutex::new(Vec::new()),
            by_service_id: Mutex::new(BTreeMap::new()),
        });

        // Bypass the network fetch: insert a record directly, the way
        // `register_provider` would once `fetch_catalog` succeeds.
        {
            let mut providers = inner.providers.lock().await;
            let mut by_service_id = inner.by_service_id.lock().await;
            providers.push(ProviderRecord {
                service_id: "provider-1".into(),
                control_addr: ([127, 0, 0, 1], 1234).into(),
                types: Some(vec![]),
            });
            by_service_id.insert("provider-1".into(), ProviderId(0));
        }

        unregister_provider(inner.clone(), "provider-1".into()).await;
        let providers = inner.providers.lock().await;
        assert!(providers[0].types.is_none());
    }
}
