//! Component J: the slave provider. A process that serves a small
//! request/reply catalog protocol (§4.10, §6.1 "Slave-provider
//! protocol") over its registered slave types, and advertises itself via
//! a `Beacon` (K) so `ProviderClusterClient` (L) instances can discover
//! it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::bind_agent;
use crate::capability::SlaveInstance;
use crate::discovery::Beacon;
use crate::error::{CoreResult, ProtocolError, SystemError};
use crate::model::{SlaveLocator, SlaveTypeDescription};
use crate::transport::reqrep::RepSocket;
use crate::wire::codec::{NormalFrame, provider_msg_type};
use crate::wire::messages::{
    ErrorBody, GetSlaveTypeBody, InstantiateSlaveBody, SlaveLocatorBody, SlaveTypeBody, SlaveTypeCountBody, error_code,
};

/// Produces a fresh `SlaveInstance` each time a slave of this type is
/// instantiated. Boxed rather than generic because one provider's
/// catalog holds entries of different concrete instance types.
pub type InstanceFactory = Arc<dyn Fn() -> Box<dyn SlaveInstance> + Send + Sync>;

#[derive(Clone)]
pub struct SlaveTypeEntry {
    pub description: SlaveTypeDescription,
    pub factory: InstanceFactory,
}

/// Serves a catalog of slave types over TCP and instantiates agents for
/// them on request.
pub struct SlaveProvider {
    types: Vec<SlaveTypeEntry>,
    control_addr: SocketAddr,
    agent_host: std::net::IpAddr,
    server_max_version: u16,
    master_timeout: Duration,
}

impl SlaveProvider {
    pub fn new(
        types: Vec<SlaveTypeEntry>,
        control_addr: SocketAddr,
        server_max_version: u16,
        master_timeout: Duration,
    ) -> Self {
        Self {
            types,
            control_addr,
            agent_host: control_addr.ip(),
            server_max_version,
            master_timeout,
        }
    }

    /// Starts broadcasting this provider's presence. The announcement
    /// payload is the provider's catalog port, little-endian `u16`
    /// bytes (the simplest encoding that satisfies "payload is the TCP
    /// port"; see `DESIGN.md`).
    pub async fn advertise(
        &self,
        partition_id: u32,
        service_id: impl Into<String>,
        broadcast_port: u16,
        period: Duration,
    ) -> CoreResult<Beacon> {
        let port_payload = Bytes::copy_from_slice(&self.control_addr.port().to_le_bytes());
        Beacon::start(partition_id, "slave_provider", service_id, port_payload, broadcast_port, period).await
    }

    /// Runs the catalog request/reply server until an I/O error ends the
    /// listener (never returns on success).
    pub async fn serve(self) -> CoreResult<()> {
        let listener = tokio::net::TcpListener::bind(self.control_addr).await.map_err(SystemError::Io)?;
        let shared = Arc::new(self);
        loop {
            let (stream, peer) = listener.accept().await.map_err(SystemError::Io)?;
            let provider = shared.clone();
            tokio::spawn(async move {
                if let Err(e) = provider.serve_connection(stream, peer).await {
                    warn!(%peer, error = %e, "slave-provider connection ended");
                }
            });
        }
    }

    async fn serve_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) -> CoreResult<()> {
        let mut rep = RepSocket::accept(stream, peer, self.server_max_version).await?;
        while let Some(request) = rep.recv().await? {
            let reply = match request.msg_type {
                provider_msg_type::GET_SLAVE_TYPE_COUNT => NormalFrame::with_body(
                    provider_msg_type::SLAVE_TYPE_COUNT,
                    SlaveTypeCountBody {
                        count: self.types.len() as u32,
                    },
                ),
                provider_msg_type::GET_SLAVE_TYPE => {
                    let body: GetSlaveTypeBody = request.decode_body()?;
                    match self.types.get(body.index as usize) {
                        Some(entry) => NormalFrame::with_body(
                            provider_msg_type::SLAVE_TYPE,
                            SlaveTypeBody {
                                type_description: Some((&entry.description).into()),
                            },
                        ),
                        None => error_frame(
                            error_code::OPERATION_FAILED,
                            &format!("no slave type at index {}", body.index),
                        ),
                    }
                }
                provider_msg_type::INSTANTIATE_SLAVE => {
                    let body: InstantiateSlaveBody = request.decode_body()?;
                    match self.instantiate(&body).await {
                        Ok(locator) => NormalFrame::with_body(
                            provider_msg_type::SLAVE_LOCATOR,
                            SlaveLocatorBody {
                                control_endpoint: locator.control_endpoint.to_string(),
                                data_pub_endpoint: locator.data_pub_endpoint.to_string(),
                            },
                        ),
                        Err(e) => error_frame(error_code::OPERATION_FAILED, &e.to_string()),
                    }
                }
                other => {
                    return Err(ProtocolError::UnexpectedMessageType(other).into());
                }
            };
            rep.send(reply).await?;
        }
        Ok(())
    }

    async fn instantiate(&self, request: &InstantiateSlaveBody) -> CoreResult<SlaveLocator> {
        let uuid = Uuid::parse_str(&request.uuid)
            .map_err(|e| ProtocolError::Violation(format!("invalid slave type uuid: {e}")))?;
        let entry = self
            .types
            .iter()
            .find(|e| e.description.uuid == uuid)
            .ok_or_else(|| ProtocolError::Violation(format!("unknown slave type uuid {uuid}")))?;

        let instance = (entry.factory)();
        let control_addr = SocketAddr::new(self.agent_host, 0);
        let data_pub_addr = SocketAddr::new(self.agent_host, 0);
        let (agent, control_listener, locator) = bind_agent(instance, control_addr, data_pub_addr).await?;

        let server_max_version = self.server_max_version;
        let master_timeout = Duration::from_millis(request.timeout_ms).max(self.master_timeout);
        tokio::spawn(async move {
            if let Err(e) = agent.serve(control_listener, server_max_version, master_timeout).await {
                debug!(error = %e, "provisioned agent's serve loop ended");
            }
        });

        Ok(locator)
    }
}

fn error_frame(code: u32, details: &str) -> NormalFrame {
    NormalFrame::with_body(
        provider_msg_type::ERROR,
        ErrorBody {
            code,
            details: details.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoreResult as CR, GenericError};
    use crate::model::{Causality, DataType, TimeDuration, TimePoint, VariableID};
    use crate::transport::reqrep::ReqSocket;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct NoopSlave(SlaveTypeDescription);

    impl SlaveInstance for NoopSlave {
        fn type_description(&self) -> &SlaveTypeDescription {
            &self.0
        }
        fn setup(&mut self, _: &str, _: &str, _: TimePoint, _: TimePoint, _: bool, _: Option<f64>) -> CR<()> {
            Ok(())
        }
        fn start_simulation(&mut self) -> CR<()> {
            Ok(())
        }
        fn end_simulation(&mut self) -> CR<()> {
            Ok(())
        }
        fn get_real(&self, _: VariableID) -> CR<f64> {
            Ok(0.0)
        }
        fn get_integer(&self, _: VariableID) -> CR<i64> {
            Ok(0)
        }
        fn get_boolean(&self, _: VariableID) -> CR<bool> {
            Ok(false)
        }
        fn get_string(&self, _: VariableID) -> CR<String> {
            Ok(String::new())
        }
        fn set_real(&mut self, _: VariableID, _: f64) -> bool {
            false
        }
        fn set_integer(&mut self, _: VariableID, _: i64) -> bool {
            false
        }
        fn set_boolean(&mut self, _: VariableID, _: bool) -> bool {
            false
        }
        fn set_string(&mut self, _: VariableID, _: String) -> bool {
            false
        }
        fn do_step(&mut self, _: TimePoint, _: TimeDuration) -> bool {
            true
        }
    }

    fn test_description() -> SlaveTypeDescription {
        SlaveTypeDescription {
            name: "Noop".into(),
            uuid: Uuid::nil(),
            description: String::new(),
            author: String::new(),
            version: "1.0".into(),
            variables: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn catalog_reports_count_and_description() {
        let description = test_description();
        let entry = SlaveTypeEntry {
            description: description.clone(),
            factory: Arc::new(move || Box::new(NoopSlave(description.clone())) as Box<dyn SlaveInstance>),
        };
        // Bind through a listener we control first so the address is
        // known up front (the provider rebinds the same address itself).
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let provider = SlaveProvider::new(vec![entry], addr, 1, Duration::from_secs(5));
        tokio::spawn(provider.serve());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut client = ReqSocket::connect(addr, 1).await.unwrap();
        let reply = client
            .request(
                NormalFrame::empty(provider_msg_type::GET_SLAVE_TYPE_COUNT),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let count: SlaveTypeCountBody = reply.decode_body().unwrap();
        assert_eq!(count.count, 1);

        let reply = client
            .request(
                NormalFrame::with_body(provider_msg_type::GET_SLAVE_TYPE, GetSlaveTypeBody { index: 0 }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let described: SlaveTypeBody = reply.decode_body().unwrap();
        assert_eq!(described.type_description.unwrap().name, "Noop");
    }

    #[tokio::test]
    async fn instantiate_unknown_uuid_is_an_error() {
        let description = test_description();
        let entry = SlaveTypeEntry {
            description: description.clone(),
            factory: Arc::new(move || Box::new(NoopSlave(description.clone())) as Box<dyn SlaveInstance>),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let provider = SlaveProvider::new(vec![entry], addr, 1, Duration::from_secs(5));
        tokio::spawn(provider.serve());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut client = ReqSocket::connect(addr, 1).await.unwrap();
        let err = client
            .request(
                NormalFrame::with_body(
                    provider_msg_type::INSTANTIATE_SLAVE,
                    InstantiateSlaveBody {
                        uuid: Uuid::new_v4().to_string(),
                        timeout_ms: 1000,
                    },
                ),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CoreError::Generic(GenericError::OperationFailed(_))));
    }
}
