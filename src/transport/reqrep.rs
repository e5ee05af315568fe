//! Component B: request/reply sockets on top of one TCP connection per
//! peer (§4.2). Every connection opens with the HELLO/DENIED handshake
//! (`wire::codec::HandshakeCodec`) and then carries `Normal`/`Error`
//! traffic (`wire::codec::MessageCodec`) for its lifetime -- there is no
//! broker/router frame, since unlike a ZeroMQ ROUTER socket a TCP
//! listener already hands us one distinct connection per peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult, GenericError, ProtocolError, SystemError};
use crate::wire::codec::{HandshakeCodec, HandshakeFrame, MessageCodec, NormalFrame, msg_type};
use crate::wire::messages::ErrorBody;

async fn negotiate_client(
    stream: TcpStream,
    client_max_version: u16,
) -> CoreResult<(Framed<TcpStream, MessageCodec>, u16)> {
    let mut handshake = Framed::new(stream, HandshakeCodec::default());
    handshake
        .send(HandshakeFrame::Hello {
            version: client_max_version,
            body: None,
        })
        .await?;
    let frame = handshake
        .next()
        .await
        .ok_or_else(|| SystemError::ConnectionLost {
            slave: crate::model::SlaveID::INVALID,
            reason: "peer closed connection during handshake".into(),
        })??;
    match frame {
        HandshakeFrame::Hello { version, .. } => {
            Ok((handshake.map_codec(|_| MessageCodec::default()), version))
        }
        HandshakeFrame::Denied { reason } => Err(ProtocolError::Denied(reason).into()),
    }
}

async fn negotiate_server(
    stream: TcpStream,
    server_max_version: u16,
) -> CoreResult<Framed<TcpStream, MessageCodec>> {
    let mut handshake = Framed::new(stream, HandshakeCodec::default());
    let frame = handshake
        .next()
        .await
        .ok_or_else(|| SystemError::ConnectionLost {
            slave: crate::model::SlaveID::INVALID,
            reason: "peer closed connection during handshake".into(),
        })??;
    let client_max_version = match frame {
        HandshakeFrame::Hello { version, .. } => version,
        HandshakeFrame::Denied { reason } => {
            return Err(ProtocolError::Denied(reason).into());
        }
    };
    // Only version 1 exists today; a future bump would widen this range.
    let agreed = client_max_version.min(server_max_version);
    if agreed == 0 {
        let reason = format!(
            "no mutually supported protocol version (client max {client_max_version}, server max {server_max_version})"
        );
        handshake
            .send(HandshakeFrame::Denied {
                reason: reason.clone(),
            })
            .await?;
        return Err(ProtocolError::NotSupported {
            client_max: client_max_version,
            server_max: server_max_version,
        }
        .into());
    }
    handshake
        .send(HandshakeFrame::Hello {
            version: agreed,
            body: None,
        })
        .await?;
    Ok(handshake.map_codec(|_| MessageCodec::default()))
}

/// One negotiated request/reply connection from the requesting side.
pub struct ReqSocket {
    framed: Framed<TcpStream, MessageCodec>,
    pub negotiated_version: u16,
}

impl ReqSocket {
    pub async fn connect(addr: SocketAddr, client_max_version: u16) -> CoreResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(SystemError::Io)?;
        let (framed, negotiated_version) = negotiate_client(stream, client_max_version).await?;
        Ok(Self {
            framed,
            negotiated_version,
        })
    }

    /// Sends `request` and waits up to `timeout` for the matching reply.
    /// A reply carrying `msg_type::ERROR` is unwrapped into `Err`.
    pub async fn request(&mut self, request: NormalFrame, timeout: Duration) -> CoreResult<NormalFrame> {
        self.framed
            .send(request)
            .await
            .map_err(|e: CoreError| e)?;
        let reply = tokio::time::timeout(timeout, self.framed.next())
            .await
            .map_err(|_| SystemError::TimedOut)?
            .ok_or_else(|| SystemError::ConnectionLost {
                slave: crate::model::SlaveID::INVALID,
                reason: "peer closed connection while awaiting reply".into(),
            })??;
        if reply.msg_type == msg_type::ERROR {
            let body: ErrorBody = reply.decode_body()?;
            return Err(GenericError::OperationFailed(body.details).into());
        }
        Ok(reply)
    }

    /// Sends `message` without waiting for a reply. Used for `TERMINATE`,
    /// which the protocol defines as unacknowledged so that shutdown
    /// makes progress even against an unresponsive peer.
    pub async fn send_only(&mut self, message: NormalFrame) -> CoreResult<()> {
        self.framed.send(message).await
    }
}

/// A request/reply client that connects lazily on the first call and
/// reconnects after any transport-level failure. Requests are strictly
/// serialised: at most one is in flight, so replies are trivially
/// FIFO-correlated with their request.
pub struct Client {
    addr: SocketAddr,
    client_max_version: u16,
    timeout: Duration,
    socket: Option<ReqSocket>,
}

impl Client {
    pub fn new(addr: SocketAddr, client_max_version: u16, timeout: Duration) -> Self {
        Self {
            addr,
            client_max_version,
            timeout,
            socket: None,
        }
    }

    pub async fn request(&mut self, request: NormalFrame) -> CoreResult<NormalFrame> {
        if self.socket.is_none() {
            self.socket = Some(ReqSocket::connect(self.addr, self.client_max_version).await?);
        }
        let result = self
            .socket
            .as_mut()
            .expect("just populated above")
            .request(request, self.timeout)
            .await;
        if let Err(CoreError::System(_)) = &result {
            // Transport-level failures invalidate the connection; the next
            // call reconnects from scratch rather than reusing dead state.
            self.socket = None;
        }
        result
    }
}

/// One negotiated request/reply connection from the accepting side.
pub struct RepSocket {
    framed: Framed<TcpStream, MessageCodec>,
    pub peer: SocketAddr,
}

impl RepSocket {
    pub async fn accept(stream: TcpStream, peer: SocketAddr, server_max_version: u16) -> CoreResult<Self> {
        let framed = negotiate_server(stream, server_max_version).await?;
        Ok(Self { framed, peer })
    }

    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    pub async fn recv(&mut self) -> CoreResult<Option<NormalFrame>> {
        self.framed.next().await.transpose()
    }

    pub async fn send(&mut self, reply: NormalFrame) -> CoreResult<()> {
        self.framed.send(reply).await
    }
}

/// Handles the requests received on one accepted connection. A fresh
/// instance is produced per connection by the `Server`'s factory, so
/// handlers may hold per-connection state (e.g. a slave messenger).
pub trait ConnectionHandler: Send {
    fn handle(&mut self, request: NormalFrame) -> CoreResult<NormalFrame>;
}

type HandlerFactory = Arc<dyn Fn(SocketAddr) -> Box<dyn ConnectionHandler> + Send + Sync>;

/// Accepts connections on a bound TCP listener, negotiates HELLO/DENIED,
/// then serves `Normal` requests against a fresh per-connection handler.
pub struct Server {
    listener: TcpListener,
    server_max_version: u16,
    factory: HandlerFactory,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        server_max_version: u16,
        factory: HandlerFactory,
    ) -> CoreResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(SystemError::Io)?;
        Ok(Self {
            listener,
            server_max_version,
            factory,
        })
    }

    pub fn local_addr(&self) -> CoreResult<SocketAddr> {
        self.listener.local_addr().map_err(|e| SystemError::Io(e).into())
    }

    /// Runs forever, spawning one task per accepted connection.
    pub async fn serve(self) -> CoreResult<()> {
        loop {
            let (stream, peer) = self.listener.accept().await.map_err(SystemError::Io)?;
            let mut handler = (self.factory)(peer);
            let server_max_version = self.server_max_version;
            tokio::spawn(async move {
                if let Err(e) = Self::serve_connection(stream, peer, server_max_version, handler.as_mut()).await {
                    warn!(%peer, error = %e, "request/reply connection ended");
                } else {
                    debug!(%peer, "request/reply connection closed");
                }
            });
        }
    }

    async fn serve_connection(
        stream: TcpStream,
        peer: SocketAddr,
        server_max_version: u16,
        handler: &mut dyn ConnectionHandler,
    ) -> CoreResult<()> {
        let mut rep = RepSocket::accept(stream, peer, server_max_version).await?;
        while let Some(request) = rep.recv().await? {
            let reply = match handler.handle(request) {
                Ok(reply) => reply,
                Err(e) => NormalFrame::with_body(
                    msg_type::ERROR,
                    ErrorBody {
                        code: crate::wire::messages::error_code::OPERATION_FAILED,
                        details: e.to_string(),
                    },
                ),
            };
            rep.send(reply).await?;
        }
        Ok(())
    }
}
