use thiserror::Error;

use crate::model::SlaveID;

pub type CoreResult<T> = Result<T, CoreError>;

/// Top-level error type for the co-simulation core.
///
/// Each category below corresponds to one of the orthogonal classes from
/// the error handling design: generic, simulation, system, protocol and
/// precondition errors. Keeping them as separate enums lets call sites
/// match on the class they actually care about via `#[from]` conversion.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Generic(#[from] GenericError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error(transparent)]
    System(#[from] SystemError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

impl CoreError {
    /// The slave this error originates from, if any. Surfaced so that
    /// aggregate (fan-out) errors can be attributed to a single slave.
    pub fn slave_id(&self) -> Option<SlaveID> {
        match self {
            CoreError::Simulation(e) => e.slave_id(),
            CoreError::System(SystemError::ConnectionLost { slave, .. }) => Some(*slave),
            _ => None,
        }
    }
}

/// Errors that don't belong to a specific simulation/protocol category.
#[derive(Debug, Error)]
pub enum GenericError {
    #[error("operation aborted")]
    Aborted,

    #[error("operation canceled")]
    Canceled,

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("communication thread died")]
    CommThreadDead {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Errors that originate from the simulated behaviour of a slave.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("slave {slave:?} could not perform the requested time step")]
    CannotPerformTimestep { slave: SlaveID },

    #[error("slave {slave:?} timed out waiting for connected input data")]
    DataTimeout { slave: SlaveID },
}

impl SimulationError {
    pub fn slave_id(&self) -> Option<SlaveID> {
        match self {
            SimulationError::CannotPerformTimestep { slave } => Some(*slave),
            SimulationError::DataTimeout { slave } => Some(*slave),
        }
    }
}

/// Transport/OS-level errors.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    TimedOut,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("permission denied")]
    PermissionDenied,

    #[error("lost connection to slave {slave:?}: {reason}")]
    ConnectionLost { slave: SlaveID, reason: String },

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Errors arising from malformed messages or protocol negotiation failure.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("no mutually supported protocol version (client max {client_max}, server max {server_max})")]
    NotSupported { client_max: u16, server_max: u16 },

    #[error("unexpected message type code {0}")]
    UnexpectedMessageType(u16),

    #[error("peer sent DENIED: {0}")]
    Denied(String),
}

/// Raised when an API is called while its owning state machine is in a
/// state that does not permit it.
#[derive(Debug, Error)]
#[error("precondition violation: `{operation}` is not valid in state `{state}`")]
pub struct PreconditionError {
    pub operation: &'static str,
    pub state: &'static str,
}

/// Raised by the reactor's own event loop (component A), as opposed to
/// by a handler it drives. Currently has a single source: the slave
/// agent's master-inactivity timer (§4.9).
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("master went inactive: no message received within the configured timeout")]
    MasterInactivityTimeout,
}
