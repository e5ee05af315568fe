//! Typed configuration records. Parsing these from a configuration file
//! is out of core scope (see `SPEC_FULL.md` §1); this module only
//! defines the shape and the documented defaults, the way a CLI or
//! embedding application would populate a plain config struct before
//! handing it to the engine.

use std::time::Duration;

use crate::model::{StepID, TimeDuration, TimePoint};

/// Execution-wide setup parameters, fixed for the lifetime of an
/// execution (`SPEC_FULL.md` §3, `slaveSetup`).
#[derive(Debug, Clone, PartialEq)]
pub struct SlaveSetup {
    pub start_time: TimePoint,
    pub stop_time: TimePoint,
    pub execution_name: String,
    pub variable_recv_timeout: Duration,
}

impl SlaveSetup {
    pub fn new(execution_name: impl Into<String>) -> Self {
        Self {
            start_time: 0.0,
            stop_time: f64::INFINITY,
            execution_name: execution_name.into(),
            variable_recv_timeout: Duration::from_millis(1000),
        }
    }
}

/// Tunables for the execution state machine (component G).
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Maximum number of `ResendVars` rounds attempted by `Prime`
    /// before it gives up.
    pub max_priming_attempts: u32,
    /// Timeout applied to each per-slave control operation.
    pub command_timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_priming_attempts: 5,
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Tunables for `SlaveController` connection establishment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionConfig {
    pub max_connection_attempts: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connection_attempts: 5,
            initial_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Tunables for the UDP discovery layer (Beacon/Tracker).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscoveryConfig {
    pub broadcast_port: u16,
    pub beacon_period: Duration,
    /// How long a tracker waits without a ping before declaring a
    /// service "disappeared".
    pub tracker_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_port: 10274,
            beacon_period: Duration::from_millis(1000),
            tracker_timeout: Duration::from_millis(3000),
        }
    }
}

/// The step identifier reserved to mean "no step has happened yet".
pub const INITIAL_STEP_ID: StepID = StepID::INVALID;

/// Used by the `Reconstitute` invariant check: a `SlaveID` is a 16-bit
/// value, so an execution can never hold more live slots than this.
pub const MAX_SLAVE_COUNT: usize = u16::MAX as usize;
