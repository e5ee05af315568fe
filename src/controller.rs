//! Component F: the slave controller. A thin layer above the messenger
//! (E) adding connection establishment with retries and the post-HELLO
//! `SETUP` handshake (§4.6).

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{ConnectionConfig, SlaveSetup};
use crate::error::{CoreResult, SystemError};
use crate::messenger::{MessengerState, SlaveControlMessenger};
use crate::model::{
    Endpoint, SlaveID, SlaveLocator, SlaveTypeDescription, StepID, TimeDuration, TimePoint, VariableSetting,
    VariableSettingResult,
};
use crate::reactor;

/// The three externally-visible states of §4.6, collapsing the
/// messenger's finer-grained machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    NotConnected,
    Busy,
    Ready,
    StepOk,
    StepFailed,
}

pub struct SlaveController {
    slave_id: SlaveID,
    locator: SlaveLocator,
    client_max_version: u16,
    connection: ConnectionConfig,
    messenger: SlaveControlMessenger,
    description: Option<SlaveTypeDescription>,
}

impl SlaveController {
    pub fn new(
        slave_id: SlaveID,
        locator: SlaveLocator,
        client_max_version: u16,
        connection: ConnectionConfig,
        command_timeout: Duration,
    ) -> Self {
        Self {
            slave_id,
            locator,
            client_max_version,
            connection,
            messenger: SlaveControlMessenger::new(slave_id, command_timeout),
            description: None,
        }
    }

    pub fn slave_id(&self) -> SlaveID {
        self.slave_id
    }

    pub fn locator(&self) -> &SlaveLocator {
        &self.locator
    }

    pub fn description(&self) -> Option<&SlaveTypeDescription> {
        self.description.as_ref()
    }

    pub fn state(&self) -> ControllerState {
        match self.messenger.state() {
            MessengerState::NotConnected | MessengerState::Disconnected => ControllerState::NotConnected,
            MessengerState::Connected | MessengerState::Busy => ControllerState::Busy,
            MessengerState::Ready => ControllerState::Ready,
            MessengerState::StepOk => ControllerState::StepOk,
            MessengerState::StepFailed => ControllerState::StepFailed,
        }
    }

    /// Connects with up to `maxConnectionAttempts` retries (exponential
    /// back-off capped at `max_retry_delay`, the wait between attempts
    /// driven by `reactor::delay` rather than a bare `tokio::time::sleep`,
    /// per §4.6), then issues `SETUP` and fetches the slave's type
    /// description.
    pub async fn connect(&mut self, slave_name: &str, setup: &SlaveSetup) -> CoreResult<SlaveTypeDescription> {
        let addr: SocketAddr = self
            .locator
            .control_endpoint
            .address
            .parse()
            .map_err(|_| SystemError::ConnectionRefused)?;

        let mut delay = self.connection.initial_retry_delay;
        let mut attempt = 1;
        loop {
            match self.messenger.connect(addr, self.client_max_version).await {
                Ok(()) => break,
                Err(e) if attempt >= self.connection.max_connection_attempts => {
                    warn!(slave = %self.slave_id, attempt, "giving up connecting to slave");
                    return Err(e);
                }
                Err(e) => {
                    debug!(slave = %self.slave_id, attempt, error = %e, "connection attempt failed, retrying");
                    reactor::delay(delay).await;
                    delay = (delay * 2).min(self.connection.max_retry_delay);
                    attempt += 1;
                }
            }
        }

        self.messenger
            .setup(
                slave_name,
                &setup.execution_name,
                setup.start_time,
                setup.stop_time,
                setup.variable_recv_timeout,
            )
            .await?;
        self.messenger.get_description().await
    }

    pub async fn set_variables(&mut self, settings: &[VariableSetting]) -> CoreResult<Vec<VariableSettingResult>> {
        self.messenger.set_variables(settings).await
    }

    pub async fn set_peers(&mut self, endpoints: &[Endpoint]) -> CoreResult<()> {
        self.messenger.set_peers(endpoints).await
    }

    pub async fn resend_vars(&mut self) -> CoreResult<()> {
        self.messenger.resend_vars().await
    }

    pub async fn step(&mut self, step: StepID, current_time: TimePoint, step_size: TimeDuration) -> CoreResult<()> {
        self.messenger.step(step, current_time, step_size).await
    }

    pub async fn accept_step(&mut self) -> CoreResult<()> {
        self.messenger.accept_step().await
    }

    pub async fn terminate(&mut self) -> CoreResult<()> {
        if self.state() == ControllerState::NotConnected {
            return Ok(());
        }
        self.messenger.terminate().await
    }
}
