//! Component E: the slave-control messenger, the client half of the
//! master <-> slave control protocol (§4.5). Each messenger owns one
//! `ReqSocket` to exactly one slave agent; the engine never issues a
//! second operation while one is in flight, so the messenger's own
//! state machine never has to arbitrate between concurrent callers.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{CoreResult, PreconditionError, ProtocolError, SimulationError};
use crate::model::{
    Endpoint, SlaveID, SlaveTypeDescription, StepID, TimeDuration, TimePoint, VariableSetting,
    VariableSettingResult,
};
use crate::transport::reqrep::ReqSocket;
use crate::wire::codec::{NormalFrame, msg_type};
use crate::wire::messages::{
    DescriptionBody, SetPeersBody, SetVarsBody, SetVarsResultBody, SetupBody, StepBody, VariableSettingProto,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerState {
    NotConnected,
    Connected,
    Ready,
    Busy,
    StepOk,
    StepFailed,
    Disconnected,
}

pub struct SlaveControlMessenger {
    slave_id: SlaveID,
    socket: Option<ReqSocket>,
    state: MessengerState,
    timeout: Duration,
}

impl SlaveControlMessenger {
    pub fn new(slave_id: SlaveID, timeout: Duration) -> Self {
        Self {
            slave_id,
            socket: None,
            state: MessengerState::NotConnected,
            timeout,
        }
    }

    pub fn state(&self) -> MessengerState {
        self.state
    }

    pub async fn connect(&mut self, addr: SocketAddr, client_max_version: u16) -> CoreResult<()> {
        let socket = ReqSocket::connect(addr, client_max_version).await?;
        self.socket = Some(socket);
        self.state = MessengerState::Connected;
        Ok(())
    }

    pub fn close(&mut self) {
        self.socket = None;
        self.state = MessengerState::NotConnected;
    }

    fn require_connected(&self) -> CoreResult<()> {
        if self.socket.is_none() {
            return Err(PreconditionError {
                operation: "messenger operation",
                state: "NotConnected",
            }
            .into());
        }
        Ok(())
    }

    async fn call(&mut self, request: NormalFrame) -> CoreResult<NormalFrame> {
        self.require_connected()?;
        self.state = MessengerState::Busy;
        let socket = self.socket.as_mut().expect("checked above");
        match socket.request(request, self.timeout).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.state = MessengerState::Disconnected;
                Err(e)
            }
        }
    }

    /// Issued once by the controller right after HELLO (§4.6), not a
    /// user-visible operation of the E/Ready⇄StepOk table.
    pub async fn setup(
        &mut self,
        slave_name: &str,
        execution_name: &str,
        start_time: TimePoint,
        stop_time: TimePoint,
        variable_recv_timeout: Duration,
    ) -> CoreResult<()> {
        let body = SetupBody {
            slave_id: self.slave_id.0 as u32,
            slave_name: slave_name.to_string(),
            execution_name: execution_name.to_string(),
            start_time,
            stop_time,
            variable_recv_timeout_ms: variable_recv_timeout.as_millis() as u64,
        };
        self.call(NormalFrame::with_body(msg_type::SETUP, body)).await?;
        self.state = MessengerState::Ready;
        Ok(())
    }

    pub async fn get_description(&mut self) -> CoreResult<SlaveTypeDescription> {
        let reply = self.call(NormalFrame::empty(msg_type::DESCRIBE)).await?;
        self.state = MessengerState::Ready;
        let body: DescriptionBody = reply.decode_body()?;
        SlaveTypeDescription::try_from(
            body.type_description
                .ok_or_else(|| ProtocolError::Violation("DESCRIPTION missing type_description".into()))?,
        )
    }

    /// Attempts every setting and reports each outcome individually
    /// (§4.9): a slave that cannot honour one entry still attempts the
    /// rest, so the returned list may contain a mix of `Ok`/`Err`
    /// entries rather than a single aggregate failure.
    pub async fn set_variables(&mut self, settings: &[VariableSetting]) -> CoreResult<Vec<VariableSettingResult>> {
        let body = SetVarsBody {
            settings: settings.iter().map(VariableSettingProto::from).collect(),
        };
        let reply = self.call(NormalFrame::with_body(msg_type::SET_VARS, body)).await?;
        self.state = MessengerState::Ready;
        let body: SetVarsResultBody = reply.decode_body()?;
        Ok(body.results.into_iter().map(VariableSettingResult::from).collect())
    }

    pub async fn set_peers(&mut self, endpoints: &[Endpoint]) -> CoreResult<()> {
        let body = SetPeersBody {
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
        };
        self.call(NormalFrame::with_body(msg_type::SET_PEERS, body)).await?;
        self.state = MessengerState::Ready;
        Ok(())
    }

    /// Idempotent: two back-to-back calls republish the same values
    /// twice (§8).
    pub async fn resend_vars(&mut self) -> CoreResult<()> {
        self.call(NormalFrame::empty(msg_type::RESEND_VARS)).await?;
        self.state = MessengerState::Ready;
        Ok(())
    }

    /// `Ok(())` on `StepOk`; `Err(SimulationError::CannotPerformTimestep)`
    /// on `StepFailed` (the messenger still transitions to `StepFailed`,
    /// distinct from a transport-level `Err` which leaves it
    /// `Disconnected`, per §4.5's three-way `Step` outcome).
    pub async fn step(&mut self, step: StepID, current_time: TimePoint, step_size: TimeDuration) -> CoreResult<()> {
        let body = StepBody {
            step_id: step.0,
            current_time,
            step_size,
        };
        let reply = self.call(NormalFrame::with_body(msg_type::STEP, body)).await?;
        match reply.msg_type {
            msg_type::STEP_OK => {
                self.state = MessengerState::StepOk;
                Ok(())
            }
            msg_type::STEP_FAILED => {
                self.state = MessengerState::StepFailed;
                Err(SimulationError::CannotPerformTimestep { slave: self.slave_id }.into())
            }
            other => Err(ProtocolError::UnexpectedMessageType(other).into()),
        }
    }

    pub async fn accept_step(&mut self) -> CoreResult<()> {
        self.call(NormalFrame::empty(msg_type::ACCEPT_STEP)).await?;
        self.state = MessengerState::Ready;
        Ok(())
    }

    /// Fire-and-forget by protocol definition: does not wait for a
    /// reply, so shutdown makes progress even against a slave that never
    /// answers.
    pub async fn terminate(&mut self) -> CoreResult<()> {
        if let Some(socket) = self.socket.as_mut() {
            socket.send_only(NormalFrame::empty(msg_type::TERMINATE)).await?;
        }
        self.close();
        Ok(())
    }
}
