//! Component I: the slave agent, the server-side counterpart of the
//! control messenger (E) and controller (F) combined with the variable
//! pub/sub plumbing (§4.9). One `SlaveAgent` owns exactly one
//! `SlaveInstance`, serves exactly one master connection for its whole
//! lifetime, and enforces the master-inactivity timeout with a Reactor
//! timer reset by every received message.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::capability::SlaveInstance;
use crate::error::{CoreError, CoreResult, PreconditionError, ProtocolError, ReactorError, SystemError};
use crate::model::{
    Causality, DataType, ScalarValue, SlaveID, SlaveLocator, StepID, Variable, VariableID,
};
use crate::pubsub::{Publisher, Subscriber};
use crate::reactor::{Reactor, TimerResetter};
use crate::transport::reqrep::RepSocket;
use crate::wire::codec::{NormalFrame, msg_type};
use crate::wire::messages::{
    DescriptionBody, ErrorBody, SetPeersBody, SetVarResult, SetVarsBody, SetVarsResultBody, SetupBody, StepBody,
    error_code,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    NotConnected,
    Connected,
    Ready,
    Published,
    StepFailed,
    Terminated,
}

impl AgentState {
    fn require(self, allowed: &[AgentState], operation: &'static str) -> CoreResult<()> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            Err(PreconditionError {
                operation,
                state: match self {
                    AgentState::NotConnected => "NotConnected",
                    AgentState::Connected => "Connected",
                    AgentState::Ready => "Ready",
                    AgentState::Published => "Published",
                    AgentState::StepFailed => "StepFailed",
                    AgentState::Terminated => "Terminated",
                },
            }
            .into())
        }
    }
}

/// Owns a `SlaveInstance` and drives it on behalf of one remote master.
pub struct SlaveAgent<S: SlaveInstance> {
    instance: S,
    state: AgentState,
    slave_id: SlaveID,
    slave_name: String,
    execution_name: String,
    variable_recv_timeout: Duration,
    subscriber: Subscriber,
    publisher: Publisher,
    /// Local input variable -> the remote output it is currently
    /// connected to. Used so `SET_VARS` disconnects know what to
    /// unsubscribe, and so `STEP` knows which local inputs to refresh
    /// from the subscriber.
    connections: HashMap<VariableID, Variable>,
    /// The step ID outputs were last published under; `RESEND_VARS`
    /// republishes at this ID without recomputing (§4.9). Starts at 0:
    /// before any real step, the instance's initial state is the
    /// "output" a fresh subscriber needs for the very first `Step(0)`.
    last_published_step: StepID,
}

impl<S: SlaveInstance> SlaveAgent<S> {
    /// Binds the agent's data-publishing endpoint. The control endpoint
    /// is bound separately by `serve`, since accepting the one master
    /// connection is a distinct step from standing up the pub/sub side.
    pub async fn bind(instance: S, data_pub_addr: SocketAddr) -> CoreResult<Self> {
        let publisher = Publisher::bind(data_pub_addr).await?;
        Ok(Self {
            instance,
            state: AgentState::NotConnected,
            slave_id: SlaveID::INVALID,
            slave_name: String::new(),
            execution_name: String::new(),
            variable_recv_timeout: Duration::from_secs(1),
            subscriber: Subscriber::new(),
            publisher,
            connections: HashMap::new(),
            last_published_step: StepID::FIRST,
        })
    }

    pub fn data_pub_addr(&self) -> SocketAddr {
        self.publisher.local_addr()
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Accepts the master's control connection on `control_listener`,
    /// negotiates the protocol version, and serves control messages
    /// until the master disconnects, sends `TERMINATE`, or falls silent
    /// for longer than `master_timeout`. The inactivity timeout is a
    /// `Reactor` timer reset by every received message (§4.9); on fire,
    /// the reactor returns `Err(ReactorError::MasterInactivityTimeout)`,
    /// raced against the dispatch loop via `tokio::select!` so whichever
    /// ends first decides `serve`'s outcome.
    pub async fn serve(
        mut self,
        control_listener: TcpListener,
        server_max_version: u16,
        master_timeout: Duration,
    ) -> CoreResult<()> {
        let (stream, peer) = control_listener.accept().await.map_err(SystemError::Io)?;
        let mut rep = RepSocket::accept(stream, peer, server_max_version).await?;
        self.state = AgentState::Connected;
        info!(%peer, "master connected");

        let mut reactor = Reactor::new();
        let (_timer_id, resetter) = reactor.register_timer_with_reset(
            master_timeout,
            Box::new(|| Err(ReactorError::MasterInactivityTimeout.into())),
        );

        tokio::select! {
            biased;
            r = reactor.run() => {
                warn!(%peer, ?master_timeout, "master went silent; aborting");
                r
            }
            r = self.dispatch_loop(&mut rep, &resetter, peer) => r,
        }
    }

    /// The per-message half of `serve`: receives, resets the inactivity
    /// timer, dispatches, and replies, until the connection ends.
    async fn dispatch_loop(&mut self, rep: &mut RepSocket, resetter: &TimerResetter, peer: SocketAddr) -> CoreResult<()> {
        loop {
            let request = match rep.recv().await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    debug!(%peer, "master closed the control connection");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            resetter.reset();

            match self.dispatch(request).await {
                Ok(Some(reply)) => rep.send(reply).await?,
                Ok(None) => {
                    // TERMINATE: fire-and-forget by protocol definition,
                    // no reply is sent and the connection ends here.
                    return Ok(());
                }
                Err(e) => {
                    rep.send(error_frame(&e)).await?;
                }
            }
        }
    }

    async fn dispatch(&mut self, request: NormalFrame) -> CoreResult<Option<NormalFrame>> {
        match request.msg_type {
            msg_type::DESCRIBE => self.handle_describe().map(Some),
            msg_type::SETUP => self.handle_setup(request.decode_body()?).await.map(Some),
            msg_type::SET_VARS => self.handle_set_vars(request.decode_body()?).map(Some),
            msg_type::SET_PEERS => self.handle_set_peers(request.decode_body()?).await.map(Some),
            msg_type::RESEND_VARS => self.handle_resend_vars().map(Some),
            msg_type::STEP => self.handle_step(request.decode_body()?).await.map(Some),
            msg_type::ACCEPT_STEP => self.handle_accept_step().map(Some),
            msg_type::TERMINATE => {
                self.handle_terminate();
                Ok(None)
            }
            other => Err(ProtocolError::UnexpectedMessageType(other).into()),
        }
    }

    fn handle_describe(&mut self) -> CoreResult<NormalFrame> {
        let body = DescriptionBody {
            type_description: Some((self.instance.type_description()).into()),
        };
        Ok(NormalFrame::with_body(msg_type::DESCRIPTION, body))
    }

    async fn handle_setup(&mut self, body: SetupBody) -> CoreResult<NormalFrame> {
        self.state.require(&[AgentState::Connected], "SETUP")?;
        self.slave_id = SlaveID(body.slave_id as u16);
        self.slave_name = body.slave_name;
        self.execution_name = body.execution_name;
        self.variable_recv_timeout = Duration::from_millis(body.variable_recv_timeout_ms);
        self.instance.setup(
            &self.slave_name,
            &self.execution_name,
            body.start_time,
            body.stop_time,
            false,
            None,
        )?;
        self.instance.start_simulation()?;
        self.state = AgentState::Ready;
        Ok(NormalFrame::empty(msg_type::HELLO_OK))
    }

    /// Attempts every setting in `body` even if earlier ones fail, and
    /// reports each outcome individually in the reply (§4.9: "a slave
    /// that cannot honour an individual setting must still attempt all
    /// others and return a per-entry result").
    fn handle_set_vars(&mut self, body: SetVarsBody) -> CoreResult<NormalFrame> {
        self.state.require(&[AgentState::Ready], "SET_VARS")?;
        let mut results = Vec::with_capacity(body.settings.len());
        for proto in body.settings {
            let variable_id = proto.variable_id;
            let outcome = crate::model::VariableSetting::try_from(proto)
                .and_then(|setting| self.apply_setting(setting));
            results.push(match outcome {
                Ok(()) => SetVarResult {
                    variable_id,
                    ok: true,
                    code: 0,
                    details: String::new(),
                },
                Err(e) => SetVarResult {
                    variable_id,
                    ok: false,
                    code: error_code_for(&e),
                    details: e.to_string(),
                },
            });
        }
        Ok(NormalFrame::with_body(msg_type::SET_VARS_RESULT, SetVarsResultBody { results }))
    }

    fn apply_setting(&mut self, setting: crate::model::VariableSetting) -> CoreResult<()> {
        let data_type = self
            .instance
            .type_description()
            .variable(setting.variable)
            .ok_or_else(|| ProtocolError::Violation(format!("unknown variable {}", setting.variable)))?
            .data_type;

        if let Some(value) = setting.value {
            set_scalar(&mut self.instance, setting.variable, data_type, value)?;
        }
        if let Some(target) = setting.connected_output {
            if let Some(previous) = self.connections.remove(&setting.variable) {
                self.subscriber.unsubscribe(previous);
            }
            if !target.is_empty() {
                self.subscriber.subscribe(target);
                self.connections.insert(setting.variable, target);
            }
        }
        Ok(())
    }

    async fn handle_set_peers(&mut self, body: SetPeersBody) -> CoreResult<NormalFrame> {
        self.state.require(&[AgentState::Ready], "SET_PEERS")?;
        let endpoints = body
            .endpoints
            .iter()
            .map(|s| s.parse().map_err(CoreError::from))
            .collect::<CoreResult<Vec<_>>>()?;
        self.subscriber.set_peers(&endpoints).await?;
        Ok(NormalFrame::empty(msg_type::HELLO_OK))
    }

    fn handle_resend_vars(&mut self) -> CoreResult<NormalFrame> {
        self.state
            .require(&[AgentState::Ready, AgentState::Published], "RESEND_VARS")?;
        self.publish_outputs(self.last_published_step);
        Ok(NormalFrame::empty(msg_type::HELLO_OK))
    }

    async fn handle_step(&mut self, body: StepBody) -> CoreResult<NormalFrame> {
        self.state.require(&[AgentState::Ready], "STEP")?;
        let target_step = StepID(body.step_id);

        let received = self.subscriber.update(target_step, self.variable_recv_timeout).await?;
        if !received {
            self.state = AgentState::StepFailed;
            // The wire protocol has a single failure signal for `STEP`
            // (`STEP_FAILED`); a timeout waiting for connected input data
            // is reported the same way as the slave itself refusing the
            // step, and the messenger attributes both as
            // `CannotPerformTimestep` (§4.5).
            return Ok(NormalFrame::empty(msg_type::STEP_FAILED));
        }

        for (&local, &remote) in &self.connections {
            let Some(value) = self.subscriber.value(remote).cloned() else {
                continue;
            };
            let data_type = self
                .instance
                .type_description()
                .variable(local)
                .map(|d| d.data_type)
                .unwrap_or(value.data_type());
            set_scalar(&mut self.instance, local, data_type, value)?;
        }

        if !self.instance.do_step(body.current_time, body.step_size) {
            self.state = AgentState::StepFailed;
            return Ok(NormalFrame::empty(msg_type::STEP_FAILED));
        }

        let next_step = target_step.next();
        self.publish_outputs(next_step);
        self.last_published_step = next_step;
        self.state = AgentState::Published;
        Ok(NormalFrame::empty(msg_type::STEP_OK))
    }

    fn handle_accept_step(&mut self) -> CoreResult<NormalFrame> {
        self.state.require(&[AgentState::Published], "ACCEPT_STEP")?;
        self.state = AgentState::Ready;
        Ok(NormalFrame::empty(msg_type::READY))
    }

    fn handle_terminate(&mut self) {
        let _ = self.instance.end_simulation();
        self.state = AgentState::Terminated;
    }

    fn publish_outputs(&self, step: StepID) {
        let description = self.instance.type_description();
        for var in description.variables.values() {
            if var.causality != Causality::Output {
                continue;
            }
            let Ok(value) = get_scalar(&self.instance, var.id, var.data_type) else {
                continue;
            };
            self.publisher.publish(step, Variable::new(self.slave_id, var.id), &value);
        }
    }
}

fn set_scalar<S: SlaveInstance>(
    instance: &mut S,
    id: VariableID,
    data_type: DataType,
    value: ScalarValue,
) -> CoreResult<()> {
    let accepted = match (data_type, &value) {
        (DataType::Real, ScalarValue::Real(v)) => instance.set_real(id, *v),
        (DataType::Integer, ScalarValue::Integer(v)) => instance.set_integer(id, *v),
        (DataType::Boolean, ScalarValue::Boolean(v)) => instance.set_boolean(id, *v),
        (DataType::String, ScalarValue::String(v)) => instance.set_string(id, v.clone()),
        _ => {
            return Err(ProtocolError::Violation(format!(
                "variable {id} is of type {data_type:?} but got a {:?} value",
                value.data_type()
            ))
            .into());
        }
    };
    if accepted {
        Ok(())
    } else {
        Err(crate::error::GenericError::OperationFailed(format!("slave rejected assignment to variable {id}")).into())
    }
}

fn get_scalar<S: SlaveInstance>(instance: &S, id: VariableID, data_type: DataType) -> CoreResult<ScalarValue> {
    Ok(match data_type {
        DataType::Real => ScalarValue::Real(instance.get_real(id)?),
        DataType::Integer => ScalarValue::Integer(instance.get_integer(id)?),
        DataType::Boolean => ScalarValue::Boolean(instance.get_boolean(id)?),
        DataType::String => ScalarValue::String(instance.get_string(id)?),
    })
}

fn error_code_for(err: &CoreError) -> u32 {
    match err {
        CoreError::Simulation(crate::error::SimulationError::CannotPerformTimestep { .. }) => {
            error_code::CANNOT_PERFORM_TIMESTEP
        }
        CoreError::Simulation(crate::error::SimulationError::DataTimeout { .. }) => error_code::DATA_TIMEOUT,
        CoreError::Precondition(_) => error_code::PRECONDITION_VIOLATION,
        CoreError::Protocol(_) => error_code::PROTOCOL_VIOLATION,
        _ => error_code::OPERATION_FAILED,
    }
}

fn error_frame(err: &CoreError) -> NormalFrame {
    error_frame_with_code(error_code_for(err), &err.to_string())
}

fn error_frame_with_code(code: u32, details: &str) -> NormalFrame {
    NormalFrame::with_body(
        msg_type::ERROR,
        ErrorBody {
            code,
            details: details.to_string(),
        },
    )
}

/// Convenience used by `SlaveProvider` and integration tests: binds both
/// the control listener and the data-publishing endpoint and returns the
/// resulting `SlaveLocator` alongside the still-unstarted agent.
pub async fn bind_agent<S: SlaveInstance>(
    instance: S,
    control_addr: SocketAddr,
    data_pub_addr: SocketAddr,
) -> CoreResult<(SlaveAgent<S>, TcpListener, SlaveLocator)> {
    let control_listener = TcpListener::bind(control_addr).await.map_err(SystemError::Io)?;
    let control_local = control_listener.local_addr().map_err(SystemError::Io)?;
    let agent = SlaveAgent::bind(instance, data_pub_addr).await?;
    let locator = SlaveLocator {
        control_endpoint: crate::model::Endpoint::tcp(control_local.to_string()),
        data_pub_endpoint: crate::model::Endpoint::tcp(agent.data_pub_addr().to_string()),
    };
    Ok((agent, control_listener, locator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SlaveTypeDescription, TimeDuration, TimePoint, Variability, VariableDescription};
    use crate::transport::reqrep::ReqSocket;
    use std::collections::BTreeMap;

    struct CounterSlave {
        description: SlaveTypeDescription,
        count: i64,
    }

    impl CounterSlave {
        fn new() -> Self {
            let mut variables = BTreeMap::new();
            variables.insert(
                VariableID(1),
                VariableDescription {
                    id: VariableID(1),
                    name: "count".into(),
                    data_type: DataType::Integer,
                    causality: Causality::Output,
                    variability: Variability::Discrete,
                },
            );
            Self {
                description: SlaveTypeDescription {
                    name: "Counter".into(),
                    uuid: uuid::Uuid::nil(),
                    description: String::new(),
                    author: String::new(),
                    version: "1.0".into(),
                    variables,
                },
                count: 0,
            }
        }
    }

    impl SlaveInstance for CounterSlave {
        fn type_description(&self) -> &SlaveTypeDescription {
            &self.description
        }
        fn setup(
            &mut self,
            _slave_name: &str,
            _execution_name: &str,
            _start_time: TimePoint,
            _stop_time: TimePoint,
            _adaptive_step_size: bool,
            _relative_tolerance: Option<f64>,
        ) -> CoreResult<()> {
            Ok(())
        }
        fn start_simulation(&mut self) -> CoreResult<()> {
            Ok(())
        }
        fn end_simulation(&mut self) -> CoreResult<()> {
            Ok(())
        }
        fn get_real(&self, _id: VariableID) -> CoreResult<f64> {
            Ok(0.0)
        }
        fn get_integer(&self, _id: VariableID) -> CoreResult<i64> {
            Ok(self.count)
        }
        fn get_boolean(&self, _id: VariableID) -> CoreResult<bool> {
            Ok(false)
        }
        fn get_string(&self, _id: VariableID) -> CoreResult<String> {
            Ok(String::new())
        }
        fn set_real(&mut self, _id: VariableID, _value: f64) -> bool {
            false
        }
        fn set_integer(&mut self, _id: VariableID, _value: i64) -> bool {
            false
        }
        fn set_boolean(&mut self, _id: VariableID, _value: bool) -> bool {
            false
        }
        fn set_string(&mut self, _id: VariableID, _value: String) -> bool {
            false
        }
        fn do_step(&mut self, _t: TimePoint, _dt: TimeDuration) -> bool {
            self.count += 1;
            true
        }
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_step_ok_and_terminates() {
        let (agent, control_listener, locator) = bind_agent(
            CounterSlave::new(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .unwrap();
        let control_addr: SocketAddr = locator.control_endpoint.address.parse().unwrap();
        let server = tokio::spawn(agent.serve(control_listener, 1, Duration::from_secs(5)));

        let mut client = ReqSocket::connect(control_addr, 1).await.unwrap();

        let reply = client
            .request(
                NormalFrame::with_body(
                    msg_type::SETUP,
                    SetupBody {
                        slave_id: 1,
                        slave_name: "counter".into(),
                        execution_name: "test".into(),
                        start_time: 0.0,
                        stop_time: 10.0,
                        variable_recv_timeout_ms: 1000,
                    },
                ),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply.msg_type, msg_type::HELLO_OK);

        let reply = client
            .request(
                NormalFrame::with_body(
                    msg_type::STEP,
                    StepBody {
                        step_id: 0,
                        current_time: 0.0,
                        step_size: 1.0,
                    },
                ),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply.msg_type, msg_type::STEP_OK);

        let reply = client
            .request(NormalFrame::empty(msg_type::ACCEPT_STEP), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.msg_type, msg_type::READY);

        client.send_only(NormalFrame::empty(msg_type::TERMINATE)).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn step_before_setup_is_a_precondition_violation() {
        let (agent, control_listener, locator) = bind_agent(
            CounterSlave::new(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .unwrap();
        let control_addr: SocketAddr = locator.control_endpoint.address.parse().unwrap();
        tokio::spawn(agent.serve(control_listener, 1, Duration::from_secs(5)));

        let mut client = ReqSocket::connect(control_addr, 1).await.unwrap();
        let err = client
            .request(
                NormalFrame::with_body(
                    msg_type::STEP,
                    StepBody {
                        step_id: 0,
                        current_time: 0.0,
                        step_size: 1.0,
                    },
                ),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Generic(crate::error::GenericError::OperationFailed(_))));
    }
}
