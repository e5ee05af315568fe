//! Component G: the execution state machine, the heart of the master
//! side of the protocol (§4.7). `ExecutionEngine` owns the
//! execution-global state of `SPEC_FULL.md` §3 (`slaves`, `lastSlaveID`,
//! `currentStepID`) and drives the eight external operations by
//! fanning per-slave work out across `fanout::fan_out` and collecting
//! every result before committing a state transition.

pub mod fanout;
pub mod state;

pub use state::ExecutionState;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{ConnectionConfig, ExecutionConfig, MAX_SLAVE_COUNT, SlaveSetup};
use crate::controller::SlaveController;
use crate::error::{CoreResult, GenericError, ProtocolError};
use crate::model::{
    Endpoint, SlaveDescription, SlaveID, SlaveLocator, SlaveTypeDescription, StepID, TimeDuration,
    TimePoint, VariableSetting, VariableSettingResult, is_valid_slave_name,
};
use fanout::{fan_out, fan_out_uniform};

/// One slave the caller wants `reconstitute` to add.
#[derive(Debug, Clone)]
pub struct SlaveToAdd {
    pub name: String,
    pub locator: SlaveLocator,
}

/// One slave's `SetVariables`/`SetPeers` fan-out for `reconfigure`.
/// `peers` replaces the subscriber's whole connection set wholesale when
/// present, matching `SET_PEERS`'s "replacing previous connections
/// wholesale" semantics (§4.9).
#[derive(Debug, Clone, Default)]
pub struct ReconfigureCommand {
    pub settings: Vec<VariableSetting>,
    pub peers: Option<Vec<Endpoint>>,
}

struct SlaveEntry {
    controller: Arc<Mutex<SlaveController>>,
    name: String,
    description: SlaveTypeDescription,
}

/// The execution state machine (component G). Not `Clone`/`Sync`: every
/// public operation takes `&mut self` and runs to completion before
/// returning, matching the "the engine never issues a new command to a
/// slave while a previous command is in flight" ordering guarantee of
/// §5.
pub struct ExecutionEngine {
    slave_setup: SlaveSetup,
    exec_config: ExecutionConfig,
    connection_config: ConnectionConfig,
    client_max_version: u16,
    slaves: BTreeMap<SlaveID, SlaveEntry>,
    last_slave_id: u16,
    current_step_id: StepID,
    sim_time: TimePoint,
    last_step_size: Option<TimeDuration>,
    state: ExecutionState,
}

impl ExecutionEngine {
    pub fn new(
        slave_setup: SlaveSetup,
        exec_config: ExecutionConfig,
        connection_config: ConnectionConfig,
        client_max_version: u16,
    ) -> Self {
        let sim_time = slave_setup.start_time;
        Self {
            slave_setup,
            exec_config,
            connection_config,
            client_max_version,
            slaves: BTreeMap::new(),
            last_slave_id: 0,
            current_step_id: StepID::INVALID,
            sim_time,
            last_step_size: None,
            state: ExecutionState::Ready,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn current_step_id(&self) -> StepID {
        self.current_step_id
    }

    pub fn current_time(&self) -> TimePoint {
        self.sim_time
    }

    pub fn slave_ids(&self) -> Vec<SlaveID> {
        self.slaves.keys().copied().collect()
    }

    pub fn slave_description(&self, id: SlaveID) -> Option<SlaveDescription> {
        let entry = self.slaves.get(&id)?;
        Some(SlaveDescription {
            id,
            name: entry.name.clone(),
            type_description: entry.description.clone(),
        })
    }

    fn controllers(&self) -> BTreeMap<SlaveID, Arc<Mutex<SlaveController>>> {
        self.slaves
            .iter()
            .map(|(id, entry)| (*id, entry.controller.clone()))
            .collect()
    }

    /// Adds `specs` to an already-initialised execution (§4.7
    /// `Reconstitute`). `SlaveID`s are reserved from `lastSlaveID` before
    /// dispatching, so the `SETUP` message each candidate receives during
    /// connection establishment already carries its final ID; a
    /// candidate that fails to connect still burns its reserved ID
    /// (`lastSlaveID` is never rewound), matching "once a slot is
    /// assigned it is never reused" even though that slave never joins
    /// `slaves`.
    pub async fn reconstitute(
        &mut self,
        specs: Vec<SlaveToAdd>,
    ) -> CoreResult<BTreeMap<String, SlaveID>> {
        self.state.require_reconstitute()?;
        if specs.is_empty() {
            return Ok(BTreeMap::new());
        }
        for spec in &specs {
            if !is_valid_slave_name(&spec.name) {
                return Err(
                    ProtocolError::Violation(format!("invalid slave name: {}", spec.name)).into(),
                );
            }
        }
        if self.slaves.len() + specs.len() > MAX_SLAVE_COUNT {
            return Err(GenericError::InvalidArgument(format!(
                "adding {} slaves would exceed the maximum of {MAX_SLAVE_COUNT} live slaves",
                specs.len()
            ))
            .into());
        }

        self.state = ExecutionState::Reconstituting;

        let mut targets = BTreeMap::new();
        let mut names = BTreeMap::new();
        for spec in specs {
            self.last_slave_id += 1;
            let id = SlaveID(self.last_slave_id);
            let controller = Arc::new(Mutex::new(SlaveController::new(
                id,
                spec.locator,
                self.client_max_version,
                self.connection_config,
                self.exec_config.command_timeout,
            )));
            names.insert(id, spec.name);
            targets.insert(id, (controller, ()));
        }

        let slave_setup = self.slave_setup.clone();
        let results = fan_out_with_descriptions(targets, names, slave_setup).await;

        let mut assigned = BTreeMap::new();
        let mut any_failed = false;
        for (id, (result, name, controller)) in results {
            match result {
                Ok(description) => {
                    self.slaves.insert(
                        id,
                        SlaveEntry {
                            controller,
                            name: name.clone(),
                            description,
                        },
                    );
                    assigned.insert(name, id);
                }
                Err(e) => {
                    any_failed = true;
                    warn!(slave = %id, name, error = %e, "slave failed to join execution during reconstitute");
                }
            }
        }

        if any_failed {
            self.state = ExecutionState::FatalError;
            return Err(GenericError::OperationFailed(
                "partial reconstitution: not every requested slave joined the execution".into(),
            )
            .into());
        }
        self.state = ExecutionState::Ready;
        Ok(assigned)
    }

    /// Changes variable values and/or connections on already-running
    /// slaves (§4.7 `Reconfigure`). *Not* atomic across slaves: per-slave
    /// failures (e.g. a lost connection) are reported individually in
    /// the returned map, and each `Ok` entry additionally carries the
    /// per-variable results the slave itself reported for `SET_VARS`
    /// (§4.9), since one slave settling several variables at once may
    /// honour some and reject others. The engine still transitions back
    /// to `Ready` once every slave has finished, regardless of outcome.
    pub async fn reconfigure(
        &mut self,
        commands: BTreeMap<SlaveID, ReconfigureCommand>,
    ) -> CoreResult<BTreeMap<SlaveID, CoreResult<Vec<VariableSettingResult>>>> {
        self.state.require_reconfigure()?;
        self.state = ExecutionState::Reconfiguring;

        let targets: BTreeMap<_, _> = commands
            .into_iter()
            .filter_map(|(id, cmd)| {
                self.slaves
                    .get(&id)
                    .map(|entry| (id, (entry.controller.clone(), cmd)))
            })
            .collect();

        let results = fan_out(targets, |controller, cmd: ReconfigureCommand| async move {
            let mut controller = controller.lock().await;
            let settings_results = if !cmd.settings.is_empty() {
                controller.set_variables(&cmd.settings).await?
            } else {
                Vec::new()
            };
            if let Some(peers) = cmd.peers {
                controller.set_peers(&peers).await?;
            }
            Ok(settings_results)
        })
        .await;

        self.state = ExecutionState::Ready;
        Ok(results)
    }

    /// Republishes every slave's current outputs, up to
    /// `max_priming_attempts` rounds, so subscribers that connected after
    /// the values were first computed catch up (§4.3 rationale, §4.7
    /// `Prime`). Idempotent: repeated calls simply republish again.
    pub async fn prime(&mut self) -> CoreResult<()> {
        self.state.require_prime()?;
        self.state = ExecutionState::Priming;

        for attempt in 1..=self.exec_config.max_priming_attempts {
            let results = fan_out_uniform(self.controllers(), |controller| async move {
                controller.lock().await.resend_vars().await
            })
            .await;
            if results.values().all(|r| r.is_ok()) {
                self.state = ExecutionState::Ready;
                return Ok(());
            }
            info!(attempt, "priming round had at least one failure, retrying");
        }

        self.state = ExecutionState::FatalError;
        Err(GenericError::OperationFailed(format!(
            "priming did not succeed within {} attempts",
            self.exec_config.max_priming_attempts
        ))
        .into())
    }

    /// Advances every slave by `step_size` (§4.7 `Stepping`). On success
    /// the engine transitions to `StepOk` and `currentStepID` has
    /// strictly increased; on any slave reporting
    /// `cannot_perform_timestep` the whole execution transitions to
    /// `StepFailed` (terminal, only `Terminate` is legal from there) and
    /// `currentStepID` is left unchanged, preserving the "strictly
    /// increasing across successful `Step` calls" invariant (§8).
    pub async fn step(&mut self, step_size: TimeDuration) -> CoreResult<()> {
        self.state.require_step()?;
        if step_size <= 0.0 {
            return Err(GenericError::InvalidArgument(format!(
                "step size must be positive, got {step_size}"
            ))
            .into());
        }
        self.state = ExecutionState::Stepping;

        let next_id = self.current_step_id.next();
        let current_time = self.sim_time;
        let results = fan_out_uniform(self.controllers(), move |controller| async move {
            controller.lock().await.step(next_id, current_time, step_size).await
        })
        .await;

        if let Some((slave, err)) = results.iter().find_map(|(id, r)| r.as_ref().err().map(|e| (*id, e))) {
            if matches!(
                err,
                crate::error::CoreError::Simulation(crate::error::SimulationError::CannotPerformTimestep { .. })
            ) {
                self.state = ExecutionState::StepFailed;
                return Err(
                    crate::error::SimulationError::CannotPerformTimestep { slave }.into(),
                );
            }
            self.state = ExecutionState::FatalError;
            return Err(GenericError::Fatal(format!("slave {slave} lost during step")).into());
        }

        self.current_step_id = next_id;
        self.last_step_size = Some(step_size);
        self.state = ExecutionState::StepOk;
        Ok(())
    }

    /// Confirms the last step to every slave (§4.7 `Accepting`),
    /// advancing simulated time by the step size that was just taken.
    pub async fn accept_step(&mut self) -> CoreResult<()> {
        self.state.require_accept_step()?;
        self.state = ExecutionState::Accepting;

        let results = fan_out_uniform(self.controllers(), |controller| async move {
            controller.lock().await.accept_step().await
        })
        .await;

        if let Some(slave) = results.iter().find(|(_, r)| r.is_err()).map(|(id, _)| *id) {
            self.state = ExecutionState::FatalError;
            return Err(GenericError::Fatal(format!("slave {slave} failed to accept step")).into());
        }

        self.sim_time += self.last_step_size.unwrap_or(0.0);
        self.state = ExecutionState::Ready;
        Ok(())
    }

    /// Sends `TERMINATE` to every connected slave without waiting for a
    /// reply, so shutdown makes progress even against an unresponsive
    /// slave. A no-op (not an error) if already `Terminated` (§7).
    pub async fn terminate(&mut self) -> CoreResult<()> {
        if self.state == ExecutionState::Terminated {
            return Ok(());
        }
        self.state.require_terminate()?;
        let _ = fan_out_uniform(self.controllers(), |controller| async move {
            controller.lock().await.terminate().await
        })
        .await;
        self.state = ExecutionState::Terminated;
        Ok(())
    }
}

/// Runs `SlaveController::connect` for every target concurrently and
/// returns each outcome alongside the caller-supplied name, keyed by the
/// `SlaveID` reserved for it.
type ConnectOutcome = (CoreResult<SlaveTypeDescription>, String, Arc<Mutex<SlaveController>>);

async fn fan_out_with_descriptions(
    targets: BTreeMap<SlaveID, (Arc<Mutex<SlaveController>>, ())>,
    names: BTreeMap<SlaveID, String>,
    slave_setup: SlaveSetup,
) -> BTreeMap<SlaveID, ConnectOutcome> {
    let mut handles = Vec::new();
    for (id, (controller, ())) in targets {
        let name = names.get(&id).cloned().unwrap_or_default();
        let slave_setup = slave_setup.clone();
        handles.push(tokio::spawn(async move {
            let result = controller.lock().await.connect(&name, &slave_setup).await;
            (id, result, name, controller)
        }));
    }
    let mut out = BTreeMap::new();
    for handle in handles {
        match handle.await {
            Ok((id, result, name, controller)) => {
                out.insert(id, (result, name, controller));
            }
            Err(e) => {
                warn!(error = %e, "reconstitute connect task panicked");
            }
        }
    }
    out
}
