//! Component H: the execution facade, the public entry point of the
//! master side of the core (§4.8). `Execution` owns a dedicated worker
//! thread that runs a single-threaded Tokio runtime hosting an
//! `ExecutionEngine` (G); every public method posts a command to that
//! thread and blocks on a `oneshot` for the result, giving callers a
//! plain synchronous API without exposing the engine's
//! `async`/callback-oriented internals.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use crate::config::{ConnectionConfig, ExecutionConfig, SlaveSetup};
use crate::error::{CoreError, CoreResult, GenericError};
use crate::execution::{ExecutionEngine, ExecutionState, ReconfigureCommand, SlaveToAdd};
use crate::model::{SlaveDescription, SlaveID, StepID, TimeDuration, TimePoint, VariableSettingResult};
use crate::reactor::Reactor;

type Reply<T> = oneshot::Sender<CoreResult<T>>;

enum Command {
    Reconstitute(Vec<SlaveToAdd>, Reply<BTreeMap<String, SlaveID>>),
    Reconfigure(
        BTreeMap<SlaveID, ReconfigureCommand>,
        Reply<BTreeMap<SlaveID, CoreResult<Vec<VariableSettingResult>>>>,
    ),
    Prime(Reply<()>),
    Step(TimeDuration, Reply<()>),
    AcceptStep(Reply<()>),
    Terminate(Reply<()>),
    State(Reply<ExecutionState>),
    CurrentTime(Reply<TimePoint>),
    CurrentStepId(Reply<StepID>),
    SlaveIds(Reply<Vec<SlaveID>>),
    SlaveDescription(SlaveID, Reply<Option<SlaveDescription>>),
}

/// A snapshot of why the worker thread is no longer available, chained
/// as the `source` of `GenericError::CommThreadDead` (§4.8).
#[derive(Debug)]
struct WorkerDied(String);

impl std::fmt::Display for WorkerDied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for WorkerDied {}

/// The public, synchronous handle to one execution. Cheap to `Clone`
/// (an `Arc`-backed command channel); every clone talks to the same
/// worker thread and therefore the same `ExecutionEngine`.
#[derive(Clone)]
pub struct Execution {
    tx: mpsc::UnboundedSender<Command>,
    panic: Arc<StdMutex<Option<String>>>,
    _worker: Arc<JoinHandle<()>>,
}

impl Execution {
    pub fn new(
        slave_setup: SlaveSetup,
        exec_config: ExecutionConfig,
        connection_config: ConnectionConfig,
        client_max_version: u16,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let panic = Arc::new(StdMutex::new(None));
        let panic_for_worker = panic.clone();
        let worker = std::thread::Builder::new()
            .name("cosim-execution".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("building a current-thread runtime cannot fail");
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    runtime.block_on(run_worker(
                        rx,
                        Reactor::new(),
                        ExecutionEngine::new(slave_setup, exec_config, connection_config, client_max_version),
                    ));
                }));
                if let Err(payload) = result {
                    let message = panic_message(&payload);
                    *panic_for_worker.lock().expect("panic mutex poisoned") = Some(message);
                }
            })
            .expect("spawning the execution worker thread cannot fail");

        Self {
            tx,
            panic,
            _worker: Arc::new(worker),
        }
    }

    fn dead_error(&self) -> CoreError {
        let reason = self
            .panic
            .lock()
            .expect("panic mutex poisoned")
            .clone()
            .unwrap_or_else(|| "worker thread's command channel closed".to_string());
        GenericError::CommThreadDead {
            source: Box::new(WorkerDied(reason)),
        }
        .into()
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> CoreResult<T> {
        let (tx_reply, rx_reply) = oneshot::channel();
        if self.tx.send(build(tx_reply)).is_err() {
            return Err(self.dead_error());
        }
        rx_reply.await.unwrap_or_else(|_| Err(self.dead_error()))
    }

    pub async fn reconstitute(&self, slaves: Vec<SlaveToAdd>) -> CoreResult<BTreeMap<String, SlaveID>> {
        self.call(|reply| Command::Reconstitute(slaves, reply)).await
    }

    pub async fn reconfigure(
        &self,
        commands: BTreeMap<SlaveID, ReconfigureCommand>,
    ) -> CoreResult<BTreeMap<SlaveID, CoreResult<Vec<VariableSettingResult>>>> {
        self.call(|reply| Command::Reconfigure(commands, reply)).await
    }

    pub async fn prime(&self) -> CoreResult<()> {
        self.call(Command::Prime).await
    }

    pub async fn step(&self, step_size: TimeDuration) -> CoreResult<()> {
        self.call(|reply| Command::Step(step_size, reply)).await
    }

    pub async fn accept_step(&self) -> CoreResult<()> {
        self.call(Command::AcceptStep).await
    }

    pub async fn terminate(&self) -> CoreResult<()> {
        self.call(Command::Terminate).await
    }

    pub async fn state(&self) -> CoreResult<ExecutionState> {
        self.call(Command::State).await
    }

    pub async fn current_time(&self) -> CoreResult<TimePoint> {
        self.call(Command::CurrentTime).await
    }

    pub async fn current_step_id(&self) -> CoreResult<StepID> {
        self.call(Command::CurrentStepId).await
    }

    pub async fn slave_ids(&self) -> CoreResult<Vec<SlaveID>> {
        self.call(Command::SlaveIds).await
    }

    pub async fn slave_description(&self, id: SlaveID) -> CoreResult<Option<SlaveDescription>> {
        self.call(|reply| Command::SlaveDescription(id, reply)).await
    }
}

/// Drives the command loop alongside the worker thread's own `Reactor`
/// (§4.8: the worker thread "owns... the Reactor"), so anything the
/// engine needs driven by a timer (e.g. a connection's retry back-off)
/// runs on the same single-threaded runtime as everything else. The
/// reactor is stopped once the command channel closes, ending `select!`
/// on whichever side is still pending.
async fn run_worker(rx: mpsc::UnboundedReceiver<Command>, mut reactor: Reactor, engine: ExecutionEngine) {
    let stopper = reactor.stopper();
    tokio::select! {
        biased;
        _ = command_loop(rx, engine) => {}
        _ = reactor.run() => {}
    }
    stopper.stop();
}

async fn command_loop(mut rx: mpsc::UnboundedReceiver<Command>, mut engine: ExecutionEngine) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Reconstitute(slaves, reply) => {
                let _ = reply.send(engine.reconstitute(slaves).await);
            }
            Command::Reconfigure(commands, reply) => {
                let _ = reply.send(engine.reconfigure(commands).await);
            }
            Command::Prime(reply) => {
                let _ = reply.send(engine.prime().await);
            }
            Command::Step(step_size, reply) => {
                let _ = reply.send(engine.step(step_size).await);
            }
            Command::AcceptStep(reply) => {
                let _ = reply.send(engine.accept_step().await);
            }
            Command::Terminate(reply) => {
                let _ = reply.send(engine.terminate().await);
            }
            Command::State(reply) => {
                let _ = reply.send(Ok(engine.state()));
            }
            Command::CurrentTime(reply) => {
                let _ = reply.send(Ok(engine.current_time()));
            }
            Command::CurrentStepId(reply) => {
                let _ = reply.send(Ok(engine.current_step_id()));
            }
            Command::SlaveIds(reply) => {
                let _ = reply.send(Ok(engine.slave_ids()));
            }
            Command::SlaveDescription(id, reply) => {
                let _ = reply.send(Ok(engine.slave_description(id)));
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "execution worker thread panicked".to_string()
    }
}
