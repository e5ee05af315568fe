//! The structured-concurrency fan-out primitive behind every per-slave
//! operation the engine issues (§4.7, §9 "Coroutine / async control
//! flow"). Each slave's share of the operation is its own `tokio` task;
//! a single collector drains exactly one result per slave before the
//! calling state transition proceeds. Entering a new engine state drops
//! the `CancellationToken` for the previous one, so any task still
//! running past that point observes cancellation instead of leaking its
//! result into the wrong transition.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::controller::SlaveController;
use crate::error::{CoreResult, GenericError};
use crate::model::SlaveID;

/// Runs `op(controller, payload)` once per entry of `targets`,
/// concurrently, and returns every outcome keyed by `SlaveID`. A result
/// is only ever missing if its task panicked (caught here as
/// `GenericError::Fatal`, never a silent drop). Generic over the
/// per-slave success payload `T` so callers that need more than "it
/// worked" (e.g. `reconfigure`'s per-variable results) don't have to
/// layer a second collection on top.
pub async fn fan_out<P, F, Fut, T>(
    targets: BTreeMap<SlaveID, (Arc<Mutex<SlaveController>>, P)>,
    op: F,
) -> BTreeMap<SlaveID, CoreResult<T>>
where
    P: Send + 'static,
    T: Send + 'static,
    F: Fn(Arc<Mutex<SlaveController>>, P) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = CoreResult<T>> + Send + 'static,
{
    let expected = targets.len();
    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for (id, (controller, payload)) in targets {
        let tx = tx.clone();
        let op = op.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = token.cancelled() => Err(GenericError::Canceled.into()),
                r = op(controller, payload) => r,
            };
            let _ = tx.send((id, result));
        });
    }
    drop(tx);

    let mut results = BTreeMap::new();
    while results.len() < expected {
        match rx.recv().await {
            Some((id, result)) => {
                results.insert(id, result);
            }
            None => break, // every sender dropped without reporting: all tasks panicked
        }
    }
    // Any task that is somehow still outstanding (a sender clone kept
    // alive by a bug) is told to stop rather than left running past the
    // state transition its result can no longer affect.
    token.cancel();
    results
}

/// Convenience for fan-outs with no per-slave payload.
pub async fn fan_out_uniform<F, Fut, T>(
    controllers: BTreeMap<SlaveID, Arc<Mutex<SlaveController>>>,
    op: F,
) -> BTreeMap<SlaveID, CoreResult<T>>
where
    T: Send + 'static,
    F: Fn(Arc<Mutex<SlaveController>>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = CoreResult<T>> + Send + 'static,
{
    let targets = controllers.into_iter().map(|(id, c)| (id, (c, ()))).collect();
    fan_out(targets, move |c, ()| op(c)).await
}
