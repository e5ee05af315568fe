//! End-to-end scenario 4 of `spec.md` §8: a slave refuses a step that
//! is too large, and the whole execution must transition to
//! `StepFailed` -- a terminal state from which only `Terminate` is
//! legal.

mod support;

use std::time::Duration;

use cosim_core::config::{ConnectionConfig, ExecutionConfig, SlaveSetup};
use cosim_core::error::CoreError;
use cosim_core::execution::SlaveToAdd;
use cosim_core::Execution;

use support::{spawn_agent, StepLimitedSlave};

#[tokio::test]
async fn oversized_step_fails_and_only_terminate_remains_legal() {
    let locator = spawn_agent(StepLimitedSlave::new(0.5), 1, Duration::from_secs(5)).await;

    let execution = Execution::new(
        SlaveSetup::new("step-failure"),
        ExecutionConfig::default(),
        ConnectionConfig::default(),
        1,
    );

    execution
        .reconstitute(vec![SlaveToAdd { name: "Limited".into(), locator }])
        .await
        .unwrap();
    execution.prime().await.unwrap();

    // Within the slave's limit: succeeds normally.
    execution.step(0.5).await.unwrap();
    execution.accept_step().await.unwrap();

    // Exceeds the slave's limit: the slave refuses and the whole
    // execution must report the failure and move to `StepFailed`.
    let err = execution.step(1.0).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Simulation(cosim_core::error::SimulationError::CannotPerformTimestep { .. })
    ));

    // `Step`/`AcceptStep`/`Prime`/`Reconfigure` are all illegal from
    // `StepFailed`; only `Terminate` remains.
    let step_again = execution.step(0.1).await;
    assert!(step_again.is_err());
    let accept_again = execution.accept_step().await;
    assert!(accept_again.is_err());

    execution.terminate().await.unwrap();
}
