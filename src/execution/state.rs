//! The execution state table of §4.7. `Reconstituting`, `Reconfiguring`,
//! `Priming`, `Stepping` and `Accepting` are internal -- no public
//! operation is valid while the engine is in one of them, they exist
//! only so `ExecutionEngine::state()` can report what it is doing.

use crate::error::PreconditionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Ready,
    Reconstituting,
    Reconfiguring,
    Priming,
    Stepping,
    StepOk,
    Accepting,
    StepFailed,
    FatalError,
    Terminated,
}

impl ExecutionState {
    pub fn name(self) -> &'static str {
        match self {
            ExecutionState::Ready => "Ready",
            ExecutionState::Reconstituting => "Reconstituting",
            ExecutionState::Reconfiguring => "Reconfiguring",
            ExecutionState::Priming => "Priming",
            ExecutionState::Stepping => "Stepping",
            ExecutionState::StepOk => "StepOk",
            ExecutionState::Accepting => "Accepting",
            ExecutionState::StepFailed => "StepFailed",
            ExecutionState::FatalError => "FatalError",
            ExecutionState::Terminated => "Terminated",
        }
    }

    fn require(self, allowed: &[ExecutionState], operation: &'static str) -> Result<(), PreconditionError> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            Err(PreconditionError {
                operation,
                state: self.name(),
            })
        }
    }

    pub fn require_reconstitute(self) -> Result<(), PreconditionError> {
        self.require(&[ExecutionState::Ready], "Reconstitute")
    }

    pub fn require_reconfigure(self) -> Result<(), PreconditionError> {
        self.require(&[ExecutionState::Ready], "Reconfigure")
    }

    pub fn require_prime(self) -> Result<(), PreconditionError> {
        self.require(&[ExecutionState::Ready], "Prime")
    }

    pub fn require_step(self) -> Result<(), PreconditionError> {
        self.require(&[ExecutionState::Ready], "Step")
    }

    pub fn require_accept_step(self) -> Result<(), PreconditionError> {
        self.require(&[ExecutionState::StepOk], "AcceptStep")
    }

    /// `Terminate` is legal from every state except `Terminated` itself,
    /// where it is a documented no-op rather than an error (§7).
    pub fn require_terminate(self) -> Result<(), PreconditionError> {
        self.require(
            &[
                ExecutionState::Ready,
                ExecutionState::StepOk,
                ExecutionState::StepFailed,
                ExecutionState::FatalError,
            ],
            "Terminate",
        )
    }
}
