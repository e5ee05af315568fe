//! The `SlaveInstance` capability: the only interface the core requires
//! from whatever owns the actual mathematical model of a slave (an FMU,
//! a hand-written model, a test double). See `SPEC_FULL.md` §6.2.

use crate::error::CoreResult;
use crate::model::{SlaveTypeDescription, TimeDuration, TimePoint, VariableID};

/// A capability, not a base class: the slave agent does not care where
/// an implementor comes from, only that it satisfies this contract.
/// Only ever called from the owning slave agent's single reactor
/// thread, hence `Send` but not `Sync`.
pub trait SlaveInstance: Send {
    fn type_description(&self) -> &SlaveTypeDescription;

    /// Called exactly once, after construction and before any other
    /// method (except `type_description`).
    fn setup(
        &mut self,
        slave_name: &str,
        execution_name: &str,
        start_time: TimePoint,
        stop_time: TimePoint,
        adaptive_step_size: bool,
        relative_tolerance: Option<f64>,
    ) -> CoreResult<()>;

    /// Called exactly once, before the first `do_step`.
    fn start_simulation(&mut self) -> CoreResult<()>;

    /// Called exactly once, after the last `do_step`.
    fn end_simulation(&mut self) -> CoreResult<()>;

    fn get_real(&self, id: VariableID) -> CoreResult<f64>;
    fn get_integer(&self, id: VariableID) -> CoreResult<i64>;
    fn get_boolean(&self, id: VariableID) -> CoreResult<bool>;
    fn get_string(&self, id: VariableID) -> CoreResult<String>;

    /// Returns whether the assignment was accepted.
    fn set_real(&mut self, id: VariableID, value: f64) -> bool;
    fn set_integer(&mut self, id: VariableID, value: i64) -> bool;
    fn set_boolean(&mut self, id: VariableID, value: bool) -> bool;
    fn set_string(&mut self, id: VariableID, value: String) -> bool;

    /// Advances the slave by `dt`. `false` means "could not take a step
    /// of this size" (the slave may be able to complete a shorter one).
    fn do_step(&mut self, t: TimePoint, dt: TimeDuration) -> bool;
}

/// Lets a boxed trait object stand in for `S: SlaveInstance` wherever an
/// owned instance is expected -- needed by `SlaveProvider`, whose
/// catalog factories produce different concrete instance types behind
/// one boxed return value.
impl SlaveInstance for Box<dyn SlaveInstance> {
    fn type_description(&self) -> &SlaveTypeDescription {
        (**self).type_description()
    }

    fn setup(
        &mut self,
        slave_name: &str,
        execution_name: &str,
        start_time: TimePoint,
        stop_time: TimePoint,
        adaptive_step_size: bool,
        relative_tolerance: Option<f64>,
    ) -> CoreResult<()> {
        (**self).setup(slave_name, execution_name, start_time, stop_time, adaptive_step_size, relative_tolerance)
    }

    fn start_simulation(&mut self) -> CoreResult<()> {
        (**self).start_simulation()
    }

    fn end_simulation(&mut self) -> CoreResult<()> {
        (**self).end_simulation()
    }

    fn get_real(&self, id: VariableID) -> CoreResult<f64> {
        (**self).get_real(id)
    }

    fn get_integer(&self, id: VariableID) -> CoreResult<i64> {
        (**self).get_integer(id)
    }

    fn get_boolean(&self, id: VariableID) -> CoreResult<bool> {
        (**self).get_boolean(id)
    }

    fn get_string(&self, id: VariableID) -> CoreResult<String> {
        (**self).get_string(id)
    }

    fn set_real(&mut self, id: VariableID, value: f64) -> bool {
        (**self).set_real(id, value)
    }

    fn set_integer(&mut self, id: VariableID, value: i64) -> bool {
        (**self).set_integer(id, value)
    }

    fn set_boolean(&mut self, id: VariableID, value: bool) -> bool {
        (**self).set_boolean(id, value)
    }

    fn set_string(&mut self, id: VariableID, value: String) -> bool {
        (**self).set_string(id, value)
    }

    fn do_step(&mut self, t: TimePoint, dt: TimeDuration) -> bool {
        (**self).do_step(t, dt)
    }
}
