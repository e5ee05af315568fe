//! Shared test fixtures for the end-to-end scenarios of `spec.md` §8:
//! a handful of minimal `SlaveInstance` implementations plus the small
//! amount of plumbing needed to stand each one up as a real
//! `SlaveAgent` over loopback TCP.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use cosim_core::agent::bind_agent;
use cosim_core::capability::SlaveInstance;
use cosim_core::error::CoreResult;
use cosim_core::model::{
    Causality, DataType, SlaveLocator, SlaveTypeDescription, TimeDuration, TimePoint, Variability,
    VariableDescription, VariableID,
};

pub const REAL_IN: VariableID = VariableID(1);
pub const REAL_OUT: VariableID = VariableID(2);
pub const INTEGER_IN: VariableID = VariableID(3);
pub const INTEGER_OUT: VariableID = VariableID(4);
pub const BOOLEAN_IN: VariableID = VariableID(5);
pub const BOOLEAN_OUT: VariableID = VariableID(6);
pub const STRING_IN: VariableID = VariableID(7);
pub const STRING_OUT: VariableID = VariableID(8);

/// A slave whose every output mirrors the matching input the instant
/// the input is set, with no delay imposed by `do_step`. Used wherever
/// the scenario just needs "whatever value was last written to this
/// slave, visible on its output".
pub struct IdentitySlave {
    description: SlaveTypeDescription,
    real: f64,
    integer: i64,
    boolean: bool,
    string: String,
}

impl IdentitySlave {
    pub fn new(name: &str) -> Self {
        let mut variables = BTreeMap::new();
        for (id, var_name, data_type, causality) in [
            (REAL_IN, "realIn", DataType::Real, Causality::Input),
            (REAL_OUT, "realOut", DataType::Real, Causality::Output),
            (INTEGER_IN, "integerIn", DataType::Integer, Causality::Input),
            (INTEGER_OUT, "integerOut", DataType::Integer, Causality::Output),
            (BOOLEAN_IN, "booleanIn", DataType::Boolean, Causality::Input),
            (BOOLEAN_OUT, "booleanOut", DataType::Boolean, Causality::Output),
            (STRING_IN, "stringIn", DataType::String, Causality::Input),
            (STRING_OUT, "stringOut", DataType::String, Causality::Output),
        ] {
            variables.insert(
                id,
                VariableDescription {
                    id,
                    name: var_name.to_string(),
                    data_type,
                    causality,
                    variability: Variability::Discrete,
                },
            );
        }
        Self {
            description: SlaveTypeDescription {
                name: name.to_string(),
                uuid: uuid::Uuid::new_v4(),
                description: "identity pass-through slave".to_string(),
                author: "test support".to_string(),
                version: "1.0".to_string(),
                variables,
            },
            real: 0.0,
            integer: 0,
            boolean: false,
            string: String::new(),
        }
    }
}

impl SlaveInstance for IdentitySlave {
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

    fn get_real(&self, id: VariableID) -> CoreResult<f64> {
        let _ = id;
        Ok(self.real)
    }

    fn get_integer(&self, id: VariableID) -> CoreResult<i64> {
        let _ = id;
        Ok(self.integer)
    }

    fn get_boolean(&self, id: VariableID) -> CoreResult<bool> {
        let _ = id;
        Ok(self.boolean)
    }

    fn get_string(&self, id: VariableID) -> CoreResult<String> {
        let _ = id;
        Ok(self.string.clone())
    }

    fn set_real(&mut self, _id: VariableID, value: f64) -> bool {
        self.real = value;
        true
    }

    fn set_integer(&mut self, _id: VariableID, value: i64) -> bool {
        self.integer = value;
        true
    }

    fn set_boolean(&mut self, _id: VariableID, value: bool) -> bool {
        self.boolean = value;
        true
    }

    fn set_string(&mut self, _id: VariableID, value: String) -> bool {
        self.string = value;
        true
    }

    fn do_step(&mut self, _t: TimePoint, _dt: TimeDuration) -> bool {
        true
    }
}

/// A slave with two real inputs and no outputs, recording the value of
/// both at the end of every `do_step` into a log visible to the test
/// that spawned it (scenario 1-3 of `spec.md` §8, "logger slave").
pub struct LoggerSlave {
    description: SlaveTypeDescription,
    in0: f64,
    in1: f64,
    log: Arc<Mutex<Vec<(TimePoint, f64, f64)>>>,
}

impl LoggerSlave {
    pub fn new() -> (Self, Arc<Mutex<Vec<(TimePoint, f64, f64)>>>) {
        let mut variables = BTreeMap::new();
        variables.insert(
            VariableID(1),
            VariableDescription {
                id: VariableID(1),
                name: "in0".to_string(),
                data_type: DataType::Real,
                causality: Causality::Input,
                variability: Variability::Discrete,
            },
        );
        variables.insert(
            VariableID(2),
            VariableDescription {
                id: VariableID(2),
                name: "in1".to_string(),
                data_type: DataType::Real,
                causality: Causality::Input,
                variability: Variability::Discrete,
            },
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                description: SlaveTypeDescription {
                    name: "Logger".to_string(),
                    uuid: uuid::Uuid::new_v4(),
                    description: "records its two real inputs every step".to_string(),
                    author: "test support".to_string(),
                    version: "1.0".to_string(),
                    variables,
                },
                in0: 0.0,
                in1: 0.0,
                log: log.clone(),
            },
            log,
        )
    }
}

impl SlaveInstance for LoggerSlave {
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

    fn get_real(&self, id: VariableID) -> CoreResult<f64> {
        Ok(if id == VariableID(1) { self.in0 } else { self.in1 })
    }

    fn get_integer(&self, _id: VariableID) -> CoreResult<i64> {
        Ok(0)
    }

    fn get_boolean(&self, _id: VariableID) -> CoreResult<bool> {
        Ok(false)
    }

    fn get_string(&self, _id: VariableID) -> CoreResult<String> {
        Ok(String::new())
    }

    fn set_real(&mut self, id: VariableID, value: f64) -> bool {
        if id == VariableID(1) {
            self.in0 = value;
        } else {
            self.in1 = value;
        }
        true
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

    fn do_step(&mut self, t: TimePoint, dt: TimeDuration) -> bool {
        self.log.lock().unwrap().push((t + dt, self.in0, self.in1));
        true
    }
}

/// A slave with one real input/output that refuses any step larger
/// than `max_step` (scenario 4 of `spec.md` §8, "step failure").
pub struct StepLimitedSlave {
    description: SlaveTypeDescription,
    value: f64,
    max_step: TimeDuration,
}

impl StepLimitedSlave {
    pub fn new(max_step: TimeDuration) -> Self {
        let mut variables = BTreeMap::new();
        variables.insert(
            REAL_IN,
            VariableDescription {
                id: REAL_IN,
                name: "realIn".to_string(),
                data_type: DataType::Real,
                causality: Causality::Input,
                variability: Variability::Discrete,
            },
        );
        variables.insert(
            REAL_OUT,
            VariableDescription {
                id: REAL_OUT,
                name: "realOut".to_string(),
                data_type: DataType::Real,
                causality: Causality::Output,
                variability: Variability::Discrete,
            },
        );
        Self {
            description: SlaveTypeDescription {
                name: "StepLimited".to_string(),
                uuid: uuid::Uuid::new_v4(),
                description: "refuses any step larger than max_step".to_string(),
                author: "test support".to_string(),
                version: "1.0".to_string(),
                variables,
            },
            value: 0.0,
            max_step,
        }
    }
}

impl SlaveInstance for StepLimitedSlave {
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
        Ok(self.value)
    }

    fn get_integer(&self, _id: VariableID) -> CoreResult<i64> {
        Ok(0)
    }

    fn get_boolean(&self, _id: VariableID) -> CoreResult<bool> {
        Ok(false)
    }

    fn get_string(&self, _id: VariableID) -> CoreResult<String> {
        Ok(String::new())
    }

    fn set_real(&mut self, _id: VariableID, value: f64) -> bool {
        self.value = value;
        true
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

    fn do_step(&mut self, _t: TimePoint, dt: TimeDuration) -> bool {
        dt <= self.max_step
    }
}

/// Binds `instance` on loopback addresses, spawns its `serve` loop on a
/// background task, and returns the `SlaveLocator` a master needs to
/// reach it, matching how `SlaveProvider::instantiate_slave` would hand
/// a freshly-spawned slave's addresses back to a master (§4.10).
pub async fn spawn_agent<S: SlaveInstance + 'static>(
    instance: S,
    server_max_version: u16,
    master_timeout: std::time::Duration,
) -> SlaveLocator {
    let (agent, control_listener, locator) = bind_agent(
        instance,
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:0".parse().unwrap(),
    )
    .await
    .expect("binding a loopback agent cannot fail");
    tokio::spawn(agent.serve(control_listener, server_max_version, master_timeout));
    locator
}
