//! The data model shared by every component of the core: identifiers,
//! scalar values, variable/slave-type/slave descriptions, variable
//! settings and network locators. See `SPEC_FULL.md` §3.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::impl_from_primitive;

/// Uniquely identifies a slave within one execution. `0` is reserved to
/// mean "no slave" / "invalid".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlaveID(pub u16);
impl_from_primitive!(SlaveID, u16);

impl SlaveID {
    pub const INVALID: SlaveID = SlaveID(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for SlaveID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Uniquely identifies a variable within one slave *type* (not across
/// types, and not within an execution by itself -- pair with `SlaveID`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VariableID(pub u32);
impl_from_primitive!(VariableID, u32);

impl fmt::Display for VariableID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a time step within an execution. Strictly monotonically
/// increasing from `0`; `-1` is reserved as "invalid".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepID(pub i32);
impl_from_primitive!(StepID, i32);

impl StepID {
    pub const INVALID: StepID = StepID(-1);
    pub const FIRST: StepID = StepID(0);

    pub fn next(self) -> StepID {
        StepID(self.0 + 1)
    }
}

impl fmt::Display for StepID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point in simulated time, in seconds.
pub type TimePoint = f64;

/// A duration of simulated time, in seconds.
pub type TimeDuration = f64;

/// A tagged union of the data types the core can transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Real(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
}

impl ScalarValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Real(_) => DataType::Real,
            ScalarValue::Integer(_) => DataType::Integer,
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::String(_) => DataType::String,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            ScalarValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ScalarValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            ScalarValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            ScalarValue::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Variable data types. Corresponds to the FMI data type categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Real,
    Integer,
    Boolean,
    String,
}

/// Variable causality, corresponding to the FMI causality definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Causality {
    Parameter,
    CalculatedParameter,
    Input,
    Output,
    Local,
}

/// Variable variability, corresponding to the FMI variability
/// definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variability {
    Constant,
    Fixed,
    Tunable,
    Discrete,
    Continuous,
}

/// An immutable description of a single variable of a slave type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDescription {
    pub id: VariableID,
    pub name: String,
    pub data_type: DataType,
    pub causality: Causality,
    pub variability: Variability,
}

/// An immutable description of a slave type: its variables and
/// identifying metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveTypeDescription {
    pub name: String,
    pub uuid: uuid::Uuid,
    pub description: String,
    pub author: String,
    pub version: String,
    pub variables: BTreeMap<VariableID, VariableDescription>,
}

impl SlaveTypeDescription {
    /// O(log n) lookup, panicking behaviour left to the caller via
    /// `Option` rather than mirroring the original `std::out_of_range`
    /// throw.
    pub fn variable(&self, id: VariableID) -> Option<&VariableDescription> {
        self.variables.get(&id)
    }
}

/// A slave type description plus the identity assigned to one instance
/// of it within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveDescription {
    pub id: SlaveID,
    pub name: String,
    pub type_description: SlaveTypeDescription,
}

/// Returns whether `s` is a valid slave name: `[A-Za-z][A-Za-z0-9_]*`.
pub fn is_valid_slave_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Identifies a variable in a simulation: a `(SlaveID, VariableID)` pair.
/// `Variable::EMPTY` (invalid slave ID) denotes "no variable / broken
/// connection".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variable {
    pub slave: SlaveID,
    pub id: VariableID,
}

impl Variable {
    pub const EMPTY: Variable = Variable {
        slave: SlaveID::INVALID,
        id: VariableID(0),
    };

    pub fn new(slave: SlaveID, id: VariableID) -> Self {
        Self { slave, id }
    }

    pub fn is_empty(&self) -> bool {
        !self.slave.is_valid()
    }
}

impl Default for Variable {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A per-input command that may assign a value, change the input's
/// connection to a remote output, or both. At least one of `value` /
/// `connected_output` must be `Some`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSetting {
    pub variable: VariableID,
    pub value: Option<ScalarValue>,
    /// `Some(Variable::EMPTY)` and `None` are both valid "leave
    /// unchanged"; an explicit empty `Variable` passed here is
    /// normalised to `None` by `VariableSetting::disconnect`/`new`.
    pub connected_output: Option<Variable>,
}

impl VariableSetting {
    pub fn value_only(variable: VariableID, value: ScalarValue) -> Self {
        Self {
            variable,
            value: Some(value),
            connected_output: None,
        }
    }

    pub fn connect(variable: VariableID, output: Variable) -> Self {
        Self {
            variable,
            value: None,
            connected_output: Some(output),
        }
    }

    pub fn disconnect(variable: VariableID) -> Self {
        Self {
            variable,
            value: None,
            connected_output: Some(Variable::EMPTY),
        }
    }

    pub fn is_connection_change(&self) -> bool {
        self.connected_output.is_some()
    }
}

/// The per-entry outcome of one `VariableSetting` as reported back by a
/// slave's `SET_VARS` reply (§4.9): a slave attempts every setting and
/// reports each individually, rather than collapsing failures into one
/// aggregate error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSettingResult {
    pub variable: VariableID,
    pub outcome: Result<(), String>,
}

impl VariableSettingResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// A transport + address pair, e.g. `("tcp", "192.168.0.4:10000")`.
/// Transport is stringly typed since the only transport the protocol
/// currently requires is TCP, but the framing itself is
/// transport-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub transport: String,
    pub address: String,
}

impl Endpoint {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            transport: "tcp".to_string(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.address)
    }
}

impl std::str::FromStr for Endpoint {
    type Err = crate::error::ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("://") {
            Some((transport, address)) => Ok(Endpoint {
                transport: transport.to_string(),
                address: address.to_string(),
            }),
            None => Err(crate::error::ProtocolError::Violation(format!(
                "malformed endpoint string: {s}"
            ))),
        }
    }
}

/// The pair of endpoints needed to address one slave: its control
/// socket and its data-publishing socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlaveLocator {
    pub control_endpoint: Endpoint,
    pub data_pub_endpoint: Endpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_id_invalid_is_zero() {
        assert!(!SlaveID::INVALID.is_valid());
        assert!(SlaveID(1).is_valid());
    }

    #[test]
    fn variable_empty_means_invalid_slave() {
        assert!(Variable::EMPTY.is_empty());
        assert!(!Variable::new(SlaveID(1), VariableID(0)).is_empty());
    }

    #[test]
    fn slave_name_validation() {
        assert!(is_valid_slave_name("Slave1"));
        assert!(is_valid_slave_name("a"));
        assert!(!is_valid_slave_name("1slave"));
        assert!(!is_valid_slave_name(""));
        assert!(!is_valid_slave_name("slave-1"));
    }

    #[test]
    fn step_id_next_increments() {
        assert_eq!(StepID::FIRST.next(), StepID(1));
    }

    #[test]
    fn endpoint_display_parse_round_trips() {
        let e = Endpoint::tcp("192.168.0.4:10000");
        let parsed: Endpoint = e.to_string().parse().unwrap();
        assert_eq!(e, parsed);
    }

    #[test]
    fn variable_setting_disconnect_sets_empty_output() {
        let vs = VariableSetting::disconnect(VariableID(3));
        assert!(vs.is_connection_change());
        assert_eq!(vs.connected_output, Some(Variable::EMPTY));
        assert!(vs.value.is_none());
    }
}
