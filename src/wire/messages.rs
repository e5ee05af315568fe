//! Structured message bodies carried inside the `Normal` envelope (§4.4,
//! §6.1). Each body derives `prost::Message` so field tags and wire
//! types match a conventional Protocol Buffers definition bit-for-bit,
//! without requiring a `protoc` build step.

use std::collections::BTreeMap;

use crate::error::{CoreError, ProtocolError};
use crate::model::{
    Causality, DataType, ScalarValue, SlaveTypeDescription, VariableDescription, VariableID,
    VariableSetting, Variability,
};

#[derive(Clone, PartialEq, prost::Message)]
pub struct ScalarValueProto {
    #[prost(oneof = "scalar_value_proto::Value", tags = "1, 2, 3, 4")]
    pub value: Option<scalar_value_proto::Value>,
}

pub mod scalar_value_proto {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(double, tag = "1")]
        Real(f64),
        #[prost(int64, tag = "2")]
        Integer(i64),
        #[prost(bool, tag = "3")]
        Boolean(bool),
        #[prost(string, tag = "4")]
        String(String),
    }
}

impl From<&ScalarValue> for ScalarValueProto {
    fn from(v: &ScalarValue) -> Self {
        use scalar_value_proto::Value;
        let value = match v {
            ScalarValue::Real(x) => Value::Real(*x),
            ScalarValue::Integer(x) => Value::Integer(*x),
            ScalarValue::Boolean(x) => Value::Boolean(*x),
            ScalarValue::String(x) => Value::String(x.clone()),
        };
        ScalarValueProto { value: Some(value) }
    }
}

impl TryFrom<ScalarValueProto> for ScalarValue {
    type Error = CoreError;

    fn try_from(p: ScalarValueProto) -> Result<Self, Self::Error> {
        use scalar_value_proto::Value;
        match p.value {
            Some(Value::Real(x)) => Ok(ScalarValue::Real(x)),
            Some(Value::Integer(x)) => Ok(ScalarValue::Integer(x)),
            Some(Value::Boolean(x)) => Ok(ScalarValue::Boolean(x)),
            Some(Value::String(x)) => Ok(ScalarValue::String(x)),
            None => Err(ProtocolError::Violation("empty ScalarValue".into()).into()),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum DataTypeProto {
    Real = 0,
    Integer = 1,
    Boolean = 2,
    String = 3,
}

impl From<DataType> for DataTypeProto {
    fn from(d: DataType) -> Self {
        match d {
            DataType::Real => DataTypeProto::Real,
            DataType::Integer => DataTypeProto::Integer,
            DataType::Boolean => DataTypeProto::Boolean,
            DataType::String => DataTypeProto::String,
        }
    }
}

impl From<DataTypeProto> for DataType {
    fn from(d: DataTypeProto) -> Self {
        match d {
            DataTypeProto::Real => DataType::Real,
            DataTypeProto::Integer => DataType::Integer,
            DataTypeProto::Boolean => DataType::Boolean,
            DataTypeProto::String => DataType::String,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum CausalityProto {
    Parameter = 0,
    CalculatedParameter = 1,
    Input = 2,
    Output = 3,
    Local = 4,
}

impl From<Causality> for CausalityProto {
    fn from(c: Causality) -> Self {
        match c {
            Causality::Parameter => CausalityProto::Parameter,
            Causality::CalculatedParameter => CausalityProto::CalculatedParameter,
            Causality::Input => CausalityProto::Input,
            Causality::Output => CausalityProto::Output,
            Causality::Local => CausalityProto::Local,
        }
    }
}

impl From<CausalityProto> for Causality {
    fn from(c: CausalityProto) -> Self {
        match c {
            CausalityProto::Parameter => Causality::Parameter,
            CausalityProto::CalculatedParameter => Causality::CalculatedParameter,
            CausalityProto::Input => Causality::Input,
            CausalityProto::Output => Causality::Output,
            CausalityProto::Local => Causality::Local,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum VariabilityProto {
    Constant = 0,
    Fixed = 1,
    Tunable = 2,
    Discrete = 3,
    Continuous = 4,
}

impl From<Variability> for VariabilityProto {
    fn from(v: Variability) -> Self {
        match v {
            Variability::Constant => VariabilityProto::Constant,
            Variability::Fixed => VariabilityProto::Fixed,
            Variability::Tunable => VariabilityProto::Tunable,
            Variability::Discrete => VariabilityProto::Discrete,
            Variability::Continuous => VariabilityProto::Continuous,
        }
    }
}

impl From<VariabilityProto> for Variability {
    fn from(v: VariabilityProto) -> Self {
        match v {
            VariabilityProto::Constant => Variability::Constant,
            VariabilityProto::Fixed => Variability::Fixed,
            VariabilityProto::Tunable => Variability::Tunable,
            VariabilityProto::Discrete => Variability::Discrete,
            VariabilityProto::Continuous => Variability::Continuous,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VariableDescriptionProto {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(enumeration = "DataTypeProto", tag = "3")]
    pub data_type: i32,
    #[prost(enumeration = "CausalityProto", tag = "4")]
    pub causality: i32,
    #[prost(enumeration = "VariabilityProto", tag = "5")]
    pub variability: i32,
}

impl From<&VariableDescription> for VariableDescriptionProto {
    fn from(v: &VariableDescription) -> Self {
        VariableDescriptionProto {
            id: v.id.0,
            name: v.name.clone(),
            data_type: DataTypeProto::from(v.data_type) as i32,
            causality: CausalityProto::from(v.causality) as i32,
            variability: VariabilityProto::from(v.variability) as i32,
        }
    }
}

impl TryFrom<VariableDescriptionProto> for VariableDescription {
    type Error = CoreError;

    fn try_from(p: VariableDescriptionProto) -> Result<Self, Self::Error> {
        let data_type = DataTypeProto::try_from(p.data_type)
            .map_err(|_| ProtocolError::Violation("invalid data_type".into()))?;
        let causality = CausalityProto::try_from(p.causality)
            .map_err(|_| ProtocolError::Violation("invalid causality".into()))?;
        let variability = VariabilityProto::try_from(p.variability)
            .map_err(|_| ProtocolError::Violation("invalid variability".into()))?;
        Ok(VariableDescription {
            id: VariableID(p.id),
            name: p.name,
            data_type: data_type.into(),
            causality: causality.into(),
            variability: variability.into(),
        })
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SlaveTypeDescriptionProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub uuid: String,
    #[prost(string, tag = "3")]
    pub description: String,
    #[prost(string, tag = "4")]
    pub author: String,
    #[prost(string, tag = "5")]
    pub version: String,
    #[prost(message, repeated, tag = "6")]
    pub variables: Vec<VariableDescriptionProto>,
}

impl From<&SlaveTypeDescription> for SlaveTypeDescriptionProto {
    fn from(t: &SlaveTypeDescription) -> Self {
        SlaveTypeDescriptionProto {
            name: t.name.clone(),
            uuid: t.uuid.to_string(),
            description: t.description.clone(),
            author: t.author.clone(),
            version: t.version.clone(),
            variables: t.variables.values().map(VariableDescriptionProto::from).collect(),
        }
    }
}

impl TryFrom<SlaveTypeDescriptionProto> for SlaveTypeDescription {
    type Error = CoreError;

    fn try_from(p: SlaveTypeDescriptionProto) -> Result<Self, Self::Error> {
        let uuid = uuid::Uuid::parse_str(&p.uuid)
            .map_err(|e| ProtocolError::Violation(format!("invalid slave type uuid: {e}")))?;
        let mut variables = BTreeMap::new();
        for v in p.variables {
            let desc = VariableDescription::try_from(v)?;
            variables.insert(desc.id, desc);
        }
        Ok(SlaveTypeDescription {
            name: p.name,
            uuid,
            description: p.description,
            author: p.author,
            version: p.version,
            variables,
        })
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VariableSettingProto {
    #[prost(uint32, tag = "1")]
    pub variable_id: u32,
    #[prost(message, optional, tag = "2")]
    pub value: Option<ScalarValueProto>,
    #[prost(bool, tag = "3")]
    pub has_connection_change: bool,
    /// `0` (`SlaveID::INVALID`) means "disconnect".
    #[prost(uint32, tag = "4")]
    pub connected_slave_id: u32,
    #[prost(uint32, tag = "5")]
    pub connected_variable_id: u32,
}

impl From<&VariableSetting> for VariableSettingProto {
    fn from(s: &VariableSetting) -> Self {
        let (has_connection_change, connected_slave_id, connected_variable_id) =
            match s.connected_output {
                Some(v) => (true, v.slave.0 as u32, v.id.0),
                None => (false, 0, 0),
            };
        VariableSettingProto {
            variable_id: s.variable.0,
            value: s.value.as_ref().map(ScalarValueProto::from),
            has_connection_change,
            connected_slave_id,
            connected_variable_id,
        }
    }
}

impl TryFrom<VariableSettingProto> for VariableSetting {
    type Error = CoreError;

    fn try_from(p: VariableSettingProto) -> Result<Self, Self::Error> {
        use crate::model::{SlaveID, Variable};
        let value = p.value.map(ScalarValue::try_from).transpose()?;
        let connected_output = if p.has_connection_change {
            Some(Variable::new(
                SlaveID(p.connected_slave_id as u16),
                VariableID(p.connected_variable_id),
            ))
        } else {
            None
        };
        if value.is_none() && connected_output.is_none() {
            return Err(ProtocolError::Violation(
                "VariableSetting with neither value nor connection change".into(),
            )
            .into());
        }
        Ok(VariableSetting {
            variable: VariableID(p.variable_id),
            value,
            connected_output,
        })
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SetupBody {
    #[prost(uint32, tag = "1")]
    pub slave_id: u32,
    #[prost(string, tag = "2")]
    pub slave_name: String,
    #[prost(string, tag = "3")]
    pub execution_name: String,
    #[prost(double, tag = "4")]
    pub start_time: f64,
    #[prost(double, tag = "5")]
    pub stop_time: f64,
    #[prost(uint64, tag = "6")]
    pub variable_recv_timeout_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SetVarsBody {
    #[prost(message, repeated, tag = "1")]
    pub settings: Vec<VariableSettingProto>,
}

/// One entry of a `SET_VARS` reply (§4.9): whether `variable_id` was
/// applied. A slave attempts every setting in a `SetVarsBody` and
/// reports each outcome individually, so a caller can tell which of
/// several simultaneous bad settings failed, not just that one did.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SetVarResult {
    #[prost(uint32, tag = "1")]
    pub variable_id: u32,
    #[prost(bool, tag = "2")]
    pub ok: bool,
    #[prost(uint32, tag = "3")]
    pub code: u32,
    #[prost(string, tag = "4")]
    pub details: String,
}

impl From<&crate::model::VariableSettingResult> for SetVarResult {
    fn from(r: &crate::model::VariableSettingResult) -> Self {
        match &r.outcome {
            Ok(()) => SetVarResult {
                variable_id: r.variable.0,
                ok: true,
                code: 0,
                details: String::new(),
            },
            Err(details) => SetVarResult {
                variable_id: r.variable.0,
                ok: false,
                code: error_code::OPERATION_FAILED,
                details: details.clone(),
            },
        }
    }
}

impl From<SetVarResult> for crate::model::VariableSettingResult {
    fn from(p: SetVarResult) -> Self {
        crate::model::VariableSettingResult {
            variable: VariableID(p.variable_id),
            outcome: if p.ok { Ok(()) } else { Err(p.details) },
        }
    }
}

/// Carried by a `Normal` message of type `SET_VARS_RESULT`, the reply to
/// `SET_VARS` (§4.9): one `SetVarResult` per requested setting, in the
/// same order they were requested.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SetVarsResultBody {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<SetVarResult>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SetPeersBody {
    #[prost(string, repeated, tag = "1")]
    pub endpoints: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StepBody {
    #[prost(int32, tag = "1")]
    pub step_id: i32,
    #[prost(double, tag = "2")]
    pub current_time: f64,
    #[prost(double, tag = "3")]
    pub step_size: f64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DescriptionBody {
    #[prost(message, optional, tag = "1")]
    pub type_description: Option<SlaveTypeDescriptionProto>,
}

/// Carried by a `Normal` message of type `ERROR` (§4.4).
#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorBody {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub details: String,
}

/// Numeric registry for `ErrorBody::code`. Stable within this protocol
/// version, but (unlike the message-type codes of §6.1) not required to
/// match any external reference implementation bit-for-bit.
pub mod error_code {
    pub const CANNOT_PERFORM_TIMESTEP: u32 = 1;
    pub const DATA_TIMEOUT: u32 = 2;
    pub const PRECONDITION_VIOLATION: u32 = 3;
    pub const PROTOCOL_VIOLATION: u32 = 4;
    pub const OPERATION_FAILED: u32 = 5;
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SlaveTypeListBody {
    #[prost(message, repeated, tag = "1")]
    pub types: Vec<SlaveTypeDescriptionProto>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SlaveTypeCountBody {
    #[prost(uint32, tag = "1")]
    pub count: u32,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct GetSlaveTypeBody {
    #[prost(uint32, tag = "1")]
    pub index: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SlaveTypeBody {
    #[prost(message, optional, tag = "1")]
    pub type_description: Option<SlaveTypeDescriptionProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InstantiateSlaveBody {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(uint64, tag = "2")]
    pub timeout_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SlaveLocatorBody {
    #[prost(string, tag = "1")]
    pub control_endpoint: String,
    #[prost(string, tag = "2")]
    pub data_pub_endpoint: String,
}
