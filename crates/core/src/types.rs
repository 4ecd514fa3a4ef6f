use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

/// Port type identifier for connection validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Int,
    Float,
    Str,
    Bool,
    Bytes,
    /// Accepts and produces any value; conversions are checked when consumed.
    Any,
}

impl PortType {
    pub fn is_compatible(&self, other: &PortType) -> bool {
        self == other || *self == PortType::Any || *other == PortType::Any
    }

    /// Whether a value produced by a `source` port may be bound to a port of
    /// this type, either directly or through an implicit conversion.
    pub fn accepts(&self, source: &PortType) -> bool {
        if self.is_compatible(source) {
            return true;
        }

        matches!(
            (source, self),
            (PortType::Int, PortType::Float)
                | (
                    PortType::Int | PortType::Float | PortType::Bool | PortType::Bytes,
                    PortType::Str
                )
                | (PortType::Str, PortType::Bytes)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            PortType::Int => "Int",
            PortType::Float => "Float",
            PortType::Str => "Str",
            PortType::Bool => "Bool",
            PortType::Bytes => "Bytes",
            PortType::Any => "Any",
        }
    }

    pub fn parse(raw: &str) -> Result<PortType> {
        match raw {
            "Int" => Ok(PortType::Int),
            "Float" => Ok(PortType::Float),
            "Str" => Ok(PortType::Str),
            "Bool" => Ok(PortType::Bool),
            "Bytes" => Ok(PortType::Bytes),
            "Any" => Ok(PortType::Any),
            other => bail!("unsupported port type '{other}', expected one of Int|Float|Str|Bool|Bytes|Any"),
        }
    }
}

/// Data that flows between node ports.
#[derive(Debug, Clone, PartialEq)]
pub enum PortData {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl PortData {
    pub fn port_type(&self) -> PortType {
        match self {
            PortData::Int(_) => PortType::Int,
            PortData::Float(_) => PortType::Float,
            PortData::Str(_) => PortType::Str,
            PortData::Bool(_) => PortType::Bool,
            PortData::Bytes(_) => PortType::Bytes,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PortData::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PortData::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Short human-readable rendering, used for logs and previews.
    pub fn preview(&self, max_chars: usize) -> String {
        let raw = match self {
            PortData::Int(v) => v.to_string(),
            PortData::Float(v) => v.to_string(),
            PortData::Str(v) => v.clone(),
            PortData::Bool(v) => v.to_string(),
            PortData::Bytes(v) => format!("<{} bytes>", v.len()),
        };

        if raw.chars().count() <= max_chars {
            raw
        } else {
            let mut truncated: String = raw.chars().take(max_chars).collect();
            truncated.push_str("...");
            truncated
        }
    }
}

/// Convert a value to the type of the port that consumes it.
pub fn coerce(value: PortData, target: &PortType) -> Result<PortData> {
    if *target == PortType::Any || value.port_type() == *target {
        return Ok(value);
    }

    let converted = match (value, target) {
        (PortData::Int(v), PortType::Float) => PortData::Float(v as f64),
        (PortData::Int(v), PortType::Str) => PortData::Str(v.to_string()),
        (PortData::Float(v), PortType::Str) => PortData::Str(v.to_string()),
        (PortData::Bool(v), PortType::Str) => PortData::Str(v.to_string()),
        (PortData::Bytes(v), PortType::Str) => {
            PortData::Str(String::from_utf8_lossy(&v).into_owned())
        }
        (PortData::Str(v), PortType::Bytes) => PortData::Bytes(v.into_bytes()),
        (other, target) => bail!(
            "cannot convert {} value to {}",
            other.port_type().name(),
            target.name()
        ),
    };

    Ok(converted)
}

pub fn port_data_from_json(port_type: &PortType, value: &serde_json::Value) -> Result<PortData> {
    match port_type {
        PortType::Int => value
            .as_i64()
            .map(PortData::Int)
            .ok_or_else(|| anyhow!("expected integer JSON value")),
        PortType::Float => value
            .as_f64()
            .map(PortData::Float)
            .ok_or_else(|| anyhow!("expected float JSON value")),
        PortType::Str => value
            .as_str()
            .map(|v| PortData::Str(v.to_string()))
            .ok_or_else(|| anyhow!("expected string JSON value")),
        PortType::Bool => value
            .as_bool()
            .map(PortData::Bool)
            .ok_or_else(|| anyhow!("expected bool JSON value")),
        PortType::Bytes => match value {
            serde_json::Value::String(text) => Ok(PortData::Bytes(text.clone().into_bytes())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|byte| u8::try_from(byte).ok())
                        .ok_or_else(|| anyhow!("expected byte values in 0..=255"))
                })
                .collect::<Result<Vec<u8>>>()
                .map(PortData::Bytes),
            _ => bail!("expected string or byte array JSON value"),
        },
        PortType::Any => match value {
            serde_json::Value::Bool(v) => Ok(PortData::Bool(*v)),
            serde_json::Value::String(v) => Ok(PortData::Str(v.clone())),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(PortData::Int)
                .or_else(|| n.as_f64().map(PortData::Float))
                .ok_or_else(|| anyhow!("unrepresentable JSON number")),
            _ => bail!("expected scalar JSON value"),
        },
    }
}

pub fn port_data_to_json(data: &PortData) -> serde_json::Value {
    match data {
        PortData::Int(v) => serde_json::json!(v),
        PortData::Float(v) => serde_json::json!(v),
        PortData::Str(v) => serde_json::json!(v),
        PortData::Bool(v) => serde_json::json!(v),
        PortData::Bytes(v) => serde_json::json!(v),
    }
}
