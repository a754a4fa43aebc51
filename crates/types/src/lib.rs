use std::fmt;

use serde::{Deserialize, Serialize};

/// Gateway endpoint the collector talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// On-wire encoding of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int16,
    Uint16,
    Int32,
    Uint32,
}

impl DataType {
    pub fn word_count(self) -> u16 {
        match self {
            DataType::Int16 | DataType::Uint16 => 1,
            DataType::Int32 | DataType::Uint32 => 2,
        }
    }
}

/// Modbus register table a read is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    Input,
    Holding,
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterKind::Input => f.write_str("input"),
            RegisterKind::Holding => f.write_str("holding"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_counts_follow_width() {
        assert_eq!(DataType::Int16.word_count(), 1);
        assert_eq!(DataType::Uint16.word_count(), 1);
        assert_eq!(DataType::Int32.word_count(), 2);
        assert_eq!(DataType::Uint32.word_count(), 2);
    }

    #[test]
    fn data_type_uses_lowercase_names() {
        let parsed: DataType = serde_json::from_str("\"uint32\"").expect("parse");
        assert_eq!(parsed, DataType::Uint32);
    }
}
