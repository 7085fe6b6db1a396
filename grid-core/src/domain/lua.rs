//! Lua values and script executions
//!
//! These mirror the records a Grid Server accepts and returns:
//! - `LuaValue`: tagged union over nil, boolean, number, string and table
//! - `ScriptExecution`: a named script plus its argument list
//! - `JobRecord` / `GridServerStatus`: job and status records of the RPC surface

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire tag for a Lua value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LuaType {
    #[serde(rename = "LUA_TNIL")]
    Nil,
    #[serde(rename = "LUA_TBOOLEAN")]
    Boolean,
    #[serde(rename = "LUA_TNUMBER")]
    Number,
    #[serde(rename = "LUA_TSTRING")]
    String,
    #[serde(rename = "LUA_TTABLE")]
    Table,
}

impl LuaType {
    /// The name used on the wire
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Nil => "LUA_TNIL",
            Self::Boolean => "LUA_TBOOLEAN",
            Self::Number => "LUA_TNUMBER",
            Self::String => "LUA_TSTRING",
            Self::Table => "LUA_TTABLE",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "LUA_TNIL" => Some(Self::Nil),
            "LUA_TBOOLEAN" => Some(Self::Boolean),
            "LUA_TNUMBER" => Some(Self::Number),
            "LUA_TSTRING" => Some(Self::String),
            "LUA_TTABLE" => Some(Self::Table),
            _ => None,
        }
    }
}

impl fmt::Display for LuaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A Lua value exchanged with a Grid Server
///
/// Tables are arrays of values; nested tables are allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum LuaValue {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Table(Vec<LuaValue>),
}

impl LuaValue {
    pub fn lua_type(&self) -> LuaType {
        match self {
            Self::Nil => LuaType::Nil,
            Self::Boolean(_) => LuaType::Boolean,
            Self::Number(_) => LuaType::Number,
            Self::String(_) => LuaType::String,
            Self::Table(_) => LuaType::Table,
        }
    }

    /// Scalar payload as it appears in the `value` element, if any
    pub fn wire_value(&self) -> Option<String> {
        match self {
            Self::Nil | Self::Table(_) => None,
            Self::Boolean(b) => Some(if *b { "true" } else { "false" }.to_string()),
            Self::Number(n) => Some(n.to_string()),
            Self::String(s) => Some(s.clone()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for LuaValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for LuaValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for LuaValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

/// A script submitted to a Grid Server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptExecution {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub arguments: Vec<LuaValue>,
}

impl ScriptExecution {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            arguments: Vec::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<LuaValue>) -> Self {
        self.arguments = arguments;
        self
    }
}

/// Job record as understood by a Grid Server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub expiration_in_seconds: f64,
    pub category: i32,
    pub cores: f64,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, expiration_in_seconds: f64) -> Self {
        Self {
            id: id.into(),
            expiration_in_seconds,
            category: 0,
            cores: 1.0,
        }
    }
}

/// Status reported by a Grid Server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridServerStatus {
    pub version: String,
    pub environment_count: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lua_type_wire_names() {
        for ty in [
            LuaType::Nil,
            LuaType::Boolean,
            LuaType::Number,
            LuaType::String,
            LuaType::Table,
        ] {
            assert_eq!(LuaType::from_wire(ty.as_wire()), Some(ty));
        }
        assert_eq!(LuaType::from_wire("LUA_TFUNCTION"), None);
    }

    #[test]
    fn test_lua_value_wire_value() {
        assert_eq!(LuaValue::Boolean(true).wire_value().as_deref(), Some("true"));
        assert_eq!(LuaValue::Number(2.5).wire_value().as_deref(), Some("2.5"));
        assert_eq!(LuaValue::Nil.wire_value(), None);
        assert_eq!(
            LuaValue::Table(vec![LuaValue::Nil]).lua_type(),
            LuaType::Table
        );
    }
}
