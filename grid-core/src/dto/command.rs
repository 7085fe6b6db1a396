//! Grid command envelope
//!
//! Commands are JSON documents carried in the `script` field of a
//! `ScriptExecution`. Enum values are written by name.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::lua::ScriptExecution;

/// Current command message version
pub const MESSAGE_VERSION: i32 = 1;

/// What the Grid Server should do with the command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridCommandMode {
    ExecuteScript,
    GameServer,
    Render,
}

/// Settings of an `ExecuteScript` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecuteScriptSettings {
    /// Script type, also the name of the script to run
    #[serde(rename = "Type")]
    pub script_type: String,
    pub arguments: Map<String, Value>,
}

/// A command sent to a Grid Server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GridCommand {
    pub mode: GridCommandMode,
    pub message_version: i32,
    pub settings: Value,
}

impl GridCommand {
    /// Creates a command with arbitrary settings
    pub fn new(mode: GridCommandMode, settings: Value) -> Self {
        Self {
            mode,
            message_version: MESSAGE_VERSION,
            settings,
        }
    }

    /// Creates an `ExecuteScript` command
    ///
    /// # Arguments
    /// * `script_type` - Name of the script the Grid Server should run
    /// * `arguments` - Named arguments passed to the script
    pub fn execute_script(
        script_type: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> serde_json::Result<Self> {
        let settings = serde_json::to_value(ExecuteScriptSettings {
            script_type: script_type.into(),
            arguments,
        })?;

        Ok(Self::new(GridCommandMode::ExecuteScript, settings))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Wraps the command into a script execution named by a fresh UUID
    pub fn to_script_execution(&self) -> serde_json::Result<ScriptExecution> {
        Ok(ScriptExecution::new(
            uuid::Uuid::new_v4().to_string(),
            self.to_json()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json_shape() {
        let mut args = Map::new();
        args.insert("script".to_string(), Value::String("print(1)".to_string()));

        let command = GridCommand::execute_script("Execute", args).unwrap();
        let json: Value = serde_json::from_str(&command.to_json().unwrap()).unwrap();

        assert_eq!(json["Mode"], "ExecuteScript");
        assert_eq!(json["MessageVersion"], 1);
        assert_eq!(json["Settings"]["Type"], "Execute");
        assert_eq!(json["Settings"]["Arguments"]["script"], "print(1)");
    }

    #[test]
    fn test_script_execution_names_are_unique() {
        let command = GridCommand::new(GridCommandMode::Render, Value::Null);

        let a = command.to_script_execution().unwrap();
        let b = command.to_script_execution().unwrap();

        assert_ne!(a.name, b.name);
        assert!(uuid::Uuid::parse_str(&a.name).is_ok());
        assert!(a.arguments.is_empty());
    }
}
