//! Settings provider
//!
//! Live-tunable settings looked up by name. Typed access goes through
//! `SettingsProviderExt`, which works on trait objects too.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

/// Key-value settings source
pub trait SettingsProvider: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Typed lookups over any `SettingsProvider`
pub trait SettingsProviderExt {
    /// Returns the parsed setting, or `default` when missing or unparsable
    fn get_or_default<T: FromStr>(&self, name: &str, default: T) -> T;
}

impl<P: SettingsProvider + ?Sized> SettingsProviderExt for P {
    fn get_or_default<T: FromStr>(&self, name: &str, default: T) -> T {
        self.get(name)
            .and_then(|v| v.trim().parse::<T>().ok())
            .unwrap_or(default)
    }
}

/// Reads settings from environment variables
///
/// `get("MaxInstanceReuses")` with prefix `GRID_` reads `GRID_MAX_INSTANCE_REUSES`.
#[derive(Debug, Clone)]
pub struct EnvSettingsProvider {
    prefix: String,
}

impl EnvSettingsProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable name for a setting
    pub fn variable_name(&self, name: &str) -> String {
        let mut out = self.prefix.clone();
        let mut prev_lower = false;
        for c in name.chars() {
            if c.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            if c == '.' || c == '-' {
                out.push('_');
            } else {
                out.push(c.to_ascii_uppercase());
            }
        }
        out
    }
}

impl SettingsProvider for EnvSettingsProvider {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(self.variable_name(name)).ok()
    }
}

/// In-memory settings, mutable at runtime
#[derive(Debug, Default)]
pub struct MemorySettingsProvider {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettingsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, value: impl ToString) {
        self.values
            .write()
            .unwrap()
            .insert(name.into(), value.to_string());
    }
}

impl SettingsProvider for MemorySettingsProvider {
    fn get(&self, name: &str) -> Option<String> {
        self.values.read().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_get_or_default() {
        let settings = MemorySettingsProvider::new();
        settings.set("MaxInstanceReuses", 3);
        settings.set("Broken", "not-a-number");

        assert_eq!(settings.get_or_default("MaxInstanceReuses", 1), 3);
        assert_eq!(settings.get_or_default("Broken", 7), 7);
        assert_eq!(settings.get_or_default("Missing", 2.5), 2.5);
    }

    #[test]
    fn test_get_or_default_through_trait_object() {
        let settings = Arc::new(MemorySettingsProvider::new());
        settings.set("Enabled", "true");

        let provider: Arc<dyn SettingsProvider> = settings;
        assert!(provider.get_or_default("Enabled", false));
    }

    #[test]
    fn test_env_variable_name() {
        let provider = EnvSettingsProvider::new("GRID_");
        assert_eq!(
            provider.variable_name("MaxInstanceReuses"),
            "GRID_MAX_INSTANCE_REUSES"
        );
        assert_eq!(provider.variable_name("cpu.ratio"), "GRID_CPU_RATIO");
    }
}
