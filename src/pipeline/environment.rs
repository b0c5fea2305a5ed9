//! Environment overrides with conflict detection
//!
//! The environment is an injectable key-value store. Production runs bind
//! into the process environment; tests use an isolated in-memory store.

use std::collections::HashMap;
use std::sync::RwLock;

use indexmap::IndexMap;
use tracing::{debug, info};

use super::error::ProvisioningError;

/// Key-value view of the environment the scan process will inherit
pub trait EnvStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    fn set(&self, name: &str, value: &str);

    /// Every binding, passed to child processes.
    fn vars(&self) -> Vec<(String, String)>;
}

/// The real process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvStore for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var_os(name).map(|v| v.to_string_lossy().into_owned())
    }

    fn set(&self, name: &str, value: &str) {
        std::env::set_var(name, value);
    }

    fn vars(&self) -> Vec<(String, String)> {
        std::env::vars_os()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.to_string_lossy().into_owned(),
                )
            })
            .collect()
    }
}

/// Isolated environment table
#[derive(Debug, Default)]
pub struct MemoryEnv {
    vars: RwLock<HashMap<String, String>>,
}

impl MemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with pre-existing (inherited) bindings.
    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            vars: RwLock::new(vars),
        }
    }
}

impl EnvStore for MemoryEnv {
    fn get(&self, name: &str) -> Option<String> {
        self.vars
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn set(&self, name: &str, value: &str) {
        self.vars
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value.to_string());
    }

    fn vars(&self) -> Vec<(String, String)> {
        let mut vars: Vec<_> = self
            .vars
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.sort();
        vars
    }
}

/// Validate an environment variable name.
pub fn validate_env_name(name: &str) -> Result<(), ProvisioningError> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(ProvisioningError::config(format!(
            "Invalid environment variable name: {name:?}"
        )));
    }
    Ok(())
}

/// Validate an environment variable value. The process environment cannot
/// hold NUL bytes.
pub fn validate_env_value(name: &str, value: &str) -> Result<(), ProvisioningError> {
    if value.contains('\0') {
        return Err(ProvisioningError::config(format!(
            "Value of environment variable {name} contains a NUL byte"
        )));
    }
    Ok(())
}

/// Bind `name` only if it is not already set.
pub(crate) fn bind_new(env: &dyn EnvStore, name: &str, value: &str) -> Result<(), ProvisioningError> {
    validate_env_value(name, value)?;
    ensure_unbound(env, name)?;
    env.set(name, value);
    Ok(())
}

pub(crate) fn ensure_unbound(env: &dyn EnvStore, name: &str) -> Result<(), ProvisioningError> {
    validate_env_name(name)?;
    if env.get(name).is_some() {
        return Err(ProvisioningError::EnvConflict {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Applies caller-supplied overrides without shadowing existing bindings.
pub struct EnvironmentConfigurator<'a> {
    env: &'a dyn EnvStore,
}

impl<'a> EnvironmentConfigurator<'a> {
    pub fn new(env: &'a dyn EnvStore) -> Self {
        Self { env }
    }

    /// Apply overrides in insertion order.
    ///
    /// Stops at the first name that is already bound. Entries applied before
    /// the conflict stay in place.
    pub fn apply(&self, overrides: &IndexMap<String, String>) -> Result<(), ProvisioningError> {
        for (name, value) in overrides {
            bind_new(self.env, name, value)?;
            debug!(name = %name, "Applied environment override");
        }

        info!(count = overrides.len(), "Environment overrides applied");
        Ok(())
    }
}
