//! # Configuration
//!
//! A plain string key/value store with dotted keys, plus a typed view of the
//! access-control settings read from it.
//!
//! ```rust
//! use clinic_core::{AccessSettings, ClinicConfig, CrossTenantPolicy};
//!
//! let mut config = ClinicConfig::new();
//! config.set("access.cross_tenant", "forbidden");
//!
//! let settings = AccessSettings::from_snapshot(&config.snapshot()).unwrap();
//! assert_eq!(settings.cross_tenant, CrossTenantPolicy::Forbidden);
//! ```
//!
//! Environment overrides use a prefix and `__` as the separator:
//!
//! ```bash
//! export CLINIC__ACCESS__CROSS_TENANT=forbidden   # access.cross_tenant
//! export CLINIC__ACCESS__PERMISSION_CACHE=true    # access.permission_cache
//! ```

use std::collections::HashMap;

use crate::errors::{ClinicError, ClinicResult};
use crate::guard::CrossTenantPolicy;

pub const CROSS_TENANT_KEY: &str = "access.cross_tenant";
pub const PERMISSION_CACHE_KEY: &str = "access.permission_cache";
pub const AUDIT_DETACHED_KEY: &str = "audit.detached";

#[derive(Debug, Default, Clone)]
pub struct ClinicConfig {
    values: HashMap<String, String>,
}

impl ClinicConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Overlay every process variable starting with `prefix`.
    pub fn load_env(&mut self, prefix: &str) {
        self.load_vars(prefix, std::env::vars());
    }

    /// Overlay `vars` the way [`load_env`](Self::load_env) does:
    /// `CLINIC__AUDIT__DETACHED` with prefix `CLINIC__` becomes `audit.detached`.
    pub fn load_vars<I>(&mut self, prefix: &str, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                if !normalized.is_empty() {
                    self.set(normalized, value);
                }
            }
        }
    }

    pub fn snapshot(&self) -> ClinicConfigSnapshot {
        ClinicConfigSnapshot {
            map: self.values.clone(),
        }
    }
}

/// Immutable copy of a [`ClinicConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClinicConfigSnapshot {
    map: HashMap<String, String>,
}

impl ClinicConfigSnapshot {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .and_then(|v| v.trim().to_ascii_lowercase().parse::<bool>().ok())
    }
}

/// Access-control switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessSettings {
    /// How rows owned by other organizations are reported.
    pub cross_tenant: CrossTenantPolicy,
    /// Keep resolved permission sets across requests.
    pub permission_cache: bool,
    /// Spawn audit writes instead of awaiting them.
    pub audit_detached: bool,
}

impl AccessSettings {
    /// Read the settings, falling back to defaults for absent keys. A value
    /// that is present but unparseable is an error.
    pub fn from_snapshot(snapshot: &ClinicConfigSnapshot) -> ClinicResult<Self> {
        let cross_tenant = match snapshot.get(CROSS_TENANT_KEY) {
            None => CrossTenantPolicy::default(),
            Some(raw) => CrossTenantPolicy::parse(raw).ok_or_else(|| invalid(CROSS_TENANT_KEY, raw))?,
        };
        Ok(Self {
            cross_tenant,
            permission_cache: read_bool(snapshot, PERMISSION_CACHE_KEY)?,
            audit_detached: read_bool(snapshot, AUDIT_DETACHED_KEY)?,
        })
    }
}

fn read_bool(snapshot: &ClinicConfigSnapshot, key: &str) -> ClinicResult<bool> {
    match snapshot.get(key) {
        None => Ok(false),
        Some(raw) => snapshot.get_bool(key).ok_or_else(|| invalid(key, raw)),
    }
}

fn invalid(key: &str, raw: &str) -> anyhow::Error {
    ClinicError::general_error(format!("Invalid value '{raw}' for config key {key}")).into_anyhow()
}
