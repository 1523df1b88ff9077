use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::lifecycle::RequestSettings;

pub const DEFAULT_DATABASE_SUFFIX: &str = "wiki";
pub const DEFAULT_SERVER: &str = "http://localhost";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FarmConfig {
    #[serde(default)]
    pub farm: FarmSection,
    #[serde(default)]
    pub requests: RequestsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FarmSection {
    pub server: Option<String>,
    pub subdomain: Option<String>,
    pub database_suffix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RequestsSection {
    pub use_job_queue: Option<bool>,
    pub use_notifications: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Approval queues a `createwiki` job.
    Deferred,
    /// Approval creates the wiki inline.
    Immediate,
}

/// Effective settings after env overrides and defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FarmSettings {
    pub server: String,
    pub subdomain: String,
    pub database_suffix: String,
    pub approval: ApprovalPolicy,
    pub notifications: bool,
}

impl FarmSettings {
    pub fn request_settings(&self) -> RequestSettings {
        RequestSettings {
            server: self.server.clone(),
            subdomain: self.subdomain.clone(),
            database_suffix: self.database_suffix.clone(),
        }
    }
}

impl FarmConfig {
    /// Resolve settings: env `WIKIFARM_*` > config > defaults.
    pub fn resolve(&self) -> Result<FarmSettings> {
        self.resolve_with_lookup(|key| env::var(key).ok())
    }

    pub fn resolve_with_lookup<F>(&self, lookup_env: F) -> Result<FarmSettings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = env_string(&lookup_env, "WIKIFARM_SERVER")
            .or_else(|| self.farm.server.clone())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());
        let subdomain = env_string(&lookup_env, "WIKIFARM_SUBDOMAIN")
            .or_else(|| self.farm.subdomain.clone())
            .unwrap_or_default();
        let database_suffix = self
            .farm
            .database_suffix
            .clone()
            .unwrap_or_else(|| DEFAULT_DATABASE_SUFFIX.to_string());

        let use_job_queue = match env_string(&lookup_env, "WIKIFARM_USE_JOB_QUEUE") {
            Some(value) => parse_bool("WIKIFARM_USE_JOB_QUEUE", &value)?,
            None => self.requests.use_job_queue.unwrap_or(false),
        };
        let notifications = match env_string(&lookup_env, "WIKIFARM_USE_NOTIFICATIONS") {
            Some(value) => parse_bool("WIKIFARM_USE_NOTIFICATIONS", &value)?,
            None => self.requests.use_notifications.unwrap_or(true),
        };

        Ok(FarmSettings {
            server,
            subdomain,
            database_suffix,
            approval: if use_job_queue {
                ApprovalPolicy::Deferred
            } else {
                ApprovalPolicy::Immediate
            },
            notifications,
        })
    }
}

/// Load and parse a FarmConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<FarmConfig> {
    if !config_path.exists() {
        return Ok(FarmConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: FarmConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_string<F>(lookup_env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{key} must be a boolean, got {other:?}"),
    }
}
