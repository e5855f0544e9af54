//! Configuration for the director.

use std::time::Duration;

use anyhow::{bail, Result};
use rollout_reconcile::DEFAULT_WATCH_INTERVALS;

use crate::agent::AgentDeadlines;

/// How a tolerated start failure (agent does not know the `start` call) is
/// reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFailureSeverity {
    #[default]
    Warn,
    Debug,
    /// No log line; the failure is only counted in the convergence report.
    Suppress,
}

impl std::str::FromStr for StartFailureSeverity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "warn" => Ok(Self::Warn),
            "debug" => Ok(Self::Debug),
            "suppress" | "off" => Ok(Self::Suppress),
            other => bail!("unknown start failure severity: {other}"),
        }
    }
}

/// Director configuration.
///
/// Built once at startup and handed to the engine; nothing below the binary
/// reads the environment.
#[derive(Debug, Clone)]
pub struct DirectorConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// SQLite database path; `None` keeps state in memory.
    pub db_path: Option<String>,

    /// DNS domain appended to instance record names.
    pub dns_domain: String,

    /// Deployment name used for DNS names and orphan-disk bookkeeping.
    pub deployment: String,

    pub start_failure_severity: StartFailureSeverity,

    /// Upper bound on a single quick agent call.
    pub agent_timeout: Duration,

    /// Upper bound on agent calls that move data or run operator scripts,
    /// such as disk migration and drain.
    pub long_agent_timeout: Duration,

    /// Wait after an in-place network change before pinging the agent.
    pub network_settle: Duration,

    /// Number of intervals a watch range is split into.
    pub watch_intervals: u32,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            db_path: None,
            dns_domain: "bosh".to_string(),
            deployment: "default".to_string(),
            start_failure_severity: StartFailureSeverity::Warn,
            agent_timeout: Duration::from_secs(45),
            long_agent_timeout: Duration::from_secs(6 * 60 * 60),
            network_settle: Duration::from_secs(5),
            watch_intervals: DEFAULT_WATCH_INTERVALS,
        }
    }
}

impl DirectorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let log_level =
            std::env::var("ROLLOUT_LOG_LEVEL").unwrap_or_else(|_| defaults.log_level.clone());

        let db_path = std::env::var("ROLLOUT_DB_PATH")
            .ok()
            .filter(|p| !p.is_empty());

        let dns_domain =
            std::env::var("ROLLOUT_DNS_DOMAIN").unwrap_or_else(|_| defaults.dns_domain.clone());

        let deployment =
            std::env::var("ROLLOUT_DEPLOYMENT").unwrap_or_else(|_| defaults.deployment.clone());

        let start_failure_severity = match std::env::var("ROLLOUT_START_FAILURE_SEVERITY") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.start_failure_severity,
        };

        let agent_timeout = std::env::var("ROLLOUT_AGENT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.agent_timeout);

        let long_agent_timeout = std::env::var("ROLLOUT_LONG_AGENT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.long_agent_timeout);

        let network_settle = std::env::var("ROLLOUT_NETWORK_SETTLE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.network_settle);

        Ok(Self {
            log_level,
            db_path,
            dns_domain,
            deployment,
            start_failure_severity,
            agent_timeout,
            long_agent_timeout,
            network_settle,
            watch_intervals: defaults.watch_intervals,
        })
    }

    pub fn agent_deadlines(&self) -> AgentDeadlines {
        AgentDeadlines {
            call: self.agent_timeout,
            long_running: self.long_agent_timeout,
        }
    }
}
