use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::error::ConfigError;

/// Maximum time `start_instance` waits for the launched child to connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Upgrade requests must deliver their headers within this window.
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Smallest read buffer hyper accepts; bounds the size of request heads.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8192;

#[derive(Debug, Clone)]
pub struct ControlServerConfig {
    pub listen_addr: SocketAddr,
    /// Absolute directory holding per-service work and cache directories.
    pub state_dir: PathBuf,
    /// Absolute path of the installed runtime executable.
    pub runtime_path: PathBuf,
    pub connect_timeout: Duration,
    pub header_read_timeout: Duration,
    pub max_header_bytes: usize,
    pub instance: InstanceTimings,
    pub restart: RestartPolicy,
    pub kill: KillOptions,
}

impl ControlServerConfig {
    pub fn new(listen_addr: SocketAddr, state_dir: PathBuf, runtime_path: PathBuf) -> Self {
        Self {
            listen_addr,
            state_dir,
            runtime_path,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            instance: InstanceTimings::default(),
            restart: RestartPolicy::default(),
            kill: KillOptions::default(),
        }
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        if !self.state_dir.is_absolute() {
            return Err(ConfigError::RelativePath {
                field: "state_dir",
                path: self.state_dir.clone(),
            });
        }
        if !self.runtime_path.is_absolute() {
            return Err(ConfigError::RelativePath {
                field: "runtime_path",
                path: self.runtime_path.clone(),
            });
        }
        if self.restart.max_failures == 0 {
            return Err(ConfigError::NoRestartBudget);
        }
        if self.instance.response_retention <= self.instance.call_timeout {
            return Err(ConfigError::RetentionTooShort {
                retention: self.instance.response_retention,
                call_timeout: self.instance.call_timeout,
            });
        }
        Ok(())
    }
}

/// Timings governing RPC calls and graceful shutdown of one instance.
#[derive(Debug, Clone)]
pub struct InstanceTimings {
    pub call_timeout: Duration,
    /// Responses older than this are purged whether or not they were consumed.
    pub response_retention: Duration,
    pub poll_interval: Duration,
    pub stop_deadline: Duration,
    /// Depth of the broadcast buffer carrying inbound events.
    pub event_buffer: usize,
}

impl Default for InstanceTimings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            response_retention: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            stop_deadline: Duration::from_secs(5),
            event_buffer: 64,
        }
    }
}

/// Bounded restart loop applied by the launcher.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// A child exiting before this uptime counts as a failure.
    pub min_uptime: Duration,
    pub max_failures: u32,
    pub cooldown: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            min_uptime: Duration::from_secs(10),
            max_failures: 3,
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// Process-tree termination parameters.
#[derive(Debug, Clone)]
pub struct KillOptions {
    /// Pause between killing a process's children and the process itself.
    pub grace: Duration,
    pub max_depth: usize,
}

impl Default for KillOptions {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(100),
            max_depth: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControlServerConfig {
        ControlServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            PathBuf::from("/var/lib/warden"),
            PathBuf::from("/opt/warden/runtime"),
        )
    }

    #[test]
    fn defaults_pass_validation() {
        config().check().unwrap();
    }

    #[test]
    fn rejects_relative_paths() {
        let mut cfg = config();
        cfg.runtime_path = PathBuf::from("bin/runtime");
        assert!(matches!(
            cfg.check(),
            Err(ConfigError::RelativePath {
                field: "runtime_path",
                ..
            })
        ));
    }

    #[test]
    fn restart_policy_needs_a_failure_budget() {
        let mut cfg = config();
        cfg.restart.max_failures = 0;
        assert!(matches!(cfg.check(), Err(ConfigError::NoRestartBudget)));
    }

    #[test]
    fn retention_must_outlive_calls() {
        let mut cfg = config();
        cfg.instance.response_retention = cfg.instance.call_timeout;
        assert!(matches!(
            cfg.check(),
            Err(ConfigError::RetentionTooShort { .. })
        ));
    }
}
