//! Configuration data types for the agent.
//!
//! Every section is optional; an empty file yields the defaults documented on
//! each field.

use core::time::Duration;
use std::path::{Component, Path, PathBuf};

use nodeagent_common::DEFAULT_BOSS_PORT;
use serde::Deserialize;

/// NFS options used when the boss does not send any.
pub const DEFAULT_NFS_OPTIONS: &str = "vers=3,hard,_netdev";

/// Root config structure for the agent.
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Account reconciliation.
    #[serde(default)]
    pub autouser: AutouserConfig,
    /// NFS mount reconciliation.
    #[serde(default)]
    pub automount: AutomountConfig,
    /// Hostname management.
    #[serde(default)]
    pub autohost: AutohostConfig,
    /// Boss communication.
    #[serde(default)]
    pub tmcc: TmccConfig,
    /// systemd integration.
    #[serde(default)]
    pub systemd: SystemdConfig,
}

/// `[autouser]` section.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct AutouserConfig {
    #[serde(default = "do_enable")]
    pub enable: bool,
    /// Name of the admin group. Discovered when unset (`wheel`, then `sudo`, then `root`).
    #[serde(default)]
    pub admin_group: Option<String>,
}

impl Default for AutouserConfig {
    fn default() -> Self {
        Self {
            enable: do_enable(),
            admin_group: None,
        }
    }
}

/// `[automount]` section.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct AutomountConfig {
    #[serde(default = "do_enable")]
    pub enable: bool,
    #[serde(default)]
    pub backend: MountBackend,
    /// Mount options for exports the boss sends without any.
    #[serde(default = "default_nfs_options")]
    pub options: String,
}

impl Default for AutomountConfig {
    fn default() -> Self {
        Self {
            enable: do_enable(),
            backend: MountBackend::default(),
            options: default_nfs_options(),
        }
    }
}

/// How mounts are realized.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MountBackend {
    /// Generated `.mount` units in `systemd.unit-dir`.
    #[default]
    Systemd,
}

/// `[autohost]` section.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct AutohostConfig {
    #[serde(default = "do_enable")]
    pub enable: bool,
    /// Maintain a line for the node's FQDN in `/etc/hosts`.
    ///
    /// The hosts file itself must be made writable by whatever owns it.
    #[serde(default, alias = "etc-hosts")]
    pub etc_hosts: bool,
}

impl Default for AutohostConfig {
    fn default() -> Self {
        Self {
            enable: do_enable(),
            etc_hosts: false,
        }
    }
}

/// `[tmcc]` section: how to find and talk to the boss.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TmccConfig {
    /// Boss host. Discovered when unset.
    #[serde(default)]
    pub boss: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Tell the boss when the node is going down (SIGTERM only).
    #[serde(default = "do_enable")]
    pub report_shutdown: bool,
    /// Seconds between configuration fetches.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// First retry delay after a failure, in milliseconds.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Upper bound of the retry delay, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Seconds a single request may take.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Seconds shutdown may take, including the shutdown notification.
    /// Should stay below the service manager's stop timeout.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl TmccConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    #[must_use]
    pub const fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    #[must_use]
    pub const fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl Default for TmccConfig {
    fn default() -> Self {
        Self {
            boss: None,
            port: default_port(),
            report_shutdown: do_enable(),
            poll_interval: default_poll_interval(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            request_timeout: default_request_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// `[systemd]` section.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SystemdConfig {
    /// Where generated units go. Relative paths are resolved against the config file.
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,
}

impl Default for SystemdConfig {
    fn default() -> Self {
        Self {
            unit_dir: default_unit_dir(),
        }
    }
}

const fn do_enable() -> bool {
    true
}

const fn default_port() -> u16 {
    DEFAULT_BOSS_PORT
}

const fn default_poll_interval() -> u64 {
    60
}

const fn default_backoff_initial_ms() -> u64 {
    500
}

const fn default_backoff_max_ms() -> u64 {
    30_000
}

const fn default_request_timeout() -> u64 {
    10
}

const fn default_shutdown_timeout() -> u64 {
    5
}

fn default_nfs_options() -> String {
    DEFAULT_NFS_OPTIONS.to_string()
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

/// Resolves a path to an absolute one.
///
/// If the path is absolute, returns it as-is. If relative, joins it with the
/// config file's parent directory and normalizes the result to remove redundant
/// components like `./`.
#[must_use]
pub fn resolve_config_relative_path(config_path: &Path, relative_path: &Path) -> PathBuf {
    let resolved = if relative_path.is_absolute() {
        relative_path.to_path_buf()
    } else {
        config_path
            .parent()
            .map_or_else(|| relative_path.to_path_buf(), |d| d.join(relative_path))
    };

    // We can't use canonicalize() because the directory might not exist yet
    normalize_path(&resolved)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        use Component as C;
        match component {
            C::Normal(c) => {
                result.push(c);
            }
            C::ParentDir => {
                result.pop();
            }
            C::CurDir => {}
            C::RootDir | C::Prefix(_) => {
                result.push(component);
            }
        }
    }
    result
}
