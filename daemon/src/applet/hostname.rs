//! The node's hostname and, optionally, its `/etc/hosts` line.

use alloc::sync::Arc;
use std::{io, path::PathBuf};

use futures::{FutureExt as _, future::BoxFuture};
use tokio::fs;
use tracing::{debug, info};

use super::{Applet, Cycle};
use crate::{bus::AppletId, config::AgentConfig, error::ReconciliationError, model::HostnamePolicy, system::SystemActions};

pub const ETC_HOSTS: &str = "/etc/hosts";

/// Trailing comment identifying the line we maintain.
const HOSTS_MARKER: &str = "# nodeagent";

const LOOPBACK: &str = "127.0.1.1";

/// `content` with our line replaced by one for `fqdn`.
fn hosts_with_entry(content: &str, fqdn: &str, short: &str) -> String {
    let mut out: String = content
        .lines()
        .filter(|line| !line.trim_end().ends_with(HOSTS_MARKER))
        .flat_map(|line| [line, "\n"])
        .collect();
    let names = if short == fqdn {
        fqdn.to_owned()
    } else {
        format!("{fqdn} {short}")
    };
    out.push_str(&format!("{LOOPBACK}\t{names}\t{HOSTS_MARKER}\n"));
    out
}

pub struct HostnameApplet {
    system: Arc<dyn SystemActions>,
    hosts_path: PathBuf,
    /// Last FQDN handed to the system.
    applied: Option<String>,
}

impl HostnameApplet {
    #[must_use]
    pub fn new(system: Arc<dyn SystemActions>, hosts_path: PathBuf) -> Self {
        Self {
            system,
            hosts_path,
            applied: None,
        }
    }

    async fn update_hosts(&self, fqdn: &str, short: &str) -> Result<(), ReconciliationError> {
        let path = self.hosts_path.as_path();
        let file_error = |action| {
            move |source| ReconciliationError::File {
                action,
                path: path.to_path_buf(),
                source,
            }
        };
        let current = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(file_error("read")(e)),
        };
        let updated = hosts_with_entry(&current, fqdn, short);
        if updated == current {
            return Ok(());
        }
        // Written in place: the file may be a bind mount owned by someone else.
        fs::write(path, updated).await.map_err(file_error("write"))?;
        info!(path = %path.display(), fqdn, "Updated hosts file");
        Ok(())
    }

    async fn run_cycle(&mut self, cycle: &Cycle) -> Result<(), ReconciliationError> {
        let HostnamePolicy::Set { ref fqdn } = cycle.snapshot.hostname else {
            debug!("Node not allocated, hostname unmanaged");
            return Ok(());
        };
        if self.applied.as_deref() == Some(fqdn.as_str()) {
            return Ok(());
        }

        let current = self.system.hostname().await.map_err(|source| ReconciliationError::Action {
            action: "read hostname",
            target: fqdn.clone(),
            source,
        })?;
        if current == *fqdn {
            debug!(hostname = %fqdn, "Hostname already set");
        } else {
            info!(from = %current, to = %fqdn, "Setting hostname");
            self.system
                .set_hostname(fqdn)
                .await
                .map_err(|source| ReconciliationError::Action {
                    action: "set hostname",
                    target: fqdn.clone(),
                    source,
                })?;
        }
        self.applied = Some(fqdn.clone());

        if cycle.config.autohost.etc_hosts {
            let short = cycle.snapshot.hostname.short().unwrap_or(fqdn);
            self.update_hosts(fqdn, short).await?;
        }
        Ok(())
    }
}

impl Applet for HostnameApplet {
    fn id(&self) -> AppletId {
        AppletId::Hostname
    }

    fn enabled(&self, config: &AgentConfig) -> bool {
        config.autohost.enable
    }

    fn reconcile<'cycle>(&'cycle mut self, cycle: &'cycle Cycle) -> BoxFuture<'cycle, Result<(), ReconciliationError>> {
        self.run_cycle(cycle).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::NodeConfig,
        store::SnapshotDiff,
        system::recording::{Action, RecordingSystem},
    };

    fn cycle(version: u64, hostname: HostnamePolicy, etc_hosts: bool) -> Cycle {
        let mut config = AgentConfig::default();
        config.autohost.etc_hosts = etc_hosts;
        Cycle {
            snapshot: Arc::new(NodeConfig {
                version,
                hostname,
                ..NodeConfig::empty()
            }),
            diff: Arc::new(SnapshotDiff::default()),
            config: Arc::new(config),
        }
    }

    fn node(fqdn: &str) -> HostnamePolicy {
        HostnamePolicy::Set { fqdn: fqdn.to_owned() }
    }

    #[tokio::test]
    async fn applies_each_change_once() {
        let dir = tempfile::tempdir().unwrap();
        let system = Arc::new(RecordingSystem::new());
        let mut applet = HostnameApplet::new(system.clone(), dir.path().join("hosts"));

        applet.reconcile(&cycle(1, HostnamePolicy::Unmanaged, false)).await.unwrap();
        assert_eq!(system.actions(), []);

        for version in 2..=3 {
            applet
                .reconcile(&cycle(version, node("node1.exp.proj.example.net"), false))
                .await
                .unwrap();
        }
        applet.reconcile(&cycle(4, node("node2.exp.proj.example.net"), false)).await.unwrap();
        assert_eq!(
            system.actions(),
            [
                Action::SetHostname("node1.exp.proj.example.net".into()),
                Action::SetHostname("node2.exp.proj.example.net".into()),
            ]
        );
        assert_eq!(system.current_hostname(), "node2.exp.proj.example.net");
    }

    #[tokio::test]
    async fn maintains_one_hosts_line() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        std::fs::write(&hosts, "127.0.0.1\tlocalhost\n").unwrap();
        let mut applet = HostnameApplet::new(Arc::new(RecordingSystem::new()), hosts.clone());

        applet.reconcile(&cycle(1, node("node1.exp.proj.example.net"), true)).await.unwrap();
        applet.reconcile(&cycle(2, node("node2.exp.proj.example.net"), true)).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&hosts).unwrap(),
            "127.0.0.1\tlocalhost\n127.0.1.1\tnode2.exp.proj.example.net node2\t# nodeagent\n"
        );
    }

    #[tokio::test]
    async fn unwritable_hosts_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let system = Arc::new(RecordingSystem::new());
        let mut applet = HostnameApplet::new(system.clone(), dir.path().join("missing/hosts"));

        let err = applet
            .reconcile(&cycle(1, node("node1.exp.proj.example.net"), true))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconciliationError::File { action: "write", .. }), "{err:?}");
        // The hostname itself was applied and is not retried until it changes.
        applet.reconcile(&cycle(2, node("node1.exp.proj.example.net"), true)).await.unwrap();
        assert_eq!(system.actions().len(), 1);
    }

    #[test]
    fn short_name_only_once() {
        assert_eq!(hosts_with_entry("", "node1", "node1"), "127.0.1.1\tnode1\t# nodeagent\n");
    }
}
