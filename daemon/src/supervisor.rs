//! Startup and shutdown of all units.
//!
//! Start order: reporters subscribe first, then the applets, and only then
//! does the protocol client start, so no outcome or snapshot can be published
//! before somebody listens for it. On shutdown the shutdown notification gets
//! the first share of the stop timeout; whatever is still running at the
//! deadline is aborted.

use alloc::sync::Arc;
use std::path::PathBuf;

use eyre::{Result, eyre};
use nodeagent_common::systemd::is_systemd;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::{mpsc, watch},
    task::JoinSet,
    time::{Instant, timeout_at},
};
use tracing::{Instrument as _, debug, error, info, warn};

use crate::{
    applet::{
        Applet, AppletState,
        account::AccountApplet,
        hostname::{ETC_HOSTS, HostnameApplet},
        mount::MountApplet,
        reporter::{ReadyReporter, ShutdownReporter},
        run_applet,
    },
    bus::{AppletId, Bus, BusEvent, ShutdownReason},
    config::{AgentConfig, ConfigRx, ConfigTx, reload},
    store::ConfigStore,
    system::{SystemActions, required_commands},
    tmcc::{TmccClient, discovery::DiscoverySources},
};

/// Requests from outside the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Shutdown(ShutdownReason),
    /// Re-read the local configuration file.
    Reload,
}

const fn is_shutdown(event: &BusEvent) -> bool {
    matches!(*event, BusEvent::Shutdown(_))
}

fn applet_enabled(id: AppletId, config: &AgentConfig) -> bool {
    match id {
        AppletId::Account => config.autouser.enable,
        AppletId::Mount => config.automount.enable,
        AppletId::Hostname => config.autohost.enable,
    }
}

/// Fail if an enabled applet lacks an external command it relies on.
///
/// # Errors
///
/// Returns an error naming the applet and the missing commands.
pub fn check_requirements(config: &AgentConfig, system: &dyn SystemActions) -> Result<()> {
    for id in AppletId::ALL {
        if !applet_enabled(id, config) {
            continue;
        }
        let missing = system.missing_commands(required_commands(id));
        if !missing.is_empty() {
            return Err(eyre!(
                "{id} is enabled but required commands are missing: {}. Install them or disable [{id}].",
                missing.join(", ")
            ));
        }
    }
    if config.automount.enable && !is_systemd() {
        warn!("automount is enabled but systemd does not appear to be running");
    }
    Ok(())
}

/// The whole agent.
pub struct Agent {
    config_tx: ConfigTx,
    config_path: Option<PathBuf>,
    system: Arc<dyn SystemActions>,
    sources: DiscoverySources,
    hosts_path: PathBuf,
}

impl Agent {
    #[must_use]
    pub fn new(config: AgentConfig, config_path: Option<PathBuf>, system: Arc<dyn SystemActions>) -> Self {
        Self {
            config_tx: watch::Sender::new(Arc::new(config)),
            config_path,
            system,
            sources: DiscoverySources::system(),
            hosts_path: PathBuf::from(ETC_HOSTS),
        }
    }

    #[must_use]
    pub fn with_sources(mut self, sources: DiscoverySources) -> Self {
        self.sources = sources;
        self
    }

    #[must_use]
    pub fn with_hosts_path(mut self, path: PathBuf) -> Self {
        self.hosts_path = path;
        self
    }

    fn config(&self) -> ConfigRx {
        self.config_tx.subscribe()
    }

    /// Run all units until a [`Control::Shutdown`] arrives on `control`.
    ///
    /// A closed `control` channel counts as an interactive shutdown.
    #[tracing::instrument(name = "supervisor", skip_all)]
    pub async fn run(self, mut control: mpsc::Receiver<Control>) {
        let config = self.config_tx.borrow().clone();
        let bus = Bus::default();
        let store = Arc::new(ConfigStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = TmccClient::new(self.config(), Arc::clone(&store), bus.clone(), shutdown_rx)
            .with_sources(self.sources.clone());
        let boss = Arc::new(client.handle());

        let shutdown_reporter = tokio::spawn(
            ShutdownReporter::new(boss.clone(), self.config())
                .run(bus.subscribe_filtered("shutdown-reporter", is_shutdown))
                .in_current_span(),
        );
        let mut tasks = JoinSet::new();
        tasks.spawn(
            ReadyReporter::new(boss, AppletId::ALL, self.config())
                .run(bus.subscribe("ready-reporter"))
                .in_current_span(),
        );

        let applets: [Box<dyn Applet>; 3] = [
            Box::new(AccountApplet::new(Arc::clone(&self.system))),
            Box::new(MountApplet::new(
                Arc::clone(&self.system),
                config.systemd.unit_dir.clone(),
            )),
            Box::new(HostnameApplet::new(Arc::clone(&self.system), self.hosts_path.clone())),
        ];
        let mut states = Vec::new();
        for applet in applets {
            let id = applet.id();
            let subscription = bus.subscribe_filtered(id.as_str(), BusEvent::is_command);
            let (state_tx, state_rx) = watch::channel(AppletState::Idle);
            states.push((id, state_rx));
            tasks.spawn(run_applet(applet, subscription, bus.clone(), self.config(), state_tx).in_current_span());
        }

        tasks.spawn(client.run().in_current_span());
        info!(subscribers = bus.subscriber_count(), "Agent started");

        let reason = loop {
            match control.recv().await {
                Some(Control::Reload) => match self.config_path {
                    Some(ref path) => {
                        if let Err(e) = reload(path, &self.config_tx).await {
                            error!(error = ?e, "Config reload failed, keeping the active config");
                        }
                    }
                    None => warn!("Started without a config file, nothing to reload"),
                },
                Some(Control::Shutdown(reason)) => break reason,
                None => break ShutdownReason::Interactive,
            }
        };

        let limit = self.config_tx.borrow().tmcc.shutdown_timeout();
        let deadline = Instant::now() + limit;
        info!(?reason, ?limit, "Shutting down");
        shutdown_tx.send_replace(true);
        if timeout_at(deadline, bus.publish(BusEvent::Shutdown(reason)))
            .await
            .is_err()
        {
            warn!("Shutdown event could not be delivered in time");
        }
        match timeout_at(deadline, shutdown_reporter).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Shutdown reporter failed"),
            Err(_) => warn!("Shutdown reporter did not finish in time"),
        }

        let drained = timeout_at(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "Abandoning unfinished work");
            tasks.abort_all();
        }
        for (id, state) in states {
            debug!(applet = %id, state = ?*state.borrow(), "Final applet state");
        }
        bus.close();
        info!("Agent stopped");
    }
}

/// Forward SIGTERM, SIGINT and SIGHUP to `control`.
///
/// # Errors
///
/// Returns an error if a signal handler cannot be installed.
pub fn forward_signals(control: mpsc::Sender<Control>) -> Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    tokio::spawn(
        async move {
            loop {
                let request = tokio::select! {
                    _ = term.recv() => Control::Shutdown(ShutdownReason::Signal),
                    _ = int.recv() => Control::Shutdown(ShutdownReason::Interactive),
                    _ = hup.recv() => Control::Reload,
                };
                debug!(?request, "Received signal");
                if control.send(request).await.is_err() {
                    return;
                }
            }
        }
        .in_current_span(),
    );
    Ok(())
}

/// Check requirements, then run until a termination signal arrives.
///
/// # Errors
///
/// Returns an error if a required resource is unavailable.
pub async fn run(config: AgentConfig, config_path: Option<PathBuf>, system: Arc<dyn SystemActions>) -> Result<()> {
    check_requirements(&config, system.as_ref())?;
    let (control_tx, control_rx) = mpsc::channel(8);
    forward_signals(control_tx)?;
    Agent::new(config, config_path, system)
        .run(control_rx)
        .in_current_span()
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::{
        system::recording::{Action, RecordingSystem},
        tmcc::fake::FakeBoss,
    };

    fn sources(dir: &std::path::Path) -> DiscoverySources {
        DiscoverySources {
            env_boss: None,
            marker_files: Vec::new(),
            resolv_conf: dir.join("resolv.conf"),
        }
    }

    #[test]
    fn missing_commands_are_fatal_for_enabled_applets() {
        let system = RecordingSystem::new().with_missing_command("useradd");
        let err = check_requirements(&AgentConfig::default(), &system).unwrap_err();
        assert!(err.to_string().contains("autouser"), "{err}");

        let mut config = AgentConfig::default();
        config.autouser.enable = false;
        config.automount.enable = false;
        check_requirements(&config, &system).unwrap();
    }

    #[tokio::test]
    async fn boots_reconciles_reports_ready_and_shutdown() {
        let boss = FakeBoss::start().await;
        boss.respond(
            "accounts",
            "ADDGROUP NAME=Proj GID=6000\n\
             ADDUSER LOGIN=alice UID=20001 GID=6000 HOMEDIR=/users/alice SHELL=bash\n\
             PUBKEY LOGIN=alice KEY=\"ssh-ed25519 AAAAalice alice@laptop\"\n",
        );
        boss.respond("mounts", "REMOTE=host:/proj/x LOCAL=/proj/x\n");
        boss.respond("status", "FREE\n");

        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.tmcc.boss = Some("127.0.0.1".into());
        config.tmcc.port = boss.addr().port();
        config.tmcc.request_timeout = 2;
        config.systemd.unit_dir = dir.path().join("units");
        let system = Arc::new(RecordingSystem::new());
        let agent = Agent::new(config, None, system.clone())
            .with_sources(sources(dir.path()))
            .with_hosts_path(dir.path().join("hosts"));
        let (control, control_rx) = mpsc::channel(1);
        let agent = tokio::spawn(agent.run(control_rx));

        assert!(boss.wait_for("state ISUP", Duration::from_secs(10)).await, "{:?}", boss.requests());
        let requests = boss.requests();
        assert_eq!(requests[0], "state MFSSETUP");
        let ready = requests.iter().position(|r| r == "state ISUP").unwrap();
        assert!(requests[..ready].iter().any(|r| r == "accounts"), "{requests:?}");

        assert_eq!(system.group("proj"), Some(6000));
        assert_eq!(
            system.authorized_keys("alice").unwrap(),
            ["ssh-ed25519 AAAAalice alice@laptop"]
        );
        assert!(dir.path().join("units/proj-x.mount").exists(), "unit written");
        let starts = system
            .actions()
            .into_iter()
            .filter(|a| *a == Action::Start("proj-x.mount".into()))
            .count();
        assert_eq!(starts, 1);

        control
            .send(Control::Shutdown(ShutdownReason::Signal))
            .await
            .unwrap();
        timeout(Duration::from_secs(10), agent).await.unwrap().unwrap();
        assert!(boss.requests().iter().any(|r| r == "state SHUTDOWN"), "{:?}", boss.requests());
    }

    #[tokio::test]
    async fn interactive_stop_sends_nothing() {
        let boss = FakeBoss::start().await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.tmcc.boss = Some("127.0.0.1".into());
        config.tmcc.port = boss.addr().port();
        config.systemd.unit_dir = dir.path().join("units");
        let agent = Agent::new(config, None, Arc::new(RecordingSystem::new())).with_sources(sources(dir.path()));
        let (control, control_rx) = mpsc::channel(1);
        let agent = tokio::spawn(agent.run(control_rx));

        assert!(boss.wait_for("state MFSSETUP", Duration::from_secs(10)).await, "booted");
        drop(control);
        timeout(Duration::from_secs(10), agent).await.unwrap().unwrap();
        assert!(!boss.requests().iter().any(|r| r == "state SHUTDOWN"), "{:?}", boss.requests());
    }
}
