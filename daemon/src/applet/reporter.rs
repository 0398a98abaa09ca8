//! Lifecycle reporting: "ready" once the first snapshot is reconciled,
//! "shutting down" when the service manager stops the node.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use nodeagent_common::NodeState;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::{
    bus::{AppletId, BusEvent, ShutdownReason, Subscription},
    config::ConfigRx,
    error::render_chain,
    tmcc::{Notifier, backoff::Backoff},
};

/// Sends the single ready notification of a boot.
pub struct ReadyReporter {
    notifier: Arc<dyn Notifier>,
    applets: BTreeSet<AppletId>,
    config: ConfigRx,
}

/// Terminal outcomes per snapshot version.
#[derive(Debug, Default)]
struct Outcomes {
    latest: u64,
    reported: BTreeMap<u64, BTreeSet<AppletId>>,
}

impl Outcomes {
    fn snapshot(&mut self, version: u64) {
        self.latest = self.latest.max(version);
        self.reported.retain(|&v, _| v >= self.latest);
    }

    /// Record an outcome. Returns `true` once every applet reported for the latest version.
    fn record(&mut self, applet: AppletId, version: u64, applets: &BTreeSet<AppletId>) -> bool {
        if version < self.latest {
            debug!(%applet, version, latest = self.latest, "Ignoring outcome for superseded snapshot");
            return false;
        }
        let reported = self.reported.entry(version).or_default();
        reported.insert(applet);
        version == self.latest && applets.is_subset(reported)
    }
}

impl ReadyReporter {
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, applets: impl IntoIterator<Item = AppletId>, config: ConfigRx) -> Self {
        Self {
            notifier,
            applets: applets.into_iter().collect(),
            config,
        }
    }

    /// Consume `subscription` until shutdown.
    ///
    /// The queue keeps being drained after the notification so the bus never
    /// waits on this subscriber.
    #[tracing::instrument(name = "ready-reporter", skip_all)]
    pub async fn run(self, mut subscription: Subscription) {
        let mut outcomes = Outcomes::default();
        let mut sent = false;
        while let Some(event) = subscription.recv().await {
            let complete = match event {
                BusEvent::ConfigUpdated { ref snapshot, .. } => {
                    outcomes.snapshot(snapshot.version);
                    false
                }
                BusEvent::AppletReady { applet, version } => outcomes.record(applet, version, &self.applets),
                BusEvent::AppletError { applet, version, .. } => outcomes.record(applet, version, &self.applets),
                BusEvent::BossDiscovered(_) => false,
                BusEvent::Shutdown(_) => return,
            };
            if complete && !sent {
                info!(version = outcomes.latest, "Initial reconciliation finished");
                sent = true;
                if !self.notify_ready(&mut subscription).await {
                    return;
                }
            }
        }
    }

    /// Retry until the boss took the notification. Returns `false` on shutdown.
    async fn notify_ready(&self, subscription: &mut Subscription) -> bool {
        let tmcc = self.config.borrow().tmcc.clone();
        let mut backoff = Backoff::new(tmcc.backoff_initial(), tmcc.backoff_max());
        loop {
            match self.notifier.notify(NodeState::Ready).await {
                Ok(()) => return true,
                Err(e) => warn!(error = %render_chain(&e), "Ready notification failed, retrying"),
            }
            let delay = sleep(backoff.next_delay());
            tokio::pin!(delay);
            loop {
                tokio::select! {
                    () = &mut delay => break,
                    event = subscription.recv() => match event {
                        None | Some(BusEvent::Shutdown(_)) => return false,
                        Some(_) => {}
                    },
                }
            }
        }
    }
}

/// Sends the shutdown notification when the node is being stopped.
pub struct ShutdownReporter {
    notifier: Arc<dyn Notifier>,
    config: ConfigRx,
}

impl ShutdownReporter {
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, config: ConfigRx) -> Self {
        Self { notifier, config }
    }

    /// Wait for `Shutdown` and report it if the reason calls for it.
    ///
    /// Never takes longer than `tmcc.shutdown-timeout` once the event arrived.
    #[tracing::instrument(name = "shutdown-reporter", skip_all)]
    pub async fn run(self, mut subscription: Subscription) {
        while let Some(event) = subscription.recv().await {
            let BusEvent::Shutdown(reason) = event else {
                continue;
            };
            let tmcc = self.config.borrow().tmcc.clone();
            match reason {
                ShutdownReason::Interactive => {
                    info!("Interrupted interactively, not reporting shutdown");
                }
                ShutdownReason::Signal if !tmcc.report_shutdown => {
                    debug!("Shutdown reporting disabled");
                }
                ShutdownReason::Signal => match timeout(tmcc.shutdown_timeout(), self.notifier.notify(NodeState::Shutdown)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %render_chain(&e), "Shutdown notification failed"),
                    Err(_) => warn!(limit = ?tmcc.shutdown_timeout(), "Shutdown notification timed out"),
                },
            }
            return;
        }
    }
}
