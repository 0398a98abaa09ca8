//! Reconciliation units.
//!
//! Each applet runs as its own task, receives `ConfigUpdated` from the bus and
//! answers every snapshot version with exactly one `AppletReady` or
//! `AppletError`, even when it is disabled.

pub mod account;
pub mod hostname;
pub mod mount;
pub mod reporter;

use alloc::sync::Arc;
use core::panic::AssertUnwindSafe;

use futures::{FutureExt as _, future::BoxFuture};
use tokio::sync::watch;
use tracing::{Instrument as _, debug, error, info, info_span};

use crate::{
    bus::{AppletId, Bus, BusEvent, Subscription},
    config::{AgentConfig, ConfigRx},
    error::{ReconciliationError, render_chain},
    model::NodeConfig,
    store::SnapshotDiff,
};

/// Everything an applet sees during one reconciliation.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub snapshot: Arc<NodeConfig>,
    pub diff: Arc<SnapshotDiff>,
    pub config: Arc<AgentConfig>,
}

/// One reconciliation domain.
pub trait Applet: Send {
    fn id(&self) -> AppletId;

    fn enabled(&self, config: &AgentConfig) -> bool;

    /// Bring the system in line with `cycle.snapshot`.
    ///
    /// Failures of single entries must not stop the others; they are
    /// collected into one [`ReconciliationError`]. Snapshots arriving while
    /// the applet is disabled are not passed in, so `cycle.diff` may start
    /// later than the last snapshot this applet saw.
    fn reconcile<'cycle>(&'cycle mut self, cycle: &'cycle Cycle) -> BoxFuture<'cycle, Result<(), ReconciliationError>>;
}

/// Progress of the current reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppletState {
    Idle,
    Running,
    Ready,
    Failed,
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Drive `applet` from `subscription` until shutdown.
///
/// Errors and panics inside the applet are turned into `AppletError` events.
pub async fn run_applet(
    mut applet: Box<dyn Applet>,
    mut subscription: Subscription,
    bus: Bus,
    config: ConfigRx,
    state: watch::Sender<AppletState>,
) {
    let id = applet.id();
    state.send_replace(AppletState::Idle);
    while let Some(event) = subscription.recv().await {
        match event {
            BusEvent::ConfigUpdated { snapshot, diff } => {
                let version = snapshot.version;
                let cycle = Cycle {
                    snapshot,
                    diff,
                    config: config.borrow().clone(),
                };
                if !applet.enabled(&cycle.config) {
                    debug!(applet = %id, version, "Applet disabled, acknowledging");
                    state.send_replace(AppletState::Idle);
                    bus.publish(BusEvent::AppletReady { applet: id, version }).await;
                    continue;
                }

                state.send_replace(AppletState::Running);
                let outcome = AssertUnwindSafe(applet.reconcile(&cycle))
                    .catch_unwind()
                    .instrument(info_span!("applet", id = %id, version))
                    .await;
                let event = match outcome {
                    Ok(Ok(())) => {
                        info!(applet = %id, version, "Reconciliation complete");
                        state.send_replace(AppletState::Ready);
                        BusEvent::AppletReady { applet: id, version }
                    }
                    Ok(Err(e)) => {
                        let error = render_chain(&e);
                        error!(applet = %id, version, %error, "Reconciliation failed");
                        state.send_replace(AppletState::Failed);
                        BusEvent::AppletError {
                            applet: id,
                            version,
                            error,
                        }
                    }
                    Err(payload) => {
                        let error = format!("panicked: {}", panic_message(payload.as_ref()));
                        error!(applet = %id, version, %error, "Reconciliation failed");
                        state.send_replace(AppletState::Failed);
                        BusEvent::AppletError {
                            applet: id,
                            version,
                            error,
                        }
                    }
                };
                bus.publish(event).await;
            }
            BusEvent::BossDiscovered(ref boss) => {
                debug!(applet = %id, boss = %boss.host, "Boss discovered");
            }
            BusEvent::AppletReady { .. } | BusEvent::AppletError { .. } => {}
            BusEvent::Shutdown(reason) => {
                debug!(applet = %id, ?reason, "Applet stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::bus::ShutdownReason;

    struct Scripted {
        panic_on: u64,
        fail_on: u64,
    }

    impl Applet for Scripted {
        fn id(&self) -> AppletId {
            AppletId::Hostname
        }

        fn enabled(&self, config: &AgentConfig) -> bool {
            config.autohost.enable
        }

        fn reconcile<'cycle>(&'cycle mut self, cycle: &'cycle Cycle) -> BoxFuture<'cycle, Result<(), ReconciliationError>> {
            async move {
                let version = cycle.snapshot.version;
                assert_ne!(version, self.panic_on, "scripted panic");
                if version == self.fail_on {
                    return Err(ReconciliationError::GidChange {
                        name: "proj".into(),
                        current: 1,
                        requested: 2,
                    });
                }
                Ok(())
            }
            .boxed()
        }
    }

    fn updated(version: u64) -> BusEvent {
        BusEvent::ConfigUpdated {
            snapshot: Arc::new(NodeConfig {
                version,
                ..NodeConfig::empty()
            }),
            diff: Arc::new(SnapshotDiff::default()),
        }
    }

    async fn next_outcome(sub: &mut Subscription) -> BusEvent {
        timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn errors_and_panics_become_applet_errors() {
        let bus = Bus::default();
        let mut outcomes = bus.subscribe("outcomes");
        let subscription = bus.subscribe_filtered("scripted", BusEvent::is_command);
        let (_config_tx, config) = watch::channel(Arc::new(AgentConfig::default()));
        let (state_tx, state) = watch::channel(AppletState::Idle);
        let task = tokio::spawn(run_applet(
            Box::new(Scripted { panic_on: 2, fail_on: 3 }),
            subscription,
            bus.clone(),
            config,
            state_tx,
        ));

        for version in 1..=4 {
            bus.publish(updated(version)).await;
        }
        let mut seen = Vec::new();
        while seen.len() < 4 {
            match next_outcome(&mut outcomes).await {
                BusEvent::AppletReady { version, .. } => seen.push((version, "ready".to_owned())),
                BusEvent::AppletError { version, error, .. } => seen.push((version, error)),
                _ => {}
            }
        }
        assert_eq!(seen[0], (1, "ready".to_owned()));
        assert!(seen[1].1.contains("panicked"), "{seen:?}");
        assert!(seen[2].1.contains("refusing to change it"), "{seen:?}");
        assert_eq!(seen[3], (4, "ready".to_owned()));
        assert_eq!(*state.borrow(), AppletState::Ready);

        bus.publish(BusEvent::Shutdown(ShutdownReason::Signal)).await;
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn disabled_applet_still_acknowledges() {
        let bus = Bus::default();
        let mut outcomes = bus.subscribe("outcomes");
        let subscription = bus.subscribe_filtered("scripted", BusEvent::is_command);
        let mut disabled = AgentConfig::default();
        disabled.autohost.enable = false;
        let (_config_tx, config) = watch::channel(Arc::new(disabled));
        let (state_tx, _state) = watch::channel(AppletState::Idle);
        let task = tokio::spawn(run_applet(
            Box::new(Scripted { panic_on: 1, fail_on: 1 }),
            subscription,
            bus.clone(),
            config,
            state_tx,
        ));

        bus.publish(updated(1)).await;
        loop {
            if let BusEvent::AppletReady { applet, version } = next_outcome(&mut outcomes).await {
                assert_eq!((applet, version), (AppletId::Hostname, 1));
                break;
            }
        }
        bus.close();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
