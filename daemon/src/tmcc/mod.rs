//! Client for the boss control protocol.
//!
//! The client owns boss discovery and the poll loop. It publishes
//! `BossDiscovered` and `ConfigUpdated` on the bus, and hands out
//! [`BossHandle`]s for the lifecycle notifications sent by the reporters.

pub mod backoff;
pub mod discovery;
#[cfg(test)]
pub(crate) mod fake;
pub mod fetch;
pub mod transport;

use alloc::sync::Arc;
use core::time::Duration;

use futures::{FutureExt as _, future::BoxFuture};
use nodeagent_common::{NodeState, Request};
use tokio::{
    sync::watch,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use self::{backoff::Backoff, discovery::DiscoverySources};
use crate::{
    bus::{Bus, BusEvent},
    config::{AgentConfig, ConfigRx},
    error::{FetchError, NotificationError, TransportError},
    model::BossEndpoint,
    store::ConfigStore,
};

/// Where the client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Discovering,
    Connected,
    Polling,
    Error,
    Backoff,
    ShuttingDown,
}

/// Sends lifecycle notifications to the boss.
pub trait Notifier: Send + Sync {
    fn notify(&self, state: NodeState) -> BoxFuture<'_, Result<(), NotificationError>>;
}

/// Notifier bound to whatever boss the client currently talks to.
#[derive(Debug, Clone)]
pub struct BossHandle {
    endpoint: watch::Receiver<Option<BossEndpoint>>,
    config: ConfigRx,
}

impl BossHandle {
    /// The boss discovered last, if any.
    #[must_use]
    pub fn endpoint(&self) -> Option<BossEndpoint> {
        self.endpoint.borrow().clone()
    }
}

impl Notifier for BossHandle {
    fn notify(&self, state: NodeState) -> BoxFuture<'_, Result<(), NotificationError>> {
        async move {
            let limit = self.config.borrow().tmcc.request_timeout();
            let Some(boss) = self.endpoint() else {
                return Err(NotificationError {
                    state,
                    source: TransportError::NoEndpoint,
                });
            };
            let request = Request::new("state").arg(state.as_str());
            transport::exchange(boss.addr, &request, limit)
                .await
                .map_err(|source| NotificationError { state, source })?;
            info!(%state, boss = %boss.host, "Reported state to boss");
            Ok(())
        }
        .boxed()
    }
}

fn boss_target(config: &AgentConfig) -> (Option<String>, u16) {
    (config.tmcc.boss.clone(), config.tmcc.port)
}

/// The protocol client task.
pub struct TmccClient {
    config: ConfigRx,
    store: Arc<ConfigStore>,
    bus: Bus,
    sources: DiscoverySources,
    shutdown: watch::Receiver<bool>,
    endpoint_tx: watch::Sender<Option<BossEndpoint>>,
    state_tx: watch::Sender<ClientState>,
}

impl TmccClient {
    #[must_use]
    pub fn new(config: ConfigRx, store: Arc<ConfigStore>, bus: Bus, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            config,
            store,
            bus,
            sources: DiscoverySources::system(),
            shutdown,
            endpoint_tx: watch::Sender::new(None),
            state_tx: watch::Sender::new(ClientState::Uninitialized),
        }
    }

    /// Replace the places discovery looks at.
    #[must_use]
    pub fn with_sources(mut self, sources: DiscoverySources) -> Self {
        self.sources = sources;
        self
    }

    #[must_use]
    pub fn handle(&self) -> BossHandle {
        BossHandle {
            endpoint: self.endpoint_tx.subscribe(),
            config: self.config.clone(),
        }
    }

    #[must_use]
    pub fn state(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ClientState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "Client state change");
            *current = state;
            true
        });
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay`, waking early for shutdown or a changed boss.
    ///
    /// Returns `false` on shutdown.
    async fn wait(&mut self, delay: Duration, target: &(Option<String>, u16)) -> bool {
        let deadline = Instant::now() + delay;
        let mut config_open = true;
        loop {
            tokio::select! {
                () = sleep_until(deadline) => return true,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return false;
                    }
                }
                changed = self.config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                    } else if boss_target(&self.config.borrow()) != *target {
                        return true;
                    }
                }
            }
        }
    }

    /// Run until shutdown is signalled.
    #[tracing::instrument(name = "tmcc", skip_all)]
    pub async fn run(mut self) {
        let initial = self.config.borrow().clone();
        let mut backoff = Backoff::new(initial.tmcc.backoff_initial(), initial.tmcc.backoff_max());
        let mut target = boss_target(&initial);
        let mut endpoint: Option<BossEndpoint> = None;
        let mut booted = false;

        while !self.shutting_down() {
            let config = self.config.borrow_and_update().clone();
            if boss_target(&config) != target {
                info!("Boss address changed in config, rediscovering");
                target = boss_target(&config);
                endpoint = None;
                backoff = Backoff::new(config.tmcc.backoff_initial(), config.tmcc.backoff_max());
            }
            let limit = config.tmcc.request_timeout();

            let Some(boss) = endpoint.clone() else {
                self.set_state(ClientState::Discovering);
                match discovery::discover(config.tmcc.boss.as_deref(), config.tmcc.port, &self.sources, limit).await {
                    Ok(found) => {
                        self.set_state(ClientState::Connected);
                        backoff.reset();
                        self.endpoint_tx.send_replace(Some(found.clone()));
                        self.bus.publish(BusEvent::BossDiscovered(found.clone())).await;
                        endpoint = Some(found);
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(error = %e, retry_in = ?delay, "Boss discovery failed");
                        if !self.wait(delay, &target).await {
                            break;
                        }
                    }
                }
                continue;
            };

            if !booted {
                match self.handle().notify(NodeState::Booted).await {
                    Ok(()) => booted = true,
                    Err(e) => {
                        if !self.back_off(&mut backoff, &target, &e).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            self.set_state(ClientState::Polling);
            let next_delay = match fetch::fetch(&boss, limit).await {
                Ok(snapshot) => {
                    backoff.reset();
                    match self.store.replace(snapshot) {
                        Some((snapshot, diff)) => {
                            info!(
                                version = snapshot.version,
                                accounts = snapshot.accounts.len(),
                                mounts = snapshot.mounts.len(),
                                "New configuration from boss"
                            );
                            self.bus.publish(BusEvent::ConfigUpdated { snapshot, diff }).await;
                        }
                        None => debug!("Configuration unchanged"),
                    }
                    config.tmcc.poll_interval()
                }
                Err(FetchError::Protocol(e)) => {
                    warn!(error = %e, "Malformed response from boss, skipping this poll cycle");
                    config.tmcc.poll_interval()
                }
                Err(FetchError::Transport(e)) => {
                    if !self.back_off(&mut backoff, &target, &e).await {
                        break;
                    }
                    continue;
                }
            };
            if !self.wait(next_delay, &target).await {
                break;
            }
        }

        self.set_state(ClientState::ShuttingDown);
        info!("Protocol client stopped");
    }

    async fn back_off(
        &mut self,
        backoff: &mut Backoff,
        target: &(Option<String>, u16),
        error: &(dyn core::error::Error + Send + Sync + 'static),
    ) -> bool {
        self.set_state(ClientState::Error);
        let delay = backoff.next_delay();
        warn!(error = %crate::error::render_chain(error), retry_in = ?delay, "Request to boss failed");
        self.set_state(ClientState::Backoff);
        self.wait(delay, target).await
    }
}
