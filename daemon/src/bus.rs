//! In-process event bus connecting the protocol client, applets and reporters.
//!
//! Every subscriber owns a bounded queue. Publishing hands the event to every
//! queue with room right away and then waits for space in the full ones, so a
//! slow subscriber slows the publisher down instead of losing events or
//! delaying the other subscribers. Subscribers only see events published
//! after they subscribed.

use alloc::sync::Arc;
use core::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::{
    model::{BossEndpoint, NodeConfig},
    store::SnapshotDiff,
};

/// Queue length of each subscriber.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// The reconciliation units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AppletId {
    Account,
    Mount,
    Hostname,
}

impl AppletId {
    pub const ALL: [Self; 3] = [Self::Account, Self::Mount, Self::Hostname];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Account => "autouser",
            Self::Mount => "automount",
            Self::Hostname => "autohost",
        }
    }
}

impl fmt::Display for AppletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the agent is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM, usually the service manager stopping the node.
    Signal,
    /// SIGINT from an operator's terminal.
    Interactive,
}

/// Everything that travels over the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    BossDiscovered(BossEndpoint),
    ConfigUpdated {
        snapshot: Arc<NodeConfig>,
        diff: Arc<SnapshotDiff>,
    },
    AppletReady {
        applet: AppletId,
        version: u64,
    },
    AppletError {
        applet: AppletId,
        version: u64,
        error: String,
    },
    Shutdown(ShutdownReason),
}

impl BusEvent {
    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match *self {
            Self::BossDiscovered(_) => "boss-discovered",
            Self::ConfigUpdated { .. } => "config-updated",
            Self::AppletReady { .. } => "applet-ready",
            Self::AppletError { .. } => "applet-error",
            Self::Shutdown(_) => "shutdown",
        }
    }

    /// Events that drive reconciliation, as opposed to reconciliation outcomes.
    ///
    /// Applets subscribe with this filter so that they never receive their own
    /// (or each other's) outcomes.
    #[must_use]
    pub const fn is_command(&self) -> bool {
        match *self {
            Self::BossDiscovered(_) | Self::ConfigUpdated { .. } | Self::Shutdown(_) => true,
            Self::AppletReady { .. } | Self::AppletError { .. } => false,
        }
    }
}

type Filter = fn(&BusEvent) -> bool;

#[derive(Clone)]
struct Subscriber {
    name: Arc<str>,
    filter: Filter,
    tx: mpsc::Sender<BusEvent>,
}

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
}

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct Subscription {
    name: Arc<str>,
    rx: mpsc::Receiver<BusEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is closed and the queue drained.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Cloneable handle to the bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Bus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        // The list stays consistent even if a holder panicked.
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn subscribe(&self, name: &str) -> Subscription {
        self.subscribe_filtered(name, |_| true)
    }

    /// Receive the events published from now on for which `filter` holds.
    #[must_use]
    pub fn subscribe_filtered(&self, name: &str, filter: Filter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let name: Arc<str> = Arc::from(name);
        self.subscribers().push(Subscriber {
            name: Arc::clone(&name),
            filter,
            tx,
        });
        Subscription { name, rx }
    }

    /// Deliver `event` to every current subscriber.
    ///
    /// Waits while a subscriber's queue is full. Returns the number of
    /// subscribers the event was delivered to.
    pub async fn publish(&self, event: BusEvent) -> usize {
        let targets: Vec<Subscriber> = self
            .subscribers()
            .iter()
            .filter(|s| (s.filter)(&event))
            .cloned()
            .collect();

        let mut delivered = 0;
        let mut saw_closed = false;
        let mut waiting = Vec::new();
        for subscriber in targets {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(event)) => waiting.push((subscriber, event)),
                Err(TrySendError::Closed(_)) => saw_closed = true,
            }
        }
        for (subscriber, event) in waiting {
            debug!(
                subscriber = %subscriber.name,
                event = event.kind(),
                "Subscriber queue full, waiting"
            );
            if subscriber.tx.send(event).await.is_ok() {
                delivered += 1;
            } else {
                saw_closed = true;
            }
        }

        if saw_closed {
            self.subscribers().retain(|s| {
                let open = !s.tx.is_closed();
                if !open {
                    debug!(subscriber = %s.name, "Dropping closed subscriber");
                }
                open
            });
        }
        delivered
    }

    /// Drop every subscriber. Queued events are still delivered, after which
    /// [`Subscription::recv`] returns `None`.
    pub fn close(&self) {
        self.subscribers().clear();
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}
