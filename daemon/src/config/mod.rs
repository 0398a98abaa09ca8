//! Local agent configuration: types, loading and runtime reload.

mod loader;
mod reload;
mod types;

use alloc::sync::Arc;

use tokio::sync::watch;

pub use loader::load;
pub use reload::{boss_changed, reload};
pub use types::*;

/// Sender half of the shared configuration.
pub type ConfigTx = watch::Sender<Arc<AgentConfig>>;
/// Receiver half of the shared configuration.
pub type ConfigRx = watch::Receiver<Arc<AgentConfig>>;
