//! Node agent for bare-metal testbeds.
//!
//! Exposes `inner_main` so the workspace-level binary can call into the agent.
//! The agent discovers the boss node, pulls the node configuration and
//! reconciles local accounts, NFS mounts and the hostname against it, while
//! reporting boot, ready and shutdown back to the boss.
#![cfg_attr(
    test,
    expect(
        clippy::indexing_slicing,
        clippy::unwrap_used,
        reason = "This is not problematic in tests",
    )
)]

extern crate alloc;
extern crate core;

pub mod applet;
pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod store;
pub mod supervisor;
pub mod system;
pub mod tmcc;

use alloc::sync::Arc;
use std::{env, fs, sync::Once};

use eyre::{Result, WrapErr as _};
use tracing::{Instrument as _, info, warn};
use tracing_subscriber::{EnvFilter, fmt::time::ChronoLocal};

use crate::{
    cli::{Cli, LogFormat},
    config::AgentConfig,
    system::HostSystem,
};

static INIT_TRACING: Once = Once::new();

fn init_tracing(format: LogFormat) {
    INIT_TRACING.call_once(move || {
        let default_level = if env::var("NODEAGENT_INTEGRATION_TEST").is_ok() {
            "debug"
        } else {
            "info"
        };

        let builder = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
            .with_timer(ChronoLocal::rfc_3339());

        match format {
            LogFormat::Compact => builder.compact().init(),
            LogFormat::Json => builder.json().init(),
            LogFormat::Pretty => builder.pretty().init(),
        }
    });
}

/// The agent's main function; can be called from a shim binary.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or a resource the
/// enabled applets need is unavailable.
pub async fn inner_main(invocation: Cli) -> Result<()> {
    let Cli {
        config: config_file,
        log_format,
    } = invocation;
    init_tracing(log_format);

    let (config, config_path) = match config_file {
        Some(file) => {
            let path = fs::canonicalize(&file)
                .wrap_err(format!("Config file not found at: {}", file.display()))?;
            let loaded = config::load(&path).await?;
            (loaded, Some(path))
        }
        None => {
            warn!("No config file given, using built-in defaults");
            (AgentConfig::default(), None)
        }
    };

    let startup_span = tracing::info_span!(
        "nodeagent",
        ?config_path,
        pid = ?std::process::id(),
        version = env!("CARGO_PKG_VERSION")
    );
    async move {
        info!("Starting node agent");
        supervisor::run(config, config_path, Arc::new(HostSystem)).await
    }
    .instrument(startup_span)
    .await
}
