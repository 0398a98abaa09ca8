//! Re-reading the local configuration file at runtime (SIGHUP).

use alloc::sync::Arc;
use std::path::Path;

use eyre::{Result, WrapErr as _};
use tracing::{info, warn};

use super::{AgentConfig, ConfigTx, load};

/// Load the file at `path` again and publish the result on `tx`.
///
/// A change of `systemd.unit-dir` is not applied, since units generated into
/// the previous directory would be orphaned. Everything else takes effect on
/// the next use by the respective component.
///
/// # Errors
///
/// Returns an error if the file cannot be loaded. The active configuration is
/// left untouched in that case.
pub async fn reload(path: &Path, tx: &ConfigTx) -> Result<()> {
    info!(path = %path.display(), "Reloading config file");
    let prev = tx.borrow().clone();
    let mut next = load(path)
        .await
        .wrap_err(format!("Failed to reload config at: {}", path.display()))?;

    if next.systemd.unit_dir != prev.systemd.unit_dir {
        warn!(
            active = %prev.systemd.unit_dir.display(),
            requested = %next.systemd.unit_dir.display(),
            "Changing systemd.unit-dir at runtime is unsupported and will be ignored. Restart the agent to apply it."
        );
        next.systemd.unit_dir.clone_from(&prev.systemd.unit_dir);
    }

    if next == *prev {
        info!("No applicable changes detected in config.");
        return Ok(());
    }

    if boss_changed(&prev, &next) {
        info!("Boss address changed, the client will rediscover it.");
    }
    tx.send_replace(Arc::new(next));
    info!("Applied config changes.");
    Ok(())
}

/// Whether `next` points at a different boss than `prev`.
#[must_use]
pub fn boss_changed(prev: &AgentConfig, next: &AgentConfig) -> bool {
    prev.tmcc.boss != next.tmcc.boss || prev.tmcc.port != next.tmcc.port
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tokio::sync::watch;

    use super::*;

    #[tokio::test]
    async fn applies_changes_but_keeps_unit_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(&path, "[systemd]\nunit-dir = \"/a\"\n").unwrap();
        let (tx, rx) = watch::channel(Arc::new(load(&path).await.unwrap()));

        fs::write(
            &path,
            "[systemd]\nunit-dir = \"/b\"\n[tmcc]\nboss = \"boss.example.net\"\n",
        )
        .unwrap();
        reload(&path, &tx).await.unwrap();

        let active = rx.borrow().clone();
        assert_eq!(active.systemd.unit_dir, Path::new("/a"));
        assert_eq!(active.tmcc.boss.as_deref(), Some("boss.example.net"));
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(&path, "[tmcc]\nport = 7000\n").unwrap();
        let (tx, rx) = watch::channel(Arc::new(load(&path).await.unwrap()));

        fs::write(&path, "[tmcc\nport = ").unwrap();
        assert!(reload(&path, &tx).await.is_err(), "malformed file must fail");
        assert_eq!(rx.borrow().tmcc.port, 7000);
    }

    #[test]
    fn boss_change_detection() {
        let prev = AgentConfig::default();
        let mut next = prev.clone();
        assert!(!boss_changed(&prev, &next), "identical configs");
        next.tmcc.port = 7778;
        assert!(boss_changed(&prev, &next), "port differs");
    }
}
