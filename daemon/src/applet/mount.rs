//! NFS mounts as generated systemd `.mount` units.
//!
//! A unit is written only when its rendered content differs from the file on
//! disk, and the init system is only touched when something was written or
//! removed. Re-applying an unchanged snapshot therefore does nothing.
//!
//! Every cycle compares the unit directory against the snapshot itself, so a
//! unit whose mount disappeared or moved is found whatever the diff says.
//! Units that could not be started are kept and activated again next cycle.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use std::{
    io,
    path::{Path, PathBuf},
};

use futures::{FutureExt as _, future::BoxFuture};
use nodeagent_common::systemd::{MountUnit, is_generated, mount_unit_name};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{Applet, Cycle};
use crate::{
    bus::AppletId,
    config::AgentConfig,
    error::{ReconciliationError, SystemError},
    model::MountSpec,
    system::SystemActions,
};

/// Units touched by one cycle.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MountReport {
    /// Newly written units, to be started.
    pub created: Vec<String>,
    /// Rewritten units, to be restarted.
    pub updated: Vec<String>,
    /// Stopped and deleted units.
    pub removed: Vec<String>,
}

impl MountReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

enum Written {
    Unchanged,
    Created,
    Updated,
}

/// What a written unit still needs from systemd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Start,
    Restart,
}

fn file_error(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> ReconciliationError {
    let path = path.to_path_buf();
    move |source| ReconciliationError::File { action, path, source }
}

fn unit_error(action: &'static str, unit: &str) -> impl FnOnce(SystemError) -> ReconciliationError {
    let target = unit.to_owned();
    move |source| ReconciliationError::Action {
        action,
        target,
        source,
    }
}

async fn read_unit(path: &Path) -> Result<Option<String>, ReconciliationError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(file_error("read", path)(e)),
    }
}

pub struct MountApplet {
    system: Arc<dyn SystemActions>,
    /// Fixed for the lifetime of the process; moving it would orphan units.
    unit_dir: PathBuf,
    /// Written units whose activation has not succeeded yet.
    pending: BTreeMap<String, Activation>,
    /// A failed `daemon-reload` has to be repeated before any activation.
    reload_pending: bool,
}

impl MountApplet {
    #[must_use]
    pub fn new(system: Arc<dyn SystemActions>, unit_dir: PathBuf) -> Self {
        Self {
            system,
            unit_dir,
            pending: BTreeMap::new(),
            reload_pending: false,
        }
    }

    async fn write_unit(&self, name: &str, content: &str) -> Result<Written, ReconciliationError> {
        let path = self.unit_dir.join(name);
        let written = match read_unit(&path).await? {
            Some(existing) if existing == content => return Ok(Written::Unchanged),
            Some(existing) if !is_generated(&existing) => return Err(ReconciliationError::Unmanaged { path }),
            Some(_) => Written::Updated,
            None => Written::Created,
        };
        fs::create_dir_all(&self.unit_dir)
            .await
            .map_err(file_error("create", &self.unit_dir))?;
        fs::write(&path, content)
            .await
            .map_err(file_error("write", &path))?;
        Ok(written)
    }

    /// Stop and delete a unit we generated. Returns whether anything was removed.
    async fn remove_unit(&self, name: &str) -> Result<bool, ReconciliationError> {
        let path = self.unit_dir.join(name);
        match read_unit(&path).await? {
            None => Ok(false),
            Some(existing) if !is_generated(&existing) => {
                warn!(unit = name, "Not removing hand-written unit");
                Ok(false)
            }
            Some(_) => {
                info!(unit = name, "Removing mount unit");
                self.system
                    .stop_unit(name)
                    .await
                    .map_err(unit_error("stop", name))?;
                fs::remove_file(&path)
                    .await
                    .map_err(file_error("remove", &path))?;
                Ok(true)
            }
        }
    }

    /// Generated units in the unit directory that are not in `wanted`.
    async fn stale_units(&self, wanted: &BTreeSet<String>) -> Result<Vec<String>, ReconciliationError> {
        let mut entries = match fs::read_dir(&self.unit_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(file_error("list", &self.unit_dir)(e)),
        };
        let mut stale = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(file_error("list", &self.unit_dir))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.ends_with(".mount") || wanted.contains(&name) {
                continue;
            }
            if read_unit(&entry.path()).await?.is_some_and(|content| is_generated(&content)) {
                stale.push(name);
            }
        }
        stale.sort();
        Ok(stale)
    }

    /// Bring the unit directory and the init system in line with `cycle`.
    ///
    /// Returns what was changed and the failures of single units.
    pub async fn apply(&mut self, cycle: &Cycle) -> (MountReport, usize, Vec<ReconciliationError>) {
        let mut report = MountReport::default();
        let mut failures = Vec::new();
        let mut total = 0;

        let units: Vec<(&MountSpec, String)> = cycle
            .snapshot
            .mounts
            .values()
            .map(|mount| {
                let options = mount
                    .options
                    .as_deref()
                    .unwrap_or(&cycle.config.automount.options);
                let unit = MountUnit {
                    what: &mount.remote,
                    r#where: &mount.mountpoint,
                    options,
                };
                (mount, unit.render())
            })
            .collect();
        let wanted: BTreeSet<String> = units
            .iter()
            .map(|&(mount, _)| mount_unit_name(&mount.mountpoint))
            .collect();
        self.pending.retain(|name, _| wanted.contains(name));

        for (mount, content) in &units {
            total += 1;
            let name = mount_unit_name(&mount.mountpoint);
            match self.write_unit(&name, content).await {
                Ok(Written::Unchanged) => debug!(unit = %name, "Mount unit up to date"),
                Ok(Written::Created) => {
                    info!(unit = %name, remote = %mount.remote, "Wrote mount unit");
                    self.pending.entry(name.clone()).or_insert(Activation::Start);
                    report.created.push(name);
                }
                Ok(Written::Updated) => {
                    info!(unit = %name, remote = %mount.remote, "Rewrote mount unit");
                    self.pending.insert(name.clone(), Activation::Restart);
                    report.updated.push(name);
                }
                Err(e) => {
                    warn!(unit = %name, error = %e, "Mount unit not written");
                    failures.push(e);
                }
            }
        }

        match self.stale_units(&wanted).await {
            Ok(stale) => {
                for name in stale {
                    total += 1;
                    match self.remove_unit(&name).await {
                        Ok(true) => report.removed.push(name),
                        Ok(false) => {}
                        Err(e) => failures.push(e),
                    }
                }
            }
            Err(e) => failures.push(e),
        }

        if !report.is_empty() || self.reload_pending {
            total += 1;
            if let Err(e) = self.system.daemon_reload().await {
                // Without a reload systemd would start the stale definitions.
                self.reload_pending = true;
                failures.push(unit_error("daemon-reload", "systemd")(e));
                return (report, total, failures);
            }
            self.reload_pending = false;
        }

        let pending: Vec<(String, Activation)> = self
            .pending
            .iter()
            .map(|(name, &activation)| (name.clone(), activation))
            .collect();
        for (name, activation) in pending {
            total += 1;
            let result = match activation {
                Activation::Start => self.system.start_unit(&name).await.map_err(unit_error("start", &name)),
                Activation::Restart => self
                    .system
                    .restart_unit(&name)
                    .await
                    .map_err(unit_error("restart", &name)),
            };
            match result {
                Ok(()) => {
                    self.pending.remove(&name);
                }
                Err(e) => {
                    warn!(unit = %name, error = %e, "Mount unit not activated, retrying next cycle");
                    failures.push(e);
                }
            }
        }
        (report, total, failures)
    }
}

impl Applet for MountApplet {
    fn id(&self) -> AppletId {
        AppletId::Mount
    }

    fn enabled(&self, config: &AgentConfig) -> bool {
        config.automount.enable
    }

    fn reconcile<'cycle>(&'cycle mut self, cycle: &'cycle Cycle) -> BoxFuture<'cycle, Result<(), ReconciliationError>> {
        async move {
            let (report, total, failures) = self.apply(cycle).await;
            debug!(?report, "Mount cycle finished");
            ReconciliationError::collect(total, failures)
        }
        .boxed()
    }
}
