//! Local accounts, groups and `authorized_keys`.

use alloc::{collections::BTreeSet, sync::Arc};
use std::path::{Path, PathBuf};

use futures::{FutureExt as _, future::BoxFuture};
use tracing::{Instrument as _, debug, info, info_span, warn};

use super::{Applet, Cycle};
use crate::{
    bus::AppletId,
    config::AgentConfig,
    error::{ReconciliationError, SystemError},
    model::{AccountSpec, Gid, NodeConfig, SshKey},
    store::SnapshotDiff,
    system::{NewUser, SystemActions, UserChanges},
};

const FALLBACK_SHELL: &str = "/bin/sh";

/// Tried in order when `autouser.admin-group` is unset.
const ADMIN_GROUP_CANDIDATES: [&str; 3] = ["wheel", "sudo", "root"];

fn failed(action: &'static str, target: &str) -> impl FnOnce(SystemError) -> ReconciliationError {
    let target = target.to_owned();
    move |source| ReconciliationError::Action {
        action,
        target,
        source,
    }
}

/// Pick the `/etc/shells` entry for `requested`, matching by basename.
fn resolve_shell(requested: &str, shells: &[PathBuf]) -> PathBuf {
    let wanted = Path::new(requested);
    if shells.iter().any(|shell| shell == wanted) {
        return wanted.to_path_buf();
    }
    if let Some(name) = wanted.file_name()
        && let Some(shell) = shells.iter().find(|shell| shell.file_name() == Some(name))
    {
        return shell.clone();
    }
    warn!(shell = requested, fallback = FALLBACK_SHELL, "Shell not listed in /etc/shells");
    PathBuf::from(FALLBACK_SHELL)
}

pub struct AccountApplet {
    system: Arc<dyn SystemActions>,
    /// Snapshot of the last finished cycle.
    applied: Option<Arc<NodeConfig>>,
    /// Logins whose last reconciliation failed.
    retry: BTreeSet<String>,
    /// Logins locked because they left the snapshot.
    disabled: BTreeSet<String>,
    root_keys_pending: bool,
}

impl AccountApplet {
    #[must_use]
    pub fn new(system: Arc<dyn SystemActions>) -> Self {
        Self {
            system,
            applied: None,
            retry: BTreeSet::new(),
            disabled: BTreeSet::new(),
            root_keys_pending: true,
        }
    }

    async fn admin_group(&self, config: &AgentConfig) -> Result<Option<String>, ReconciliationError> {
        if let Some(ref group) = config.autouser.admin_group {
            return Ok(Some(group.to_lowercase()));
        }
        for candidate in ADMIN_GROUP_CANDIDATES {
            let gid = self
                .system
                .group_gid(candidate)
                .await
                .map_err(failed("look up group", candidate))?;
            if gid.is_some() {
                return Ok(Some(candidate.to_owned()));
            }
        }
        warn!("No admin group found, ROOT accounts get no extra privileges");
        Ok(None)
    }

    /// Make sure `name` exists, with `gid` if one is requested.
    async fn ensure_group(&self, name: &str, gid: Option<Gid>) -> Result<(), ReconciliationError> {
        let current = self
            .system
            .group_gid(name)
            .await
            .map_err(failed("look up group", name))?;
        match (current, gid) {
            (Some(current), Some(requested)) if current != requested => Err(ReconciliationError::GidChange {
                name: name.to_owned(),
                current,
                requested,
            }),
            (Some(_), _) => Ok(()),
            (None, _) => {
                info!(group = name, ?gid, "Creating group");
                self.system
                    .create_group(name, gid)
                    .await
                    .map_err(failed("create group", name))
            }
        }
    }

    async fn apply(
        &self,
        spec: &AccountSpec,
        snapshot: &NodeConfig,
        admin: Option<&str>,
        shells: &[PathBuf],
    ) -> Result<(), ReconciliationError> {
        let login = spec.username.as_str();
        let primary = spec
            .primary_group
            .clone()
            .unwrap_or_else(|| login.to_lowercase());
        self.ensure_group(&primary, Some(spec.gid)).await?;

        let mut wanted = BTreeSet::new();
        for group in spec.groups().filter(|&group| group != primary) {
            self.ensure_group(group, snapshot.groups.get(group).map(|g| g.gid))
                .await?;
            wanted.insert(group.to_owned());
        }
        if spec.admin
            && let Some(admin) = admin
        {
            wanted.insert(admin.to_owned());
        }
        let shell = resolve_shell(&spec.shell, shells);

        let home = match self
            .system
            .lookup_user(login)
            .await
            .map_err(failed("look up user", login))?
        {
            Some(record) => {
                if record.uid != spec.uid {
                    return Err(ReconciliationError::UidChange {
                        login: login.to_owned(),
                        current: record.uid,
                        requested: spec.uid,
                    });
                }
                // Groups the boss does not know about stay untouched.
                let mut groups: BTreeSet<String> = record
                    .groups
                    .iter()
                    .filter(|&group| !snapshot.groups.contains_key(group) && Some(group.as_str()) != admin)
                    .cloned()
                    .collect();
                groups.extend(wanted);
                let current: BTreeSet<String> = record.groups.iter().cloned().collect();

                let changes = UserChanges {
                    shell: (record.shell != shell).then_some(shell),
                    groups: (groups != current).then(|| groups.into_iter().collect()),
                    unlock: self.disabled.contains(login),
                };
                if changes.is_empty() {
                    debug!("User up to date");
                } else {
                    info!(?changes, "Updating user");
                    self.system
                        .modify_user(login, &changes)
                        .await
                        .map_err(failed("modify user", login))?;
                }
                record.home
            }
            None => {
                if let Some(existing) = self
                    .system
                    .login_for_uid(spec.uid)
                    .await
                    .map_err(failed("look up uid", login))?
                {
                    return Err(ReconciliationError::DuplicateUid {
                        login: login.to_owned(),
                        uid: spec.uid,
                        existing,
                    });
                }
                let groups: Vec<String> = wanted.into_iter().collect();
                let user = NewUser {
                    login,
                    uid: spec.uid,
                    gid: spec.gid,
                    home: &spec.home,
                    shell: &shell,
                    groups: &groups,
                };
                info!(uid = spec.uid, shell = %shell.display(), "Creating user");
                self.system
                    .create_user(&user)
                    .await
                    .map_err(failed("create user", login))?;
                spec.home.clone()
            }
        };

        debug!(keys = spec.ssh_keys.len(), "Writing authorized_keys");
        self.system
            .write_authorized_keys(login, &home, (spec.uid, spec.gid), &spec.ssh_keys)
            .await
            .map_err(failed("write authorized_keys", login))
    }

    /// Lock an account that left the snapshot. Its files stay.
    async fn disable(&self, login: &str) -> Result<bool, ReconciliationError> {
        if self.disabled.contains(login) {
            return Ok(false);
        }
        let exists = self
            .system
            .lookup_user(login)
            .await
            .map_err(failed("look up user", login))?
            .is_some();
        if exists {
            info!("Locking account removed by the boss");
            self.system
                .lock_user(login)
                .await
                .map_err(failed("lock user", login))?;
        }
        Ok(exists)
    }

    async fn write_root_keys(&self, keys: &[SshKey]) -> Result<(), ReconciliationError> {
        let home = self
            .system
            .lookup_user("root")
            .await
            .map_err(failed("look up user", "root"))?
            .map_or_else(|| PathBuf::from("/root"), |record| record.home);
        info!(keys = keys.len(), "Writing root authorized_keys");
        self.system
            .write_authorized_keys("root", &home, (0, 0), keys)
            .await
            .map_err(failed("write authorized_keys", "root"))
    }

    /// Changes since the last applied snapshot, `None` before the first cycle.
    ///
    /// Snapshots published while the applet was disabled never reach it, so
    /// the bus diff only applies when it starts where the last cycle ended.
    fn diff_since_applied(&self, cycle: &Cycle) -> Option<Arc<SnapshotDiff>> {
        let applied = self.applied.as_ref()?;
        if applied.version == cycle.diff.from_version {
            return Some(Arc::clone(&cycle.diff));
        }
        debug!(
            applied = applied.version,
            version = cycle.snapshot.version,
            "Catching up on snapshots skipped while disabled"
        );
        Some(Arc::new(SnapshotDiff::between(applied, &cycle.snapshot)))
    }

    async fn run_cycle(&mut self, cycle: &Cycle) -> Result<(), ReconciliationError> {
        let snapshot = &cycle.snapshot;
        let shells = self
            .system
            .login_shells()
            .await
            .map_err(failed("read", "/etc/shells"))?;
        let admin = self.admin_group(&cycle.config).await?;

        let mut total = 0;
        let mut failures = Vec::new();

        let diff = self.diff_since_applied(cycle);
        let groups: Vec<_> = match diff {
            Some(ref diff) => diff.groups.upserts().map(|(_, group)| group).collect(),
            None => snapshot.groups.values().collect(),
        };
        for group in groups {
            total += 1;
            if let Err(e) = self.ensure_group(&group.name, Some(group.gid)).await {
                failures.push(e);
            }
        }

        let mut work: BTreeSet<String> = core::mem::take(&mut self.retry);
        match diff {
            Some(ref diff) => {
                work.extend(diff.accounts.upserts().map(|(login, _)| login.clone()));
                work.extend(diff.accounts.removed.keys().cloned());
            }
            None => work.extend(snapshot.accounts.keys().cloned()),
        }

        for login in work {
            total += 1;
            let span = info_span!("account", login = %login);
            let outcome = match snapshot.accounts.get(&login) {
                Some(spec) => {
                    let applied = self
                        .apply(spec, snapshot, admin.as_deref(), &shells)
                        .instrument(span)
                        .await;
                    if applied.is_ok() {
                        self.disabled.remove(&login);
                    }
                    applied
                }
                None => match self.disable(&login).instrument(span).await {
                    Ok(locked) => {
                        if locked {
                            self.disabled.insert(login.clone());
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
            };
            if let Err(e) = outcome {
                warn!(login = %login, error = %e, "Account reconciliation failed");
                self.retry.insert(login);
                failures.push(e);
            }
        }

        if self.root_keys_pending || diff.as_ref().is_some_and(|diff| diff.root_keys_changed) {
            // An empty set would lock out whoever manages root by hand.
            if snapshot.root_keys.is_empty() {
                self.root_keys_pending = false;
            } else {
                total += 1;
                match self.write_root_keys(&snapshot.root_keys).await {
                    Ok(()) => self.root_keys_pending = false,
                    Err(e) => {
                        self.root_keys_pending = true;
                        failures.push(e);
                    }
                }
            }
        }

        self.applied = Some(Arc::clone(&cycle.snapshot));
        ReconciliationError::collect(total, failures)
    }
}

impl Applet for AccountApplet {
    fn id(&self) -> AppletId {
        AppletId::Account
    }

    fn enabled(&self, config: &AgentConfig) -> bool {
        config.autouser.enable
    }

    fn reconcile<'cycle>(&'cycle mut self, cycle: &'cycle Cycle) -> BoxFuture<'cycle, Result<(), ReconciliationError>> {
        self.run_cycle(cycle).boxed()
    }
}
