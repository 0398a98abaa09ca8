//! OS primitives used by the applets.
//!
//! Reconciliation logic only talks to [`SystemActions`], so it can be
//! exercised against a recording fake instead of a live system.

mod host;
#[cfg(test)]
pub(crate) mod recording;

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;

pub use host::HostSystem;

use crate::{
    error::SystemError,
    model::{Gid, SshKey, Uid},
};

/// What the system knows about an existing user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub uid: Uid,
    pub gid: Gid,
    pub home: PathBuf,
    pub shell: PathBuf,
    /// Supplementary group names, primary group excluded.
    pub groups: Vec<String>,
}

/// Parameters for creating a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser<'spec> {
    pub login: &'spec str,
    pub uid: Uid,
    pub gid: Gid,
    pub home: &'spec Path,
    pub shell: &'spec Path,
    pub groups: &'spec [String],
}

/// Changes to an existing user. `None` leaves the attribute alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserChanges {
    pub shell: Option<PathBuf>,
    pub groups: Option<Vec<String>>,
    /// Undo an earlier [`SystemActions::lock_user`].
    pub unlock: bool,
}

impl UserChanges {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.shell.is_none() && self.groups.is_none() && !self.unlock
    }
}

type SysResult<T> = Result<T, SystemError>;

/// The external collaborator providing user, group, service and hostname
/// primitives.
pub trait SystemActions: Send + Sync {
    fn lookup_user<'this>(&'this self, login: &'this str) -> BoxFuture<'this, SysResult<Option<UserRecord>>>;

    /// Login currently owning `uid`.
    fn login_for_uid(&self, uid: Uid) -> BoxFuture<'_, SysResult<Option<String>>>;

    fn group_gid<'this>(&'this self, name: &'this str) -> BoxFuture<'this, SysResult<Option<Gid>>>;

    fn create_group<'this>(&'this self, name: &'this str, gid: Option<Gid>) -> BoxFuture<'this, SysResult<()>>;

    fn create_user<'this>(&'this self, user: &'this NewUser<'this>) -> BoxFuture<'this, SysResult<()>>;

    fn modify_user<'this>(&'this self, login: &'this str, changes: &'this UserChanges) -> BoxFuture<'this, SysResult<()>>;

    /// Lock the password and expire the account.
    fn lock_user<'this>(&'this self, login: &'this str) -> BoxFuture<'this, SysResult<()>>;

    /// Replace `~/.ssh/authorized_keys` of `login` with exactly `keys`.
    fn write_authorized_keys<'this>(
        &'this self,
        login: &'this str,
        home: &'this Path,
        owner: (Uid, Gid),
        keys: &'this [SshKey],
    ) -> BoxFuture<'this, SysResult<()>>;

    /// Entries of `/etc/shells`.
    fn login_shells(&self) -> BoxFuture<'_, SysResult<Vec<PathBuf>>>;

    fn daemon_reload(&self) -> BoxFuture<'_, SysResult<()>>;

    fn start_unit<'this>(&'this self, unit: &'this str) -> BoxFuture<'this, SysResult<()>>;

    fn restart_unit<'this>(&'this self, unit: &'this str) -> BoxFuture<'this, SysResult<()>>;

    fn stop_unit<'this>(&'this self, unit: &'this str) -> BoxFuture<'this, SysResult<()>>;

    fn hostname(&self) -> BoxFuture<'_, SysResult<String>>;

    fn set_hostname<'this>(&'this self, name: &'this str) -> BoxFuture<'this, SysResult<()>>;

    /// Names of `commands` that are not available.
    fn missing_commands(&self, commands: &[&str]) -> Vec<String>;
}

/// External commands each applet shells out to.
#[must_use]
pub const fn required_commands(applet: crate::bus::AppletId) -> &'static [&'static str] {
    use crate::bus::AppletId;
    match applet {
        AppletId::Account => &["useradd", "usermod", "groupadd"],
        AppletId::Mount => &["systemctl"],
        AppletId::Hostname => &[],
    }
}
