//! In-memory [`SystemActions`] that records every mutation.

use alloc::collections::{BTreeMap, BTreeSet};
use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use futures::{
    FutureExt as _,
    future::{BoxFuture, ready},
};

use super::{NewUser, SysResult, SystemActions, UserChanges, UserRecord};
use crate::{
    error::SystemError,
    model::{Gid, SshKey, Uid},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    CreateGroup { name: String, gid: Option<Gid> },
    CreateUser { login: String, uid: Uid, shell: PathBuf, groups: Vec<String> },
    ModifyUser { login: String, changes: UserChanges },
    LockUser(String),
    WriteKeys { login: String, keys: Vec<String> },
    DaemonReload,
    Start(String),
    Restart(String),
    Stop(String),
    SetHostname(String),
}

#[derive(Debug)]
struct State {
    users: BTreeMap<String, UserRecord>,
    groups: BTreeMap<String, Gid>,
    keys: BTreeMap<String, Vec<String>>,
    hostname: String,
    shells: Vec<PathBuf>,
    failing: BTreeSet<String>,
    missing: Vec<String>,
    actions: Vec<Action>,
    next_gid: Gid,
}

/// Fake system for reconciliation tests.
#[derive(Debug)]
pub(crate) struct RecordingSystem {
    state: Mutex<State>,
}

impl RecordingSystem {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                users: BTreeMap::new(),
                groups: BTreeMap::from([("root".to_owned(), 0), ("wheel".to_owned(), 10)]),
                keys: BTreeMap::new(),
                hostname: "localhost".to_owned(),
                shells: ["/bin/sh", "/bin/bash", "/usr/bin/zsh"]
                    .into_iter()
                    .map(PathBuf::from)
                    .collect(),
                failing: BTreeSet::new(),
                missing: Vec::new(),
                actions: Vec::new(),
                next_gid: 5000,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn with_user(self, login: &str, record: UserRecord) -> Self {
        self.state().users.insert(login.to_owned(), record);
        self
    }

    pub(crate) fn with_group(self, name: &str, gid: Gid) -> Self {
        self.state().groups.insert(name.to_owned(), gid);
        self
    }

    pub(crate) fn with_missing_command(self, command: &str) -> Self {
        self.state().missing.push(command.to_owned());
        self
    }

    /// Make every mutation for `target` (a login or a unit) fail.
    pub(crate) fn fail_for(&self, target: &str) {
        self.state().failing.insert(target.to_owned());
    }

    /// Undo [`Self::fail_for`].
    pub(crate) fn recover(&self, target: &str) {
        self.state().failing.remove(target);
    }

    pub(crate) fn actions(&self) -> Vec<Action> {
        self.state().actions.clone()
    }

    pub(crate) fn clear_actions(&self) {
        self.state().actions.clear();
    }

    pub(crate) fn user(&self, login: &str) -> Option<UserRecord> {
        self.state().users.get(login).cloned()
    }

    pub(crate) fn group(&self, name: &str) -> Option<Gid> {
        self.state().groups.get(name).copied()
    }

    pub(crate) fn authorized_keys(&self, login: &str) -> Option<Vec<String>> {
        self.state().keys.get(login).cloned()
    }

    pub(crate) fn current_hostname(&self) -> String {
        self.state().hostname.clone()
    }

    fn mutate(&self, login: &str, action: Action) -> SysResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        if state.failing.contains(login) {
            return Err(SystemError::CommandFailed {
                command: format!("{action:?}"),
                status: "exit status: 1".to_owned(),
            });
        }
        state.actions.push(action);
        Ok(state)
    }

    fn record(&self, action: Action) {
        self.state().actions.push(action);
    }
}

impl SystemActions for RecordingSystem {
    fn lookup_user<'this>(&'this self, login: &'this str) -> BoxFuture<'this, SysResult<Option<UserRecord>>> {
        ready(Ok(self.user(login))).boxed()
    }

    fn login_for_uid(&self, uid: Uid) -> BoxFuture<'_, SysResult<Option<String>>> {
        let login = self
            .state()
            .users
            .iter()
            .find(|&(_, record)| record.uid == uid)
            .map(|(login, _)| login.clone());
        ready(Ok(login)).boxed()
    }

    fn group_gid<'this>(&'this self, name: &'this str) -> BoxFuture<'this, SysResult<Option<Gid>>> {
        ready(Ok(self.group(name))).boxed()
    }

    fn create_group<'this>(&'this self, name: &'this str, gid: Option<Gid>) -> BoxFuture<'this, SysResult<()>> {
        let mut state = self.state();
        state.actions.push(Action::CreateGroup {
            name: name.to_owned(),
            gid,
        });
        let gid = gid.unwrap_or_else(|| {
            state.next_gid += 1;
            state.next_gid
        });
        state.groups.insert(name.to_owned(), gid);
        ready(Ok(())).boxed()
    }

    fn create_user<'this>(&'this self, user: &'this NewUser<'this>) -> BoxFuture<'this, SysResult<()>> {
        let action = Action::CreateUser {
            login: user.login.to_owned(),
            uid: user.uid,
            shell: user.shell.to_path_buf(),
            groups: user.groups.to_vec(),
        };
        let result = self.mutate(user.login, action).map(|mut state| {
            state.users.insert(
                user.login.to_owned(),
                UserRecord {
                    uid: user.uid,
                    gid: user.gid,
                    home: user.home.to_path_buf(),
                    shell: user.shell.to_path_buf(),
                    groups: user.groups.to_vec(),
                },
            );
        });
        ready(result).boxed()
    }

    fn modify_user<'this>(&'this self, login: &'this str, changes: &'this UserChanges) -> BoxFuture<'this, SysResult<()>> {
        let action = Action::ModifyUser {
            login: login.to_owned(),
            changes: changes.clone(),
        };
        let result = self.mutate(login, action).map(|mut state| {
            if let Some(record) = state.users.get_mut(login) {
                if let Some(ref shell) = changes.shell {
                    record.shell.clone_from(shell);
                }
                if let Some(ref groups) = changes.groups {
                    record.groups.clone_from(groups);
                }
            }
        });
        ready(result).boxed()
    }

    fn lock_user<'this>(&'this self, login: &'this str) -> BoxFuture<'this, SysResult<()>> {
        let result = self.mutate(login, Action::LockUser(login.to_owned())).map(drop);
        ready(result).boxed()
    }

    fn write_authorized_keys<'this>(
        &'this self,
        login: &'this str,
        _home: &'this Path,
        _owner: (Uid, Gid),
        keys: &'this [SshKey],
    ) -> BoxFuture<'this, SysResult<()>> {
        let keys: Vec<String> = keys.iter().map(|k| k.expose().to_owned()).collect();
        let action = Action::WriteKeys {
            login: login.to_owned(),
            keys: keys.clone(),
        };
        let result = self.mutate(login, action).map(|mut state| {
            state.keys.insert(login.to_owned(), keys);
        });
        ready(result).boxed()
    }

    fn login_shells(&self) -> BoxFuture<'_, SysResult<Vec<PathBuf>>> {
        ready(Ok(self.state().shells.clone())).boxed()
    }

    fn daemon_reload(&self) -> BoxFuture<'_, SysResult<()>> {
        self.record(Action::DaemonReload);
        ready(Ok(())).boxed()
    }

    fn start_unit<'this>(&'this self, unit: &'this str) -> BoxFuture<'this, SysResult<()>> {
        let result = self.mutate(unit, Action::Start(unit.to_owned())).map(drop);
        ready(result).boxed()
    }

    fn restart_unit<'this>(&'this self, unit: &'this str) -> BoxFuture<'this, SysResult<()>> {
        let result = self.mutate(unit, Action::Restart(unit.to_owned())).map(drop);
        ready(result).boxed()
    }

    fn stop_unit<'this>(&'this self, unit: &'this str) -> BoxFuture<'this, SysResult<()>> {
        let result = self.mutate(unit, Action::Stop(unit.to_owned())).map(drop);
        ready(result).boxed()
    }

    fn hostname(&self) -> BoxFuture<'_, SysResult<String>> {
        ready(Ok(self.current_hostname())).boxed()
    }

    fn set_hostname<'this>(&'this self, name: &'this str) -> BoxFuture<'this, SysResult<()>> {
        let mut state = self.state();
        state.actions.push(Action::SetHostname(name.to_owned()));
        name.clone_into(&mut state.hostname);
        ready(Ok(())).boxed()
    }

    fn missing_commands(&self, commands: &[&str]) -> Vec<String> {
        let state = self.state();
        commands
            .iter()
            .filter(|c| state.missing.iter().any(|m| m == *c))
            .map(|c| (*c).to_owned())
            .collect()
    }
}
