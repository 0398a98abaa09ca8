//! [`SystemActions`] backed by the running host: shadow-utils, systemctl and
//! libc calls through `nix`.

use std::{
    ffi::CString,
    fs::File,
    io::Write as _,
    path::{Path, PathBuf},
};

use futures::{FutureExt as _, future::BoxFuture};
use nix::{
    errno::Errno,
    fcntl::{AT_FDCWD, OFlag, openat, renameat},
    sys::stat::{Mode, fchmod, mkdirat},
    unistd::{self, Group, UnlinkatFlags, User},
};
use tokio::{fs, process::Command};
use tracing::debug;

use super::{NewUser, SysResult, SystemActions, UserChanges, UserRecord};
use crate::{
    error::SystemError,
    model::{Gid, SshKey, Uid},
};

/// Applies actions to the live system.
#[derive(Debug, Clone, Default)]
pub struct HostSystem;

async fn run(program: &str, args: &[&str]) -> SysResult<()> {
    let command = format!("{program} {}", args.join(" "));
    debug!(%command, "Running command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| SystemError::Spawn {
            command: command.clone(),
            source,
        })?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(SystemError::CommandFailed {
        command,
        status: format!("{} ({})", output.status, stderr.trim()),
    })
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SystemError + '_ {
    move |source| SystemError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn supplementary_groups(user: &User) -> SysResult<Vec<String>> {
    let name = CString::new(user.name.as_str()).map_err(|_| SystemError::InvalidName {
        what: format!("login {:?}", user.name),
    })?;
    let mut names = Vec::new();
    for gid in unistd::getgrouplist(&name, user.gid)? {
        if gid == user.gid {
            continue;
        }
        if let Some(group) = Group::from_gid(gid)? {
            names.push(group.name);
        }
    }
    Ok(names)
}

const SSH_DIR: &str = ".ssh";
const AUTHORIZED_KEYS: &str = "authorized_keys";
const STAGING: &str = "authorized_keys.nodeagent";

/// Replace `home/.ssh/authorized_keys` with `content`, owned by `owner`.
///
/// The user owns `.ssh`, so everything below `home` is opened relative to a
/// directory descriptor and never through a symlink.
fn replace_keys(home: &Path, owner: (Uid, Gid), content: &[u8]) -> SysResult<()> {
    let uid = Some(unistd::Uid::from_raw(owner.0));
    let gid = Some(unistd::Gid::from_raw(owner.1));
    let dir_flags = OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC;

    let home_dir = openat(AT_FDCWD, home, dir_flags, Mode::empty()).map_err(|errno| SystemError::Io {
        path: home.to_path_buf(),
        source: errno.into(),
    })?;
    match mkdirat(&home_dir, SSH_DIR, Mode::S_IRWXU) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(errno) => return Err(errno.into()),
    }
    let ssh_dir = openat(&home_dir, SSH_DIR, dir_flags | OFlag::O_NOFOLLOW, Mode::empty()).map_err(
        |errno| match errno {
            Errno::ELOOP | Errno::ENOTDIR => SystemError::NotADirectory {
                path: home.join(SSH_DIR),
            },
            other => other.into(),
        },
    )?;
    fchmod(&ssh_dir, Mode::S_IRWXU)?;
    unistd::fchown(&ssh_dir, uid, gid)?;

    match unistd::unlinkat(&ssh_dir, STAGING, UnlinkatFlags::NoRemoveDir) {
        Ok(()) | Err(Errno::ENOENT) => {}
        Err(errno) => return Err(errno.into()),
    }
    let staging = openat(
        &ssh_dir,
        STAGING,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )?;
    unistd::fchown(&staging, uid, gid)?;
    let staging_path = home.join(SSH_DIR).join(STAGING);
    let mut file = File::from(staging);
    file.write_all(content).map_err(io_error(&staging_path))?;
    file.sync_all().map_err(io_error(&staging_path))?;
    renameat(&ssh_dir, STAGING, &ssh_dir, AUTHORIZED_KEYS)?;
    Ok(())
}

impl SystemActions for HostSystem {
    fn lookup_user<'this>(&'this self, login: &'this str) -> BoxFuture<'this, SysResult<Option<UserRecord>>> {
        async move {
            let Some(user) = User::from_name(login)? else {
                return Ok(None);
            };
            Ok(Some(UserRecord {
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
                groups: supplementary_groups(&user)?,
                home: user.dir,
                shell: user.shell,
            }))
        }
        .boxed()
    }

    fn login_for_uid(&self, uid: Uid) -> BoxFuture<'_, SysResult<Option<String>>> {
        async move { Ok(User::from_uid(unistd::Uid::from_raw(uid))?.map(|u| u.name)) }.boxed()
    }

    fn group_gid<'this>(&'this self, name: &'this str) -> BoxFuture<'this, SysResult<Option<Gid>>> {
        async move { Ok(Group::from_name(name)?.map(|g| g.gid.as_raw())) }.boxed()
    }

    fn create_group<'this>(&'this self, name: &'this str, gid: Option<Gid>) -> BoxFuture<'this, SysResult<()>> {
        async move {
            let gid = gid.map(|gid| gid.to_string());
            let mut args: Vec<&str> = Vec::new();
            if let Some(ref gid) = gid {
                args.extend(["-g", gid.as_str()]);
            }
            args.push(name);
            run("groupadd", &args).await
        }
        .boxed()
    }

    fn create_user<'this>(&'this self, user: &'this NewUser<'this>) -> BoxFuture<'this, SysResult<()>> {
        async move {
            let uid = user.uid.to_string();
            let gid = user.gid.to_string();
            let home = user.home.to_string_lossy().into_owned();
            let shell = user.shell.to_string_lossy().into_owned();
            let groups = user.groups.join(",");
            let mut args: Vec<&str> = vec![
                "-m",
                "-u",
                uid.as_str(),
                "-g",
                gid.as_str(),
                "-d",
                home.as_str(),
                "-s",
                shell.as_str(),
            ];
            if !groups.is_empty() {
                args.extend(["-G", groups.as_str()]);
            }
            args.push(user.login);
            run("useradd", &args).await
        }
        .boxed()
    }

    fn modify_user<'this>(&'this self, login: &'this str, changes: &'this UserChanges) -> BoxFuture<'this, SysResult<()>> {
        async move {
            let shell = changes
                .shell
                .as_ref()
                .map(|s| s.to_string_lossy().into_owned());
            let groups = changes.groups.as_ref().map(|g| g.join(","));
            let mut args: Vec<&str> = Vec::new();
            if let Some(ref shell) = shell {
                args.extend(["-s", shell.as_str()]);
            }
            if let Some(ref groups) = groups {
                args.extend(["-G", groups.as_str()]);
            }
            if changes.unlock {
                args.extend(["-U", "-e", ""]);
            }
            if args.is_empty() {
                return Ok(());
            }
            args.push(login);
            run("usermod", &args).await
        }
        .boxed()
    }

    fn lock_user<'this>(&'this self, login: &'this str) -> BoxFuture<'this, SysResult<()>> {
        async move { run("usermod", &["-L", "-e", "1", login]).await }.boxed()
    }

    fn write_authorized_keys<'this>(
        &'this self,
        _login: &'this str,
        home: &'this Path,
        owner: (Uid, Gid),
        keys: &'this [SshKey],
    ) -> BoxFuture<'this, SysResult<()>> {
        async move {
            let mut content = String::new();
            for key in keys {
                content.push_str(key.expose());
                content.push('\n');
            }
            let home = home.to_path_buf();
            tokio::task::spawn_blocking(move || replace_keys(&home, owner, content.as_bytes())).await?
        }
        .boxed()
    }

    fn login_shells(&self) -> BoxFuture<'_, SysResult<Vec<PathBuf>>> {
        async move {
            let path = Path::new("/etc/shells");
            let content = fs::read_to_string(path).await.map_err(io_error(path))?;
            Ok(content
                .lines()
                .map(str::trim)
                .filter(|l| l.starts_with('/'))
                .map(PathBuf::from)
                .collect())
        }
        .boxed()
    }

    fn daemon_reload(&self) -> BoxFuture<'_, SysResult<()>> {
        async move { run("systemctl", &["daemon-reload"]).await }.boxed()
    }

    fn start_unit<'this>(&'this self, unit: &'this str) -> BoxFuture<'this, SysResult<()>> {
        async move { run("systemctl", &["start", unit]).await }.boxed()
    }

    fn restart_unit<'this>(&'this self, unit: &'this str) -> BoxFuture<'this, SysResult<()>> {
        async move { run("systemctl", &["restart", unit]).await }.boxed()
    }

    fn stop_unit<'this>(&'this self, unit: &'this str) -> BoxFuture<'this, SysResult<()>> {
        async move { run("systemctl", &["stop", unit]).await }.boxed()
    }

    fn hostname(&self) -> BoxFuture<'_, SysResult<String>> {
        async move { Ok(unistd::gethostname()?.to_string_lossy().into_owned()) }.boxed()
    }

    fn set_hostname<'this>(&'this self, name: &'this str) -> BoxFuture<'this, SysResult<()>> {
        async move { Ok(unistd::sethostname(name)?) }.boxed()
    }

    fn missing_commands(&self, commands: &[&str]) -> Vec<String> {
        commands
            .iter()
            .filter(|c| which::which(c).is_err())
            .map(|c| (*c).to_owned())
            .collect()
    }
}
