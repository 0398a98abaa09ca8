//! Building a [`NodeConfig`] from the boss' responses.

use alloc::collections::BTreeMap;
use core::time::Duration;

use nodeagent_common::{Request, ResponseLine, content_digest, systemd::mount_unit_name};
use tracing::{debug, warn};

use super::transport::{exchange, lines};
use crate::{
    error::{FetchError, ProtocolError},
    model::{AccountSpec, BossEndpoint, Gid, GroupSpec, HostnamePolicy, MountSpec, NodeConfig, SshKey},
};

/// Raw response lines of every request that makes up a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Responses {
    pub accounts: Vec<String>,
    pub localization: Vec<String>,
    pub mounts: Vec<String>,
    pub status: Vec<String>,
}

async fn request_lines(boss: &BossEndpoint, command: &str, limit: Duration) -> Result<Vec<String>, FetchError> {
    let response = exchange(boss.addr, &Request::new(command), limit).await?;
    Ok(lines(command, &response)?)
}

/// Fetch everything the agent reconciles from `boss`.
///
/// # Errors
///
/// Returns [`FetchError::Transport`] if a request fails and
/// [`FetchError::Protocol`] if a response is malformed.
pub async fn fetch(boss: &BossEndpoint, limit: Duration) -> Result<NodeConfig, FetchError> {
    let responses = Responses {
        accounts: request_lines(boss, "accounts", limit).await?,
        localization: request_lines(boss, "localization", limit).await?,
        mounts: request_lines(boss, "mounts", limit).await?,
        status: request_lines(boss, "status", limit).await?,
    };
    Ok(build(&responses, boss)?)
}

/// Interpret `responses`. The version is left at zero for the store to assign.
///
/// # Errors
///
/// Returns a [`ProtocolError`] for the first malformed line.
pub fn build(responses: &Responses, boss: &BossEndpoint) -> Result<NodeConfig, ProtocolError> {
    let (accounts, groups) = parse_accounts(&responses.accounts)?;
    let domain = boss.domain();

    // The hostname depends on the boss' domain, so it is part of the content.
    let boss_marker = format!("BOSSDOMAIN={}", domain.unwrap_or_default());
    let content_id = content_digest(
        responses
            .accounts
            .iter()
            .chain(&responses.localization)
            .chain(&responses.mounts)
            .chain(&responses.status)
            .map(String::as_str)
            .chain([boss_marker.as_str()]),
    );

    Ok(NodeConfig {
        version: 0,
        content_id,
        accounts,
        groups,
        mounts: parse_mounts(&responses.mounts)?,
        root_keys: parse_localization(&responses.localization),
        hostname: parse_status(&responses.status, domain)?,
        boss: Some(boss.clone()),
    })
}

type Accounts = (BTreeMap<String, AccountSpec>, BTreeMap<String, GroupSpec>);

/// `ADDUSER`, `PUBKEY`, `ADDGROUP` and `SFSKEY` lines.
///
/// # Errors
///
/// Returns a [`ProtocolError`] for unknown directives, duplicates and keys of
/// unknown users.
pub fn parse_accounts(lines: &[String]) -> Result<Accounts, ProtocolError> {
    let mut accounts: BTreeMap<String, AccountSpec> = BTreeMap::new();
    let mut groups: BTreeMap<String, GroupSpec> = BTreeMap::new();
    let mut glists: Vec<(String, String)> = Vec::new();

    for raw in lines {
        let line = ResponseLine::parse(raw)?;
        match line.directive() {
            Some("ADDUSER") => {
                let login = line.get("LOGIN")?;
                let mut account = AccountSpec::new(login, line.get_parsed("UID")?, line.get_parsed("GID")?);
                account.admin = line.field("ROOT") == Some("1");
                if let Some(home) = line.field("HOMEDIR") {
                    account.home = home.into();
                }
                if let Some(shell) = line.field("SHELL") {
                    shell.clone_into(&mut account.shell);
                }
                if let Some(serial) = line.field("SERIAL") {
                    serial.clone_into(&mut account.serial);
                }
                if let Some(glist) = line.field("GLIST") {
                    glists.push((login.to_owned(), glist.to_owned()));
                }
                if accounts.insert(login.to_owned(), account).is_some() {
                    return Err(ProtocolError::DuplicateUser {
                        login: login.to_owned(),
                    });
                }
            }
            Some("PUBKEY") => {
                let login = line.get("LOGIN")?;
                let key = line.get("KEY")?;
                let account = accounts.get_mut(login).ok_or_else(|| ProtocolError::UnknownUser {
                    login: login.to_owned(),
                })?;
                account.ssh_keys.push(SshKey::new(key));
            }
            Some("ADDGROUP") => {
                let group = GroupSpec::new(line.get("NAME")?, line.get_parsed("GID")?);
                if groups.contains_key(&group.name) {
                    return Err(ProtocolError::DuplicateGroup { name: group.name });
                }
                groups.insert(group.name.clone(), group);
            }
            Some("SFSKEY") => warn!("Ignoring unsupported SFSKEY directive"),
            Some(directive) => {
                return Err(ProtocolError::UnknownDirective {
                    directive: directive.to_owned(),
                    line: raw.clone(),
                });
            }
            None => return Err(ProtocolError::MissingDirective { line: raw.clone() }),
        }
    }

    let by_gid: BTreeMap<Gid, &str> = groups
        .values()
        .map(|g| (g.gid, g.name.as_str()))
        .collect();
    for account in accounts.values_mut() {
        if let Some(name) = by_gid.get(&account.gid) {
            account.set_primary_group(name);
        }
    }
    for (login, glist) in glists {
        let Some(account) = accounts.get_mut(&login) else {
            continue;
        };
        for gid in glist.split(',').map(str::trim).filter(|g| !g.is_empty()) {
            match gid.parse::<Gid>().ok().and_then(|gid| by_gid.get(&gid)) {
                Some(name) => account.add_group(name),
                None => warn!(%login, %gid, "Ignoring group unknown to the boss"),
            }
        }
    }
    Ok((accounts, groups))
}

/// `ROOTPUBKEY` lines. Anything else (continuation lines included) is skipped.
#[must_use]
pub fn parse_localization(lines: &[String]) -> Vec<SshKey> {
    lines
        .iter()
        .filter_map(|raw| match ResponseLine::parse(raw) {
            Ok(line) => line.field("ROOTPUBKEY").map(SshKey::new),
            Err(e) => {
                debug!(error = %e, "Skipping localization line");
                None
            }
        })
        .collect()
}

/// `REMOTE=host:/path LOCAL=/path [OPTIONS=...]` lines, keyed by export path.
///
/// # Errors
///
/// Returns a [`ProtocolError`] for malformed remotes and duplicate exports.
pub fn parse_mounts(lines: &[String]) -> Result<BTreeMap<String, MountSpec>, ProtocolError> {
    let mut mounts = BTreeMap::new();
    // Unit name -> export, since two mounts sharing a unit would replace each other.
    let mut units: BTreeMap<String, String> = BTreeMap::new();
    for raw in lines {
        let line = ResponseLine::parse(raw)?;
        let Some(remote) = line.field("REMOTE") else {
            debug!(line = %raw, "Skipping non-mount line");
            continue;
        };
        if !matches!(remote.split_once(':'), Some((host, path)) if !host.is_empty() && path.starts_with('/')) {
            return Err(ProtocolError::BadRemote {
                remote: remote.to_owned(),
            });
        }
        let mount = MountSpec {
            remote: remote.to_owned(),
            mountpoint: line.get("LOCAL")?.to_owned(),
            options: line.field("OPTIONS").map(str::to_owned),
        };
        let export = mount.export_path().to_owned();
        if mounts.contains_key(&export) {
            return Err(ProtocolError::DuplicateMount { export });
        }
        if let Some(first) = units.insert(mount_unit_name(&mount.mountpoint), export.clone()) {
            return Err(ProtocolError::SharedMountpoint {
                mountpoint: mount.mountpoint,
                first,
                second: export,
            });
        }
        mounts.insert(export, mount);
    }
    Ok(mounts)
}

/// First `status` line: `FREE` or `ALLOCATED=<pid>/<eid> NICKNAME=<node>`.
///
/// # Errors
///
/// Returns a [`ProtocolError`] for an allocation without a nickname or with a
/// malformed experiment.
pub fn parse_status(lines: &[String], domain: Option<&str>) -> Result<HostnamePolicy, ProtocolError> {
    let Some(raw) = lines.first() else {
        return Ok(HostnamePolicy::Unmanaged);
    };
    let line = ResponseLine::parse(raw)?;
    if line.directive() == Some("FREE") {
        return Ok(HostnamePolicy::Unmanaged);
    }
    let allocated = line.get("ALLOCATED")?;
    let node = line.get("NICKNAME")?;
    let Some((pid, eid)) = allocated.split_once('/') else {
        return Err(nodeagent_common::ParseError::BadValue {
            key: "ALLOCATED".to_owned(),
            value: allocated.to_owned(),
        }
        .into());
    };
    let fqdn = match domain {
        Some(domain) => format!("{node}.{eid}.{pid}.{domain}"),
        None => node.to_owned(),
    };
    Ok(HostnamePolicy::Set {
        fqdn: fqdn.to_lowercase(),
    })
}
