//! Node configuration as fetched from the boss.
//!
//! Everything in here is immutable once published: a [`NodeConfig`] is built
//! by the protocol client, handed to the [`ConfigStore`](crate::store::ConfigStore)
//! and from then on only read.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use core::{fmt, net::SocketAddr};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret as _, SecretString};

pub type Uid = u32;
pub type Gid = u32;

/// One public key line. The content never shows up in `Debug` output.
#[derive(Clone)]
pub struct SshKey(Arc<SecretString>);

impl SshKey {
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self(Arc::new(SecretString::from(key.trim().to_owned())))
    }

    /// The key line, for writing `authorized_keys`.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl PartialEq for SshKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.expose_secret() == other.0.expose_secret()
    }
}

impl Eq for SshKey {}

impl fmt::Debug for SshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SshKey([REDACTED])")
    }
}

/// A local account the boss wants to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSpec {
    pub username: String,
    pub uid: Uid,
    /// Primary GID.
    pub gid: Gid,
    /// Name of the primary group, when the boss announced it.
    pub primary_group: Option<String>,
    groups: BTreeSet<String>,
    /// Full replacement set for `~/.ssh/authorized_keys`.
    pub ssh_keys: Vec<SshKey>,
    /// Shell as sent by the boss; resolved against `/etc/shells` when applied.
    pub shell: String,
    pub home: PathBuf,
    /// Member of the admin group.
    pub admin: bool,
    /// Opaque change counter maintained by the boss.
    pub serial: String,
}

impl AccountSpec {
    #[must_use]
    pub fn new(username: &str, uid: Uid, gid: Gid) -> Self {
        Self {
            username: username.to_owned(),
            uid,
            gid,
            primary_group: None,
            groups: BTreeSet::new(),
            ssh_keys: Vec::new(),
            shell: "/bin/sh".to_owned(),
            home: PathBuf::from("/home").join(username),
            admin: false,
            serial: String::new(),
        }
    }

    /// Record a supplementary group. Names are lower-cased.
    pub fn add_group(&mut self, name: &str) {
        self.groups.insert(name.to_lowercase());
    }

    /// Set the primary group name. Lower-cased like every other group.
    pub fn set_primary_group(&mut self, name: &str) {
        self.primary_group = Some(name.to_lowercase());
    }

    /// Supplementary groups, lower-cased and sorted.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }
}

/// A group announced with `ADDGROUP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    /// Lower-cased.
    pub name: String,
    pub gid: Gid,
}

impl GroupSpec {
    #[must_use]
    pub fn new(name: &str, gid: Gid) -> Self {
        Self {
            name: name.to_lowercase(),
            gid,
        }
    }
}

/// An NFS export to mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// `host:/export/path`
    pub remote: String,
    pub mountpoint: String,
    /// Options from the boss; `None` means the configured default applies.
    pub options: Option<String>,
}

impl MountSpec {
    /// The path part of [`Self::remote`], which identifies the mount.
    #[must_use]
    pub fn export_path(&self) -> &str {
        self.remote
            .split_once(':')
            .map_or(self.remote.as_str(), |(_, path)| path)
    }
}

/// What the hostname should be.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostnamePolicy {
    /// The node is not allocated; leave the hostname alone.
    #[default]
    Unmanaged,
    Set { fqdn: String },
}

impl HostnamePolicy {
    /// First label of the FQDN.
    #[must_use]
    pub fn short(&self) -> Option<&str> {
        match *self {
            Self::Unmanaged => None,
            Self::Set { ref fqdn } => fqdn.split('.').next(),
        }
    }
}

/// Where the boss address came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverySource {
    Config,
    Environment,
    MarkerFile(PathBuf),
    SearchDomain(String),
    Fallback,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Config => f.write_str("config"),
            Self::Environment => f.write_str("BOSSNODE"),
            Self::MarkerFile(ref path) => write!(f, "{}", path.display()),
            Self::SearchDomain(ref domain) => write!(f, "search domain {domain}"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// A boss that accepted a connection during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BossEndpoint {
    /// Host name as found (may be an address literal).
    pub host: String,
    pub port: u16,
    /// Resolved address used for requests.
    pub addr: SocketAddr,
    pub discovered_at: DateTime<Utc>,
    pub source: DiscoverySource,
}

impl BossEndpoint {
    /// DNS domain of the boss (`boss.example.net` → `example.net`).
    ///
    /// `None` for address literals and single-label names.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        if self.host.parse::<core::net::IpAddr>().is_ok() {
            return None;
        }
        self.host
            .trim_end_matches('.')
            .split_once('.')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
    }
}

/// A complete configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeConfig {
    /// Assigned by the store, strictly increasing.
    pub version: u64,
    /// Digest of the boss responses this snapshot was built from.
    pub content_id: String,
    /// Keyed by username.
    pub accounts: BTreeMap<String, AccountSpec>,
    /// Keyed by lower-cased group name.
    pub groups: BTreeMap<String, GroupSpec>,
    /// Keyed by export path.
    pub mounts: BTreeMap<String, MountSpec>,
    /// Keys for root's `authorized_keys`.
    pub root_keys: Vec<SshKey>,
    pub hostname: HostnamePolicy,
    /// The boss this snapshot was fetched from.
    pub boss: Option<BossEndpoint>,
}

impl NodeConfig {
    /// The snapshot before anything was fetched.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use core::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn endpoint(host: &str) -> BossEndpoint {
        BossEndpoint {
            host: host.to_owned(),
            port: 7777,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7777),
            discovered_at: Utc::now(),
            source: DiscoverySource::Fallback,
        }
    }

    #[test]
    fn groups_are_lower_cased() {
        let mut account = AccountSpec::new("alice", 20001, 600);
        account.add_group("Proj");
        account.add_group("PROJ");
        account.add_group("wheel");
        account.set_primary_group("Staff");
        assert_eq!(account.groups().collect::<Vec<_>>(), ["proj", "wheel"]);
        assert_eq!(account.primary_group.as_deref(), Some("staff"));
        assert_eq!(GroupSpec::new("MyProj", 7).name, "myproj");
    }

    #[test]
    fn key_material_is_redacted() {
        let key = SshKey::new("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 alice@laptop\n");
        assert_eq!(key.expose(), "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 alice@laptop");
        let mut account = AccountSpec::new("alice", 1, 1);
        account.ssh_keys.push(key);
        let debug = format!("{account:?}");
        assert!(!debug.contains("AAAAC3"), "{debug}");
    }

    #[test]
    fn export_path_strips_host() {
        let mount = MountSpec {
            remote: "fs:/proj/x".into(),
            mountpoint: "/proj/x".into(),
            options: None,
        };
        assert_eq!(mount.export_path(), "/proj/x");
    }

    #[test]
    fn boss_domain() {
        assert_eq!(endpoint("boss.emulab.net").domain(), Some("emulab.net"));
        assert_eq!(endpoint("boss").domain(), None);
        assert_eq!(endpoint("10.0.0.1").domain(), None);
    }

    #[test]
    fn short_hostname() {
        let policy = HostnamePolicy::Set {
            fqdn: "node1.exp.proj.emulab.net".into(),
        };
        assert_eq!(policy.short(), Some("node1"));
        assert_eq!(HostnamePolicy::Unmanaged.short(), None);
    }
}
