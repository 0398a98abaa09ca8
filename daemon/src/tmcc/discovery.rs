//! Finding the boss.
//!
//! Candidates are tried in order until one resolves and accepts a TCP
//! connection:
//!
//! 1. `tmcc.boss` from the config file (exclusively, when set)
//! 2. the `BOSSNODE` environment variable
//! 3. the testbed marker files
//! 4. `boss.<domain>` for every search domain in `/etc/resolv.conf`
//! 5. the plain name `boss`

use core::time::Duration;
use std::{
    env,
    path::{Path, PathBuf},
};

use chrono::Utc;
use resolv_conf::Config as ResolvConf;
use tokio::{
    fs,
    net::{TcpStream, lookup_host},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::DiscoveryError,
    model::{BossEndpoint, DiscoverySource},
};

/// Hostname tried when nothing else is known.
pub const FALLBACK_BOSS: &str = "boss";

const MARKER_FILES: [&str; 4] = [
    "/etc/testbed/bossnode",
    "/etc/emulab/bossnode",
    "/usr/local/etc/testbed/bossnode",
    "/usr/local/etc/emulab/bossnode",
];

/// Where candidates are read from.
#[derive(Debug, Clone)]
pub struct DiscoverySources {
    pub env_boss: Option<String>,
    pub marker_files: Vec<PathBuf>,
    pub resolv_conf: PathBuf,
}

impl DiscoverySources {
    /// The running system's sources.
    #[must_use]
    pub fn system() -> Self {
        Self {
            env_boss: env::var("BOSSNODE").ok(),
            marker_files: MARKER_FILES.iter().map(PathBuf::from).collect(),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
        }
    }
}

/// A host name worth probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub host: String,
    pub source: DiscoverySource,
}

/// Search domains in effect according to `resolv_conf`.
///
/// The last `search` or `domain` line wins, as for the resolver itself.
#[must_use]
pub fn search_domains(resolv_conf: &str) -> Vec<String> {
    let parsed = match ResolvConf::parse(resolv_conf) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Ignoring unparsable resolv.conf");
            return Vec::new();
        }
    };
    let domains = match parsed.get_search() {
        Some(search) => search.clone(),
        None => parsed.get_domain().cloned().into_iter().collect(),
    };
    let mut unique: Vec<String> = Vec::new();
    for domain in domains {
        let domain = domain.trim_end_matches('.').to_lowercase();
        if !domain.is_empty() && !unique.contains(&domain) {
            unique.push(domain);
        }
    }
    unique
}

async fn first_line(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).await.ok()?;
    content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_owned)
}

/// Candidates in probing order.
pub async fn candidates(configured: Option<&str>, sources: &DiscoverySources) -> Vec<Candidate> {
    if let Some(host) = configured {
        return vec![Candidate {
            host: host.to_owned(),
            source: DiscoverySource::Config,
        }];
    }

    let mut found = Vec::new();
    if let Some(ref host) = sources.env_boss
        && !host.trim().is_empty()
    {
        found.push(Candidate {
            host: host.trim().to_owned(),
            source: DiscoverySource::Environment,
        });
    }
    for path in &sources.marker_files {
        if let Some(host) = first_line(path).await {
            found.push(Candidate {
                host,
                source: DiscoverySource::MarkerFile(path.clone()),
            });
        }
    }
    if let Ok(conf) = fs::read_to_string(&sources.resolv_conf).await {
        for domain in search_domains(&conf) {
            found.push(Candidate {
                host: format!("{FALLBACK_BOSS}.{domain}"),
                source: DiscoverySource::SearchDomain(domain),
            });
        }
    }
    found.push(Candidate {
        host: FALLBACK_BOSS.to_owned(),
        source: DiscoverySource::Fallback,
    });

    let mut seen = Vec::new();
    found.retain(|c| {
        if seen.contains(&c.host) {
            false
        } else {
            seen.push(c.host.clone());
            true
        }
    });
    found
}

/// Resolve `candidate` and connect to it once.
///
/// # Errors
///
/// Returns [`DiscoveryError::Unresolvable`] or [`DiscoveryError::Unreachable`].
pub async fn reach(
    candidate: &Candidate,
    port: u16,
    limit: Duration,
) -> Result<BossEndpoint, DiscoveryError> {
    let unresolvable = || DiscoveryError::Unresolvable {
        host: candidate.host.clone(),
        port,
    };
    let addrs: Vec<_> = timeout(limit, lookup_host((candidate.host.as_str(), port)))
        .await
        .map_err(|_| unresolvable())?
        .map_err(|_| unresolvable())?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        let attempt = timeout(limit, TcpStream::connect(addr))
            .await
            .unwrap_or_else(|elapsed| Err(elapsed.into()));
        match attempt {
            Ok(_) => {
                return Ok(BossEndpoint {
                    host: candidate.host.clone(),
                    port,
                    addr,
                    discovered_at: Utc::now(),
                    source: candidate.source.clone(),
                });
            }
            Err(e) => {
                debug!(%addr, error = %e, "Boss candidate address unreachable");
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(source) => Err(DiscoveryError::Unreachable {
            host: candidate.host.clone(),
            port,
            source,
        }),
        None => Err(unresolvable()),
    }
}

/// Try every candidate in order and return the first that answers.
///
/// # Errors
///
/// Returns [`DiscoveryError::Exhausted`] when no candidate is reachable.
pub async fn discover(
    configured: Option<&str>,
    port: u16,
    sources: &DiscoverySources,
    limit: Duration,
) -> Result<BossEndpoint, DiscoveryError> {
    let candidates = candidates(configured, sources).await;
    for candidate in &candidates {
        match reach(candidate, port, limit).await {
            Ok(endpoint) => {
                info!(
                    host = %endpoint.host,
                    addr = %endpoint.addr,
                    source = %endpoint.source,
                    "Discovered boss"
                );
                return Ok(endpoint);
            }
            Err(e) => debug!(error = %e, "Boss candidate rejected"),
        }
    }
    Err(DiscoveryError::Exhausted {
        tried: candidates.len(),
    })
}
