//! systemd helpers: unit name escaping and mount unit rendering.

use core::fmt::Write as _;
use std::path::Path;

/// First line of every unit file written by the agent.
///
/// Used to tell our units apart from hand-written ones before removing anything.
pub const GENERATED_MARKER: &str = "# Generated by nodeagent. Local changes will be overwritten.";

/// Returns `true` if the system uses systemd (detects `/run/systemd/system`).
#[must_use]
pub fn is_systemd() -> bool {
    Path::new("/run/systemd/system").exists()
}

/// Escape an absolute path the way `systemd-escape --path` does.
///
/// Duplicate and trailing slashes are dropped, the root directory becomes `-`,
/// every remaining `/` becomes `-` and bytes outside `[A-Za-z0-9:_.]` (plus a
/// leading `.`) are written as `\xNN`.
#[must_use]
pub fn escape_path(path: &str) -> String {
    let components: Vec<&str> = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();

    if components.is_empty() {
        return "-".to_string();
    }

    let joined = components.join("/");
    let mut escaped = String::with_capacity(joined.len());
    for (index, byte) in joined.bytes().enumerate() {
        match byte {
            b'/' => escaped.push('-'),
            b'.' if index == 0 => push_hex(&mut escaped, byte),
            b if b.is_ascii_alphanumeric() || matches!(b, b':' | b'_' | b'.') => {
                escaped.push(char::from(b));
            }
            _ => push_hex(&mut escaped, byte),
        }
    }
    escaped
}

fn push_hex(out: &mut String, byte: u8) {
    // Writing to a String cannot fail.
    drop(write!(out, "\\x{byte:02x}"));
}

/// Unit file name for a mount at `mountpoint` (`/proj/x` → `proj-x.mount`).
///
/// systemd requires the name of a mount unit to follow its `Where=`, so it is
/// derived from the mountpoint and not from the export.
#[must_use]
pub fn mount_unit_name(mountpoint: &str) -> String {
    format!("{}.mount", escape_path(mountpoint))
}

/// Whether a unit file's contents were produced by [`MountUnit::render`].
#[must_use]
pub fn is_generated(content: &str) -> bool {
    content.lines().next() == Some(GENERATED_MARKER)
}

/// Declarative description of an NFS mount unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountUnit<'spec> {
    /// `host:/export/path`
    pub what: &'spec str,
    /// Local mountpoint.
    pub r#where: &'spec str,
    /// Comma-separated mount options.
    pub options: &'spec str,
}

impl MountUnit<'_> {
    /// Unit file name derived from the mountpoint.
    #[must_use]
    pub fn unit_name(&self) -> String {
        mount_unit_name(self.r#where)
    }

    /// Render the unit file. Output is deterministic for identical input.
    #[must_use]
    pub fn render(&self) -> String {
        let mut unit = String::new();
        unit.push_str(GENERATED_MARKER);
        unit.push('\n');
        unit.push_str("[Unit]\n");
        unit.push_str(&format!("Description=Testbed NFS mount of {}\n", self.what));
        unit.push_str("Wants=network-online.target\n");
        unit.push_str("After=network-online.target\n");
        unit.push('\n');
        unit.push_str("[Mount]\n");
        unit.push_str(&format!("What={}\n", self.what));
        unit.push_str(&format!("Where={}\n", self.r#where));
        unit.push_str("Type=nfs\n");
        if !self.options.is_empty() {
            unit.push_str(&format!("Options={}\n", self.options));
        }
        unit.push('\n');
        unit.push_str("[Install]\n");
        unit.push_str("WantedBy=remote-fs.target\n");
        unit
    }
}
