//! Engine version parsing and comparison.
//!
//! Nested daemon startup needs to know which release of the engine binary
//! it is driving: older releases take a `--daemon` flag where newer ones
//! grew a `daemon` subcommand.

use crate::error::{Error, Result};

/// A specific release or build of the container engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineVersion {
    /// Original version string, e.g. `1.10.3-rc1`.
    pub name: String,
    /// Major, minor, release.
    pub number: [u32; 3],
    /// Pre-release tag, e.g. `rc1` or `dev`. Empty for final releases.
    pub tag: String,
    /// Build commit, when known.
    pub commit: String,
}

impl EngineVersion {
    /// A version object for a bare release number, useful for comparisons.
    pub fn of(major: u32, minor: u32, release: u32) -> EngineVersion {
        EngineVersion {
            name: format!("v{}.{}.{}", major, minor, release),
            number: [major, minor, release],
            ..Default::default()
        }
    }

    /// Parses a version string as printed by the engine's version command
    /// and git tags: `[v]X.Y.Z[-tag][@commit]`.
    pub fn parse(s: &str) -> Result<EngineVersion> {
        let invalid = || Error::InvalidVersion(s.to_string());

        let (body, commit) = match s.split_once('@') {
            Some((body, commit)) => (body, commit.to_string()),
            None => (s, String::new()),
        };
        let body = body.strip_prefix('v').unwrap_or(body);
        let (numbers, tag) = match body.split_once('-') {
            Some((numbers, tag)) => (numbers, tag.to_string()),
            None => (body, String::new()),
        };

        let mut parts = numbers.splitn(3, '.');
        let mut number = [0u32; 3];
        for slot in number.iter_mut() {
            *slot = parts
                .next()
                .ok_or_else(invalid)?
                .parse()
                .map_err(|_| invalid())?;
        }

        Ok(EngineVersion {
            name: s.to_string(),
            number,
            tag,
            commit,
        })
    }

    /// Release ordering: numbers first, then pre-release tags. A final
    /// release sorts after any tagged build of the same number; `dev`
    /// sorts before named tags; `rc*` sorts last among tags.
    pub fn less_than(&self, other: &EngineVersion) -> bool {
        for i in 0..3 {
            if self.number[i] != other.number[i] {
                return self.number[i] < other.number[i];
            }
        }
        if self.tag != other.tag {
            if self.tag.is_empty() {
                return false;
            }
            if other.tag.is_empty() {
                return true;
            }
            if self.tag == "dev" {
                return true;
            }
            if self.tag.starts_with("rc") && !other.tag.starts_with("rc") {
                return false;
            }
            return self.tag < other.tag;
        }
        self.commit < other.commit
    }
}

impl std::fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if !self.commit.is_empty() && !self.name.contains('@') {
            write!(f, "@{}", self.commit)?;
        }
        Ok(())
    }
}

/// Queries a local engine binary for its version by running
/// `<binary> --version` and parsing the output line, which looks like
/// `Docker version 1.10.3, build 20f81dd`.
pub async fn binary_version(binary: &str) -> Result<EngineVersion> {
    let output = tokio::process::Command::new(binary)
        .arg("--version")
        .output()
        .await
        .map_err(|e| Error::DaemonStartFailed(format!("running {} --version: {}", binary, e)))?;
    let text = String::from_utf8_lossy(&output.stdout);
    parse_version_output(text.trim())
}

fn parse_version_output(line: &str) -> Result<EngineVersion> {
    let invalid = || Error::InvalidVersion(line.to_string());

    // "<name> version <x.y.z[-tag]>, build <commit>"
    let rest = line
        .split_once(" version ")
        .map(|(_, rest)| rest)
        .ok_or_else(invalid)?;
    let (version, build) = match rest.split_once(", build ") {
        Some((version, build)) => (version, build.trim()),
        None => (rest.trim(), ""),
    };
    let mut v = EngineVersion::parse(version.trim_end_matches(','))?;
    if !build.is_empty() {
        v.commit = build.to_string();
    }
    Ok(v)
}
