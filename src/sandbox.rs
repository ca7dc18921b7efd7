//! Sandbox identity, lifecycle states and the control boundary the registry
//! drives.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::config::ResourceLimits;
use crate::error::Result;

/// Stable identifier for one (student, course) sandbox.
///
/// Built from `"{course}-{student}"` with every character outside
/// `[a-zA-Z0-9-]` replaced by `-`, then lowercased. Pairs that differ only in
/// replaced characters (or in where the hyphen falls) map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SandboxKey(String);

impl SandboxKey {
    pub fn from_identity(student_id: &str, course_name: &str) -> Self {
        Self(normalize(&format!("{course_name}-{student_id}")))
    }

    /// Accepts an already-derived key (admin surface), normalizing it again.
    pub fn parse(raw: &str) -> Option<Self> {
        let key = normalize(raw.trim());
        if key.trim_matches('-').is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Absent,
    Creating,
    Running,
    Stopped,
    Unreachable,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Absent => "absent",
            SandboxState::Creating => "creating",
            SandboxState::Running => "running",
            SandboxState::Stopped => "stopped",
            SandboxState::Unreachable => "unreachable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A running sandbox with a reachable shell endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sandbox {
    pub key: SandboxKey,
    pub name: String,
    pub endpoint: Endpoint,
}

/// What the backend reports about one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxStatus {
    pub state: SandboxState,
    pub endpoint: Option<Endpoint>,
}

impl SandboxStatus {
    pub fn absent() -> Self {
        Self {
            state: SandboxState::Absent,
            endpoint: None,
        }
    }
}

/// Listing entry for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxSummary {
    pub name: String,
    pub key: Option<SandboxKey>,
    pub state: SandboxState,
    pub endpoint: Option<Endpoint>,
}

/// Platform that actually creates and runs sandboxes.
///
/// Every method addresses a sandbox by its backend name. `inspect` reports
/// [`SandboxState::Absent`] for unknown names instead of failing.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Creates and starts a sandbox tagged with `key`; returns its backend id.
    async fn create(&self, name: &str, key: &SandboxKey, limits: &ResourceLimits) -> Result<String>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;

    /// Runs `argv` inside the sandbox and returns its stdout.
    async fn exec(&self, name: &str, argv: &[String]) -> Result<String>;

    async fn inspect(&self, name: &str) -> Result<SandboxStatus>;

    async fn list(&self) -> Result<Vec<SandboxSummary>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_and_normalized() {
        let a = SandboxKey::from_identity("Alice Smith", "CS 101");
        let b = SandboxKey::from_identity("Alice Smith", "CS 101");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "cs-101-alice-smith");
    }

    #[test]
    fn key_uses_only_restricted_alphabet() {
        let key = SandboxKey::from_identity("bob@example.com", "net_sec/π");
        assert!(key
            .as_str()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert_eq!(key.as_str(), "net-sec---bob-example-com");
    }

    #[test]
    fn distinct_pairs_get_distinct_keys() {
        let a = SandboxKey::from_identity("alice", "cs101");
        let b = SandboxKey::from_identity("bob", "cs101");
        let c = SandboxKey::from_identity("alice", "cs102");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn documented_collision_when_hyphen_moves() {
        let a = SandboxKey::from_identity("b-c", "a");
        let b = SandboxKey::from_identity("c", "a-b");
        assert_eq!(a, b);
    }

    #[test]
    fn parse_rejects_empty_keys() {
        assert!(SandboxKey::parse("  ").is_none());
        assert!(SandboxKey::parse("---").is_none());
        assert_eq!(SandboxKey::parse("CS101-Alice").map(|k| k.to_string()), Some("cs101-alice".to_string()));
    }
}
