//! Typed runtime settings. Defaults carry the reference constants; `main`
//! overrides them from the command line.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub docker: DockerSettings,
    pub readiness: ReadinessSettings,
    pub ssh: SshSettings,
    pub terminal: TerminalSettings,
    pub advice: AdviceSettings,
}

/// Resource limits applied to every new sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory: String,
    pub cpus: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "512m".to_string(),
            cpus: "0.5".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerSettings {
    pub binary: String,
    pub image: String,
    /// Prepended to the sandbox key to form the container name.
    pub name_prefix: String,
    pub limits: ResourceLimits,
    pub capabilities: Vec<String>,
    /// Host address the container's SSH port is published on.
    pub publish_host: String,
    pub command_timeout: Duration,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            image: "dfusco/hax-ai-cyber-lab:latest".to_string(),
            name_prefix: "hax".to_string(),
            limits: ResourceLimits::default(),
            capabilities: vec!["NET_ADMIN".to_string()],
            publish_host: "127.0.0.1".to_string(),
            command_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessSettings {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Command run inside the sandbox; success means the shell service is up.
    pub probe: Vec<String>,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 30,
            probe: vec!["pgrep".to_string(), "sshd".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub binary: String,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            user: "student".to_string(),
            identity_file: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// What to do when a sandboxed shell cannot be provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Fail the open request.
    Deny,
    /// Start a local shell confined to a chroot jail.
    Jailed,
    /// Start an unconfined local shell in the student's directory.
    Host,
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deny" => Ok(FallbackPolicy::Deny),
            "jailed" => Ok(FallbackPolicy::Jailed),
            "host" => Ok(FallbackPolicy::Host),
            other => Err(format!("unknown fallback policy: {other}")),
        }
    }
}

impl std::fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FallbackPolicy::Deny => "deny",
            FallbackPolicy::Jailed => "jailed",
            FallbackPolicy::Host => "host",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct TerminalSettings {
    pub fallback: FallbackPolicy,
    /// Delay between a trigger and the analysis pass it schedules.
    pub debounce: Duration,
    /// Quiet time the output buffer needs before a pass runs.
    pub min_quiet: Duration,
    /// Promptless, errorless output shorter than this is not analyzed.
    pub min_output_len: usize,
    pub history_len: usize,
    pub rows: u16,
    pub cols: u16,
    pub idle_ttl: Duration,
    /// Parent directory for local fallback home directories.
    pub local_root: PathBuf,
    pub shell: String,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            fallback: FallbackPolicy::Jailed,
            debounce: Duration::from_millis(500),
            min_quiet: Duration::from_millis(500),
            min_output_len: 50,
            history_len: 15,
            rows: 24,
            cols: 80,
            idle_ttl: Duration::from_secs(30 * 60),
            local_root: PathBuf::from("/tmp/labterm"),
            shell: "/bin/bash".to_string(),
        }
    }
}

/// Size caps for what is sent to an external advice provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLimits {
    pub output_chars: usize,
    pub error_chars: usize,
    pub history_entries: usize,
    pub max_tokens: u32,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            output_chars: 800,
            error_chars: 400,
            history_entries: 5,
            max_tokens: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdviceSettings {
    /// Completion relay URL. Heuristics only when unset.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub provider_name: String,
    pub timeout: Duration,
    pub limits: PromptLimits,
}

impl Default for AdviceSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            provider_name: "relay".to_string(),
            timeout: Duration::from_secs(10),
            limits: PromptLimits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_policy_parses() {
        assert_eq!("deny".parse::<FallbackPolicy>(), Ok(FallbackPolicy::Deny));
        assert_eq!("Jailed".parse::<FallbackPolicy>(), Ok(FallbackPolicy::Jailed));
        assert_eq!("host".parse::<FallbackPolicy>(), Ok(FallbackPolicy::Host));
        assert!("open".parse::<FallbackPolicy>().is_err());
        assert_eq!(FallbackPolicy::Jailed.to_string(), "jailed");
    }

    #[test]
    fn defaults_match_reference_behaviour() {
        let settings = Settings::default();
        assert_eq!(settings.readiness.interval, Duration::from_secs(2));
        assert_eq!(settings.readiness.max_attempts, 30);
        assert_eq!(settings.terminal.debounce, Duration::from_millis(500));
        assert_eq!(settings.terminal.history_len, 15);
        assert_eq!(settings.advice.limits.output_chars, 800);
        assert_eq!(settings.advice.limits.error_chars, 400);
        assert_eq!(settings.advice.limits.history_entries, 5);
        assert!(settings.advice.endpoint.is_none());
    }
}
