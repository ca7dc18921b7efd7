//! [`SandboxBackend`] driven through the `docker` CLI.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Output;
use tracing::{debug, info};

use crate::config::{DockerSettings, ResourceLimits};
use crate::error::{Error, Result};
use crate::sandbox::{Endpoint, SandboxBackend, SandboxKey, SandboxState, SandboxStatus, SandboxSummary};

/// Label carrying the sandbox key on every container we create.
pub const KEY_LABEL: &str = "labterm.sandbox-key";

const SSH_PORT: &str = "22/tcp";

pub struct DockerBackend {
    settings: DockerSettings,
}

impl DockerBackend {
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }

    async fn docker(&self, args: &[String]) -> Result<Output> {
        debug!(args = ?args, "docker");
        let child = tokio::process::Command::new(&self.settings.binary)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Backend(format!("spawn {}: {}", self.settings.binary, e)))?;

        match tokio::time::timeout(self.settings.command_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(Error::Backend(format!("docker {}: {}", args[0], e))),
            Err(_) => Err(Error::Backend(format!(
                "docker {} timed out after {}s",
                args[0],
                self.settings.command_timeout.as_secs()
            ))),
        }
    }

    /// Like [`Self::docker`] but treats a non-zero exit as an error.
    async fn docker_ok(&self, args: &[String]) -> Result<String> {
        let output = self.docker(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Backend(format!("docker {} failed: {}", args[0], stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, name: &str, key: &SandboxKey, limits: &ResourceLimits) -> Result<String> {
        let args = run_args(&self.settings, name, key, limits);
        let stdout = self.docker_ok(&args).await?;
        let id = stdout.trim().to_string();
        info!(container = %name, id = %id, "container created");
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.docker_ok(&owned(&["start", name])).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.docker_ok(&owned(&["stop", name])).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.docker_ok(&owned(&["rm", "-f", name])).await.map(|_| ())
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<String> {
        let mut args = owned(&["exec", name]);
        args.extend(argv.iter().cloned());
        self.docker_ok(&args).await
    }

    async fn inspect(&self, name: &str) -> Result<SandboxStatus> {
        let output = self.docker(&owned(&["inspect", "--type", "container", name])).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Ok(SandboxStatus::absent());
            }
            return Err(Error::Backend(format!("docker inspect failed: {}", stderr.trim())));
        }
        parse_inspect(&String::from_utf8_lossy(&output.stdout), &self.settings.publish_host)
    }

    async fn list(&self) -> Result<Vec<SandboxSummary>> {
        let args = owned(&[
            "ps",
            "-a",
            "--filter",
            &format!("label={KEY_LABEL}"),
            "--format",
            "{{json .}}",
        ]);
        let stdout = self.docker_ok(&args).await?;
        Ok(stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| parse_ps_line(line, &self.settings.publish_host))
            .collect())
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Arguments for `docker run` creating one student sandbox.
pub fn run_args(settings: &DockerSettings, name: &str, key: &SandboxKey, limits: &ResourceLimits) -> Vec<String> {
    let mut args = owned(&["run", "-d", "--name", name]);
    args.push("--label".to_string());
    args.push(format!("{KEY_LABEL}={key}"));
    args.push(format!("--memory={}", limits.memory));
    args.push(format!("--cpus={}", limits.cpus));
    for cap in &settings.capabilities {
        args.push(format!("--cap-add={cap}"));
    }
    args.push("-p".to_string());
    args.push(format!("{}::22", settings.publish_host));
    args.push(settings.image.clone());
    args
}

fn map_state(status: &str) -> SandboxState {
    match status {
        "running" => SandboxState::Running,
        "restarting" => SandboxState::Creating,
        "created" | "exited" | "paused" | "dead" => SandboxState::Stopped,
        _ => SandboxState::Unreachable,
    }
}

/// Parses `docker inspect --type container` JSON into a status.
pub fn parse_inspect(json: &str, host: &str) -> Result<SandboxStatus> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| Error::Backend(format!("bad inspect output: {e}")))?;
    let Some(container) = value.as_array().and_then(|items| items.first()) else {
        return Ok(SandboxStatus::absent());
    };

    let status = container["State"]["Status"].as_str().unwrap_or("");
    let mut state = map_state(status);

    let port = container["NetworkSettings"]["Ports"][SSH_PORT]
        .as_array()
        .and_then(|bindings| bindings.iter().find_map(|b| b["HostPort"].as_str()))
        .and_then(|p| p.parse::<u16>().ok());
    let endpoint = port.map(|port| Endpoint {
        host: host.to_string(),
        port,
    });

    if state == SandboxState::Running && endpoint.is_none() {
        state = SandboxState::Unreachable;
    }
    Ok(SandboxStatus { state, endpoint })
}

/// Parses one `docker ps --format '{{json .}}'` line.
pub fn parse_ps_line(line: &str, host: &str) -> Option<SandboxSummary> {
    let value: Value = serde_json::from_str(line).ok()?;
    let name = value["Names"].as_str()?.to_string();
    let state = map_state(value["State"].as_str().unwrap_or(""));
    let key = value["Labels"].as_str().and_then(|labels| {
        labels
            .split(',')
            .find_map(|pair| pair.strip_prefix(&format!("{KEY_LABEL}=")))
            .and_then(SandboxKey::parse)
    });
    let endpoint = value["Ports"]
        .as_str()
        .and_then(published_ssh_port)
        .map(|port| Endpoint {
            host: host.to_string(),
            port,
        });
    Some(SandboxSummary {
        name,
        key,
        state,
        endpoint,
    })
}

/// Extracts the host port from a ps `Ports` column such as
/// `127.0.0.1:49153->22/tcp, 80/tcp`.
fn published_ssh_port(ports: &str) -> Option<u16> {
    ports.split(',').find_map(|mapping| {
        let (host_side, container_side) = mapping.trim().split_once("->")?;
        if container_side != SSH_PORT {
            return None;
        }
        host_side.rsplit(':').next()?.parse().ok()
    })
}
