//! Starting terminal processes: SSH into a sandbox, or a local shell when
//! the sandbox path is unavailable.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::SshSettings;
use crate::error::{Error, Result};
use crate::jail::{self, JailLimits};
use crate::pty::{self, JailSpec, ProcessHandle, PtyCommand, WindowSize};
use crate::sandbox::{Sandbox, SandboxKey};

/// Who a local fallback shell is for.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub student_id: String,
    pub course_name: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confinement {
    /// Chroot jail with resource limits, running as `nobody`.
    Jailed,
    /// Plain shell in the student's directory on the host.
    Host,
}

#[async_trait]
pub trait ShellLauncher: Send + Sync {
    /// Opens an interactive shell inside a running sandbox.
    async fn connect(&self, sandbox: &Sandbox, size: WindowSize) -> Result<ProcessHandle>;

    async fn spawn_local(
        &self,
        identity: &LocalIdentity,
        confinement: Confinement,
        size: WindowSize,
    ) -> Result<ProcessHandle>;
}

pub struct PtyLauncher {
    ssh: SshSettings,
    shell: String,
    local_root: PathBuf,
    jail_limits: JailLimits,
}

impl PtyLauncher {
    pub fn new(ssh: SshSettings, shell: impl Into<String>, local_root: impl Into<PathBuf>) -> Self {
        Self {
            ssh,
            shell: shell.into(),
            local_root: local_root.into(),
            jail_limits: JailLimits::default(),
        }
    }

    pub fn ssh_args(&self, sandbox: &Sandbox) -> Vec<String> {
        let mut args: Vec<String> = [
            "-tt",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", self.ssh.connect_timeout.as_secs().max(1)));
        args.push("-p".to_string());
        args.push(sandbox.endpoint.port.to_string());
        if let Some(identity) = &self.ssh.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.ssh.user, sandbox.endpoint.host));
        args
    }

    async fn spawn_host(&self, identity: &LocalIdentity, size: WindowSize) -> Result<ProcessHandle> {
        let dir = self.local_root.join(student_dir_name(identity));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Spawn(format!("create {}: {}", dir.display(), e)))?;
        let welcome = dir.join("welcome.txt");
        if !tokio::fs::try_exists(&welcome).await.unwrap_or(false) {
            tokio::fs::write(&welcome, welcome_text(identity))
                .await
                .map_err(|e| Error::Spawn(format!("write welcome file: {e}")))?;
        }

        let mut cmd = PtyCommand::new(&self.shell);
        cmd.cwd = Some(dir.clone());
        cmd.size = size;
        cmd.env = shell_env(identity, &dir.display().to_string());
        info!(session_id = %identity.session_id, dir = %dir.display(), "starting host shell");
        pty::spawn(cmd, None)
    }

    async fn spawn_jailed(&self, identity: &LocalIdentity, size: WindowSize) -> Result<ProcessHandle> {
        if !jail::supported() {
            return Err(Error::Spawn("jailed shells need root".to_string()));
        }
        let root = self.local_root.join(format!("jail-{}", identity.session_id));
        let welcome = welcome_text(identity);
        let prepare_root = root.clone();
        tokio::task::spawn_blocking(move || jail::prepare(&prepare_root, &[("welcome.txt", welcome)]))
            .await
            .map_err(|e| Error::Spawn(format!("jail setup task: {e}")))??;

        let mut cmd = PtyCommand::new(&self.shell);
        cmd.clear_env = true;
        cmd.size = size;
        cmd.env = shell_env(identity, "/home");
        cmd.env.push(("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string()));
        cmd.jail = Some(JailSpec {
            root: root.clone(),
            workdir: "/home".to_string(),
            limits: self.jail_limits,
        });

        let cleanup_root = root.clone();
        match pty::spawn(cmd, Some(Box::new(move || jail::cleanup(&cleanup_root)))) {
            Ok(handle) => {
                info!(session_id = %identity.session_id, root = %root.display(), "starting jailed shell");
                Ok(handle)
            }
            Err(e) => {
                let root = root.clone();
                let _ = tokio::task::spawn_blocking(move || jail::cleanup(&root)).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ShellLauncher for PtyLauncher {
    async fn connect(&self, sandbox: &Sandbox, size: WindowSize) -> Result<ProcessHandle> {
        let addr = sandbox.endpoint.to_string();
        match tokio::time::timeout(self.ssh.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(Error::Connect {
                    endpoint: addr,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::Connect {
                    endpoint: addr,
                    message: "connection timed out".to_string(),
                })
            }
        }

        let mut cmd = PtyCommand::new(&self.ssh.binary);
        cmd.args = self.ssh_args(sandbox);
        cmd.size = size;
        cmd.env.push(("TERM".to_string(), "xterm-256color".to_string()));
        info!(sandbox = %sandbox.name, endpoint = %addr, "opening ssh shell");
        pty::spawn(cmd, None).map_err(|e| Error::Connect {
            endpoint: addr,
            message: e.to_string(),
        })
    }

    async fn spawn_local(
        &self,
        identity: &LocalIdentity,
        confinement: Confinement,
        size: WindowSize,
    ) -> Result<ProcessHandle> {
        match confinement {
            Confinement::Jailed => self.spawn_jailed(identity, size).await,
            Confinement::Host => {
                warn!(session_id = %identity.session_id, "starting an unconfined host shell");
                self.spawn_host(identity, size).await
            }
        }
    }
}

fn student_dir_name(identity: &LocalIdentity) -> String {
    format!(
        "student-{}",
        SandboxKey::from_identity(&identity.student_id, &identity.course_name)
    )
}

fn shell_env(identity: &LocalIdentity, home: &str) -> Vec<(String, String)> {
    vec![
        ("HOME".to_string(), home.to_string()),
        ("TERM".to_string(), "xterm-256color".to_string()),
        (
            "PS1".to_string(),
            format!("{}@hax-lab:\\w$ ", prompt_safe(&identity.student_id)),
        ),
    ]
}

/// Keeps prompt expansion out of a student id.
fn prompt_safe(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}

pub fn welcome_text(identity: &LocalIdentity) -> String {
    format!(
        "Welcome to the lab, {student}!\n\
         Course: {course}\n\
         \n\
         This is a local practice shell, not your lab container.\n\
         Network tools may be missing or limited here.\n\
         \n\
         Things to try:\n\
         \x20 ls -la      list files with details\n\
         \x20 pwd         show where you are\n\
         \x20 whoami      show the current user\n\
         \x20 df -h       show disk usage\n\
         \x20 man <cmd>   read a command's manual\n",
        student = identity.student_id,
        course = identity.course_name,
    )
}
