//! Processes attached to a pseudo-terminal, exposed as channel pairs.

use nix::pty::{openpty, OpenptyResult, Winsize};
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::jail::{self, JailLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Out-of-band control over a running terminal process.
pub trait ProcessControl: Send + Sync {
    fn resize(&self, size: WindowSize) -> Result<()>;

    /// Asks the process to terminate. Idempotent.
    fn terminate(&self);
}

/// A live terminal process. `output` closes when the process is gone.
pub struct ProcessHandle {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub input: mpsc::Sender<Vec<u8>>,
    pub control: Box<dyn ProcessControl>,
}

/// Confines the child to a prepared jail root.
#[derive(Debug, Clone)]
pub struct JailSpec {
    pub root: PathBuf,
    pub workdir: String,
    pub limits: JailLimits,
}

#[derive(Debug, Clone)]
pub struct PtyCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Start from an empty environment instead of inheriting ours.
    pub clear_env: bool,
    pub cwd: Option<PathBuf>,
    pub jail: Option<JailSpec>,
    pub size: WindowSize,
}

impl PtyCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            clear_env: false,
            cwd: None,
            jail: None,
            size: WindowSize::default(),
        }
    }
}

fn winsize(size: WindowSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

struct PtyControl {
    master: OwnedFd,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessControl for PtyControl {
    fn resize(&self, size: WindowSize) -> Result<()> {
        let ws = winsize(size);
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws as *const Winsize) };
        if rc != 0 {
            return Err(Error::Spawn(format!("resize: {}", std::io::Error::last_os_error())));
        }
        Ok(())
    }

    fn terminate(&self) {
        let sender = self.kill.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

/// Spawns `cmd` on a fresh PTY and wires its master side to channels.
///
/// The returned output channel yields raw chunks in read order. When
/// `on_exit` is given it runs on a blocking thread after the child exits.
pub fn spawn(cmd: PtyCommand, on_exit: Option<Box<dyn FnOnce() + Send>>) -> Result<ProcessHandle> {
    let OpenptyResult { master, slave } =
        openpty(Some(&winsize(cmd.size)), None).map_err(|e| Error::Spawn(format!("openpty: {e}")))?;
    // The child only gets the slave side.
    unsafe {
        libc::fcntl(master.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
    }

    let mut child = {
        let mut command = tokio::process::Command::new(&cmd.program);
        command.args(&cmd.args);
        if cmd.clear_env {
            command.env_clear();
        }
        command.envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(cwd) = &cmd.cwd {
            command.current_dir(cwd);
        }
        let stdin = slave.try_clone().map_err(|e| Error::Spawn(format!("dup pty: {e}")))?;
        let stdout = slave.try_clone().map_err(|e| Error::Spawn(format!("dup pty: {e}")))?;
        command
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(slave))
            .kill_on_drop(true);

        let setup = ChildSetup::new(cmd.jail.as_ref())?;
        unsafe {
            command.pre_exec(move || setup.apply());
        }

        command
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", cmd.program, e)))?
        // `command` drops here, closing our copies of the slave side.
    };
    let pid = child.id().unwrap_or(0);
    info!(pid, program = %cmd.program, "pty process started");

    let resize_fd = master.try_clone().map_err(|e| Error::Spawn(format!("dup pty: {e}")))?;
    let mut reader = File::from(master);
    let mut writer = reader.try_clone().map_err(|e| Error::Spawn(format!("dup pty: {e}")))?;

    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(256);
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(256);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    tokio::task::spawn_blocking(move || {
        let mut buffer = [0u8; 8192];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => {
                    if output_tx.blocking_send(buffer[..count].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO once the slave side is fully closed.
                Err(_) => break,
            }
        }
        debug!(pid, "pty reader finished");
    });

    tokio::task::spawn_blocking(move || {
        while let Some(payload) = input_rx.blocking_recv() {
            if writer.write_all(&payload).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                if let Err(e) = child.start_kill() {
                    warn!(pid, error = %e, "failed to kill pty process");
                }
                child.wait().await
            }
        };
        match status {
            Ok(status) => info!(pid, code = ?status.code(), "pty process exited"),
            Err(e) => warn!(pid, error = %e, "waiting for pty process failed"),
        }
        if let Some(on_exit) = on_exit {
            let _ = tokio::task::spawn_blocking(on_exit).await;
        }
    });

    Ok(ProcessHandle {
        output: output_rx,
        input: input_tx,
        control: Box::new(PtyControl {
            master: resize_fd,
            kill: Mutex::new(Some(kill_tx)),
        }),
    })
}

/// Everything the child does between fork and exec. Strings are converted
/// up front so the closure does not allocate.
struct ChildSetup {
    jail: Option<(CString, CString, JailLimits)>,
}

impl ChildSetup {
    fn new(jail: Option<&JailSpec>) -> Result<Self> {
        let jail = match jail {
            Some(spec) => {
                let root = CString::new(spec.root.as_os_str().as_bytes())
                    .map_err(|e| Error::Spawn(format!("jail root: {e}")))?;
                let workdir =
                    CString::new(spec.workdir.as_bytes()).map_err(|e| Error::Spawn(format!("jail workdir: {e}")))?;
                Some((root, workdir, spec.limits))
            }
            None => None,
        };
        Ok(Self { jail })
    }

    fn apply(&self) -> std::io::Result<()> {
        unsafe {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        if let Some((root, workdir, limits)) = &self.jail {
            jail::enter(root, workdir, limits)?;
        }
        Ok(())
    }
}
