//! In-memory stand-ins for the sandbox backend, the shell launcher and the
//! advice provider.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::advice::AdviceError;
use crate::config::ResourceLimits;
use crate::error::{Error, Result};
use crate::launcher::{Confinement, LocalIdentity, ShellLauncher};
use crate::provider::AdviceProvider;
use crate::pty::{ProcessControl, ProcessHandle, WindowSize};
use crate::sandbox::{Endpoint, Sandbox, SandboxBackend, SandboxKey, SandboxState, SandboxStatus, SandboxSummary};

struct FakeContainer {
    key: SandboxKey,
    state: SandboxState,
    port: u16,
    readiness_checks: u32,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    next_port: u16,
}

/// Sandbox backend keeping containers in a map.
pub struct FakeBackend {
    state: Mutex<FakeState>,
    /// Probe attempt (1-based) that first succeeds; `None` never does.
    ready_on: Option<u32>,
    fail_create: bool,
    creates: AtomicUsize,
    starts: AtomicUsize,
    execs: AtomicUsize,
    removes: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                containers: HashMap::new(),
                next_port: 40022,
            }),
            ready_on: Some(1),
            fail_create: false,
            creates: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        }
    }

    pub fn ready_after(mut self, attempts: u32) -> Self {
        self.ready_on = Some(attempts);
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.ready_on = None;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn exec_calls(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, name: &str, state: SandboxState) {
        if let Some(container) = self.state.lock().unwrap_or_else(|e| e.into_inner()).containers.get_mut(name) {
            container.state = state;
        }
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, name: &str, key: &SandboxKey, _limits: &ResourceLimits) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to interleave.
        tokio::time::sleep(Duration::from_millis(50)).await;
        if self.fail_create {
            return Err(Error::Backend("image not found".to_string()));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let port = state.next_port;
        state.next_port += 1;
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                key: key.clone(),
                state: SandboxState::Running,
                port,
                readiness_checks: 0,
            },
        );
        Ok(format!("id-{name}"))
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::Backend(format!("no such container {name}")))?;
        container.state = SandboxState::Running;
        container.readiness_checks = 0;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        if let Some(container) = self.state.lock().unwrap_or_else(|e| e.into_inner()).containers.get_mut(name) {
            container.state = SandboxState::Stopped;
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap_or_else(|e| e.into_inner()).containers.remove(name);
        Ok(())
    }

    async fn exec(&self, name: &str, _argv: &[String]) -> Result<String> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::Backend(format!("no such container {name}")))?;
        container.readiness_checks += 1;
        match self.ready_on {
            Some(n) if container.readiness_checks >= n => Ok("1\n".to_string()),
            _ => Err(Error::Backend("sshd not running".to_string())),
        }
    }

    async fn inspect(&self, name: &str) -> Result<SandboxStatus> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(match state.containers.get(name) {
            None => SandboxStatus::absent(),
            Some(container) => SandboxStatus {
                state: container.state,
                endpoint: (container.state == SandboxState::Running).then(|| Endpoint {
                    host: "127.0.0.1".to_string(),
                    port: container.port,
                }),
            },
        })
    }

    async fn list(&self) -> Result<Vec<SandboxSummary>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<SandboxSummary> = state
            .containers
            .iter()
            .map(|(name, c)| SandboxSummary {
                name: name.clone(),
                key: Some(c.key.clone()),
                state: c.state,
                endpoint: None,
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

struct ScriptedControl {
    kill: Mutex<Option<oneshot::Sender<()>>>,
    resizes: Arc<Mutex<Vec<WindowSize>>>,
}

impl ProcessControl for ScriptedControl {
    fn resize(&self, size: WindowSize) -> Result<()> {
        self.resizes.lock().unwrap_or_else(|e| e.into_inner()).push(size);
        Ok(())
    }

    fn terminate(&self) {
        if let Some(kill) = self.kill.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = kill.send(());
        }
    }
}

/// What a scripted shell answers, keyed by command prefix.
#[derive(Clone, Default)]
pub struct Script {
    pub responses: Vec<(String, String)>,
    /// Commands whose output arrives one line per interval.
    pub streams: Vec<(String, Vec<String>, Duration)>,
}

/// Spawns a fake shell: echoes input the way a PTY does, answers scripted
/// commands, prints `$ ` after each and exits on `exit`.
pub fn scripted_shell(script: Script, resizes: Arc<Mutex<Vec<WindowSize>>>) -> ProcessHandle {
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        if output_tx.send(b"$ ".to_vec()).await.is_err() {
            return;
        }
        let mut line = String::new();
        loop {
            let payload = tokio::select! {
                payload = input_rx.recv() => match payload {
                    Some(payload) => payload,
                    None => return,
                },
                _ = &mut kill_rx => return,
            };
            let text = String::from_utf8_lossy(&payload).into_owned();
            let mut echo = String::new();
            let mut replies = Vec::new();
            for c in text.chars() {
                match c {
                    '\r' | '\n' => {
                        echo.push_str("\r\n");
                        replies.push(std::mem::take(&mut line));
                    }
                    '\u{7f}' => {
                        line.pop();
                        echo.push_str("\u{8} \u{8}");
                    }
                    c => {
                        line.push(c);
                        echo.push(c);
                    }
                }
            }
            if output_tx.send(echo.into_bytes()).await.is_err() {
                return;
            }
            for command in replies {
                let command = command.trim().to_string();
                if command == "exit" {
                    return;
                }
                if let Some((_, lines, interval)) = script
                    .streams
                    .iter()
                    .find(|(prefix, _, _)| command.starts_with(prefix.as_str()))
                {
                    for (i, line) in lines.iter().enumerate() {
                        if i > 0 {
                            tokio::time::sleep(*interval).await;
                        }
                        if output_tx.send(line.clone().into_bytes()).await.is_err() {
                            return;
                        }
                    }
                    tokio::time::sleep(*interval).await;
                    if output_tx.send(b"$ ".to_vec()).await.is_err() {
                        return;
                    }
                    continue;
                }
                let reply = script
                    .responses
                    .iter()
                    .find(|(prefix, _)| !command.is_empty() && command.starts_with(prefix.as_str()))
                    .map(|(_, reply)| reply.clone())
                    .unwrap_or_default();
                let mut chunk = reply;
                chunk.push_str("$ ");
                if output_tx.send(chunk.into_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });

    ProcessHandle {
        output: output_rx,
        input: input_tx,
        control: Box::new(ScriptedControl {
            kill: Mutex::new(Some(kill_tx)),
            resizes,
        }),
    }
}

/// Launcher handing out scripted shells.
pub struct ScriptedLauncher {
    script: Script,
    fail_connect: bool,
    fail_local: bool,
    connects: AtomicUsize,
    locals: Mutex<Vec<Confinement>>,
    pub resizes: Arc<Mutex<Vec<WindowSize>>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self {
            script: Script {
                responses: vec![
                    (
                        "nmap -djf".to_string(),
                        "nmap: unrecognized option '-djf'\r\nSee the output of nmap -h for a summary of options.\r\nQUITTING!\r\n"
                            .to_string(),
                    ),
                    ("whoami".to_string(), "student\r\n".to_string()),
                    (
                        "cat /etc/shadow".to_string(),
                        "cat: /etc/shadow: Permission denied\r\n".to_string(),
                    ),
                ],
                streams: Vec::new(),
            },
            fail_connect: false,
            fail_local: false,
            connects: AtomicUsize::new(0),
            locals: Mutex::new(Vec::new()),
            resizes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Makes `prefix` print `lines` one per `interval`, then a prompt.
    pub fn with_stream(mut self, prefix: &str, lines: Vec<String>, interval: Duration) -> Self {
        self.script.streams.push((prefix.to_string(), lines, interval));
        self
    }

    pub fn failing_local(mut self) -> Self {
        self.fail_local = true;
        self
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn local_calls(&self) -> Vec<Confinement> {
        self.locals.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for ScriptedLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellLauncher for ScriptedLauncher {
    async fn connect(&self, sandbox: &Sandbox, _size: WindowSize) -> Result<ProcessHandle> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(Error::Connect {
                endpoint: sandbox.endpoint.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(scripted_shell(self.script.clone(), self.resizes.clone()))
    }

    async fn spawn_local(
        &self,
        _identity: &LocalIdentity,
        confinement: Confinement,
        _size: WindowSize,
    ) -> Result<ProcessHandle> {
        self.locals.lock().unwrap_or_else(|e| e.into_inner()).push(confinement);
        if self.fail_local {
            return Err(Error::Spawn("jailed shells need root".to_string()));
        }
        Ok(scripted_shell(self.script.clone(), self.resizes.clone()))
    }
}

pub struct FailingProvider;

#[async_trait]
impl AdviceProvider for FailingProvider {
    async fn complete(&self, _system: &str, _prompt: &str, _max_tokens: u32) -> Result<String, AdviceError> {
        Err(AdviceError::Transport("connection reset".to_string()))
    }
}

pub struct PanickingProvider;

#[async_trait]
impl AdviceProvider for PanickingProvider {
    async fn complete(&self, _system: &str, _prompt: &str, _max_tokens: u32) -> Result<String, AdviceError> {
        panic!("provider bug");
    }
}

pub struct SlowProvider(pub Duration);

#[async_trait]
impl AdviceProvider for SlowProvider {
    async fn complete(&self, _system: &str, _prompt: &str, _max_tokens: u32) -> Result<String, AdviceError> {
        tokio::time::sleep(self.0).await;
        Ok("too late".to_string())
    }
}

/// Answers every prompt with the same text and records what it was asked.
pub struct FixedProvider {
    text: String,
    calls: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

impl FixedProvider {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AdviceProvider for FixedProvider {
    async fn complete(&self, _system: &str, prompt: &str, _max_tokens: u32) -> Result<String, AdviceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap_or_else(|e| e.into_inner()) = Some(prompt.to_string());
        Ok(self.text.clone())
    }
}

/// Answers after a delay and records how many calls overlapped.
pub struct SlowCountingProvider {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowCountingProvider {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdviceProvider for SlowCountingProvider {
    async fn complete(&self, _system: &str, _prompt: &str, _max_tokens: u32) -> Result<String, AdviceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok("Try `id` to see your groups.".to_string())
    }
}
