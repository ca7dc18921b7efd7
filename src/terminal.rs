//! Live terminal sessions.
//!
//! Each session owns one process handle. A pump task relays the process
//! output to subscribers in order, appends it to the session's output
//! buffer and, when the chunk looks like a command finished, arms the
//! session's debounce slot. The armed task waits for the output to settle,
//! then runs one analysis pass off the relay path and posts the resulting
//! suggestion on the same event channel.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::activity::{self, CommandBuffer, OutputBuffer, Utf8Stream};
use crate::advice::{AdvicePipeline, AnalysisRequest, HistoryEntry, Suggestion};
use crate::config::{FallbackPolicy, TerminalSettings};
use crate::debounce::DeferredSlot;
use crate::error::{Error, Result};
use crate::launcher::{Confinement, LocalIdentity, ShellLauncher};
use crate::pty::{ProcessControl, ProcessHandle, WindowSize};
use crate::registry::SandboxRegistry;
use crate::sandbox::SandboxKey;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Sandboxed,
    Fallback,
}

/// What subscribers of a session receive, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    Output(String),
    Suggestion(Suggestion),
    Closed,
}

pub struct OpenedSession {
    pub session_id: String,
    pub mode: SessionMode,
    /// Lines to show the client before any process output.
    pub notices: Vec<String>,
    pub events: broadcast::Receiver<TerminalEvent>,
}

pub struct AttachedSession {
    pub mode: SessionMode,
    pub events: broadcast::Receiver<TerminalEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub student_id: String,
    pub course_name: String,
    /// `None` for local fallback sessions.
    pub sandbox: Option<SandboxKey>,
    pub mode: SessionMode,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub subscribers: usize,
    pub analysis_pending: bool,
}

struct Activity {
    commands: CommandBuffer,
    output: OutputBuffer,
    history: VecDeque<HistoryEntry>,
    last_command: Option<String>,
    last_input: Instant,
    closed: bool,
}

struct Session {
    id: String,
    student_id: String,
    course_name: String,
    sandbox: Option<SandboxKey>,
    mode: SessionMode,
    created_at: SystemTime,
    started: Instant,
    input: mpsc::Sender<Vec<u8>>,
    control: Box<dyn ProcessControl>,
    events: broadcast::Sender<TerminalEvent>,
    activity: Mutex<Activity>,
    slot: DeferredSlot,
}

impl Session {
    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks the session closed, stops pending analysis and the process.
    /// Returns false if it was already closed.
    fn shutdown(&self) -> bool {
        {
            let mut activity = self.activity();
            if activity.closed {
                return false;
            }
            activity.closed = true;
        }
        self.slot.cancel();
        self.control.terminate();
        let _ = self.events.send(TerminalEvent::Closed);
        true
    }

    /// Posts a suggestion unless the session closed in the meantime.
    fn deliver(&self, suggestion: Suggestion) {
        let activity = self.activity();
        if activity.closed {
            debug!(session_id = %self.id, "dropping suggestion for closed session");
            return;
        }
        info!(session_id = %self.id, title = %suggestion.title, "suggestion delivered");
        let _ = self.events.send(TerminalEvent::Suggestion(suggestion));
    }

    fn summary(&self, now: Instant) -> SessionSummary {
        let activity = self.activity();
        let last_seen = activity.last_input.max(activity.output.last_update());
        SessionSummary {
            id: self.id.clone(),
            student_id: self.student_id.clone(),
            course_name: self.course_name.clone(),
            sandbox: self.sandbox.clone(),
            mode: self.mode,
            created_at: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            age_secs: now.saturating_duration_since(self.started).as_secs(),
            idle_secs: now.saturating_duration_since(last_seen).as_secs(),
            subscribers: self.events.receiver_count(),
            analysis_pending: self.slot.is_pending(),
        }
    }
}

/// Timing and size knobs of the analysis path.
struct AnalysisSettings {
    debounce: Duration,
    min_quiet: Duration,
    min_output_len: usize,
    history_len: usize,
}

type SessionTable = Arc<RwLock<HashMap<String, Arc<Session>>>>;

pub struct TerminalManager {
    registry: Arc<SandboxRegistry>,
    launcher: Arc<dyn ShellLauncher>,
    advice: Arc<AdvicePipeline>,
    settings: TerminalSettings,
    analysis: Arc<AnalysisSettings>,
    sessions: SessionTable,
}

impl TerminalManager {
    pub fn new(
        registry: Arc<SandboxRegistry>,
        launcher: Arc<dyn ShellLauncher>,
        advice: Arc<AdvicePipeline>,
        settings: TerminalSettings,
    ) -> Self {
        let analysis = Arc::new(AnalysisSettings {
            debounce: settings.debounce,
            min_quiet: settings.min_quiet,
            min_output_len: settings.min_output_len,
            history_len: settings.history_len,
        });
        Self {
            registry,
            launcher,
            advice,
            settings,
            analysis,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn advice(&self) -> &Arc<AdvicePipeline> {
        &self.advice
    }

    pub fn default_size(&self) -> WindowSize {
        WindowSize {
            rows: self.settings.rows,
            cols: self.settings.cols,
        }
    }

    /// Opens a terminal for the student, in their sandbox when possible and
    /// in a local shell when the fallback policy allows it.
    pub async fn open(&self, student_id: &str, course_name: &str, size: WindowSize) -> Result<OpenedSession> {
        let key = SandboxKey::from_identity(student_id, course_name);
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut notices = vec!["Preparing your lab environment...".to_string()];

        let sandboxed = match self.registry.resolve_or_create(&key).await {
            Ok(sandbox) => self.launcher.connect(&sandbox, size).await.map(|handle| (sandbox, handle)),
            Err(e) => Err(e),
        };

        let (handle, mode, bound) = match sandboxed {
            Ok((sandbox, handle)) => {
                notices.push(format!("Container ready: {}", sandbox.name));
                (handle, SessionMode::Sandboxed, Some(key))
            }
            Err(e) => {
                let reason = e.client_message();
                let handle = self.fallback(student_id, course_name, &session_id, size, e).await?;
                notices.push(reason);
                notices.push("Local terminal mode: this shell is not your lab container.".to_string());
                (handle, SessionMode::Fallback, None)
            }
        };

        let ProcessHandle { output, input, control } = handle;
        let (events, receiver) = broadcast::channel(EVENT_CAPACITY);
        let now = Instant::now();
        let session = Arc::new(Session {
            id: session_id.clone(),
            student_id: student_id.to_string(),
            course_name: course_name.to_string(),
            sandbox: bound,
            mode,
            created_at: SystemTime::now(),
            started: now,
            input,
            control,
            events,
            activity: Mutex::new(Activity {
                commands: CommandBuffer::new(),
                output: OutputBuffer::default(),
                history: VecDeque::new(),
                last_command: None,
                last_input: now,
                closed: false,
            }),
            slot: DeferredSlot::new(),
        });

        self.sessions.write().await.insert(session_id.clone(), session.clone());
        tokio::spawn(pump(
            session,
            output,
            self.sessions.clone(),
            self.advice.clone(),
            self.analysis.clone(),
        ));
        info!(session_id = %session_id, student = %student_id, course = %course_name, mode = ?mode, "session opened");

        Ok(OpenedSession {
            session_id,
            mode,
            notices,
            events: receiver,
        })
    }

    async fn fallback(
        &self,
        student_id: &str,
        course_name: &str,
        session_id: &str,
        size: WindowSize,
        cause: Error,
    ) -> Result<ProcessHandle> {
        let confinement = match self.settings.fallback {
            FallbackPolicy::Deny => {
                warn!(student = %student_id, error = %cause, "sandbox unavailable and fallback denied");
                // Provisioning errors pass through unchanged.
                return Err(match cause {
                    Error::Connect { .. } => Error::FallbackDisabled,
                    other => other,
                });
            }
            FallbackPolicy::Jailed => Confinement::Jailed,
            FallbackPolicy::Host => Confinement::Host,
        };
        warn!(student = %student_id, error = %cause, confinement = ?confinement, "sandbox unavailable, starting local shell");
        let identity = LocalIdentity {
            student_id: student_id.to_string(),
            course_name: course_name.to_string(),
            session_id: session_id.to_string(),
        };
        self.launcher.spawn_local(&identity, confinement, size).await
    }

    /// Subscribes another client to a live session.
    pub async fn attach(&self, session_id: &str) -> Option<AttachedSession> {
        let session = self.get(session_id).await?;
        Some(AttachedSession {
            mode: session.mode,
            events: session.events.subscribe(),
        })
    }

    async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Writes client input to the session's process. Unknown ids are
    /// ignored.
    pub async fn send_input(&self, session_id: &str, data: &str) {
        let Some(session) = self.get(session_id).await else {
            debug!(session_id = %session_id, "input for unknown session dropped");
            return;
        };
        {
            let mut activity = session.activity();
            activity.last_input = Instant::now();
            if let Some(command) = activity.commands.feed(data).pop() {
                debug!(session_id = %session_id, command = %command, "command finalized");
                activity.last_command = Some(command);
            }
        }
        if session.input.send(data.as_bytes().to_vec()).await.is_err() {
            debug!(session_id = %session_id, "process input closed");
        }
    }

    pub async fn resize(&self, session_id: &str, size: WindowSize) -> Result<()> {
        match self.get(session_id).await {
            Some(session) => session.control.resize(size),
            None => Ok(()),
        }
    }

    /// Ends a session. Closing an unknown or already closed id is a no-op.
    pub async fn close(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(session) = removed {
            if session.shutdown() {
                info!(session_id = %session_id, "session closed");
            }
        }
    }

    /// Runs the advice pipeline for an explicit question, using the
    /// session's recent activity without consuming it.
    pub async fn ask(&self, session_id: &str, question: &str) -> Option<Suggestion> {
        let session = self.get(session_id).await?;
        let request = {
            let state = session.activity();
            let output = state.output.as_str().to_string();
            AnalysisRequest {
                student_id: session.student_id.clone(),
                command: state.last_command.clone(),
                error_output: activity::extract_errors(&output),
                output,
                history: state.history.iter().cloned().collect(),
                question: Some(question.to_string()),
            }
        };
        self.advice.analyze(&request).await
    }

    pub async fn last_command(&self, session_id: &str) -> Option<String> {
        let session = self.get(session_id).await?;
        let command = session.activity().last_command.clone();
        command
    }

    pub async fn list_active(&self) -> Vec<SessionSummary> {
        let now = Instant::now();
        let mut all: Vec<SessionSummary> = self
            .sessions
            .read()
            .await
            .values()
            .map(|session| session.summary(now))
            .collect();
        all.sort_by(|a, b| b.age_secs.cmp(&a.age_secs).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Closes every session bound to the sandbox, then resets it. Returns
    /// how many sessions were closed.
    pub async fn reset_sandbox(&self, key: &SandboxKey) -> Result<usize> {
        let bound: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.sandbox.as_ref() == Some(key))
            .map(|s| s.id.clone())
            .collect();
        for id in &bound {
            self.close(id).await;
        }
        self.registry.reset(key).await?;
        info!(sandbox = %key, closed = bound.len(), "sandbox reset by operator");
        Ok(bound.len())
    }

    /// Closes sessions nobody is watching that have been quiet longer than
    /// the idle TTL.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let ttl = self.settings.idle_ttl;
        let expired: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| {
                let summary = s.summary(now);
                summary.subscribers == 0 && Duration::from_secs(summary.idle_secs) > ttl
            })
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            info!(session_id = %id, "reaping idle session");
            self.close(id).await;
        }
        expired.len()
    }
}

/// Relays process output until the process goes away, then retires the
/// session.
async fn pump(
    session: Arc<Session>,
    mut output: mpsc::Receiver<Vec<u8>>,
    sessions: SessionTable,
    advice: Arc<AdvicePipeline>,
    analysis: Arc<AnalysisSettings>,
) {
    let mut decoder = Utf8Stream::default();
    while let Some(chunk) = output.recv().await {
        let text = decoder.decode(&chunk);
        if text.is_empty() {
            continue;
        }
        relay(&session, text, &advice, &analysis);
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        relay(&session, tail, &advice, &analysis);
    }

    {
        let mut table = sessions.write().await;
        if table.get(&session.id).is_some_and(|s| Arc::ptr_eq(s, &session)) {
            table.remove(&session.id);
        }
    }
    if session.shutdown() {
        info!(session_id = %session.id, "process exited, session closed");
    }
}

fn relay(session: &Arc<Session>, text: String, advice: &Arc<AdvicePipeline>, analysis: &Arc<AnalysisSettings>) {
    let trigger = {
        let mut activity = session.activity();
        if activity.closed {
            return;
        }
        activity.output.append(&text);
        activity::should_trigger(&text)
    };
    if trigger {
        schedule_analysis(session, advice, analysis);
    }
    let _ = session.events.send(TerminalEvent::Output(text));
}

fn schedule_analysis(session: &Arc<Session>, advice: &Arc<AdvicePipeline>, analysis: &Arc<AnalysisSettings>) {
    let task_session = session.clone();
    let advice = advice.clone();
    let analysis = analysis.clone();
    let armed = session.slot.schedule_if_absent(move |armed| async move {
        tokio::time::sleep(analysis.debounce).await;
        if !settled(&task_session, analysis.min_quiet).await {
            debug!(session_id = %task_session.id, "output still arriving, skipping analysis");
            return;
        }
        // Held until the pass is over, so passes never overlap.
        run_pass(&task_session, &advice, &analysis).await;
        armed.release();
    });
    if armed {
        debug!(session_id = %session.id, "analysis scheduled");
    }
}

/// Waits at most once for the output buffer to go quiet.
async fn settled(session: &Session, min_quiet: Duration) -> bool {
    let quiet = session.activity().output.quiet_for();
    if quiet >= min_quiet {
        return true;
    }
    tokio::time::sleep(min_quiet - quiet).await;
    let quiet = session.activity().output.quiet_for();
    quiet >= min_quiet
}

async fn run_pass(session: &Session, advice: &AdvicePipeline, analysis: &AnalysisSettings) {
    let request = {
        let mut state = session.activity();
        if state.closed {
            return;
        }
        let output = state.output.take();
        let command = state
            .commands
            .take_unclaimed()
            .or_else(|| activity::attribute_command(&output));
        let errors = activity::extract_errors(&output);
        if !activity::worth_analyzing(command.as_deref(), &output, &errors, analysis.min_output_len) {
            debug!(session_id = %session.id, chars = output.len(), "nothing worth analyzing");
            return;
        }
        if let Some(command) = &command {
            state.history.push_back(HistoryEntry {
                command: command.clone(),
                had_error: !errors.is_empty(),
            });
            while state.history.len() > analysis.history_len {
                state.history.pop_front();
            }
        }
        AnalysisRequest {
            student_id: session.student_id.clone(),
            command,
            output,
            error_output: errors,
            history: state.history.iter().cloned().collect(),
            question: None,
        }
    };
    debug!(session_id = %session.id, command = ?request.command, "running analysis pass");
    if let Some(suggestion) = advice.analyze(&request).await {
        session.deliver(suggestion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advice::{AdviceStrategy, SuggestionKind};
    use crate::config::{PromptLimits, ReadinessSettings, ResourceLimits};
    use crate::registry::RegistrySettings;
    use crate::testing::{FakeBackend, FixedProvider, ScriptedLauncher, SlowCountingProvider};

    struct Harness {
        backend: Arc<FakeBackend>,
        launcher: Arc<ScriptedLauncher>,
        manager: TerminalManager,
    }

    fn harness_with(backend: FakeBackend, launcher: ScriptedLauncher, settings: TerminalSettings) -> Harness {
        harness_full(backend, launcher, settings, AdvicePipeline::heuristic())
    }

    fn harness_full(
        backend: FakeBackend,
        launcher: ScriptedLauncher,
        settings: TerminalSettings,
        advice: AdvicePipeline,
    ) -> Harness {
        let backend = Arc::new(backend);
        let launcher = Arc::new(launcher);
        let registry = Arc::new(SandboxRegistry::new(
            backend.clone(),
            RegistrySettings {
                name_prefix: "hax".to_string(),
                limits: ResourceLimits::default(),
                readiness: ReadinessSettings {
                    max_attempts: 3,
                    ..ReadinessSettings::default()
                },
            },
        ));
        let manager = TerminalManager::new(registry, launcher.clone(), Arc::new(advice), settings);
        Harness {
            backend,
            launcher,
            manager,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeBackend::new(), ScriptedLauncher::new(), TerminalSettings::default())
    }

    async fn next_suggestion(events: &mut broadcast::Receiver<TerminalEvent>) -> Option<Suggestion> {
        let wait = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match events.recv().await {
                    Ok(TerminalEvent::Suggestion(s)) => return Some(s),
                    Ok(TerminalEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return None,
                    Ok(TerminalEvent::Output(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        });
        wait.await.ok().flatten()
    }

    async fn output_until(events: &mut broadcast::Receiver<TerminalEvent>, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match events.recv().await {
                Ok(TerminalEvent::Output(text)) => seen.push_str(&text),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn nmap_typo_gets_a_syntax_suggestion() {
        let h = harness();
        let mut opened = h
            .manager
            .open("alice", "cs101", WindowSize::default())
            .await
            .unwrap();
        assert_eq!(opened.mode, SessionMode::Sandboxed);
        assert!(opened.notices.iter().any(|n| n.contains("hax-cs101-alice")));

        h.manager.send_input(&opened.session_id, "nmap -djf 127.0.0.1\r").await;
        assert_eq!(
            h.manager.last_command(&opened.session_id).await.as_deref(),
            Some("nmap -djf 127.0.0.1")
        );

        let suggestion = next_suggestion(&mut opened.events).await.unwrap();
        assert_eq!(suggestion.kind, SuggestionKind::ErrorHelp);
        assert_eq!(suggestion.title, "Nmap syntax error");
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_triggers_runs_one_pass_over_the_latest_buffer() {
        let provider = Arc::new(FixedProvider::new("Try `whoami` next."));
        let advice = AdvicePipeline::new(
            AdviceStrategy::External {
                name: "stub".to_string(),
                provider: provider.clone(),
            },
            Duration::from_secs(10),
            PromptLimits::default(),
        );
        let h = harness_full(FakeBackend::new(), ScriptedLauncher::new(), TerminalSettings::default(), advice);
        let mut opened = h.manager.open("alice", "cs101", WindowSize::default()).await.unwrap();
        let id = opened.session_id.clone();
        output_until(&mut opened.events, "$ ").await;

        // Let the pass armed by the first prompt run and find nothing.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(provider.calls(), 0);

        h.manager.send_input(&id, "cat /etc/shadow\r").await;
        output_until(&mut opened.events, "Permission denied").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.manager.send_input(&id, "whoami\r").await;
        output_until(&mut opened.events, "student").await;

        let suggestion = next_suggestion(&mut opened.events).await.unwrap();
        assert_eq!(suggestion.command.as_deref(), Some("whoami"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(provider.calls(), 1);

        let prompt = provider.last_prompt().unwrap();
        assert!(prompt.contains("Command: whoami"), "{prompt}");
        assert!(prompt.contains("Permission denied"), "{prompt}");
    }

    #[tokio::test(start_paused = true)]
    async fn passes_for_one_session_never_overlap() {
        let provider = Arc::new(SlowCountingProvider::new(Duration::from_secs(3)));
        let advice = AdvicePipeline::new(
            AdviceStrategy::External {
                name: "slow".to_string(),
                provider: provider.clone(),
            },
            Duration::from_secs(10),
            PromptLimits::default(),
        );
        let h = harness_full(FakeBackend::new(), ScriptedLauncher::new(), TerminalSettings::default(), advice);
        let mut opened = h.manager.open("alice", "cs101", WindowSize::default()).await.unwrap();
        let id = opened.session_id.clone();
        output_until(&mut opened.events, "$ ").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(provider.calls(), 0);

        h.manager.send_input(&id, "cat /etc/shadow\r").await;
        output_until(&mut opened.events, "Permission denied").await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(provider.calls(), 1);
        assert!(h.manager.list_active().await[0].analysis_pending);

        // Triggers while the provider is still thinking do not arm a pass.
        h.manager.send_input(&id, "whoami\r").await;
        output_until(&mut opened.events, "student").await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(provider.calls(), 1);
        assert!(!h.manager.list_active().await[0].analysis_pending);

        h.manager.send_input(&id, "whoami\r").await;
        output_until(&mut opened.events, "student").await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(provider.calls(), 2);
        assert_eq!(provider.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_output_skips_the_pass_without_rearming() {
        let provider = Arc::new(FixedProvider::new("Try `tcpdump -c 10` to stop after ten packets."));
        let advice = AdvicePipeline::new(
            AdviceStrategy::External {
                name: "stub".to_string(),
                provider: provider.clone(),
            },
            Duration::from_secs(10),
            PromptLimits::default(),
        );
        let mut lines = vec!["tcpdump: error opening eth1, using eth0\r\n".to_string()];
        lines.extend((1..=20).map(|i| format!("packet {i} len 60\r\n")));
        let launcher = ScriptedLauncher::new().with_stream("tcpdump", lines, Duration::from_millis(100));
        let h = harness_full(FakeBackend::new(), launcher, TerminalSettings::default(), advice);
        let mut opened = h.manager.open("alice", "cs101", WindowSize::default()).await.unwrap();
        let id = opened.session_id.clone();
        output_until(&mut opened.events, "$ ").await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        h.manager.send_input(&id, "tcpdump -i eth1\r").await;
        output_until(&mut opened.events, "error opening").await;
        assert!(h.manager.list_active().await[0].analysis_pending);

        // Past the debounce and the one extra quiet wait, lines still arrive.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(provider.calls(), 0);
        assert!(!h.manager.list_active().await[0].analysis_pending);

        output_until(&mut opened.events, "packet 20 ").await;
        assert_eq!(provider.calls(), 0);
        assert!(!h.manager.list_active().await[0].analysis_pending);

        // The closing prompt triggers a pass over everything buffered.
        let suggestion = next_suggestion(&mut opened.events).await.unwrap();
        assert_eq!(suggestion.command.as_deref(), Some("tcpdump -c 10"));
        assert_eq!(provider.calls(), 1);
        let prompt = provider.last_prompt().unwrap();
        assert!(prompt.contains("Command: tcpdump -i eth1"), "{prompt}");
        assert!(prompt.contains("packet 1 len 60"), "{prompt}");
    }

    #[tokio::test(start_paused = true)]
    async fn closing_cancels_pending_analysis() {
        let h = harness();
        let mut opened = h.manager.open("alice", "cs101", WindowSize::default()).await.unwrap();
        let id = opened.session_id.clone();
        output_until(&mut opened.events, "$ ").await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        h.manager.send_input(&id, "nmap -djf 127.0.0.1\r").await;
        output_until(&mut opened.events, "QUITTING").await;
        let pending = h.manager.list_active().await;
        assert!(pending[0].analysis_pending);

        h.manager.close(&id).await;
        assert!(h.manager.list_active().await.is_empty());
        assert!(next_suggestion(&mut opened.events).await.is_none());

        // Closing again is harmless.
        h.manager.close(&id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_falls_back_to_a_local_shell() {
        let h = harness_with(
            FakeBackend::new(),
            ScriptedLauncher::new().failing_connect(),
            TerminalSettings::default(),
        );
        let opened = h.manager.open("alice", "cs101", WindowSize::default()).await.unwrap();
        assert_eq!(opened.mode, SessionMode::Fallback);
        assert_eq!(h.launcher.local_calls(), vec![Confinement::Jailed]);
        assert!(opened.notices.iter().any(|n| n.contains("Local terminal mode")));

        let sessions = h.manager.list_active().await;
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].sandbox.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn provision_failure_under_host_policy_uses_host_shell() {
        let settings = TerminalSettings {
            fallback: FallbackPolicy::Host,
            ..TerminalSettings::default()
        };
        let h = harness_with(FakeBackend::new().failing_create(), ScriptedLauncher::new(), settings);
        let opened = h.manager.open("alice", "cs101", WindowSize::default()).await.unwrap();
        assert_eq!(opened.mode, SessionMode::Fallback);
        assert_eq!(h.launcher.local_calls(), vec![Confinement::Host]);
        assert_eq!(h.launcher.connect_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deny_policy_surfaces_the_original_error() {
        let settings = TerminalSettings {
            fallback: FallbackPolicy::Deny,
            ..TerminalSettings::default()
        };
        let h = harness_with(FakeBackend::new().never_ready(), ScriptedLauncher::new(), settings);
        let err = h
            .manager
            .open("alice", "cs101", WindowSize::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Timeout { attempts: 3, .. }), "{err:?}");
        assert!(h.launcher.local_calls().is_empty());
        assert!(h.manager.list_active().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deny_policy_on_connect_failure_reports_fallback_disabled() {
        let settings = TerminalSettings {
            fallback: FallbackPolicy::Deny,
            ..TerminalSettings::default()
        };
        let h = harness_with(FakeBackend::new(), ScriptedLauncher::new().failing_connect(), settings);
        let err = h
            .manager
            .open("alice", "cs101", WindowSize::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::FallbackDisabled), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn jailed_fallback_that_cannot_confine_fails_the_open() {
        let h = harness_with(
            FakeBackend::new(),
            ScriptedLauncher::new().failing_connect().failing_local(),
            TerminalSettings::default(),
        );
        let err = h
            .manager
            .open("alice", "cs101", WindowSize::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Spawn(_)), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_session_operations_are_no_ops() {
        let h = harness();
        h.manager.send_input("missing", "ls\r").await;
        h.manager.close("missing").await;
        assert!(h.manager.resize("missing", WindowSize { rows: 1, cols: 1 }).await.is_ok());
        assert!(h.manager.attach("missing").await.is_none());
        assert!(h.manager.ask("missing", "help?").await.is_none());
        assert!(h.manager.last_command("missing").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn process_exit_closes_the_session() {
        let h = harness();
        let mut opened = h.manager.open("alice", "cs101", WindowSize::default()).await.unwrap();
        h.manager.send_input(&opened.session_id, "exit\r").await;

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match opened.events.recv().await {
                    Ok(TerminalEvent::Closed) => return true,
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
        })
        .await
        .unwrap();
        assert!(closed);
        assert!(h.manager.list_active().await.is_empty());
        h.manager.send_input(&opened.session_id, "ls\r").await;
    }

    #[tokio::test(start_paused = true)]
    async fn attached_clients_see_the_same_stream() {
        let h = harness();
        let opened = h.manager.open("alice", "cs101", WindowSize::default()).await.unwrap();
        let mut second = h.manager.attach(&opened.session_id).await.unwrap();
        assert_eq!(second.mode, SessionMode::Sandboxed);

        h.manager.send_input(&opened.session_id, "whoami\r").await;
        let seen = output_until(&mut second.events, "student").await;
        assert!(seen.contains("whoami"));
        assert_eq!(h.manager.list_active().await[0].subscribers, 2);

        h.manager
            .resize(&opened.session_id, WindowSize { rows: 50, cols: 132 })
            .await
            .unwrap();
        assert_eq!(
            h.launcher.resizes.lock().unwrap().last(),
            Some(&WindowSize { rows: 50, cols: 132 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ask_answers_without_consuming_the_buffer() {
        let h = harness();
        let mut opened = h.manager.open("alice", "cs101", WindowSize::default()).await.unwrap();
        let id = opened.session_id.clone();
        h.manager.send_input(&id, "cat /etc/shadow\r").await;
        output_until(&mut opened.events, "Permission denied").await;

        let answer = h.manager.ask(&id, "why can't I read this?").await.unwrap();
        assert_eq!(answer.kind, SuggestionKind::ErrorHelp);

        // The debounced pass still sees the same output.
        let suggestion = next_suggestion(&mut opened.events).await.unwrap();
        assert_eq!(suggestion.kind, SuggestionKind::ErrorHelp);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_bound_sessions_and_discards_the_sandbox() {
        let h = harness();
        let opened = h.manager.open("alice", "cs101", WindowSize::default()).await.unwrap();
        h.manager.open("bob", "cs101", WindowSize::default()).await.unwrap();

        let key = SandboxKey::from_identity("alice", "cs101");
        assert_eq!(h.manager.reset_sandbox(&key).await.unwrap(), 1);
        let remaining = h.manager.list_active().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].student_id, "bob");
        assert!(h.manager.attach(&opened.session_id).await.is_none());
        assert_eq!(h.backend.remove_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_unwatched_sessions_are_reaped() {
        let settings = TerminalSettings {
            idle_ttl: Duration::from_secs(60),
            ..TerminalSettings::default()
        };
        let h = harness_with(FakeBackend::new(), ScriptedLauncher::new(), settings);
        let watched = h.manager.open("alice", "cs101", WindowSize::default()).await.unwrap();
        let unwatched = h.manager.open("bob", "cs101", WindowSize::default()).await.unwrap();
        drop(unwatched.events);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.manager.reap_idle().await, 1);
        let remaining = h.manager.list_active().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, watched.session_id);
    }
}
