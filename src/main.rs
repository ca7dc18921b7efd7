//! labterm - lab terminal server.
//!
//! Usage:
//!   labterm serve [--port 8080] [--fallback jailed] [--advice-endpoint URL]

use clap::{Parser, Subcommand};
use labterm::advice::{AdvicePipeline, AdviceStrategy};
use labterm::config::{FallbackPolicy, Settings};
use labterm::docker::DockerBackend;
use labterm::launcher::PtyLauncher;
use labterm::registry::{RegistrySettings, SandboxRegistry};
use labterm::state::AppState;
use labterm::terminal::TerminalManager;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "labterm")]
#[command(about = "Browser terminals into per-student lab sandboxes")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP and WebSocket server
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "LABTERM_PORT", default_value = "8080")]
    port: u16,

    /// Sandbox image
    #[arg(long, env = "LABTERM_IMAGE", default_value = "dfusco/hax-ai-cyber-lab:latest")]
    image: String,

    /// Container name prefix
    #[arg(long, env = "LABTERM_NAME_PREFIX", default_value = "hax")]
    name_prefix: String,

    /// Memory limit per sandbox
    #[arg(long, env = "LABTERM_MEMORY", default_value = "512m")]
    memory: String,

    /// CPU limit per sandbox
    #[arg(long, env = "LABTERM_CPUS", default_value = "0.5")]
    cpus: String,

    /// Milliseconds between readiness probes
    #[arg(long, env = "LABTERM_READY_INTERVAL_MS", default_value = "2000")]
    ready_interval_ms: u64,

    /// Readiness probes before giving up
    #[arg(long, env = "LABTERM_READY_ATTEMPTS", default_value = "30")]
    ready_attempts: u32,

    /// SSH user inside the sandbox
    #[arg(long, env = "LABTERM_SSH_USER", default_value = "student")]
    ssh_user: String,

    /// SSH private key
    #[arg(long, env = "LABTERM_SSH_IDENTITY")]
    ssh_identity: Option<PathBuf>,

    /// What to do when no sandboxed shell can be opened: deny, jailed or host
    #[arg(long, env = "LABTERM_FALLBACK", default_value = "jailed")]
    fallback: FallbackPolicy,

    /// Directory for local fallback shells
    #[arg(long, env = "LABTERM_LOCAL_ROOT", default_value = "/tmp/labterm")]
    local_root: PathBuf,

    /// Shell for local fallback sessions
    #[arg(long, env = "LABTERM_SHELL", default_value = "/bin/bash")]
    shell: String,

    /// Milliseconds between a trigger and its analysis pass
    #[arg(long, env = "LABTERM_DEBOUNCE_MS", default_value = "500")]
    debounce_ms: u64,

    /// Minutes an unwatched, quiet session survives
    #[arg(long, env = "LABTERM_IDLE_TTL_MINS", default_value = "30")]
    idle_ttl_mins: u64,

    /// Completion relay URL; heuristic advice only when unset
    #[arg(long, env = "LABTERM_ADVICE_ENDPOINT")]
    advice_endpoint: Option<String>,

    /// Bearer token for the completion relay
    #[arg(long, env = "LABTERM_ADVICE_API_KEY", hide_env_values = true)]
    advice_api_key: Option<String>,

    /// Seconds to wait for the completion relay
    #[arg(long, env = "LABTERM_ADVICE_TIMEOUT_SECS", default_value = "10")]
    advice_timeout_secs: u64,
}

impl ServeArgs {
    fn settings(self) -> Settings {
        let mut settings = Settings::default();
        settings.docker.image = self.image;
        settings.docker.name_prefix = self.name_prefix;
        settings.docker.limits.memory = self.memory;
        settings.docker.limits.cpus = self.cpus;
        settings.readiness.interval = Duration::from_millis(self.ready_interval_ms);
        settings.readiness.max_attempts = self.ready_attempts;
        settings.ssh.user = self.ssh_user;
        settings.ssh.identity_file = self.ssh_identity;
        settings.terminal.fallback = self.fallback;
        settings.terminal.local_root = self.local_root;
        settings.terminal.shell = self.shell;
        settings.terminal.debounce = Duration::from_millis(self.debounce_ms);
        settings.terminal.idle_ttl = Duration::from_secs(self.idle_ttl_mins * 60);
        settings.advice.endpoint = self.advice_endpoint;
        settings.advice.api_key = self.advice_api_key;
        settings.advice.timeout = Duration::from_secs(self.advice_timeout_secs);
        settings
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Serve(serve) => {
            let port = serve.port;
            let state = match build_state(serve.settings()) {
                Ok(state) => state,
                Err(e) => {
                    error!("startup failed: {e}");
                    exit(1);
                }
            };
            if let Err(e) = labterm::http_server::run_server(port, state).await {
                error!("server error: {e}");
                exit(1);
            }
        }
    }
}

fn build_state(settings: Settings) -> Result<AppState, String> {
    let registry = SandboxRegistry::new(
        Arc::new(DockerBackend::new(settings.docker.clone())),
        RegistrySettings {
            name_prefix: settings.docker.name_prefix.clone(),
            limits: settings.docker.limits.clone(),
            readiness: settings.readiness.clone(),
        },
    );
    let launcher = PtyLauncher::new(
        settings.ssh.clone(),
        settings.terminal.shell.clone(),
        settings.terminal.local_root.clone(),
    );
    let strategy = AdviceStrategy::from_settings(&settings.advice).map_err(|e| e.to_string())?;
    info!(
        strategy = strategy.label(),
        provider = strategy.provider_name().unwrap_or("-"),
        fallback = %settings.terminal.fallback,
        "advice and fallback configured"
    );
    let advice = AdvicePipeline::new(strategy, settings.advice.timeout, settings.advice.limits);

    Ok(AppState::new(TerminalManager::new(
        Arc::new(registry),
        Arc::new(launcher),
        Arc::new(advice),
        settings.terminal,
    )))
}
