//! Serves the real router over the crate's in-memory fakes.

use labterm::advice::AdvicePipeline;
use labterm::config::{ReadinessSettings, ResourceLimits, TerminalSettings};
use labterm::http_server::router;
use labterm::registry::{RegistrySettings, SandboxRegistry};
use labterm::state::AppState;
use labterm::terminal::TerminalManager;
use labterm::testing::{FakeBackend, ScriptedLauncher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub async fn spawn_server() -> SocketAddr {
    let registry = SandboxRegistry::new(
        Arc::new(FakeBackend::new()),
        RegistrySettings {
            name_prefix: "hax".to_string(),
            limits: ResourceLimits::default(),
            readiness: ReadinessSettings::default(),
        },
    );
    let settings = TerminalSettings {
        debounce: Duration::from_millis(50),
        min_quiet: Duration::from_millis(50),
        ..TerminalSettings::default()
    };
    let terminals = TerminalManager::new(
        Arc::new(registry),
        Arc::new(ScriptedLauncher::new()),
        Arc::new(AdvicePipeline::heuristic()),
        settings,
    );
    let app = router(AppState::new(terminals));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
