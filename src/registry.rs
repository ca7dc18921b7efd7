//! Maps sandbox keys to running sandboxes: create, resume, readiness wait
//! and reset.
//!
//! Every lifecycle transition for a key happens while holding that key's
//! provisioning lock, so concurrent resolves for the same student coalesce
//! onto one creation while different keys proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ReadinessSettings, ResourceLimits};
use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SandboxBackend, SandboxKey, SandboxState, SandboxSummary};

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub name_prefix: String,
    pub limits: ResourceLimits,
    pub readiness: ReadinessSettings,
}

pub struct SandboxRegistry {
    backend: Arc<dyn SandboxBackend>,
    settings: RegistrySettings,
    /// Per-key provisioning locks. The outer mutex is only held to look up
    /// or insert an entry, never across an await.
    locks: Mutex<HashMap<SandboxKey, Arc<AsyncMutex<()>>>>,
    known: RwLock<HashMap<SandboxKey, Sandbox>>,
}

impl SandboxRegistry {
    pub fn new(backend: Arc<dyn SandboxBackend>, settings: RegistrySettings) -> Self {
        Self {
            backend,
            settings,
            locks: Mutex::new(HashMap::new()),
            known: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn sandbox_name(&self, key: &SandboxKey) -> String {
        format!("{}-{}", self.settings.name_prefix, key)
    }

    async fn lock_key(&self, key: &SandboxKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Returns a running sandbox for `key`, resuming or creating it first if
    /// needed.
    pub async fn resolve_or_create(&self, key: &SandboxKey) -> Result<Sandbox> {
        let _guard = self.lock_key(key).await;
        let name = self.sandbox_name(key);

        let status = self.backend.inspect(&name).await.map_err(|e| provision(&name, e))?;
        debug!(sandbox = %name, state = status.state.as_str(), "resolving sandbox");

        match status.state {
            SandboxState::Running => {
                if let Some(endpoint) = status.endpoint {
                    return Ok(self.remember(key, name, endpoint).await);
                }
            }
            SandboxState::Stopped => {
                info!(sandbox = %name, "resuming stopped sandbox");
                self.backend.start(&name).await.map_err(|e| provision(&name, e))?;
                self.wait_ready(&name).await?;
            }
            SandboxState::Absent => {
                info!(sandbox = %name, "creating sandbox");
                self.backend
                    .create(&name, key, &self.settings.limits)
                    .await
                    .map_err(|e| provision(&name, e))?;
                self.wait_ready(&name).await?;
            }
            SandboxState::Creating | SandboxState::Unreachable => {
                self.wait_ready(&name).await?;
            }
        }

        let status = self.backend.inspect(&name).await.map_err(|e| provision(&name, e))?;
        match (status.state, status.endpoint) {
            (SandboxState::Running, Some(endpoint)) => Ok(self.remember(key, name, endpoint).await),
            (state, _) => Err(Error::Provision {
                name,
                message: format!("sandbox is {} with no shell endpoint", state.as_str()),
            }),
        }
    }

    async fn remember(&self, key: &SandboxKey, name: String, endpoint: crate::sandbox::Endpoint) -> Sandbox {
        let sandbox = Sandbox {
            key: key.clone(),
            name,
            endpoint,
        };
        self.known.write().await.insert(key.clone(), sandbox.clone());
        sandbox
    }

    /// Polls the readiness probe at a fixed interval up to the attempt
    /// ceiling.
    async fn wait_ready(&self, name: &str) -> Result<()> {
        let readiness = &self.settings.readiness;
        for attempt in 1..=readiness.max_attempts {
            match self.backend.exec(name, &readiness.probe).await {
                Ok(_) => {
                    info!(sandbox = %name, attempt, "sandbox ready");
                    return Ok(());
                }
                Err(e) => {
                    debug!(sandbox = %name, attempt, max = readiness.max_attempts, error = %e, "sandbox not ready yet");
                }
            }
            if attempt < readiness.max_attempts {
                tokio::time::sleep(readiness.interval).await;
            }
        }
        warn!(sandbox = %name, attempts = readiness.max_attempts, "sandbox readiness timed out");
        Err(Error::Timeout {
            name: name.to_string(),
            attempts: readiness.max_attempts,
        })
    }

    /// Stops and discards the sandbox; the next resolve creates a fresh one.
    pub async fn reset(&self, key: &SandboxKey) -> Result<()> {
        let _guard = self.lock_key(key).await;
        let name = self.sandbox_name(key);
        self.known.write().await.remove(key);

        let status = self.backend.inspect(&name).await?;
        match status.state {
            SandboxState::Absent => {
                debug!(sandbox = %name, "reset: nothing to remove");
                return Ok(());
            }
            SandboxState::Running | SandboxState::Creating | SandboxState::Unreachable => {
                if let Err(e) = self.backend.stop(&name).await {
                    warn!(sandbox = %name, error = %e, "stop before reset failed");
                }
            }
            SandboxState::Stopped => {}
        }
        self.backend.remove(&name).await?;
        info!(sandbox = %name, "sandbox reset");
        Ok(())
    }

    /// Sandboxes the backend knows about, resolved or not.
    pub async fn list(&self) -> Result<Vec<SandboxSummary>> {
        self.backend.list().await
    }

    /// Sandboxes resolved by this process since startup.
    pub async fn known(&self) -> Vec<Sandbox> {
        let mut sandboxes: Vec<Sandbox> = self.known.read().await.values().cloned().collect();
        sandboxes.sort_by(|a, b| a.key.cmp(&b.key));
        sandboxes
    }
}

fn provision(name: &str, err: Error) -> Error {
    match err {
        Error::Provision { .. } | Error::Timeout { .. } => err,
        other => Error::Provision {
            name: name.to_string(),
            message: other.to_string(),
        },
    }
}
