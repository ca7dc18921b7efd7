//! Error taxonomy shared by the registry, the shell launcher and the terminal
//! manager.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The platform could not create or start the sandbox.
    #[error("failed to provision sandbox {name}: {message}")]
    Provision { name: String, message: String },

    /// The sandbox never passed its readiness probe.
    #[error("sandbox {name} did not become ready after {attempts} attempts")]
    Timeout { name: String, attempts: u32 },

    /// The sandbox reports running but its shell endpoint cannot be reached.
    #[error("could not connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("failed to start terminal process: {0}")]
    Spawn(String),

    #[error("local fallback terminals are disabled")]
    FallbackDisabled,

    #[error("sandbox backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Short human-readable reason, sent to the client when falling back.
    pub fn client_message(&self) -> String {
        match self {
            Error::Provision { message, .. } => format!("could not prepare your lab: {message}"),
            Error::Timeout { .. } => "your lab did not start in time".to_string(),
            Error::Connect { .. } => "could not connect to your lab".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
