//! labterm - browser terminals into per-student lab sandboxes, with
//! debounced, non-blocking command advice.

#[cfg(not(target_os = "linux"))]
compile_error!("labterm only works on Linux.");

pub mod activity;
pub mod advice;
pub mod config;
pub mod debounce;
pub mod docker;
pub mod error;
pub mod heuristics;
pub mod http_server;
pub mod jail;
pub mod launcher;
pub mod provider;
pub mod pty;
pub mod registry;
pub mod sandbox;
pub mod state;
pub mod terminal;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod testing;

pub use error::{Error, Result};
