//! Container management module for the dockshell orchestrator
//!
//! Handles all interactions with the container runtime:
//! - Creating detached session containers
//! - Attaching an interactive shell
//! - Driving each session through its lifecycle and tearing it down

pub mod runtime;
pub mod session;

pub use runtime::{CliRuntime, ContainerRuntime, RuntimeError, TeardownReport};
pub use session::{
    ContainerSession, SessionError, SessionHandle, SessionSettings, SessionState, StatusSnapshot,
};
