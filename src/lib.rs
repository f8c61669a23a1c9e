#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod task;

pub use crate::agent::{AgentBackend, BackendKind, TurnEvent, TurnHandle, TurnRequest};
pub use crate::error::OrchError;
pub use crate::orchestrator::Orchestrator;
