//! MailMaestro: email triage orchestration core.

pub mod audit;
pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod store;

pub use error::{Error, Result};
pub use orchestrator::{EmailOutcome, Orchestrator};
