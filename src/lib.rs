//! plugin-runner library
//!
//! Subprocess runtime for multi-stage pipelines. Each stage runs as a
//! dynamically loaded plugin inside its own worker process:
//! - Wire protocol and framing over the worker's stdin/stdout
//! - Result references: handles to values resident in the worker that
//!   produced them
//! - Orchestrator-side runnables with a strict one-call-in-flight gate
//! - The worker-side endpoint loop and dylib plugin loading

pub mod config;
pub mod error;
pub mod plugin;
pub mod reference;
pub mod runnable;
pub mod runtime;
pub mod transport;
pub mod worker;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use plugin::{PluginDescriptor, PluginLoader};
pub use reference::{ResultRef, ResultTable};
pub use runnable::{Runnable, State};
pub use runtime::Runtime;
