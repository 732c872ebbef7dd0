//! Core agent components.
//!
//! Contains:
//! - `dispatcher` - routes one inbound message and delivers the reply
//! - `routing` - the pure routing decision
//! - `executor` - status, shell passthrough, and interpreter commands
//! - `session` - clarification sessions with a five-minute window
//! - `directives` - file and screenshot directives in interpreter output
//! - `memory` - conversation context and daily rollover
//! - `gate` - per-identity serialization

pub mod directives;
pub mod dispatcher;
pub mod executor;
pub mod gate;
pub mod memory;
pub mod prompts;
pub mod routing;
pub mod session;
pub mod stats;

pub use dispatcher::{AgentDeps, DispatchOutcome, Dispatcher, FALLBACK_REPLY};
pub use executor::{CommandExecutor, ExecutorConfig};
pub use gate::IdentityGate;
pub use memory::{ConversationMemory, MaintenanceReport};
pub use routing::{IgnoreReason, Route, TriggerPolicy};
pub use session::{Session, SessionRegistry, SessionState};
pub use stats::AgentStats;
