//! Everything that touches a run's working tree: the per-run sandbox copy,
//! the bounded command runner, the workspace profile and ticket directives,
//! and code context search.

pub mod commands;
pub mod context;
pub mod profile;
pub mod sandbox;

pub use commands::{CommandResult, CommandRunner, TIMEOUT_EXIT_CODE};
pub use context::{DocHit, build_code_context, search_docs};
pub use profile::{Directives, WorkspaceProfile};
pub use sandbox::SandboxManager;
