//! The agent runtime: the ReAct router, its prompt assembly, the hot-reload
//! watcher, and the background pollers.

pub mod hot_reload;
pub mod pollers;
pub mod prompt;
pub mod router;
pub mod triage;

pub use hot_reload::HotReloader;
pub use router::{Enforcement, Router, RouterOutcome};
pub use triage::MailTriage;
