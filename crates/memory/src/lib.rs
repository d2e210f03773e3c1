//! Durable memory for the agent: SQLite-backed conversations, knowledge and
//! feedback, a read-only vault indexer, rule-based fact extraction, and the
//! correction feedback loop. Everything degrades gracefully when the local
//! embedding model is unavailable — semantic search falls back to keywords.

pub mod embedder;
pub mod facts;
pub mod feedback;
pub mod master_prompt;
pub mod store;
pub mod vault;

pub use embedder::Embedder;
pub use facts::{Fact, FactExtractor};
pub use feedback::{FeedbackManager, FeedbackRow};
pub use master_prompt::MasterPrompt;
pub use store::{ConversationTurn, MemoryStore, SearchHit, SearchSource};
pub use vault::{IndexStats, VaultHit, VaultIndexer};
