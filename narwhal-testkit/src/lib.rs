//! narwhal-testkit - in-memory fakes and scripted runnables for testing
//! narwhal without a database, a message broker, or a cluster.
//!
//! - [`InMemoryRunStore`] - compare-and-set run store over a hash map
//! - [`MockWorkerScheduler`] - scripted launch failures and phases
//! - [`InProcessScheduler`] - runs the real worker harness as a tokio task
//! - [`ScriptedRunnable`] / [`ScriptedResolver`] - canned chunk sequences

/// Scripted runnables and resolvers.
pub mod runnable;
/// Scheduler fakes.
pub mod scheduler;
/// In-memory run store.
pub mod store;

pub use runnable::{ScriptedResolver, ScriptedRunnable};
pub use scheduler::{InProcessScheduler, MockWorkerScheduler, ScriptedLaunch};
pub use store::InMemoryRunStore;
