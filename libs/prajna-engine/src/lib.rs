//! Sandboxed execution and judging core.
//!
//! [`executor::Executor`] runs untrusted code once through an
//! [`backend::IsolationBackend`]; [`judge::Judge`] runs it against every
//! test case of a problem; [`runner::JobRunner`] drives both from a bounded
//! worker pool.

pub mod backend;
pub mod compile;
pub mod executor;
pub mod judge;
pub mod language;
pub mod monitor;
pub mod problem;
pub mod runner;
pub mod store;
pub mod workspace;

pub use backend::{BackendError, Capabilities, DockerBackend, IsolationBackend, Limits, ProcessBackend};
pub use executor::{Executor, ExecutorSettings};
pub use judge::Judge;
pub use language::LanguageConfigManager;
pub use problem::ProblemStore;
pub use runner::JobRunner;
pub use store::{MemoryStore, StoreError, SubmissionStore};
