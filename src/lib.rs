//! Mailbox change-notification engine
//!
//! Watches a set of hosted mailboxes on behalf of subscriber systems:
//! discovers where each mailbox lives, keeps streaming push subscriptions
//! open against those backends, folds pushed and pulled changes into a
//! deduplicated change log, and pokes subscriber callback URLs when new
//! changes land.
//!
//! The remote protocols are injected as trait objects
//! ([`remote::discovery::DirectoryClient`], [`remote::sync::SyncClient`],
//! [`remote::push::PushClient`]); this crate owns the orchestration, the
//! persistence, and the self-healing synchronization loop.

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod remote;
pub mod store;

pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use engine::runner::SynchronizationLoop;
pub use engine::EngineContext;
pub use error::EngineError;
