//! Synchronization core for the Quill note store.
//!
//! Keeps a local note database convergent with a remote note service:
//! a download-merge pass pulls paginated change batches and reconciles
//! them against local storage with duplicate detection and rename-based
//! conflict resolution, then an upload pass pushes locally modified
//! entities back in dependency order.
//!
//! The managers ([`FullSyncManager`], [`SendLocalChangesManager`]) are
//! pure state machines: they produce and consume messages and never
//! perform I/O. [`SyncRunner`] is the async orchestrator that executes
//! their [`Action`]s against a [`NoteStoreClient`] and a local-storage
//! channel.

pub mod action;
pub mod download;
pub mod error;
pub mod ledger;
pub mod protocol;
pub mod resolver;
pub mod runner;
pub mod signal;
pub mod storage;
pub mod timer;
pub mod upload;

pub use action::Action;
pub use download::FullSyncManager;
pub use error::{SyncError, SyncResult};
pub use ledger::{all_settled, PendingSet, RequestToken};
pub use protocol::{AuthToken, NoteFetchOptions, NoteStoreClient, RemoteError, RemoteErrorCode};
pub use resolver::{Resolution, CONFLICT_PREFIX};
pub use runner::{RunnerConfig, SyncCommand, SyncOutcome, SyncRunner};
pub use signal::Signal;
pub use storage::{AnyEntity, StorageReply, StorageRequest};
pub use timer::{CallSite, DelayQueue};
pub use upload::{PushOutcome, SendLocalChangesManager};
