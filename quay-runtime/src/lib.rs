//! Runtime content layer: a cooperatively scheduled request system, a
//! reference-counted load cache with deferred recycling, and an update
//! orchestrator that downloads, verifies and atomically adopts new content
//! and native patches.

pub mod cache;
pub mod config;
pub mod download;
pub mod patch;
pub mod request;
pub mod requests;
pub mod scheduler;
pub mod source;
pub mod updater;

mod recycler;
mod references;
mod runtime;

pub use crate::cache::{BundleContentHandler, ContentCache, ContentHandler, LoadRequest};
pub use crate::config::PlayerConfig;
pub use crate::patch::{Bootstrap, NoopBootstrap};
pub use crate::request::{Outcome, Request, RequestBase, SharedRequest, Status};
pub use crate::requests::{AutoConfirm, DecisionHandle, Prompter};
pub use crate::runtime::{ContentPaths, ContentRuntime};
pub use crate::scheduler::{Scheduler, TickBudget};
pub use crate::source::{ContentSource, DirSource, HttpSource, TrustPolicy};
pub use crate::updater::{UpdateOutcome, Updater, UpdaterPoll};
