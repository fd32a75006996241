//! Core library for weiboharvest, a resumable, rate-limited media
//! harvester.
//!
//! The crate is the coordination layer that keeps a long-running harvest
//! reliable: the paginated cursor iterator with its checkpoint manager,
//! the sliding-window rate controller, the HTTP context that braids
//! authentication, retry, and challenge handling into one request
//! discipline, and the orchestrator that threads them together with a
//! bounded worker pool, atomic file writes, and incremental watermarks.

pub mod adapter;
pub mod api;
pub mod checkpoint;
pub mod error;
pub mod fsutil;
pub mod harvester;
pub mod iterator;
pub mod model;
pub mod naming;
pub mod progress;
pub mod ratecontrol;
pub mod stamps;

pub use api::{ApiConfig, ApiContext, ChallengeHandler, ChallengeMode, SessionStore};
pub use error::Error;
pub use harvester::{Harvester, HarvestOptions};
pub use model::{CursorState, MediaItem, MediaKind, Post, SuperTopic, TargetSpec, User};
pub use progress::{HarvestEvent, MediaOutcome, NullSink, ProgressSink};
pub use ratecontrol::{Bucket, RateConfig, RateController};

/// Returns the version of the weiboharvest-core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
