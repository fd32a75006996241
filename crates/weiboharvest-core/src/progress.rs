//! Structured progress events and the sink interface.
//!
//! The orchestrator narrates a harvest through these events; consumers
//! (a terminal renderer, a test recorder, nothing at all) implement
//! [`ProgressSink`]. Emitting is infallible by contract: a sink must not
//! let rendering problems escape into the harvest.

/// How a single media job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaOutcome {
    Downloaded,
    Skipped,
    Failed,
}

impl MediaOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaOutcome::Downloaded => "downloaded",
            MediaOutcome::Skipped => "skipped",
            MediaOutcome::Failed => "failed",
        }
    }
}

/// One step of harvest progress.
///
/// Ordering guarantees: `TargetStart` precedes all events for its target;
/// every `MediaDone` for a post precedes that post's `PostDone`;
/// `TargetDone` arrives exactly once, after everything else.
#[derive(Debug, Clone)]
pub enum HarvestEvent {
    /// A coarse phase description (resolving a target, fetching cookies).
    Stage { message: String },
    TargetStart {
        target_key: String,
    },
    MediaDone {
        outcome: MediaOutcome,
        media_done: usize,
        media_total: usize,
        post_index: usize,
        filename: String,
    },
    PostDone {
        posts_processed: usize,
    },
    TargetDone {
        target_key: String,
        posts_processed: usize,
        downloaded: usize,
        skipped: usize,
        failed: usize,
        ok: bool,
    },
    Interrupted {
        target_key: String,
    },
}

/// Consumer of [`HarvestEvent`]s.
///
/// `pause` and `resume` bracket the challenge detour, during which an
/// interactive renderer should yield the terminal to the operator.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &HarvestEvent);

    fn pause(&self) {}

    fn resume(&self) {}

    fn close(&self) {}
}

/// Discards every event.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: &HarvestEvent) {}
}
