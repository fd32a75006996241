//! Terminal progress rendering.

use console::{style, Term};
use weiboharvest_core::progress::{HarvestEvent, MediaOutcome, ProgressSink};

/// Renders harvest progress as stderr lines: one per target, plus any
/// media failures. Per-media and per-post ticks stay quiet; the summary
/// line carries the counts.
pub struct ConsoleSink {
    term: Term,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            term: Term::stderr(),
        }
    }
}

impl ProgressSink for ConsoleSink {
    fn emit(&self, event: &HarvestEvent) {
        let line = match event {
            HarvestEvent::Stage { message } => format!("{} {message}", style("·").dim()),
            HarvestEvent::TargetStart { target_key } => {
                format!("{} {target_key}", style("→").cyan())
            }
            HarvestEvent::MediaDone {
                outcome: MediaOutcome::Failed,
                filename,
                ..
            } => format!("  {} {filename}", style("✗").red()),
            HarvestEvent::MediaDone { .. } | HarvestEvent::PostDone { .. } => return,
            HarvestEvent::TargetDone {
                target_key,
                posts_processed,
                downloaded,
                skipped,
                failed,
                ok,
            } => {
                if *ok {
                    format!(
                        "{} {target_key}: {posts_processed} posts, {downloaded} downloaded, {skipped} skipped",
                        style("✓").green()
                    )
                } else {
                    format!(
                        "{} {target_key}: {posts_processed} posts, {downloaded} downloaded, {failed} failed",
                        style("✗").red()
                    )
                }
            }
            HarvestEvent::Interrupted { target_key } => {
                format!("{} interrupted: {target_key}", style("!").yellow())
            }
        };
        let _ = self.term.write_line(&line);
    }

    fn pause(&self) {
        let _ = self
            .term
            .write_line(&format!("{}", style("waiting for challenge resolution...").yellow()));
    }

    fn resume(&self) {
        let _ = self.term.write_line(&format!("{}", style("resuming").dim()));
    }
}
