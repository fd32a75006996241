//! Lazy, deduplicating, restartable post sequence.
//!
//! A [`PostIterator`] buffers one upstream page at a time, yields each mid
//! at most once, and can be frozen into a [`CursorState`] after any yield.
//! A fresh iterator thawed from that state over the same upstream produces
//! exactly the remaining suffix.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Error;
use crate::model::{CursorState, Post};

/// Upper bound on remembered mids per iterator. Watermarks cover dedup
/// beyond this horizon, so older entries can be dropped without yielding a
/// post twice within any realistic window.
const SEEN_MIDS_CAP: usize = 10_000;

/// One fetched page of posts plus continuation state.
#[derive(Debug)]
pub struct FetchedPage {
    pub posts: Vec<Post>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Where pages come from. The orchestrator injects an implementation per
/// target kind; tests inject scripted pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: u32, cursor: Option<&str>) -> Result<FetchedPage, Error>;
}

/// Lazy stream of posts for a single target.
pub struct PostIterator {
    source: Box<dyn PageSource>,
    options_hash: String,
    page: u32,
    cursor: Option<String>,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    buffer: VecDeque<Post>,
    exhausted: bool,
}

impl PostIterator {
    pub fn new(source: Box<dyn PageSource>, options_hash: impl Into<String>) -> Self {
        Self {
            source,
            options_hash: options_hash.into(),
            page: 1,
            cursor: None,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// The next not-yet-yielded post, or `None` at end of sequence.
    ///
    /// End of sequence is reached when a fetched page is empty or the
    /// upstream signals no further pages.
    pub async fn next(&mut self) -> Result<Option<Post>, Error> {
        while self.buffer.is_empty() && !self.exhausted {
            let fetched = self.source.fetch_page(self.page, self.cursor.as_deref()).await?;
            for post in fetched.posts {
                if !self.seen.contains(&post.mid) {
                    self.buffer.push_back(post);
                }
            }
            self.cursor = fetched.next_cursor;
            self.page += 1;
            if !fetched.has_more {
                self.exhausted = true;
            }
        }

        let Some(post) = self.buffer.pop_front() else {
            return Ok(None);
        };
        self.remember(post.mid.clone());
        Ok(Some(post))
    }

    fn remember(&mut self, mid: String) {
        if self.seen.insert(mid.clone()) {
            self.seen_order.push_back(mid);
            if self.seen_order.len() > SEEN_MIDS_CAP {
                if let Some(oldest) = self.seen_order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
    }

    /// Put a yielded post back at the head of the sequence.
    ///
    /// Used when work on the post was cut short: the post leaves
    /// `seen_mids`, so a snapshot taken afterwards re-fetches its page and
    /// yields it again on resume.
    pub fn unyield(&mut self, post: Post) {
        self.seen.remove(&post.mid);
        self.seen_order.retain(|mid| mid != &post.mid);
        self.buffer.push_front(post);
    }

    /// Snapshot the cursor position.
    ///
    /// Buffered-but-unyielded posts are not serialized; instead, a
    /// partially-consumed page is recorded by its own number, so a thawed
    /// iterator re-fetches it and `seen_mids` filters out the posts that
    /// were already yielded. The replay therefore produces exactly the
    /// remaining suffix.
    pub fn freeze(&self) -> CursorState {
        let page = if self.buffer.is_empty() {
            self.page
        } else {
            self.page - 1
        };
        CursorState {
            page,
            cursor: self.cursor.clone(),
            seen_mids: self.seen_order.iter().cloned().collect(),
            options_hash: self.options_hash.clone(),
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    /// Restore a snapshot taken by [`PostIterator::freeze`].
    pub fn thaw(&mut self, state: &CursorState) {
        self.page = state.page;
        self.cursor = state.cursor.clone();
        self.seen.clear();
        self.seen_order.clear();
        for mid in &state.seen_mids {
            self.remember(mid.clone());
        }
        self.options_hash = state.options_hash.clone();
        self.buffer.clear();
        self.exhausted = false;
    }
}
