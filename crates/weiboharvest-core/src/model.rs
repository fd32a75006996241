//! Core data model: upstream records, cursor snapshots, and target specs.
//!
//! Every entity keeps its `raw` upstream JSON as an opaque pouch so that
//! metadata export can round-trip bytes the parser never looked at.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The upstream's fixed timezone offset (+08:00).
pub fn upstream_tz() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("UTC+8 is a valid offset")
}

/// An upstream account.
#[derive(Debug, Clone)]
pub struct User {
    pub uid: String,
    pub nickname: String,
    pub avatar_url: Option<String>,
    /// The untranslated upstream record.
    pub raw: Value,
}

/// A super-topic community, addressed by its container id.
#[derive(Debug, Clone)]
pub struct SuperTopic {
    pub containerid: String,
    pub name: String,
    pub raw: Value,
}

/// What kind of media a [`MediaItem`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Picture,
    Video,
}

impl MediaKind {
    /// The `{type}` template token and log label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Picture => "picture",
            MediaKind::Video => "video",
        }
    }
}

/// One downloadable picture or video reference within a post.
#[derive(Debug, Clone)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub url: String,
    /// Position within the post's emission order; unique per post.
    pub index: usize,
    /// URL path stem, when one exists.
    pub filename_hint: Option<String>,
    pub raw: Value,
}

/// A single upstream post.
///
/// `mid` is the stable identifier: two posts with the same `mid` are the
/// same logical post, across pages and re-fetches.
#[derive(Debug, Clone)]
pub struct Post {
    pub mid: String,
    pub bid: Option<String>,
    pub text: String,
    pub created_at: DateTime<FixedOffset>,
    pub user: Option<User>,
    pub media_items: Vec<MediaItem>,
    pub raw: Value,
}

/// A frozen cursor position, produced by `PostIterator::freeze` and stored
/// by the checkpoint manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub page: u32,
    pub cursor: Option<String>,
    pub seen_mids: Vec<String>,
    pub options_hash: String,
    pub timestamp: Option<String>,
}

/// What to harvest. A closed sum; `key` doubles as the stamp-map key and,
/// hashed, as the checkpoint filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// An account, by uid or by nickname.
    User { identifier: String, is_uid: bool },
    /// A super-topic, by container id or by display name.
    SuperTopic {
        identifier: String,
        is_containerid: bool,
    },
    /// A full-text search query.
    Search { keyword: String },
    /// A single post.
    Mid { mid: String },
}

/// Discriminant of a [`TargetSpec`], used to pick default directory layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    User,
    SuperTopic,
    Search,
    Mid,
}

impl TargetSpec {
    /// Short textual key: `u:<id>`, `t:<id>`, `s:<keyword>`, or `m:<mid>`.
    pub fn key(&self) -> String {
        match self {
            TargetSpec::User { identifier, .. } => format!("u:{identifier}"),
            TargetSpec::SuperTopic { identifier, .. } => format!("t:{identifier}"),
            TargetSpec::Search { keyword } => format!("s:{keyword}"),
            TargetSpec::Mid { mid } => format!("m:{mid}"),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            TargetSpec::User { .. } => TargetKind::User,
            TargetSpec::SuperTopic { .. } => TargetKind::SuperTopic,
            TargetSpec::Search { .. } => TargetKind::Search,
            TargetSpec::Mid { .. } => TargetKind::Mid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_keys_are_prefixed() {
        assert_eq!(
            TargetSpec::User {
                identifier: "123456".into(),
                is_uid: true
            }
            .key(),
            "u:123456"
        );
        assert_eq!(
            TargetSpec::SuperTopic {
                identifier: "100808abc".into(),
                is_containerid: true
            }
            .key(),
            "t:100808abc"
        );
        assert_eq!(
            TargetSpec::Search {
                keyword: "rust".into()
            }
            .key(),
            "s:rust"
        );
        assert_eq!(TargetSpec::Mid { mid: "abc".into() }.key(), "m:abc");
    }

    #[test]
    fn cursor_state_round_trips_through_json() {
        let state = CursorState {
            page: 3,
            cursor: Some("next".into()),
            seen_mids: vec!["a".into(), "b".into()],
            options_hash: "deadbeefdeadbeef".into(),
            timestamp: Some("2024-01-01T00:00:00+08:00".into()),
        };
        let json = serde_json::to_string(&state).expect("serialize");
        let back: CursorState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, state);
    }
}
