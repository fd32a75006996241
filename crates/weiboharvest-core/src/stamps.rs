//! Incremental-run watermarks: the latest successfully processed post
//! timestamp per target key.
//!
//! The on-disk form is a JSON object sorted by key, 2-space indented, with
//! RFC 3339 values carrying the upstream +08:00 offset. Writes are atomic
//! and elided when nothing changed since the last save.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset};

use crate::error::Error;
use crate::fsutil::atomic_write;

/// Watermark map, optionally backed by a stamps file.
///
/// With no backing path the map still gates iteration in-memory for the
/// current run; it just is not persisted.
pub struct LatestStamps {
    path: Option<PathBuf>,
    map: BTreeMap<String, DateTime<FixedOffset>>,
    last_saved: Option<String>,
}

impl LatestStamps {
    /// Load the stamps file when one is configured. An absent or unreadable
    /// file starts an empty map; unparsable entries are dropped.
    pub fn load(path: Option<PathBuf>) -> Self {
        let mut map = BTreeMap::new();
        if let Some(p) = &path {
            match fs::read_to_string(p) {
                Ok(text) => match serde_json::from_str::<BTreeMap<String, String>>(&text) {
                    Ok(raw) => {
                        for (key, value) in raw {
                            match DateTime::parse_from_rfc3339(&value) {
                                Ok(dt) => {
                                    map.insert(key, dt);
                                }
                                Err(e) => {
                                    tracing::warn!(key, error = %e, "dropping unparsable stamp");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %p.display(), error = %e, "unreadable stamps file, starting empty");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "unreadable stamps file, starting empty");
                }
            }
        }
        let mut stamps = Self {
            path,
            map,
            last_saved: None,
        };
        stamps.last_saved = Some(stamps.serialize());
        stamps
    }

    /// The cutoff for `key`, when one is known.
    pub fn get(&self, key: &str) -> Option<DateTime<FixedOffset>> {
        self.map.get(key).copied()
    }

    /// Move the watermark for `key` forward to `ts`. Never moves backward.
    pub fn advance(&mut self, key: &str, ts: DateTime<FixedOffset>) {
        let entry = self.map.entry(key.to_string()).or_insert(ts);
        if ts > *entry {
            *entry = ts;
        }
    }

    /// Persist the map atomically, skipping the write when the serialized
    /// payload is unchanged since the last save (or load). A no-op without
    /// a backing path.
    pub fn save(&mut self) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let payload = self.serialize();
        if self.last_saved.as_deref() == Some(payload.as_str()) {
            return Ok(());
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        atomic_write(path, payload.as_bytes())?;
        self.last_saved = Some(payload);
        Ok(())
    }

    fn serialize(&self) -> String {
        let rendered: BTreeMap<&str, String> = self
            .map
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_rfc3339()))
            .collect();
        serde_json::to_string_pretty(&rendered).unwrap_or_else(|_| "{}".to_string())
    }
}
