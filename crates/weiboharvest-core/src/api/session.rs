//! Cookie and header snapshot, shared across workers.
//!
//! The session is plain data serialized as JSON (never native-object
//! pickling), applied to outgoing requests as a `Cookie` header and
//! refreshed from `Set-Cookie` responses. Workers share it behind an
//! `Arc<RwLock>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Error;
use crate::fsutil::atomic_write;

/// Name of the cookie that proves an authenticated session.
pub const AUTH_COOKIE: &str = "SUB";

/// Default cookie domain for cookies injected from strings and files.
pub const COOKIE_DOMAIN: &str = ".weibo.cn";

/// The session store handle shared between the context and its workers.
pub type SharedSession = Arc<RwLock<SessionStore>>;

/// One stored cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    #[serde(default = "default_cookie_path")]
    pub path: String,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// Cookie list plus extra request headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStore {
    pub cookies: Vec<SessionCookie>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl SessionStore {
    /// Insert or replace a cookie by name.
    pub fn set_cookie(&mut self, name: &str, value: &str, domain: Option<&str>, path: &str) {
        if let Some(existing) = self.cookies.iter_mut().find(|c| c.name == name) {
            existing.value = value.to_string();
            existing.domain = domain.map(str::to_string);
            existing.path = path.to_string();
            return;
        }
        self.cookies.push(SessionCookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.map(str::to_string),
            path: path.to_string(),
        });
    }

    /// The stored value of a cookie, when present.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    /// Render the `Cookie` request header, or `None` when the jar is empty.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Merge the cookie pair out of a `Set-Cookie` header value.
    pub fn merge_set_cookie(&mut self, header: &str) {
        let pair = header.split(';').next().unwrap_or("");
        if let Some((name, value)) = pair.split_once('=') {
            let name = name.trim();
            if !name.is_empty() {
                self.set_cookie(name, value.trim(), Some(COOKIE_DOMAIN), "/");
            }
        }
    }

    /// Load cookies from an operator-supplied `name=value; name2=value2`
    /// string (newlines tolerated as separators).
    pub fn apply_cookie_string(&mut self, raw: &str) -> Result<(), Error> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Auth {
                message: "empty cookie string".to_string(),
            });
        }
        for part in raw.replace('\n', ";").split(';') {
            if let Some((name, value)) = part.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    self.set_cookie(name, value.trim(), Some(COOKIE_DOMAIN), "/");
                }
            }
        }
        Ok(())
    }

    /// Whether the session carries a non-empty authentication cookie.
    pub fn has_auth_cookie(&self) -> bool {
        self.cookie(AUTH_COOKIE).is_some_and(|v| !v.is_empty())
    }

    /// Persist the snapshot as JSON, atomically.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let payload = serde_json::to_vec(self).map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other(e),
        })?;
        atomic_write(path, &payload)
    }

    /// Load a snapshot; `None` when the file is absent or unreadable.
    pub fn load(path: &Path) -> Option<SessionStore> {
        let bytes = std::fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable session file");
                None
            }
        }
    }

    /// `~/.config/weiboharvest/session.json`, when a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("weiboharvest").join("session.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_joins_pairs() {
        let mut store = SessionStore::default();
        assert_eq!(store.cookie_header(), None);
        store.set_cookie("A", "1", None, "/");
        store.set_cookie("B", "2", None, "/");
        assert_eq!(store.cookie_header().as_deref(), Some("A=1; B=2"));
    }

    #[test]
    fn set_cookie_replaces_by_name() {
        let mut store = SessionStore::default();
        store.set_cookie("SUB", "old", None, "/");
        store.set_cookie("SUB", "new", Some(COOKIE_DOMAIN), "/");
        assert_eq!(store.cookie("SUB"), Some("new"));
        assert_eq!(store.cookies.len(), 1);
    }

    #[test]
    fn apply_cookie_string_parses_semicolons_and_newlines() {
        let mut store = SessionStore::default();
        store
            .apply_cookie_string("SUB=abc; other=1\nthird=x=y")
            .expect("apply");
        assert_eq!(store.cookie("SUB"), Some("abc"));
        assert_eq!(store.cookie("other"), Some("1"));
        assert_eq!(store.cookie("third"), Some("x=y"));
    }

    #[test]
    fn apply_empty_cookie_string_is_an_auth_error() {
        let mut store = SessionStore::default();
        let err = store.apply_cookie_string("   ").unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }

    #[test]
    fn merge_set_cookie_takes_first_pair_only() {
        let mut store = SessionStore::default();
        store.merge_set_cookie("XSRF-TOKEN=tok123; Path=/; HttpOnly");
        assert_eq!(store.cookie("XSRF-TOKEN"), Some("tok123"));
        assert_eq!(store.cookies.len(), 1);
    }

    #[test]
    fn auth_cookie_must_be_non_empty() {
        let mut store = SessionStore::default();
        assert!(!store.has_auth_cookie());
        store.set_cookie(AUTH_COOKIE, "", None, "/");
        assert!(!store.has_auth_cookie());
        store.set_cookie(AUTH_COOKIE, "value", None, "/");
        assert!(store.has_auth_cookie());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");

        let mut store = SessionStore::default();
        store.set_cookie("SUB", "secret", Some(COOKIE_DOMAIN), "/");
        store
            .headers
            .insert("X-Custom".to_string(), "yes".to_string());
        store.save(&path).expect("save");

        let loaded = SessionStore::load(&path).expect("load");
        assert_eq!(loaded.cookie("SUB"), Some("secret"));
        assert_eq!(loaded.headers.get("X-Custom").map(String::as_str), Some("yes"));
    }

    #[test]
    fn load_missing_or_corrupt_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(SessionStore::load(&dir.path().join("absent.json")).is_none());

        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"pickle!").expect("write");
        assert!(SessionStore::load(&path).is_none());
    }
}
