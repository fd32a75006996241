//! Anti-automation challenge handling.
//!
//! A challenge wall suspends the harvest until a human (or an external
//! browser collaborator) clears it. The context depends only on the
//! [`ChallengeHandler`] capability; the concrete mechanism is chosen once
//! at construction and captured behind the trait.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::session::SharedSession;

/// Default window an operator gets to clear a challenge.
pub const CHALLENGE_TIMEOUT_DEFAULT: Duration = Duration::from_secs(300);

/// How challenges are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChallengeMode {
    /// Prefer a browser collaborator when one is wired in, else manual.
    #[default]
    Auto,
    /// Require the browser collaborator.
    Browser,
    /// Print the URL and wait for the operator.
    Manual,
    /// Treat every challenge as unsolved.
    Skip,
}

/// Clears a challenge at `verify_url`.
///
/// Post-condition on success: any cookies issued while solving have been
/// merged into `session`.
#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    async fn solve(&self, verify_url: &str, session: &SharedSession, timeout: Duration) -> bool;
}

/// Never solves; callers treat the challenge as a fatal auth failure.
pub struct SkipChallengeHandler;

#[async_trait]
impl ChallengeHandler for SkipChallengeHandler {
    async fn solve(&self, _verify_url: &str, _session: &SharedSession, _timeout: Duration) -> bool {
        false
    }
}

/// Prints the challenge URL and waits for the operator to confirm with
/// Enter, up to the timeout.
pub struct ManualChallengeHandler;

#[async_trait]
impl ChallengeHandler for ManualChallengeHandler {
    async fn solve(&self, verify_url: &str, _session: &SharedSession, timeout: Duration) -> bool {
        eprintln!("Challenge wall hit: {verify_url}");
        eprintln!(
            "Solve it in a browser, then press Enter here within {}s...",
            timeout.as_secs()
        );
        let wait_for_enter = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).is_ok()
        });
        matches!(tokio::time::timeout(timeout, wait_for_enter).await, Ok(Ok(true)))
    }
}

/// Whether a URL looks like the upstream's verification wall.
pub fn is_challenge_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let haystack = format!("{}{}", parsed.host_str().unwrap_or(""), parsed.path()).to_ascii_lowercase();
    ["passport.weibo", "login.sina", "verify", "captcha", "challenge"]
        .iter()
        .any(|marker| haystack.contains(marker))
}

/// The challenge URL implied by a response, if any.
///
/// A 418 counts only when its own URL is challenge-like; otherwise the
/// final URL and a redirect `Location` are checked in that order.
pub fn extract_challenge_url(status: u16, final_url: &str, location: Option<&str>) -> Option<String> {
    if status == 418 {
        return is_challenge_url(final_url).then(|| final_url.to_string());
    }
    if is_challenge_url(final_url) {
        return Some(final_url.to_string());
    }
    match location {
        Some(loc) if is_challenge_url(loc) => Some(loc.to_string()),
        _ => None,
    }
}
