//! Upstream access: HTTP context, session persistence, and challenge
//! handling.

pub mod challenge;
pub mod client;
pub mod session;

pub use challenge::{
    ChallengeHandler, ChallengeMode, ManualChallengeHandler, SkipChallengeHandler,
    CHALLENGE_TIMEOUT_DEFAULT,
};
pub use client::{ApiConfig, ApiContext, RequestOptions, BASE_URL};
pub use session::{SessionCookie, SessionStore, SharedSession, AUTH_COOKIE};
