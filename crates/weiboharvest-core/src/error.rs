//! Error taxonomy for the harvester.
//!
//! A single root enum: every failure the crate can surface is one of these
//! taxa, and each maps to a process exit code via [`Error::exit_code`].
//! The library uses `thiserror` for structured, typed errors.

use std::path::PathBuf;

/// All errors raised by the harvester core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or rejected credentials, HTTP 401, or an unsolved challenge.
    #[error("authentication failed: {message}")]
    Auth {
        /// Details about the authentication failure.
        message: String,
    },

    /// Retries exhausted on a throttled (403/418) response.
    #[error("rate limited: {target}")]
    RateLimit {
        /// The URL that kept being throttled.
        target: String,
    },

    /// Resolve failure, terminal HTTP status, or transport failure after retries.
    #[error("target error: {message}")]
    Target {
        /// Details about the failure.
        message: String,
        /// The underlying HTTP client error, when one exists.
        #[source]
        source: Option<reqwest::Error>,
    },

    /// A required upstream field is missing or malformed.
    #[error("upstream schema error: {message}")]
    Schema {
        /// What is missing or malformed.
        message: String,
    },

    /// Another process holds the checkpoint lock for this target.
    #[error("checkpoint error: {message}")]
    Checkpoint {
        /// Details, including the contended key.
        message: String,
    },

    /// Invalid configuration or arguments.
    #[error("init error: {message}")]
    Init {
        /// What is invalid.
        message: String,
    },

    /// Filesystem failure while persisting an artifact.
    #[error("io error at {path}")]
    Io {
        /// The path being read or written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The operator interrupted the run; state has been flushed.
    #[error("interrupted")]
    Interrupted,
}

impl Error {
    /// Map this error to the process exit code contract:
    /// 0 success, 1 generic failure, 2 init error, 3 auth failure, 5 interrupted.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Auth { .. } => 3,
            Error::Init { .. } => 2,
            Error::Interrupted => 5,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_message() {
        let err = Error::Auth {
            message: "missing SUB cookie".to_string(),
        };
        assert_eq!(err.to_string(), "authentication failed: missing SUB cookie");
    }

    #[test]
    fn rate_limit_message_names_target() {
        let err = Error::RateLimit {
            target: "https://m.weibo.cn/api/container/getIndex".to_string(),
        };
        assert!(err.to_string().contains("getIndex"));
    }

    #[test]
    fn exit_codes_are_total() {
        let samples = [
            Error::Auth {
                message: String::new(),
            },
            Error::RateLimit {
                target: String::new(),
            },
            Error::Target {
                message: String::new(),
                source: None,
            },
            Error::Schema {
                message: String::new(),
            },
            Error::Checkpoint {
                message: String::new(),
            },
            Error::Init {
                message: String::new(),
            },
            Error::Io {
                path: PathBuf::from("/tmp/x"),
                source: std::io::Error::other("boom"),
            },
            Error::Interrupted,
        ];
        for err in samples {
            assert!(matches!(err.exit_code(), 1 | 2 | 3 | 5));
        }
    }

    #[test]
    fn auth_maps_to_3_init_to_2_interrupt_to_5() {
        assert_eq!(
            Error::Auth {
                message: String::new()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            Error::Init {
                message: String::new()
            }
            .exit_code(),
            2
        );
        assert_eq!(Error::Interrupted.exit_code(), 5);
        assert_eq!(
            Error::Schema {
                message: String::new()
            }
            .exit_code(),
            1
        );
    }
}
