//! Outbound request pacing: sliding-window quota, minimum spacing, and
//! exponential backoff after throttled responses.
//!
//! Two buckets, `api` and `media`, share one configuration but keep fully
//! independent state; failures on one never delay the other. Timekeeping
//! goes through `tokio::time` so tests run under paused time.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::error::Error;

/// A named channel of request accounting. Quotas and backoff are tracked
/// per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Api,
    Media,
}

impl Bucket {
    fn index(self) -> usize {
        match self {
            Bucket::Api => 0,
            Bucket::Media => 1,
        }
    }

    /// Log label for this bucket.
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Api => "api",
            Bucket::Media => "media",
        }
    }
}

/// Pacing configuration, shared by both buckets.
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Sliding-window quota: at most this many requests per `window`.
    pub limit: usize,
    /// Width of the sliding window.
    pub window: Duration,
    /// First backoff delay; doubles per consecutive failure.
    pub base_delay: Duration,
    /// Backoff ceiling (before jitter).
    pub max_delay: Duration,
    /// Jitter is uniform in `[0, delay * jitter_ratio)`.
    pub jitter_ratio: f64,
    /// Minimum spacing between consecutive api-bucket requests.
    pub request_interval: Duration,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            limit: 30,
            window: Duration::from_secs(600),
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            jitter_ratio: 0.5,
            request_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct BucketState {
    timestamps: VecDeque<Instant>,
    last_request_at: Option<Instant>,
    failures: u32,
    backoff_until: Option<Instant>,
}

/// Serializes outbound requests against the two buckets.
pub struct RateController {
    config: RateConfig,
    state: Mutex<[BucketState; 2]>,
}

impl RateController {
    pub fn new(config: RateConfig) -> Result<Self, Error> {
        if config.limit == 0 || config.window.is_zero() {
            return Err(Error::Init {
                message: "rate limit and window must be positive".to_string(),
            });
        }
        Ok(Self {
            config,
            state: Mutex::new([BucketState::default(), BucketState::default()]),
        })
    }

    /// Block until the caller may issue a request on `bucket`, then record
    /// the request timestamp. The record happens in the same critical
    /// section as the admission decision, so a slot can never be spent
    /// twice. Never returns early.
    pub async fn wait_before_request(&self, bucket: Bucket) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("rate controller lock poisoned");
                let st = &mut state[bucket.index()];
                let now = Instant::now();

                while st
                    .timestamps
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.config.window)
                {
                    st.timestamps.pop_front();
                }

                let mut wait = Duration::ZERO;
                if st.timestamps.len() >= self.config.limit {
                    if let Some(earliest) = st.timestamps.front() {
                        wait = wait.max((*earliest + self.config.window).saturating_duration_since(now));
                    }
                }
                if bucket == Bucket::Api && !self.config.request_interval.is_zero() {
                    if let Some(last) = st.last_request_at {
                        wait = wait
                            .max((last + self.config.request_interval).saturating_duration_since(now));
                    }
                }
                if let Some(until) = st.backoff_until {
                    wait = wait.max(until.saturating_duration_since(now));
                }

                if wait.is_zero() {
                    st.timestamps.push_back(now);
                    st.last_request_at = Some(now);
                    return;
                }
                wait
            };

            tracing::debug!(bucket = bucket.as_str(), wait_secs = wait.as_secs_f64(), "pacing");
            tokio::time::sleep(wait).await;
        }
    }

    /// Feed a response status back into the bucket. 403/418 schedule an
    /// exponential backoff window; any 2xx/3xx clears failures and backoff;
    /// everything else is ignored.
    pub fn handle_response(&self, bucket: Bucket, status: u16) {
        let mut state = self.state.lock().expect("rate controller lock poisoned");
        let st = &mut state[bucket.index()];
        match status {
            403 | 418 => {
                st.failures += 1;
                let doubling = 1u32 << st.failures.saturating_sub(1).min(20);
                let delay = self
                    .config
                    .base_delay
                    .saturating_mul(doubling)
                    .min(self.config.max_delay);
                let jitter = delay.mul_f64(self.config.jitter_ratio * rand::thread_rng().gen::<f64>());
                st.backoff_until = Some(Instant::now() + delay + jitter);
                tracing::debug!(
                    bucket = bucket.as_str(),
                    failures = st.failures,
                    delay_secs = (delay + jitter).as_secs_f64(),
                    "backoff scheduled"
                );
            }
            200..=399 => {
                st.failures = 0;
                st.backoff_until = None;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(limit: usize, window: u64, interval: u64) -> RateController {
        RateController::new(RateConfig {
            limit,
            window: Duration::from_secs(window),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter_ratio: 0.0,
            request_interval: Duration::from_secs(interval),
        })
        .expect("valid config")
    }

    #[test]
    fn rejects_zero_limit_or_window() {
        let bad = RateConfig {
            limit: 0,
            ..RateConfig::default()
        };
        assert!(matches!(RateController::new(bad), Err(Error::Init { .. })));

        let bad = RateConfig {
            window: Duration::ZERO,
            ..RateConfig::default()
        };
        assert!(matches!(RateController::new(bad), Err(Error::Init { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_request_waits_for_window_slot() {
        // L=3, W=10, jitter=0: three requests pass at t=0, the fourth
        // blocks until the first timestamp leaves the window at t=10.
        let rate = controller(3, 10, 0);
        let start = Instant::now();
        for _ in 0..3 {
            rate.wait_before_request(Bucket::Api).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        rate.wait_before_request(Bucket::Api).await;
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn window_never_holds_more_than_limit() {
        let rate = controller(3, 10, 0);
        let mut stamps = Vec::new();
        for _ in 0..7 {
            rate.wait_before_request(Bucket::Api).await;
            stamps.push(Instant::now());
        }
        // In any rolling 10s window at most 3 recorded requests.
        for (i, t) in stamps.iter().enumerate() {
            let in_window = stamps
                .iter()
                .filter(|u| **u <= *t && t.duration_since(**u) < Duration::from_secs(10))
                .count();
            assert!(in_window <= 3, "window overflow at request {i}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn api_interval_spaces_requests() {
        let rate = controller(100, 600, 2);
        let start = Instant::now();
        rate.wait_before_request(Bucket::Api).await;
        rate.wait_before_request(Bucket::Api).await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        // The media bucket is not subject to the api spacing.
        let media_start = Instant::now();
        rate.wait_before_request(Bucket::Media).await;
        rate.wait_before_request(Bucket::Media).await;
        assert_eq!(media_start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_resets_on_success() {
        let rate = controller(100, 600, 0);

        rate.handle_response(Bucket::Api, 403);
        let start = Instant::now();
        rate.wait_before_request(Bucket::Api).await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        rate.handle_response(Bucket::Api, 418);
        let start = Instant::now();
        rate.wait_before_request(Bucket::Api).await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        rate.handle_response(Bucket::Api, 403);
        let start = Instant::now();
        rate.wait_before_request(Bucket::Api).await;
        assert_eq!(start.elapsed(), Duration::from_secs(4));

        // A success resets the ladder to base_delay.
        rate.handle_response(Bucket::Api, 200);
        let start = Instant::now();
        rate.wait_before_request(Bucket::Api).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        rate.handle_response(Bucket::Api, 403);
        let start = Instant::now();
        rate.wait_before_request(Bucket::Api).await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped_at_max_delay() {
        let rate = controller(100, 600, 0);
        for _ in 0..10 {
            rate.handle_response(Bucket::Api, 403);
        }
        let start = Instant::now();
        rate.wait_before_request(Bucket::Api).await;
        assert_eq!(start.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn buckets_do_not_cross_pollute() {
        let rate = controller(100, 600, 0);
        rate.handle_response(Bucket::Api, 403);

        let start = Instant::now();
        rate.wait_before_request(Bucket::Media).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_statuses_leave_state_alone() {
        let rate = controller(100, 600, 0);
        rate.handle_response(Bucket::Api, 403);
        rate.handle_response(Bucket::Api, 404);
        // 404 neither clears nor extends the pending backoff.
        let start = Instant::now();
        rate.wait_before_request(Bucket::Api).await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
