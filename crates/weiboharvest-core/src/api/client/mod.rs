//! Authenticated upstream access.
//!
//! [`ApiContext`] braids authentication, rate control, retry, and the
//! challenge detour into one request discipline, and exposes typed
//! accessors over the upstream's endpoints. The session is shared with
//! media workers; the HTTP client multiplexes connections safely under
//! that sharing.

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use regex::Regex;
use reqwest::header::{HeaderName, HeaderValue, LOCATION, SET_COOKIE};
use reqwest::{Method, Response};
use serde_json::Value;
use url::Url;

use super::challenge::{
    extract_challenge_url, ChallengeHandler, ChallengeMode, ManualChallengeHandler,
    SkipChallengeHandler, CHALLENGE_TIMEOUT_DEFAULT,
};
use super::session::{SessionStore, SharedSession};
use crate::adapter::{self, parse_post, parse_supertopic, parse_user_info};
use crate::error::Error;
use crate::model::{upstream_tz, Post, SuperTopic, User};
use crate::ratecontrol::{Bucket, RateController};

/// Production upstream origin.
pub const BASE_URL: &str = "https://m.weibo.cn";

const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 13; Pixel 7) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";

/// Idle-read timeout applied to every response body, sized for media
/// streaming.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Context construction knobs.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Upstream origin; overridable for tests.
    pub base_url: String,
    pub challenge_mode: ChallengeMode,
    pub challenge_timeout: Duration,
    /// Connection establishment timeout.
    pub request_timeout: Duration,
    /// Session file override; `None` means the per-user config directory.
    pub session_path: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            challenge_mode: ChallengeMode::Auto,
            challenge_timeout: CHALLENGE_TIMEOUT_DEFAULT,
            request_timeout: Duration::from_secs(20),
            session_path: None,
        }
    }
}

/// Per-call request knobs.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub bucket: Bucket,
    pub allow_challenge: bool,
    /// Retries after the initial attempt.
    pub retries: u32,
    pub follow_redirects: bool,
    pub query: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            bucket: Bucket::Api,
            allow_challenge: true,
            retries: 3,
            follow_redirects: true,
            query: Vec::new(),
        }
    }
}

/// Authenticated HTTP context over the upstream.
pub struct ApiContext {
    client: reqwest::Client,
    /// Redirects disabled, for probing `Location` headers.
    probe_client: reqwest::Client,
    base_url: String,
    session: SharedSession,
    rate: RateController,
    challenge: Arc<dyn ChallengeHandler>,
    challenge_timeout: Duration,
    session_path: Option<PathBuf>,
    on_pause: Option<Box<dyn Fn() + Send + Sync>>,
    on_resume: Option<Box<dyn Fn() + Send + Sync>>,
}

/// Fires the resume hook on scope exit, unwinding included.
struct ResumeGuard<'a> {
    hook: Option<&'a (dyn Fn() + Send + Sync)>,
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        if let Some(hook) = self.hook {
            hook();
        }
    }
}

impl ApiContext {
    /// Build a context. The challenge mechanism is selected here, once:
    /// `Browser` requires `browser_handler` to be wired in, `Auto` prefers
    /// it and falls back to the operator prompt.
    pub fn new(
        config: ApiConfig,
        rate: RateController,
        browser_handler: Option<Arc<dyn ChallengeHandler>>,
    ) -> Result<Self, Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(
            reqwest::header::REFERER,
            HeaderValue::from_static("https://m.weibo.cn/"),
        );

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers.clone())
            .connect_timeout(config.request_timeout)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| Error::Init {
                message: format!("http client: {e}"),
            })?;
        let probe_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(config.request_timeout)
            .read_timeout(READ_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Init {
                message: format!("http client: {e}"),
            })?;

        let challenge: Arc<dyn ChallengeHandler> = match (config.challenge_mode, browser_handler) {
            (ChallengeMode::Skip, _) => Arc::new(SkipChallengeHandler),
            (ChallengeMode::Manual, _) => Arc::new(ManualChallengeHandler),
            (ChallengeMode::Browser, Some(handler)) | (ChallengeMode::Auto, Some(handler)) => handler,
            (ChallengeMode::Browser, None) => {
                return Err(Error::Init {
                    message: "browser challenge mode requires a browser handler".to_string(),
                })
            }
            (ChallengeMode::Auto, None) => Arc::new(ManualChallengeHandler),
        };

        Ok(Self {
            client,
            probe_client,
            base_url: config.base_url,
            session: Arc::new(tokio::sync::RwLock::new(SessionStore::default())),
            rate,
            challenge,
            challenge_timeout: config.challenge_timeout,
            session_path: config.session_path,
            on_pause: None,
            on_resume: None,
        })
    }

    /// Install hooks fired when the challenge detour suspends and resumes
    /// normal traffic. The resume hook fires on every exit path.
    pub fn on_challenge_pause(
        mut self,
        pause: impl Fn() + Send + Sync + 'static,
        resume: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.on_pause = Some(Box::new(pause));
        self.on_resume = Some(Box::new(resume));
        self
    }

    /// Handle to the shared session store.
    pub fn session(&self) -> SharedSession {
        self.session.clone()
    }

    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&upstream_tz())
    }

    fn absolute_url(&self, path_or_url: &str) -> Result<Url, Error> {
        let raw = if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                path_or_url.trim_start_matches('/')
            )
        };
        Url::parse(&raw).map_err(|_| Error::Target {
            message: format!("invalid url: {raw}"),
            source: None,
        })
    }

    /// Perform a request under the full discipline: rate pacing, retry
    /// with backoff on 403/418/5xx, the challenge detour (which does not
    /// consume an attempt), and typed terminal errors.
    pub async fn request(
        &self,
        method: Method,
        path_or_url: &str,
        opts: &RequestOptions,
    ) -> Result<Response, Error> {
        let target = self.absolute_url(path_or_url)?;
        let client = if opts.follow_redirects {
            &self.client
        } else {
            &self.probe_client
        };

        let mut attempt: u32 = 0;
        loop {
            self.rate.wait_before_request(opts.bucket).await;

            let (cookie_header, extra_headers) = {
                let session = self.session.read().await;
                (session.cookie_header(), session.headers.clone())
            };
            let mut builder = client.request(method.clone(), target.clone());
            if !opts.query.is_empty() {
                builder = builder.query(&opts.query);
            }
            if let Some(cookie) = cookie_header {
                builder = builder.header(reqwest::header::COOKIE, cookie);
            }
            for (name, value) in &extra_headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    builder = builder.header(name, value);
                }
            }

            let resp = match builder.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt >= opts.retries {
                        return Err(Error::Target {
                            message: format!("request failed: {target}"),
                            source: Some(e),
                        });
                    }
                    tracing::debug!(url = %target, attempt, error = %e, "transport failure, retrying");
                    attempt += 1;
                    continue;
                }
            };

            let status = resp.status().as_u16();
            self.rate.handle_response(opts.bucket, status);
            self.capture_cookies(&resp).await;

            let final_url = resp.url().to_string();
            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            if opts.allow_challenge {
                if let Some(verify_url) = extract_challenge_url(status, &final_url, location.as_deref())
                {
                    drop(resp);
                    if self.solve_challenge(&verify_url).await {
                        // Solving the wall does not consume an attempt.
                        continue;
                    }
                    return Err(Error::Auth {
                        message: "challenge not solved".to_string(),
                    });
                }
            }

            match status {
                401 => {
                    return Err(Error::Auth {
                        message: "authentication failed".to_string(),
                    })
                }
                403 | 418 => {
                    if attempt >= opts.retries {
                        return Err(Error::RateLimit { target: final_url });
                    }
                    // Backoff is already scheduled by handle_response.
                    attempt += 1;
                }
                500..=u16::MAX => {
                    if attempt >= opts.retries {
                        return Err(Error::Target {
                            message: format!("server error {status}: {final_url}"),
                            source: None,
                        });
                    }
                    attempt += 1;
                }
                400..=499 => {
                    return Err(Error::Target {
                        message: format!("http {status}: {final_url}"),
                        source: None,
                    })
                }
                _ => return Ok(resp),
            }
        }
    }

    async fn capture_cookies(&self, resp: &Response) {
        let set_cookies: Vec<String> = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        if set_cookies.is_empty() {
            return;
        }
        let mut session = self.session.write().await;
        for header in set_cookies {
            session.merge_set_cookie(&header);
        }
    }

    async fn solve_challenge(&self, verify_url: &str) -> bool {
        tracing::info!(url = verify_url, "challenge wall, suspending requests");
        if let Some(hook) = &self.on_pause {
            hook();
        }
        let _resume = ResumeGuard {
            hook: self.on_resume.as_deref(),
        };
        self.challenge
            .solve(verify_url, &self.session, self.challenge_timeout)
            .await
    }

    async fn get_json(&self, path: &str, opts: &RequestOptions) -> Result<Value, Error> {
        let resp = self.request(Method::GET, path, opts).await?;
        resp.json().await.map_err(|e| Error::Target {
            message: format!("invalid json from {path}"),
            source: Some(e),
        })
    }

    /// Call the shared feed endpoint and unwrap its `data` envelope.
    async fn get_index(&self, params: Vec<(String, String)>) -> Result<Value, Error> {
        let opts = RequestOptions {
            query: params,
            ..RequestOptions::default()
        };
        let payload = self.get_json("/api/container/getIndex", &opts).await?;
        match payload.get("data") {
            Some(data) if data.is_object() => Ok(data.clone()),
            _ => Err(Error::Target {
                message: payload
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("api error")
                    .to_string(),
                source: None,
            }),
        }
    }

    /// Resolve a display nickname to a uid via the redirect probe, falling
    /// back to following the redirect and scanning the landing page.
    pub async fn resolve_nickname_to_uid(&self, nickname: &str) -> Result<String, Error> {
        let encoded = utf8_percent_encode(nickname.trim(), NON_ALPHANUMERIC).to_string();
        let path = format!("/n/{encoded}");

        let probe_opts = RequestOptions {
            retries: 2,
            follow_redirects: false,
            ..RequestOptions::default()
        };
        let resp = self.request(Method::GET, &path, &probe_opts).await?;
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let final_url = resp.url().to_string();
        drop(resp);

        if let Some(uid) = location
            .as_deref()
            .filter(|loc| !loc.is_empty())
            .and_then(extract_uid)
            .or_else(|| extract_uid(&final_url))
        {
            return Ok(uid);
        }

        let follow_opts = RequestOptions {
            retries: 2,
            ..RequestOptions::default()
        };
        let resp = self.request(Method::GET, &path, &follow_opts).await?;
        let final_url = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        if let Some(uid) = extract_uid(&final_url).or_else(|| extract_uid(&body)) {
            return Ok(uid);
        }

        Err(Error::Target {
            message: format!("cannot resolve nickname: {nickname}"),
            source: None,
        })
    }

    /// Fetch profile data for a uid.
    pub async fn get_user_info(&self, uid: &str) -> Result<User, Error> {
        let data = self
            .get_index(vec![
                ("type".to_string(), "uid".to_string()),
                ("value".to_string(), uid.to_string()),
            ])
            .await?;

        let user = data
            .get("userInfo")
            .filter(|v| v.is_object())
            .or_else(|| data.get("user").filter(|v| v.is_object()))
            .cloned()
            .or_else(|| {
                data.get("cards")
                    .and_then(Value::as_array)
                    .and_then(|cards| {
                        cards
                            .iter()
                            .find_map(|c| c.get("user").filter(|u| u.is_object()).cloned())
                    })
            });

        match user {
            Some(user) => parse_user_info(&user),
            None => Err(Error::Auth {
                message: format!("user not found: {uid}"),
            }),
        }
    }

    /// One page of a user's feed plus the next-cursor token.
    pub async fn get_user_posts(
        &self,
        uid: &str,
        page: u32,
    ) -> Result<(Vec<Post>, Option<String>), Error> {
        let data = self
            .get_index(vec![
                ("containerid".to_string(), format!("107603{uid}")),
                ("page".to_string(), page.to_string()),
            ])
            .await?;
        Ok((
            adapter::parse_page(&data, self.now()),
            adapter::extract_next_cursor(&data),
        ))
    }

    /// One page of a super-topic feed plus the next-cursor token.
    pub async fn get_supertopic_posts(
        &self,
        containerid: &str,
        page: u32,
    ) -> Result<(Vec<Post>, Option<String>), Error> {
        let containerid = if containerid.ends_with("_-_feed") {
            containerid.to_string()
        } else {
            format!("{containerid}_-_feed")
        };
        let data = self
            .get_index(vec![
                ("containerid".to_string(), containerid),
                ("page".to_string(), page.to_string()),
            ])
            .await?;
        Ok((
            adapter::parse_page(&data, self.now()),
            adapter::extract_next_cursor(&data),
        ))
    }

    /// Search super-topics by keyword, deduplicated by container id.
    ///
    /// Cards that hide the container id inside their `scheme` URL, or the
    /// title under `title_sub`/`title`, are recovered before parsing.
    pub async fn search_supertopic(&self, keyword: &str) -> Result<Vec<SuperTopic>, Error> {
        let data = self
            .get_index(vec![(
                "containerid".to_string(),
                format!("100103type=98&q={keyword}"),
            )])
            .await?;

        let mut topics = Vec::new();
        let mut seen = HashSet::new();
        let Some(cards) = data.get("cards").and_then(Value::as_array) else {
            return Ok(topics);
        };
        for card in cards {
            if !card.is_object() {
                continue;
            }
            let mut raw = card.clone();
            if raw.get("containerid").is_none() {
                if let Some(scheme) = card.get("scheme").and_then(Value::as_str) {
                    if let Some(caps) = containerid_re().captures(scheme) {
                        raw["containerid"] = Value::String(caps[1].to_string());
                    }
                }
            }
            if raw.get("topic_title").is_none() {
                let title = card
                    .get("title_sub")
                    .and_then(Value::as_str)
                    .or_else(|| card.get("title").and_then(Value::as_str));
                if let Some(title) = title {
                    raw["topic_title"] =
                        Value::String(title.trim_matches(['#', ' ']).to_string());
                }
            }
            if let Ok(topic) = parse_supertopic(&raw) {
                if seen.insert(topic.containerid.clone()) {
                    topics.push(topic);
                }
            }
        }
        Ok(topics)
    }

    /// One page of full-text search results plus the next-cursor token.
    pub async fn search_posts(
        &self,
        keyword: &str,
        page: u32,
    ) -> Result<(Vec<Post>, Option<String>), Error> {
        let data = self
            .get_index(vec![
                (
                    "containerid".to_string(),
                    format!("100103type=1&q={keyword}"),
                ),
                ("page".to_string(), page.to_string()),
            ])
            .await?;
        Ok((
            adapter::parse_page(&data, self.now()),
            adapter::extract_next_cursor(&data),
        ))
    }

    /// Fetch a single post by mid: the detail page's embedded render data
    /// first, then the status endpoint.
    pub async fn get_post_by_mid(&self, mid: &str) -> Result<Post, Error> {
        let opts = RequestOptions {
            retries: 2,
            ..RequestOptions::default()
        };
        let resp = self.request(Method::GET, &format!("/detail/{mid}"), &opts).await?;
        let html = resp.text().await.unwrap_or_default();
        if let Some(status) = extract_status_from_html(&html) {
            return parse_post(&status, self.now());
        }

        let show_opts = RequestOptions {
            query: vec![("id".to_string(), mid.to_string())],
            ..RequestOptions::default()
        };
        let payload = self.get_json("/api/statuses/show", &show_opts).await?;
        let status = match payload.get("data") {
            Some(data) if data.is_object() => data.clone(),
            _ => payload,
        };
        if status.is_object() && !status.as_object().is_some_and(serde_json::Map::is_empty) {
            return parse_post(&status, self.now());
        }

        Err(Error::Target {
            message: format!("post not found: {mid}"),
            source: None,
        })
    }

    /// Fail unless the session carries the authentication cookie.
    pub async fn validate_cookie(&self) -> Result<(), Error> {
        if self.session.read().await.has_auth_cookie() {
            Ok(())
        } else {
            Err(Error::Auth {
                message: "missing SUB cookie".to_string(),
            })
        }
    }

    /// Merge cookies from a `name=value; ...` string into the session.
    pub async fn set_cookies_from_string(&self, raw: &str) -> Result<(), Error> {
        self.session.write().await.apply_cookie_string(raw)
    }

    /// Merge cookies from a file holding a cookie string.
    pub async fn set_cookies_from_file(&self, path: &Path) -> Result<(), Error> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Auth {
            message: format!("cannot read cookie file {}: {e}", path.display()),
        })?;
        self.set_cookies_from_string(&text).await
    }

    /// Persist the session snapshot; returns the path written.
    pub async fn save_session(&self, path: Option<&Path>) -> Result<PathBuf, Error> {
        let path = self.session_file(path)?;
        self.session.read().await.save(&path)?;
        Ok(path)
    }

    /// Load a session snapshot into the live session. Returns whether a
    /// snapshot was found.
    pub async fn load_session(&self, path: Option<&Path>) -> bool {
        let Ok(path) = self.session_file(path) else {
            return false;
        };
        let Some(loaded) = SessionStore::load(&path) else {
            return false;
        };
        let mut session = self.session.write().await;
        for cookie in loaded.cookies {
            session.set_cookie(&cookie.name, &cookie.value, cookie.domain.as_deref(), &cookie.path);
        }
        session.headers.extend(loaded.headers);
        true
    }

    fn session_file(&self, path: Option<&Path>) -> Result<PathBuf, Error> {
        if let Some(path) = path {
            return Ok(path.to_path_buf());
        }
        if let Some(path) = &self.session_path {
            return Ok(path.clone());
        }
        SessionStore::default_path().ok_or_else(|| Error::Init {
            message: "no config directory available for the session file".to_string(),
        })
    }
}

fn containerid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"containerid=([^&]+)").expect("static regex"))
}

fn render_data_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$render_data\s*=\s*(\[[^\]]+\])\s*\[0\]").expect("static regex"))
}

fn status_obj_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""status"\s*:\s*(\{[^}]+\})"#).expect("static regex"))
}

fn uid_path_res() -> &'static [Regex; 2] {
    static RES: OnceLock<[Regex; 2]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"/u/(\d{5,})").expect("static regex"),
            Regex::new(r"/profile/(\d{5,})").expect("static regex"),
        ]
    })
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{5,}").expect("static regex"))
}

/// Pull a uid out of a redirect URL, landing URL, or page body.
fn extract_uid(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let decoded = percent_decode_str(text)
        .decode_utf8()
        .map_or_else(|_| text.to_string(), |c| c.into_owned());

    if let Ok(url) = Url::parse(&decoded) {
        for key in ["uid", "value", "id"] {
            if let Some(value) = url
                .query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
            {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        for re in uid_path_res() {
            if let Some(caps) = re.captures(url.path()) {
                return Some(caps[1].to_string());
            }
        }
        // Last resort for URLs: digit runs in path or query, never the
        // authority (a port would false-positive).
        let tail = format!("{}?{}", url.path(), url.query().unwrap_or(""));
        return digits_re().find(&tail).map(|m| m.as_str().to_string());
    }

    digits_re().find(&decoded).map(|m| m.as_str().to_string())
}

/// Pull the embedded status record out of a detail page's HTML.
fn extract_status_from_html(html: &str) -> Option<Value> {
    if html.is_empty() {
        return None;
    }
    if let Some(caps) = render_data_re().captures(html) {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&caps[1]) {
            if let Some(status) = items.first().and_then(|first| first.get("status")) {
                if status.is_object() {
                    return Some(status.clone());
                }
            }
        }
    }
    if let Some(caps) = status_obj_re().captures(html) {
        if let Ok(value) = serde_json::from_str::<Value>(&caps[1]) {
            return Some(value);
        }
    }
    None
}
