use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::api::challenge::{ChallengeHandler, ChallengeMode};
use crate::api::session::SharedSession;
use crate::ratecontrol::{RateConfig, RateController};

/// Rate controller with no pacing so tests never sleep.
fn quick_rate() -> RateController {
    RateController::new(RateConfig {
        limit: 10_000,
        window: Duration::from_secs(600),
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter_ratio: 0.0,
        request_interval: Duration::ZERO,
    })
    .expect("valid config")
}

fn config(server: &MockServer, mode: ChallengeMode) -> ApiConfig {
    ApiConfig {
        base_url: server.uri(),
        challenge_mode: mode,
        challenge_timeout: Duration::from_secs(1),
        ..ApiConfig::default()
    }
}

fn context(server: &MockServer) -> ApiContext {
    ApiContext::new(config(server, ChallengeMode::Skip), quick_rate(), None).expect("context")
}

struct CountingHandler {
    calls: AtomicUsize,
    solved: bool,
}

#[async_trait]
impl ChallengeHandler for CountingHandler {
    async fn solve(&self, _verify_url: &str, _session: &SharedSession, _timeout: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.solved
    }
}

fn feed_page(mids: &[&str], since_id: Option<&str>) -> serde_json::Value {
    let cards: Vec<serde_json::Value> = mids
        .iter()
        .map(|mid| {
            serde_json::json!({
                "mblog": {
                    "mid": mid,
                    "created_at": "Mon Aug 13 10:00:00 +0800 2018",
                    "text": format!("post {mid}"),
                    "user": {"id": 123, "screen_name": "Author"}
                }
            })
        })
        .collect();
    let mut info = serde_json::json!({});
    if let Some(sid) = since_id {
        info["since_id"] = serde_json::Value::String(sid.to_string());
    }
    serde_json::json!({"ok": 1, "data": {"cards": cards, "cardlistInfo": info}})
}

#[tokio::test]
async fn get_user_posts_parses_page_and_cursor() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/api/container/getIndex"))
        .and(query_param("containerid", "107603123456"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(feed_page(&["m1", "m2"], Some("next"))))
        .mount(&server)
        .await;

    let (posts, cursor) = ctx.get_user_posts("123456", 1).await.expect("posts");
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].mid, "m1");
    assert_eq!(posts[0].user.as_ref().map(|u| u.uid.as_str()), Some("123"));
    assert_eq!(cursor.as_deref(), Some("next"));
}

#[tokio::test]
async fn get_index_error_envelope_is_target_error() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/api/container/getIndex"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": 0, "msg": "invalid uid"})),
        )
        .mount(&server)
        .await;

    let err = ctx.get_user_posts("1", 1).await.unwrap_err();
    assert!(matches!(err, Error::Target { .. }));
    assert!(err.to_string().contains("invalid uid"));
}

#[tokio::test]
async fn server_errors_are_retried_then_succeed() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let resp = ctx
        .request(Method::GET, "/api/ping", &RequestOptions::default())
        .await
        .expect("eventual success");
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(server.received_requests().await.expect("requests").len(), 3);
}

#[tokio::test]
async fn persistent_server_error_exhausts_to_target_error() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let opts = RequestOptions {
        retries: 1,
        ..RequestOptions::default()
    };
    let err = ctx.request(Method::GET, "/api/ping", &opts).await.unwrap_err();
    assert!(matches!(err, Error::Target { .. }));
    assert_eq!(server.received_requests().await.expect("requests").len(), 2);
}

#[tokio::test]
async fn unauthorized_is_terminal_auth_error() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = ctx
        .request(Method::GET, "/api/ping", &RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth { .. }));
    // Terminal: no retry burned on it.
    assert_eq!(server.received_requests().await.expect("requests").len(), 1);
}

#[tokio::test]
async fn client_errors_are_terminal_target_errors() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = ctx
        .request(Method::GET, "/api/ping", &RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Target { .. }));
    assert_eq!(server.received_requests().await.expect("requests").len(), 1);
}

#[tokio::test]
async fn throttling_exhausts_to_rate_limit_error() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let opts = RequestOptions {
        retries: 2,
        ..RequestOptions::default()
    };
    let err = ctx.request(Method::GET, "/api/ping", &opts).await.unwrap_err();
    assert!(matches!(err, Error::RateLimit { .. }));
    assert_eq!(server.received_requests().await.expect("requests").len(), 3);
}

#[tokio::test]
async fn solved_challenge_retries_without_consuming_an_attempt() {
    let server = MockServer::start().await;
    let handler = Arc::new(CountingHandler {
        calls: AtomicUsize::new(0),
        solved: true,
    });
    let ctx = ApiContext::new(
        config(&server, ChallengeMode::Browser),
        quick_rate(),
        Some(handler.clone() as Arc<dyn ChallengeHandler>),
    )
    .expect("context");

    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "https://passport.weibo.cn/verify?from=feed"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // retries=0: the retry after the solved challenge must be free.
    let opts = RequestOptions {
        retries: 0,
        follow_redirects: false,
        ..RequestOptions::default()
    };
    let resp = ctx.request(Method::GET, "/api/ping", &opts).await.expect("success");
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsolved_challenge_is_an_auth_error() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "https://passport.weibo.cn/verify?from=feed"),
        )
        .mount(&server)
        .await;

    let opts = RequestOptions {
        follow_redirects: false,
        ..RequestOptions::default()
    };
    let err = ctx.request(Method::GET, "/api/ping", &opts).await.unwrap_err();
    assert!(matches!(err, Error::Auth { .. }));
}

#[tokio::test]
async fn pause_and_resume_hooks_bracket_the_challenge() {
    let server = MockServer::start().await;
    let paused = Arc::new(AtomicUsize::new(0));
    let resumed = Arc::new(AtomicUsize::new(0));
    let ctx = {
        let paused = paused.clone();
        let resumed = resumed.clone();
        ApiContext::new(config(&server, ChallengeMode::Skip), quick_rate(), None)
            .expect("context")
            .on_challenge_pause(
                move || {
                    paused.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    resumed.fetch_add(1, Ordering::SeqCst);
                },
            )
    };

    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", "https://passport.weibo.cn/verify"),
        )
        .mount(&server)
        .await;

    let opts = RequestOptions {
        follow_redirects: false,
        ..RequestOptions::default()
    };
    let _ = ctx.request(Method::GET, "/api/ping", &opts).await;
    // Resume fires even though the handler failed.
    assert_eq!(paused.load(Ordering::SeqCst), 1);
    assert_eq!(resumed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn set_cookie_responses_are_merged_and_replayed() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/issue"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Set-Cookie", "SUB=token123; Path=/; HttpOnly"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/echo"))
        .and(header("Cookie", "SUB=token123"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    ctx.request(Method::GET, "/issue", &RequestOptions::default())
        .await
        .expect("issue");
    ctx.validate_cookie().await.expect("SUB cookie present");
    ctx.request(Method::GET, "/echo", &RequestOptions::default())
        .await
        .expect("cookie replayed");
}

#[tokio::test]
async fn validate_cookie_fails_without_auth_cookie() {
    let server = MockServer::start().await;
    let ctx = context(&server);
    let err = ctx.validate_cookie().await.unwrap_err();
    assert!(matches!(err, Error::Auth { .. }));
}

#[tokio::test]
async fn resolve_nickname_reads_redirect_location() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/n/Alice"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", "https://m.weibo.cn/u/1234567"),
        )
        .mount(&server)
        .await;

    let uid = ctx.resolve_nickname_to_uid("Alice").await.expect("uid");
    assert_eq!(uid, "1234567");
}

#[tokio::test]
async fn resolve_nickname_failure_is_target_error() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/n/Nobody"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>no uid here</html>"))
        .mount(&server)
        .await;

    let err = ctx.resolve_nickname_to_uid("Nobody").await.unwrap_err();
    assert!(matches!(err, Error::Target { .. }));
}

#[tokio::test]
async fn get_user_info_unwraps_user_info_envelope() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/api/container/getIndex"))
        .and(query_param("type", "uid"))
        .and(query_param("value", "123456"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": 1,
            "data": {"userInfo": {"id": 123456, "screen_name": "TestUser"}}
        })))
        .mount(&server)
        .await;

    let user = ctx.get_user_info("123456").await.expect("user");
    assert_eq!(user.uid, "123456");
    assert_eq!(user.nickname, "TestUser");
}

#[tokio::test]
async fn search_supertopic_recovers_containerid_and_title() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/api/container/getIndex"))
        .and(query_param("containerid", "100103type=98&q=topic"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": 1,
            "data": {"cards": [
                {"scheme": "sinaweibo://pageinfo?containerid=100808abc123&ext=x",
                 "title_sub": "#topic#"},
                {"containerid": "100808abc123", "topic_title": "topic again"},
                {"irrelevant": true}
            ]}
        })))
        .mount(&server)
        .await;

    let topics = ctx.search_supertopic("topic").await.expect("topics");
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].containerid, "100808abc123");
    assert_eq!(topics[0].name, "topic");
}

#[tokio::test]
async fn supertopic_feed_appends_feed_suffix() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/api/container/getIndex"))
        .and(query_param("containerid", "100808abc123_-_feed"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(feed_page(&["t1"], None)))
        .mount(&server)
        .await;

    let (posts, cursor) = ctx.get_supertopic_posts("100808abc123", 1).await.expect("posts");
    assert_eq!(posts.len(), 1);
    assert_eq!(cursor, None);
}

#[tokio::test]
async fn get_post_by_mid_reads_embedded_render_data() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    let html = concat!(
        "<html><script>var $render_data = [{\"status\": {\"mid\": \"abc123\", ",
        "\"created_at\": \"Mon Aug 13 10:00:00 +0800 2018\", \"text\": \"hello\"}}][0] || {};",
        "</script></html>"
    );
    Mock::given(method("GET"))
        .and(path("/detail/abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_string(html))
        .mount(&server)
        .await;

    let post = ctx.get_post_by_mid("abc123").await.expect("post");
    assert_eq!(post.mid, "abc123");
    assert_eq!(post.text, "hello");
    // Only the detail page was touched, never the paginated endpoints.
    let requests = server.received_requests().await.expect("requests");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url.path(), "/detail/abc123");
}

#[tokio::test]
async fn get_post_by_mid_falls_back_to_status_endpoint() {
    let server = MockServer::start().await;
    let ctx = context(&server);

    Mock::given(method("GET"))
        .and(path("/detail/xyz"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>nothing embedded</html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/statuses/show"))
        .and(query_param("id", "xyz"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"mid": "xyz", "created_at": "2018-08-13"}
        })))
        .mount(&server)
        .await;

    let post = ctx.get_post_by_mid("xyz").await.expect("post");
    assert_eq!(post.mid, "xyz");
}

#[tokio::test]
async fn session_save_and_load_round_trip() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");

    let ctx = context(&server);
    ctx.set_cookies_from_string("SUB=abc; SUBP=def").await.expect("cookies");
    let written = ctx.save_session(Some(&path)).await.expect("save");
    assert_eq!(written, path);

    let fresh = context(&server);
    assert!(fresh.load_session(Some(&path)).await);
    fresh.validate_cookie().await.expect("SUB restored");
}

#[test]
fn extract_uid_handles_urls_queries_and_text() {
    assert_eq!(extract_uid("https://m.weibo.cn/u/1234567"), Some("1234567".into()));
    assert_eq!(
        extract_uid("https://m.weibo.cn/profile/7654321?from=page"),
        Some("7654321".into())
    );
    assert_eq!(
        extract_uid("https://m.weibo.cn/p/index?uid=111222333"),
        Some("111222333".into())
    );
    assert_eq!(extract_uid("uid is 55555 somewhere"), Some("55555".into()));
    assert_eq!(extract_uid("no digits here"), None);
    assert_eq!(extract_uid(""), None);
}

#[test]
fn extract_status_handles_fallback_form() {
    let html = r#"<script>window.config = {"status": {"mid": "m9", "ok": 1}};</script>"#;
    let status = extract_status_from_html(html).expect("status");
    assert_eq!(status.get("mid").and_then(serde_json::Value::as_str), Some("m9"));
}
