//! Pure translation of upstream JSON into typed records.
//!
//! No I/O happens here: every function takes already-fetched
//! `serde_json::Value` trees (and, where dates are relative, an explicit
//! `now`) and returns typed records. The untranslated input is preserved in
//! each record's `raw` pouch.

use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Timelike};
use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::error::Error;
use crate::model::{upstream_tz, MediaItem, MediaKind, Post, SuperTopic, User};

/// Canonical upstream timestamp form, e.g. `Mon Aug 13 10:00:00 +0800 2018`.
const CANONICAL_FMT: &str = "%a %b %d %H:%M:%S %z %Y";

fn minutes_ago_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\s*(?:分钟前|分鐘前)$").expect("static regex"))
}

fn yesterday_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^昨天\s*(\d{2}):(\d{2})").expect("static regex"))
}

fn month_day_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{2})-(\d{2})$").expect("static regex"))
}

/// Parse any of the upstream's date spellings into an instant at +08:00.
///
/// Accepted, in order: the canonical form, `<N> 分钟前` / `分鐘前` (N minutes
/// ago, truncated to the minute), `昨天 HH:MM`, `MM-DD` (current year), and
/// `YYYY-MM-DD`. Anything else is a schema error.
pub fn parse_upstream_datetime(
    raw: &str,
    now: DateTime<FixedOffset>,
) -> Result<DateTime<FixedOffset>, Error> {
    let tz = upstream_tz();
    let now = now.with_timezone(&tz);
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_str(raw, CANONICAL_FMT) {
        return Ok(dt.with_timezone(&tz));
    }

    if let Some(caps) = minutes_ago_re().captures(raw) {
        let minutes: i64 = caps[1]
            .parse()
            .map_err(|_| schema(format!("invalid relative date: {raw}")))?;
        let dt = now - Duration::minutes(minutes);
        return truncate_to_minute(dt).ok_or_else(|| schema(format!("invalid date: {raw}")));
    }

    if let Some(caps) = yesterday_re().captures(raw) {
        let hour: u32 = caps[1].parse().expect("two digits");
        let minute: u32 = caps[2].parse().expect("two digits");
        let dt = (now - Duration::days(1))
            .with_hour(hour)
            .and_then(|d| d.with_minute(minute))
            .and_then(truncate_to_minute);
        return dt.ok_or_else(|| schema(format!("invalid date: {raw}")));
    }

    if let Some(caps) = month_day_re().captures(raw) {
        let month: u32 = caps[1].parse().expect("two digits");
        let day: u32 = caps[2].parse().expect("two digits");
        return tz
            .with_ymd_and_hms(now.year(), month, day, 0, 0, 0)
            .single()
            .ok_or_else(|| schema(format!("invalid date: {raw}")));
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).expect("midnight exists");
        return tz
            .from_local_datetime(&midnight)
            .single()
            .ok_or_else(|| schema(format!("invalid date: {raw}")));
    }

    Err(schema(format!("unknown date format: {raw}")))
}

fn truncate_to_minute(dt: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    dt.with_second(0).and_then(|d| d.with_nanosecond(0))
}

fn schema(message: String) -> Error {
    Error::Schema { message }
}

/// Read a field that the upstream serves sometimes as a string, sometimes
/// as a bare number.
fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse an upstream user record.
pub fn parse_user_info(raw: &Value) -> Result<User, Error> {
    let uid = string_field(raw, "id")
        .or_else(|| string_field(raw, "idstr"))
        .ok_or_else(|| schema("user missing id".to_string()))?;

    let nickname = string_field(raw, "screen_name")
        .or_else(|| string_field(raw, "nickname"))
        .unwrap_or_else(|| format!("user_{uid}"));

    let avatar_url = string_field(raw, "avatar_large").or_else(|| string_field(raw, "profile_image_url"));

    Ok(User {
        uid,
        nickname,
        avatar_url,
        raw: raw.clone(),
    })
}

/// Parse a super-topic card.
pub fn parse_supertopic(raw: &Value) -> Result<SuperTopic, Error> {
    let containerid = string_field(raw, "containerid")
        .or_else(|| string_field(raw, "id"))
        .ok_or_else(|| schema("supertopic missing containerid".to_string()))?;

    let name = string_field(raw, "topic_title")
        .or_else(|| string_field(raw, "topic_name"))
        .unwrap_or_else(|| "topic".to_string());

    Ok(SuperTopic {
        containerid,
        name,
        raw: raw.clone(),
    })
}

/// The last path segment of a URL, minus its extension.
fn url_stem(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let stem = Path::new(segment).file_stem()?.to_str()?;
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

/// Pictures first, then the video if the post carries one. Pictures prefer
/// the `large` rendition; videos walk the quality ladder
/// `stream_url_hd` > `mp4_720p_mp4` > `mp4_hd_url` > `stream_url` and are
/// dropped entirely when no variant is present.
fn extract_media(mblog: &Value) -> Vec<MediaItem> {
    let mut items = Vec::new();

    if let Some(pics) = mblog.get("pics").and_then(Value::as_array) {
        for (index, pic) in pics.iter().enumerate() {
            let url = pic
                .get("large")
                .and_then(|l| string_field(l, "url"))
                .or_else(|| string_field(pic, "url"));
            if let Some(url) = url {
                items.push(MediaItem {
                    kind: MediaKind::Picture,
                    filename_hint: url_stem(&url),
                    url,
                    index,
                    raw: pic.clone(),
                });
            }
        }
    }

    if let Some(page_info) = mblog.get("page_info") {
        if page_info.get("type").and_then(Value::as_str) == Some("video") {
            let info = page_info.get("media_info").unwrap_or(&Value::Null);
            let url = ["stream_url_hd", "mp4_720p_mp4", "mp4_hd_url", "stream_url"]
                .into_iter()
                .find_map(|key| string_field(info, key));
            if let Some(url) = url {
                items.push(MediaItem {
                    kind: MediaKind::Video,
                    filename_hint: url_stem(&url),
                    url,
                    index: items.len(),
                    raw: page_info.clone(),
                });
            }
        }
    }

    items
}

/// Parse one post out of a card (or bare `mblog`) record.
///
/// A post with no `mid` or no `created_at` is a schema error; `now` anchors
/// the relative date spellings.
pub fn parse_post(card: &Value, now: DateTime<FixedOffset>) -> Result<Post, Error> {
    let mblog = match card.get("mblog") {
        Some(inner) if inner.is_object() => inner,
        _ => card,
    };

    let mid = string_field(mblog, "mid")
        .or_else(|| string_field(mblog, "id"))
        .ok_or_else(|| schema("post missing mid".to_string()))?;

    let created_raw = mblog
        .get("created_at")
        .and_then(Value::as_str)
        .ok_or_else(|| schema(format!("post {mid} missing created_at")))?;

    let user = match mblog.get("user") {
        Some(u) if u.is_object() => Some(parse_user_info(u)?),
        _ => None,
    };

    Ok(Post {
        bid: string_field(mblog, "bid"),
        text: string_field(mblog, "text_raw")
            .or_else(|| string_field(mblog, "text"))
            .unwrap_or_default(),
        created_at: parse_upstream_datetime(created_raw, now)?,
        user,
        media_items: extract_media(mblog),
        raw: card.clone(),
        mid,
    })
}

/// The upstream's since-id continuation token, when the page carries one.
pub fn extract_next_cursor(page: &Value) -> Option<String> {
    let info = page.get("cardlistInfo")?;
    match info.get("since_id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_u64() != Some(0) => Some(n.to_string()),
        _ => None,
    }
}

/// Flatten a feed page's `cards` (and nested `card_group`s) into posts.
///
/// Schema problems are contained per card: the card is logged and skipped,
/// never the page. Duplicate mids within the page collapse to the first
/// occurrence.
pub fn parse_page(data: &Value, now: DateTime<FixedOffset>) -> Vec<Post> {
    let mut posts: Vec<Post> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let Some(cards) = data.get("cards").and_then(Value::as_array) else {
        return posts;
    };

    for card in cards {
        if !card.is_object() {
            continue;
        }
        let group = card
            .get("card_group")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for item in std::iter::once(card).chain(group.iter()) {
            if !item.is_object() || item.get("mblog").is_none() {
                continue;
            }
            match parse_post(item, now) {
                Ok(post) => {
                    if seen.insert(post.mid.clone()) {
                        posts.push(post);
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "skipping malformed card");
                }
            }
        }
    }

    posts
}
