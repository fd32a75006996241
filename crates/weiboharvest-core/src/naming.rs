//! Output path composition: template rendering, sanitization, and the
//! default per-target directory layouts.
//!
//! Template grammar: `{name}` or `{name:spec}`. `date:spec` is strftime
//! (falling back to `%Y%m%d_%H%M%S` on an invalid spec), `index:N` is
//! zero-padded to width N, and every other name substitutes verbatim.

use std::sync::OnceLock;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset, Utc};
use regex::{Captures, Regex};

use crate::model::{upstream_tz, TargetKind, TargetSpec};

/// Characters stripped from every rendered path component.
pub const ILLEGAL: &str = "\\/:*?\"<>|";

/// `{text}` expands to at most this many characters.
pub const MAX_TEXT: usize = 50;

const DATE_FMT: &str = "%Y%m%d_%H%M%S";

/// Default directory template per target kind.
pub fn default_dirname_pattern(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::User => "./{nickname}/",
        TargetKind::SuperTopic => "./topic/{topic_name}/",
        TargetKind::Search => "./search/{keyword}/",
        TargetKind::Mid => "./",
    }
}

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)(?::([^{}]*))?\}").expect("static regex")
    })
}

/// Values available to a template. Unset names render empty.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    pub nickname: String,
    pub uid: String,
    pub mid: String,
    pub bid: String,
    pub text: String,
    /// The `{type}` token: `picture` or `video`.
    pub media_kind: String,
    pub topic_name: String,
    pub keyword: String,
    pub name: String,
    pub date: Option<DateTime<FixedOffset>>,
    pub index: Option<usize>,
}

/// Strip the illegal character set, and reject `.` / `..` as whole tokens.
/// Idempotent: sanitizing a sanitized string is a no-op.
pub fn sanitize(s: &str) -> String {
    let cleaned: String = s.chars().filter(|c| !ILLEGAL.contains(*c)).collect();
    if cleaned == "." || cleaned == ".." {
        String::new()
    } else {
        cleaned
    }
}

fn format_date(date: &DateTime<FixedOffset>, spec: &str) -> String {
    let items: Vec<Item<'_>> = StrftimeItems::new(spec).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return date.format(DATE_FMT).to_string();
    }
    date.format_with_items(items.into_iter()).to_string()
}

/// Substitute `{name}` / `{name:spec}` tokens in `template`.
pub fn render_template(template: &str, vars: &TemplateVars) -> String {
    let date = vars
        .date
        .unwrap_or_else(|| Utc::now().with_timezone(&upstream_tz()));
    let text: String = vars.text.chars().take(MAX_TEXT).collect();

    template_re()
        .replace_all(template, |caps: &Captures<'_>| {
            let spec = caps.get(2).map(|m| m.as_str());
            match &caps[1] {
                "date" => match spec {
                    Some(spec) if !spec.is_empty() => format_date(&date, spec),
                    _ => date.format(DATE_FMT).to_string(),
                },
                "index" => match (vars.index, spec) {
                    (None, _) => String::new(),
                    (Some(idx), Some(width)) if width.chars().all(|c| c.is_ascii_digit()) && !width.is_empty() => {
                        let width: usize = width.parse().unwrap_or(0);
                        format!("{idx:0width$}")
                    }
                    (Some(idx), _) => idx.to_string(),
                },
                "nickname" => vars.nickname.clone(),
                "uid" => vars.uid.clone(),
                "mid" => vars.mid.clone(),
                "bid" => vars.bid.clone(),
                "text" => text.clone(),
                "type" => vars.media_kind.clone(),
                "topic_name" => vars.topic_name.clone(),
                "keyword" => vars.keyword.clone(),
                "name" => vars.name.clone(),
                _ => String::new(),
            }
        })
        .into_owned()
}

/// Render and sanitize a media file basename. Falls back to the sanitized
/// mid, then the literal `file`, so the result is never empty.
pub fn build_filename(template: &str, mid: &str, vars: &TemplateVars) -> String {
    let sanitized = sanitize(&render_template(template, vars));
    if !sanitized.is_empty() {
        return sanitized;
    }
    let fallback = sanitize(mid);
    if fallback.is_empty() {
        "file".to_string()
    } else {
        fallback
    }
}

/// Render the output directory for a target, sanitizing each path segment.
///
/// A missing pattern falls back to the per-kind default. The target seeds
/// its own identifier into any still-empty template variable, a leading
/// `./` survives sanitization, and a segment sanitized to nothing becomes
/// `x` rather than collapsing the hierarchy.
pub fn build_directory(target: &TargetSpec, pattern: Option<&str>, vars: &TemplateVars) -> String {
    let pattern = pattern.unwrap_or_else(|| default_dirname_pattern(target.kind()));

    let mut vars = vars.clone();
    match target {
        TargetSpec::User { identifier, is_uid } => {
            if *is_uid && vars.uid.is_empty() {
                vars.uid = identifier.clone();
            } else if !*is_uid && vars.nickname.is_empty() {
                vars.nickname = identifier.clone();
            }
        }
        TargetSpec::SuperTopic { identifier, .. } => {
            if vars.topic_name.is_empty() {
                vars.topic_name = identifier.clone();
            }
        }
        TargetSpec::Search { keyword } => {
            if vars.keyword.is_empty() {
                vars.keyword = keyword.clone();
            }
        }
        TargetSpec::Mid { mid } => {
            if vars.mid.is_empty() {
                vars.mid = mid.clone();
            }
        }
    }

    let rendered = render_template(pattern, &vars);
    let mut parts = Vec::new();
    for (i, part) in rendered.replace('\\', "/").split('/').enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 && part == "." {
            parts.push(".".to_string());
            continue;
        }
        let sanitized = sanitize(part);
        parts.push(if sanitized.is_empty() {
            "x".to_string()
        } else {
            sanitized
        });
    }

    let joined = parts.join("/");
    if rendered.ends_with('/') {
        format!("{joined}/")
    } else {
        joined
    }
}
