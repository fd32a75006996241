//! Positional target token parsing.
//!
//! Token syntax: a URL yields the mid embedded in `/detail/{mid}` or a
//! `mid`/`id` query parameter; a leading `#` is a super-topic; a leading
//! `:` is a search; all-digits is a uid; anything else is a nickname. The
//! `--mid` flag forces a mid target for non-URL tokens, but a URL
//! positional still wins.

use url::Url;
use weiboharvest_core::{Error, TargetSpec};

pub fn parse_target(raw: &str, mid_flag: Option<&str>) -> Result<TargetSpec, Error> {
    let token = raw.trim();

    if token.starts_with("http://") || token.starts_with("https://") {
        let mid = extract_mid_from_url(token).ok_or_else(|| Error::Init {
            message: format!("cannot parse mid from url: {raw}"),
        })?;
        return Ok(TargetSpec::Mid { mid });
    }

    if let Some(mid) = mid_flag.map(str::trim).filter(|m| !m.is_empty()) {
        return Ok(TargetSpec::Mid {
            mid: mid.to_string(),
        });
    }

    if let Some(identifier) = token.strip_prefix('#') {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(Error::Init {
                message: "empty super-topic target".to_string(),
            });
        }
        return Ok(TargetSpec::SuperTopic {
            identifier: identifier.to_string(),
            is_containerid: looks_like_containerid(identifier),
        });
    }

    if let Some(keyword) = token.strip_prefix(':') {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(Error::Init {
                message: "empty search target".to_string(),
            });
        }
        return Ok(TargetSpec::Search {
            keyword: keyword.to_string(),
        });
    }

    if token.is_empty() {
        return Err(Error::Init {
            message: "missing target".to_string(),
        });
    }

    Ok(TargetSpec::User {
        identifier: token.to_string(),
        is_uid: token.chars().all(|c| c.is_ascii_digit()),
    })
}

fn looks_like_containerid(identifier: &str) -> bool {
    identifier.starts_with("100808") || identifier.ends_with("_-_feed")
}

fn extract_mid_from_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;

    if let Some(mut segments) = url.path_segments() {
        while let Some(segment) = segments.next() {
            if segment == "detail" {
                if let Some(mid) = segments.next().map(str::trim).filter(|m| !m.is_empty()) {
                    return Some(mid.to_string());
                }
            }
        }
    }

    for key in ["mid", "id"] {
        if let Some(value) = url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim().to_string())
        {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digits_become_uid_targets() {
        assert_eq!(
            parse_target("123456", None).expect("parse"),
            TargetSpec::User {
                identifier: "123456".into(),
                is_uid: true
            }
        );
    }

    #[test]
    fn names_become_nickname_targets() {
        assert_eq!(
            parse_target("some_user", None).expect("parse"),
            TargetSpec::User {
                identifier: "some_user".into(),
                is_uid: false
            }
        );
    }

    #[test]
    fn hash_prefix_is_a_supertopic() {
        assert_eq!(
            parse_target("#rustlang", None).expect("parse"),
            TargetSpec::SuperTopic {
                identifier: "rustlang".into(),
                is_containerid: false
            }
        );
        assert_eq!(
            parse_target("#100808abc123", None).expect("parse"),
            TargetSpec::SuperTopic {
                identifier: "100808abc123".into(),
                is_containerid: true
            }
        );
        assert_eq!(
            parse_target("#abc_-_feed", None).expect("parse"),
            TargetSpec::SuperTopic {
                identifier: "abc_-_feed".into(),
                is_containerid: true
            }
        );
    }

    #[test]
    fn colon_prefix_is_a_search() {
        assert_eq!(
            parse_target(":rust harvester", None).expect("parse"),
            TargetSpec::Search {
                keyword: "rust harvester".into()
            }
        );
    }

    #[test]
    fn detail_urls_yield_mids() {
        assert_eq!(
            parse_target("https://m.weibo.cn/detail/4912345678901234", None).expect("parse"),
            TargetSpec::Mid {
                mid: "4912345678901234".into()
            }
        );
        assert_eq!(
            parse_target("https://m.weibo.cn/status?mid=abc123", None).expect("parse"),
            TargetSpec::Mid {
                mid: "abc123".into()
            }
        );
    }

    #[test]
    fn url_wins_over_mid_flag() {
        assert_eq!(
            parse_target("https://m.weibo.cn/detail/from_url", Some("from_flag")).expect("parse"),
            TargetSpec::Mid {
                mid: "from_url".into()
            }
        );
    }

    #[test]
    fn mid_flag_overrides_non_url_tokens() {
        assert_eq!(
            parse_target("123456", Some("abc123")).expect("parse"),
            TargetSpec::Mid {
                mid: "abc123".into()
            }
        );
        assert_eq!(
            parse_target("", Some("abc123")).expect("parse"),
            TargetSpec::Mid {
                mid: "abc123".into()
            }
        );
    }

    #[test]
    fn invalid_tokens_are_init_errors() {
        assert!(matches!(parse_target("", None), Err(Error::Init { .. })));
        assert!(matches!(parse_target("#", None), Err(Error::Init { .. })));
        assert!(matches!(parse_target(":", None), Err(Error::Init { .. })));
        assert!(matches!(
            parse_target("https://m.weibo.cn/home", None),
            Err(Error::Init { .. })
        ));
    }
}
