//! Page classifier: maps a URL on a supported site to a capture event.
//!
//! Recognized routes:
//!
//! | Platform | Path                       | Type     |
//! |----------|----------------------------|----------|
//! | ChatGPT  | `/c/<hex>`                 | Chat     |
//! | ChatGPT  | `/p/<hex>`                 | Project  |
//! | ChatGPT  | `/g/g-<alnum>`             | GPT      |
//! | ChatGPT  | `/share/<hex>`             | Share    |
//! | Claude   | `/chat/<hex>`              | Chat     |
//! | Claude   | `/project/<hex>[/...]`     | Project  |
//! | Claude   | `/artifact/<hex>`          | Artifact |
//! | Grok     | any non-empty path         | Chat     |
//!
//! `<hex>` is hex digits and dashes, case-insensitive. Anything else is a miss.

use reqwest::Url;

use crate::types::CaptureEvent;

/// Supported sites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    ChatGpt,
    Claude,
    Grok,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::ChatGpt => "ChatGPT",
            Platform::Claude => "Claude",
            Platform::Grok => "Grok",
        }
    }

    /// Identify the platform from a hostname
    pub fn from_host(host: &str) -> Option<Self> {
        let host = host.to_ascii_lowercase();
        if host == "chat.openai.com" || host == "chatgpt.com" || host.ends_with(".chatgpt.com") {
            Some(Platform::ChatGpt)
        } else if host == "claude.ai" || host.ends_with(".claude.ai") {
            Some(Platform::Claude)
        } else if host == "x.com" || host.ends_with(".x.com") || host.ends_with(".x.ai") {
            Some(Platform::Grok)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource type and id parsed from a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub kind: &'static str,
    pub id: String,
}

/// Classify a page. Returns `None` for unsupported sites and unrecognized routes.
pub fn classify(url: &str, title: &str) -> Option<CaptureEvent> {
    let parsed = Url::parse(url).ok()?;
    let platform = Platform::from_host(parsed.host_str()?)?;
    let route = parse_route(platform, parsed.path())?;

    Some(CaptureEvent::new(
        platform.as_str(),
        route.kind,
        route.id,
        title,
        url,
    ))
}

/// Match a path against the routes for `platform`
pub fn parse_route(platform: Platform, path: &str) -> Option<Route> {
    let route = match platform {
        Platform::ChatGpt => chatgpt_route(path),
        Platform::Claude => claude_route(path),
        Platform::Grok => (!path.is_empty()).then(|| Route {
            kind: "Chat",
            id: path.to_string(),
        }),
    }?;

    (!route.id.is_empty()).then_some(route)
}

fn chatgpt_route(path: &str) -> Option<Route> {
    let segments = segments(path)?;
    let (kind, id) = match segments.as_slice() {
        ["c", id] if is_hex_id(id) => ("Chat", *id),
        ["p", id] if is_hex_id(id) => ("Project", *id),
        ["g", gpt] => {
            let id = strip_prefix_ci(gpt, "g-")?;
            if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
                return None;
            }
            ("GPT", id)
        }
        ["share", id] if is_hex_id(id) => ("Share", *id),
        _ => return None,
    };
    Some(Route {
        kind,
        id: id.to_string(),
    })
}

fn claude_route(path: &str) -> Option<Route> {
    if let Some(rest) = path.strip_prefix("/project/") {
        // Project pages may have sub-paths
        let id = rest.split('/').next().unwrap_or_default();
        return is_hex_id(id).then(|| Route {
            kind: "Project",
            id: id.to_string(),
        });
    }

    let segments = segments(path)?;
    let (kind, id) = match segments.as_slice() {
        ["chat", id] if is_hex_id(id) => ("Chat", *id),
        ["artifact", id] if is_hex_id(id) => ("Artifact", *id),
        _ => return None,
    };
    Some(Route {
        kind,
        id: id.to_string(),
    })
}

/// Split an absolute path into segments; a trailing slash is not allowed
fn segments(path: &str) -> Option<Vec<&str>> {
    let rest = path.strip_prefix('/')?;
    Some(rest.split('/').collect())
}

fn is_hex_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}
