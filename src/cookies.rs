//! Minimal cookie jar used to correlate captured requests into sessions.
//!
//! Honours `Domain`, `Path`, `Secure` and `Max-Age`. Other attributes are
//! ignored, which is enough to decide which cookies a replayed request would
//! have carried.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use hyper::{HeaderMap, Uri, header};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CookieKey {
    domain: String,
    path: String,
    name: String,
}

#[derive(Debug, Clone)]
struct StoredCookie {
    value: String,
    host_only: bool,
    secure: bool,
    expires: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    entries: BTreeMap<CookieKey, StoredCookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores every parseable `Set-Cookie` value as if received from `url`.
    pub fn set_cookies<'a>(&mut self, url: &Uri, set_cookies: impl IntoIterator<Item = &'a str>) {
        let Some(host) = url.host().map(normalize_host) else {
            return;
        };
        let now = Instant::now();
        for raw in set_cookies {
            let Some(parsed) = ParsedSetCookie::parse(raw) else {
                continue;
            };

            let (domain, host_only) = match parsed.domain {
                Some(domain) if domain_matches(&host, &domain) => (domain, false),
                Some(_) => continue,
                None => (host.clone(), true),
            };
            let path = parsed
                .path
                .filter(|path| path.starts_with('/'))
                .unwrap_or_else(|| default_path(url.path()));
            let key = CookieKey {
                domain,
                path,
                name: parsed.name,
            };

            match parsed.max_age {
                Some(max_age) if max_age <= 0 => {
                    self.entries.remove(&key);
                }
                max_age => {
                    let expires = max_age
                        .and_then(|secs| u64::try_from(secs).ok())
                        .map(|secs| now + Duration::from_secs(secs));
                    self.entries.insert(
                        key,
                        StoredCookie {
                            value: parsed.value,
                            host_only,
                            secure: parsed.secure,
                            expires,
                        },
                    );
                }
            }
        }
    }

    /// `name=value` pairs this jar would send to `url`.
    pub fn cookies(&self, url: &Uri) -> Vec<String> {
        let Some(host) = url.host().map(normalize_host) else {
            return Vec::new();
        };
        let secure_scheme = url.scheme_str() == Some("https");
        let request_path = if url.path().is_empty() { "/" } else { url.path() };
        let now = Instant::now();

        self.entries
            .iter()
            .filter(|(key, cookie)| {
                let domain_ok = if cookie.host_only {
                    host == key.domain
                } else {
                    domain_matches(&host, &key.domain)
                };
                domain_ok
                    && path_matches(request_path, &key.path)
                    && (!cookie.secure || secure_scheme)
                    && cookie.expires.is_none_or(|expires| expires > now)
            })
            .map(|(key, cookie)| format!("{}={}", key.name, cookie.value))
            .collect()
    }
}

/// Canonical signature of a cookie set: `name=value` strings sorted and joined with `&`.
pub fn signature<S: AsRef<str>>(cookies: &[S]) -> String {
    let mut sorted: Vec<&str> = cookies.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sorted.join("&")
}

/// Cookies carried by a request's `Cookie` headers.
pub fn request_cookies(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| format!("{name}={}", value.trim()))
        })
        .collect()
}

/// Raw `Set-Cookie` header values of a response.
pub fn response_set_cookies(headers: &HeaderMap) -> Vec<&str> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter(|value| ParsedSetCookie::parse(value).is_some())
        .collect()
}

#[derive(Debug)]
struct ParsedSetCookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    secure: bool,
    max_age: Option<i64>,
}

impl ParsedSetCookie {
    fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Self {
            name: name.to_owned(),
            value: value.trim().trim_matches('"').to_owned(),
            domain: None,
            path: None,
            secure: false,
            max_age: None,
        };
        for attribute in parts {
            let (attr, attr_value) = match attribute.split_once('=') {
                Some((attr, attr_value)) => (attr.trim(), attr_value.trim()),
                None => (attribute.trim(), ""),
            };
            if attr.eq_ignore_ascii_case("domain") {
                let domain = normalize_host(attr_value.trim_start_matches('.'));
                if !domain.is_empty() {
                    cookie.domain = Some(domain);
                }
            } else if attr.eq_ignore_ascii_case("path") {
                cookie.path = Some(attr_value.to_owned());
            } else if attr.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if attr.eq_ignore_ascii_case("max-age") {
                // Unparseable Max-Age is ignored.
                if let Ok(max_age) = attr_value.parse() {
                    cookie.max_age = Some(max_age);
                }
            }
        }
        Some(cookie)
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path[cookie_path.len()..].starts_with('/'))
}

fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_owned();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => request_path[..idx].to_owned(),
    }
}
