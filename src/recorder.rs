use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{HeaderMap, Method, Request, Response, Uri, Version, header};

use crate::{
    cookies::{self, CookieJar},
    model::History,
    transport::{Transport, TransportError},
};

/// `host` is implied by the replayed URL.
const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "x-forwarded-for",
    "cookie",
    "user-agent",
    "accept-encoding",
    "content-length",
];

const DROPPED_RESPONSE_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "user-agent",
    "accept-encoding",
    "content-length",
    "connection",
    "x-envoy-upstream-service-time",
    "date",
    "x-dc-transaction-id",
    "strict-transport-security",
    "pragma",
    "x-frame-options",
    "cache-control",
    "x-xss-protection",
    "x-content-type-options",
    "vary",
    "expires",
];

/// Receives every History a recorder produces.
#[async_trait]
pub trait HistoryListener: Send + Sync {
    async fn notify(&self, history: History);
}

/// Jar pool and index counter shared by every recorder of one capture process.
#[derive(Debug, Default)]
pub struct RecorderState {
    jars: Mutex<Vec<CookieJar>>,
    next_index: AtomicU64,
}

impl RecorderState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every jar and restarts indices at zero.
    pub fn reset(&self) {
        let mut jars = self.lock_jars();
        jars.clear();
        self.next_index.store(0, Ordering::SeqCst);
    }

    pub fn jar_count(&self) -> usize {
        self.lock_jars().len()
    }

    fn lock_jars(&self) -> std::sync::MutexGuard<'_, Vec<CookieJar>> {
        self.jars
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Finds the jar whose cookies for `url` equal the request's cookie set,
    /// allocating a fresh jar when the request carried cookies nobody knows.
    fn correlate_request(&self, request_cookies: &[String], url: &Uri) -> Option<usize> {
        if request_cookies.is_empty() {
            return None;
        }
        let expected = cookies::signature(request_cookies);
        let mut jars = self.lock_jars();
        if let Some(idx) = jars
            .iter()
            .position(|jar| cookies::signature(&jar.cookies(url)) == expected)
        {
            return Some(idx);
        }
        jars.push(CookieJar::new());
        Some(jars.len() - 1)
    }

    fn store_response_cookies(&self, jar: Option<usize>, url: &Uri, set_cookies: &[&str]) -> usize {
        let mut jars = self.lock_jars();
        let idx = match jar {
            Some(idx) if idx < jars.len() => idx,
            _ => {
                jars.push(CookieJar::new());
                jars.len() - 1
            }
        };
        jars[idx].set_cookies(url, set_cookies.iter().copied());
        idx
    }

    fn next_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }
}

/// Transport decorator that turns each round trip into a replayable History.
pub struct TrafficRecorder {
    inner: Arc<dyn Transport>,
    listener: Arc<dyn HistoryListener>,
    state: Arc<RecorderState>,
    insecure: bool,
}

impl fmt::Debug for TrafficRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrafficRecorder")
            .field("insecure", &self.insecure)
            .finish_non_exhaustive()
    }
}

impl TrafficRecorder {
    pub fn new(
        inner: Arc<dyn Transport>,
        listener: Arc<dyn HistoryListener>,
        state: Arc<RecorderState>,
        insecure: bool,
    ) -> Self {
        Self {
            inner,
            listener,
            state,
            insecure,
        }
    }
}

#[async_trait]
impl Transport for TrafficRecorder {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
        let mut args = curl_args(&request, self.insecure);
        let url = request.uri().clone();
        let mut jar = self
            .state
            .correlate_request(&cookies::request_cookies(request.headers()), &url);

        let started = Instant::now();
        let response = match self.inner.round_trip(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(url = %url, "upstream round trip failed, nothing recorded: {err}");
                return Err(err);
            }
        };
        let exec_time = started.elapsed();

        let set_cookies = cookies::response_set_cookies(response.headers());
        if !set_cookies.is_empty() {
            jar = Some(self.state.store_response_cookies(jar, &url, &set_cookies));
        }
        if let Some(idx) = jar {
            args.push("--cookie-jar".to_owned());
            args.push(format!("jar-{idx}.txt"));
        }

        let history = History {
            index: self.state.next_index(),
            args,
            output: render_response(&response),
            exec_time: u64::try_from(exec_time.as_nanos()).unwrap_or(u64::MAX),
        };
        tracing::debug!(index = history.index, url = %url, "recorded round trip");
        self.listener.notify(history).await;

        Ok(response)
    }
}

/// Curl invocation that replays `request`.
pub fn curl_args(request: &Request<Bytes>, insecure: bool) -> Vec<String> {
    let mut args = vec!["curl".to_owned()];
    if insecure {
        args.push("--insecure".to_owned());
    }
    args.push("-X".to_owned());
    args.push(request.method().to_string());

    for (name, values) in canonical_headers(request.headers(), DROPPED_REQUEST_HEADERS) {
        for value in values {
            args.push("-H".to_owned());
            args.push(format!("\"{name}: {value}\""));
        }
    }

    let carries_body = matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH);
    if carries_body && !request.body().is_empty() {
        let body = if is_json(request.headers()) {
            pretty_json(request.body())
        } else {
            String::from_utf8_lossy(request.body()).into_owned()
        };
        args.push("--data".to_owned());
        args.push(format!("'{body}'"));
    }

    args.push(format!("{:?}", request.uri().to_string()));
    args
}

/// Status line, kept headers, blank line, body.
pub fn render_response(response: &Response<Bytes>) -> String {
    let status = response.status();
    let mut output = match status.canonical_reason() {
        Some(reason) => format!(
            "\nHTTP/{} {} {reason}\n",
            version_label(response.version()),
            status.as_str()
        ),
        None => format!(
            "\nHTTP/{} {}\n",
            version_label(response.version()),
            status.as_str()
        ),
    };

    for (name, values) in canonical_headers(response.headers(), DROPPED_RESPONSE_HEADERS) {
        for value in values {
            output.push_str(&format!("{name}: {value}\n"));
        }
    }
    output.push('\n');

    if is_json(response.headers()) {
        output.push_str(&pretty_json(response.body()));
    } else {
        output.push_str(&String::from_utf8_lossy(response.body()));
    }
    output
}

fn canonical_headers(headers: &HeaderMap, dropped: &[&str]) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if dropped.contains(&name.as_str()) {
            continue;
        }
        out.entry(canonical_header_name(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

/// `content-type` becomes `Content-Type`.
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join("-")
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
}

fn pretty_json(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}
