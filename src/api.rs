use std::{
    convert::Infallible,
    fmt::{self, Write as _},
    future::Future,
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use crate::{
    model::{History, Project},
    session::{LocalSink, ProjectSink, SinkError},
};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
}

pub(crate) type ApiResponse = Response<Full<Bytes>>;

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    let payload = ErrorBody {
        error: message.into(),
    };
    match serde_json::to_vec(&payload) {
        Ok(body) => with_json_body(status, body),
        Err(err) => {
            tracing::debug!("failed to serialize api error response: {err}");
            let mut response = Response::new(Full::new(Bytes::from_static(
                b"failed to serialize api error response",
            )));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> ApiResponse {
    match serde_json::to_vec(payload) {
        Ok(body) => with_json_body(status, body),
        Err(err) => {
            tracing::debug!("failed to serialize api JSON response: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to serialize api response",
            )
        }
    }
}

fn with_json_body(status: StatusCode, body: Vec<u8>) -> ApiResponse {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

pub(crate) fn method_not_allowed() -> ApiResponse {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

pub(crate) fn not_found() -> ApiResponse {
    error_response(StatusCode::NOT_FOUND, "not found")
}

/// Reads and decodes a JSON request body, or produces the 400 to send back.
pub(crate) async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, ApiResponse> {
    let body = req.into_body().collect().await.map_err(|err| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("failed to read request body: {err}"),
        )
    })?;
    serde_json::from_slice(&body.to_bytes()).map_err(|err| {
        error_response(StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}"))
    })
}

/// Running JSON API listener.
pub struct ApiHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl fmt::Debug for ApiHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiHandle")
            .field("listen_addr", &self.listen_addr)
            .finish_non_exhaustive()
    }
}

impl ApiHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

pub(crate) async fn serve_json_api<S, H, Fut>(
    listen: SocketAddr,
    name: &'static str,
    state: Arc<S>,
    handler: H,
) -> anyhow::Result<ApiHandle>
where
    S: Send + Sync + 'static,
    H: Fn(Request<Incoming>, Arc<S>) -> Fut + Copy + Send + Sync + 'static,
    Fut: Future<Output = Result<ApiResponse, Infallible>> + Send + 'static,
{
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind {name} api on {listen}"))?;
    let listen_addr = listener
        .local_addr()
        .with_context(|| format!("get {name} api local_addr"))?;
    tracing::info!(listen = %listen_addr, "{name} api listening");

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("{name} api connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ApiHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

pub(crate) fn status_for_sink_error(err: &SinkError) -> StatusCode {
    match err {
        SinkError::Invalid(_) => StatusCode::BAD_REQUEST,
        SinkError::Conflict(_) => StatusCode::CONFLICT,
        SinkError::Rejected { .. } => StatusCode::BAD_GATEWAY,
        SinkError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        SinkError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct WorkerApiState {
    sink: LocalSink,
}

/// Serves the persistence API that capture processes post records to.
pub async fn serve_worker_api(listen: SocketAddr, sink: LocalSink) -> anyhow::Result<ApiHandle> {
    serve_json_api(
        listen,
        "worker",
        Arc::new(WorkerApiState { sink }),
        worker_api_handler,
    )
    .await
}

pub(crate) fn encode_uri_path_segment(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if matches!(byte, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~') {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(&mut encoded, "%{byte:02X}");
        }
    }
    encoded
}

fn decode_uri_path_segment(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = value.get(idx + 1..idx + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            idx += 3;
        } else {
            decoded.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

fn parse_history_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/project/")?;
    let (project, suffix) = rest.split_once("/history")?;
    if project.is_empty() || project.contains('/') {
        return None;
    }
    if suffix.is_empty() || suffix == "/" {
        return decode_uri_path_segment(project);
    }
    None
}

async fn worker_api_handler(
    req: Request<Incoming>,
    state: Arc<WorkerApiState>,
) -> Result<ApiResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    if path == "/health" {
        if method != Method::GET {
            return Ok(method_not_allowed());
        }
        return Ok(json_response(StatusCode::OK, &HealthBody { status: "ok" }));
    }

    if path == "/work" {
        if method != Method::GET {
            return Ok(method_not_allowed());
        }
        return match state.sink.store().list_work().await {
            Ok(items) => Ok(json_response(StatusCode::OK, &items)),
            Err(err) => Ok(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            )),
        };
    }

    if path == "/project" {
        if method != Method::POST {
            return Ok(method_not_allowed());
        }
        let project: Project = match read_json(req).await {
            Ok(project) => project,
            Err(response) => return Ok(response),
        };
        return match state.sink.save_project(project.clone()).await {
            Ok(()) => Ok(json_response(StatusCode::CREATED, &project)),
            Err(err) => {
                tracing::debug!(project = %project.name, "rejecting project: {err}");
                Ok(error_response(status_for_sink_error(&err), err.to_string()))
            }
        };
    }

    if let Some(project) = parse_history_path(&path) {
        if method != Method::POST {
            return Ok(method_not_allowed());
        }
        let history: History = match read_json(req).await {
            Ok(history) => history,
            Err(response) => return Ok(response),
        };
        let index = history.index;
        return match state.sink.save_history(&project, history).await {
            Ok(()) => Ok(json_response(
                StatusCode::CREATED,
                &serde_json::json!({ "project": project, "index": index }),
            )),
            Err(err) => Ok(error_response(status_for_sink_error(&err), err.to_string())),
        };
    }

    Ok(not_found())
}

/// Posts captured records to a remote worker API.
#[derive(Clone)]
pub struct WorkerClient {
    base_uri: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerClient")
            .field("base_uri", &self.base_uri)
            .finish_non_exhaustive()
    }
}

impl WorkerClient {
    pub fn new(base_uri: impl Into<String>) -> Self {
        let base_uri = base_uri.into().trim_end_matches('/').to_owned();
        Self {
            base_uri,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    async fn post_json<T: Serialize>(&self, path: &str, payload: &T) -> Result<(), SinkError> {
        let uri: Uri = format!("{}{path}", self.base_uri)
            .parse()
            .map_err(|err| SinkError::Invalid(format!("worker url for `{path}`: {err}")))?;
        let body = serde_json::to_vec(payload)
            .map_err(|err| SinkError::Invalid(format!("encode record: {err}")))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|err| SinkError::Invalid(err.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| SinkError::Unavailable(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map(|body| String::from_utf8_lossy(&body.to_bytes()).into_owned())
            .unwrap_or_default();
        if status == StatusCode::CONFLICT {
            return Err(SinkError::Conflict(body));
        }
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ProjectSink for WorkerClient {
    async fn save_project(&self, project: Project) -> Result<(), SinkError> {
        self.post_json("/project", &project).await
    }

    async fn save_history(&self, project: &str, history: History) -> Result<(), SinkError> {
        let path = format!("/project/{}/history", encode_uri_path_segment(project));
        self.post_json(&path, &history).await
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use super::{
        WorkerClient, encode_uri_path_segment, parse_history_path, serve_worker_api,
        status_for_sink_error,
    };
    use crate::{
        jobs::JobStore,
        model::{History, Project},
        session::{LocalSink, ProjectSink, SinkError},
    };

    #[test]
    fn history_path_requires_single_project_segment() {
        assert_eq!(parse_history_path("/project/demo1/history").as_deref(), Some("demo1"));
        assert_eq!(parse_history_path("/project/demo1/history/").as_deref(), Some("demo1"));
        assert_eq!(
            parse_history_path("/project/my%20demo/history").as_deref(),
            Some("my demo")
        );
        assert_eq!(parse_history_path("/project/bad%2/history"), None);
        assert_eq!(parse_history_path("/project//history"), None);
        assert_eq!(parse_history_path("/project/a/b/history"), None);
        assert_eq!(parse_history_path("/project/demo1/historyx"), None);
        assert_eq!(parse_history_path("/project/demo1"), None);
    }

    #[test]
    fn uri_path_segment_encoding_handles_spaces_and_slashes() {
        assert_eq!(encode_uri_path_segment("my demo/1"), "my%20demo%2F1");
        assert_eq!(encode_uri_path_segment("demo-1_a.b~"), "demo-1_a.b~");
    }

    #[test]
    fn sink_errors_map_to_client_statuses() {
        assert_eq!(status_for_sink_error(&SinkError::Invalid(String::new())), 400);
        assert_eq!(status_for_sink_error(&SinkError::Conflict(String::new())), 409);
        assert_eq!(status_for_sink_error(&SinkError::Storage(String::new())), 500);
    }

    #[tokio::test]
    async fn worker_client_round_trips_through_worker_api() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let store = JobStore::open(temp.path().join("jobs.db"), Duration::from_secs(5))
            .expect("store");
        let api = serve_worker_api(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            LocalSink::new(store.clone()),
        )
        .await
        .expect("serve");
        let client = WorkerClient::new(format!("http://{}/", api.listen_addr));

        let project = Project {
            name: "demo1".to_owned(),
            working_dir: temp.path().join("projects"),
            desc: String::new(),
        };
        client
            .save_history(
                "demo1",
                History {
                    index: 0,
                    args: vec!["curl".to_owned()],
                    output: String::new(),
                    exec_time: 1,
                },
            )
            .await
            .expect("history");
        client.save_project(project.clone()).await.expect("project");
        let err = client.save_project(project).await.expect_err("duplicate");
        assert!(matches!(err, SinkError::Conflict(_)), "unexpected: {err}");

        assert_eq!(store.list_work().await.expect("list").len(), 2);
        api.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_worker_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = WorkerClient::new(format!("http://{addr}"));
        let err = client
            .save_project(Project {
                name: "demo1".to_owned(),
                working_dir: "/tmp/unused".into(),
                desc: String::new(),
            })
            .await
            .expect_err("closed port");
        assert!(matches!(err, SinkError::Unavailable(_)), "unexpected: {err}");
    }
}
