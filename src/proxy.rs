use std::{
    convert::Infallible,
    fmt,
    io::ErrorKind,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Request, Response, StatusCode, Uri, Version,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use rcgen::{CertificateParams, DnType};
use rustls::{
    server::WebPkiClientVerifier,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::oneshot,
    task::{JoinHandle, JoinSet},
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::{
    pki::{CertificateAuthority, PkiError},
    recorder::{HistoryListener, RecorderState, TrafficRecorder},
    transport::{self, HyperTransport, Transport, TransportError},
};

const LEAF_COMMON_NAME: &str = "localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// One listener/forwarder pair as submitted by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySpec {
    pub listen_host: String,
    pub listen_port: u16,
    pub listen_scheme: Scheme,
    pub forward_host: String,
    pub forward_port: u16,
    pub forward_scheme: Scheme,
    #[serde(default)]
    pub forward_insecure: bool,
}

impl ProxySpec {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.listen_host.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(
                "listen_host must not be empty".to_owned(),
            ));
        }
        if self.forward_host.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(
                "forward_host must not be empty".to_owned(),
            ));
        }
        if self.forward_port == 0 {
            return Err(ProxyError::InvalidConfig(
                "forward_port must be non-zero".to_owned(),
            ));
        }
        self.forward_base()?;
        Ok(())
    }

    pub fn forward_authority(&self) -> String {
        format!("{}:{}", bracket_ipv6(&self.forward_host), self.forward_port)
    }

    fn listen_target(&self) -> String {
        format!("{}:{}", bracket_ipv6(&self.listen_host), self.listen_port)
    }

    fn forward_base(&self) -> Result<Uri, ProxyError> {
        let raw = format!("{}://{}", self.forward_scheme.as_str(), self.forward_authority());
        raw.parse()
            .map_err(|err| ProxyError::InvalidConfig(format!("forward target `{raw}`: {err}")))
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyId(pub usize);

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    Running,
    Stopped,
}

/// Snapshot of one proxy for operators.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyInfo {
    pub id: ProxyId,
    #[serde(flatten)]
    pub spec: ProxySpec,
    pub status: ProxyStatus,
    pub addr: Option<SocketAddr>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub enum ProxyError {
    InvalidConfig(String),
    Certificate(PkiError),
    Tls(String),
    Transport(TransportError),
    Listener(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(message) => write!(f, "invalid proxy config: {message}"),
            Self::Certificate(err) => write!(f, "issue listener certificate: {err}"),
            Self::Tls(message) => write!(f, "build listener TLS config: {message}"),
            Self::Transport(err) => write!(f, "{err}"),
            Self::Listener(message) => write!(f, "listener error: {message}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Certificate(err) => Some(err),
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

/// Every listener that failed to stop cleanly.
#[derive(Debug)]
pub struct ShutdownError {
    pub failures: Vec<(ProxyId, ProxyError)>,
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} listener(s) failed to shut down", self.failures.len())?;
        for (id, err) in &self.failures {
            write!(f, "; proxy {id}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}

struct ListenerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<Result<(), ProxyError>>,
}

struct ProxyEntry {
    spec: ProxySpec,
    status: ProxyStatus,
    addr: Option<SocketAddr>,
    last_error: Option<String>,
    handle: Option<ListenerHandle>,
}

#[derive(Default)]
struct ManagerState {
    entries: Vec<ProxyEntry>,
    last_error: Option<String>,
}

type SharedState = Arc<Mutex<ManagerState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, ManagerState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns every listener/forwarder pair created in this process.
pub struct ProxyManager {
    ca: Arc<CertificateAuthority>,
    listener: Arc<dyn HistoryListener>,
    recorder_state: Arc<RecorderState>,
    secure_transport: Arc<dyn Transport>,
    insecure_transport: Arc<dyn Transport>,
    state: SharedState,
}

impl fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyManager")
            .field("proxies", &lock(&self.state).entries.len())
            .finish_non_exhaustive()
    }
}

impl ProxyManager {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        listener: Arc<dyn HistoryListener>,
        recorder_state: Arc<RecorderState>,
    ) -> Result<Self, ProxyError> {
        let secure = HyperTransport::secure().map_err(ProxyError::Transport)?;
        let insecure = HyperTransport::insecure().map_err(ProxyError::Transport)?;
        Ok(Self::with_transports(
            ca,
            listener,
            recorder_state,
            Arc::new(secure),
            Arc::new(insecure),
        ))
    }

    /// Uses the given upstream transports instead of the default hyper clients.
    pub fn with_transports(
        ca: Arc<CertificateAuthority>,
        listener: Arc<dyn HistoryListener>,
        recorder_state: Arc<RecorderState>,
        secure_transport: Arc<dyn Transport>,
        insecure_transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            ca,
            listener,
            recorder_state,
            secure_transport,
            insecure_transport,
            state: Arc::new(Mutex::new(ManagerState::default())),
        }
    }

    pub async fn create_proxy(&self, spec: ProxySpec) -> Result<ProxyId, ProxyError> {
        let result = self.start_proxy(spec.clone()).await;
        if let Err(err) = &result {
            tracing::warn!(
                listen = %spec.listen_target(),
                forward = %spec.forward_authority(),
                "failed to create proxy: {err}"
            );
            lock(&self.state).last_error = Some(err.to_string());
        }
        result
    }

    async fn start_proxy(&self, spec: ProxySpec) -> Result<ProxyId, ProxyError> {
        spec.validate()?;
        let forward_base = spec.forward_base()?;

        let upstream = if spec.forward_insecure {
            Arc::clone(&self.insecure_transport)
        } else {
            Arc::clone(&self.secure_transport)
        };
        let recorder: Arc<dyn Transport> = Arc::new(TrafficRecorder::new(
            upstream,
            Arc::clone(&self.listener),
            Arc::clone(&self.recorder_state),
            spec.forward_insecure,
        ));

        let acceptor = match spec.listen_scheme {
            Scheme::Https => Some(build_leaf_tls_acceptor(&self.ca)?),
            Scheme::Http => None,
        };

        let listen_target = spec.listen_target();
        let tcp = TcpListener::bind(&listen_target)
            .await
            .map_err(|err| ProxyError::Listener(format!("bind {listen_target}: {err}")))?;
        let addr = tcp
            .local_addr()
            .map_err(|err| ProxyError::Listener(format!("get local_addr: {err}")))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let mut state = lock(&self.state);
        let id = ProxyId(state.entries.len());
        let route = Arc::new(Route {
            id,
            forward_base,
            forward_authority: spec.forward_authority(),
            recorder,
        });
        let join = tokio::spawn(run_listener(
            tcp,
            acceptor,
            route,
            shutdown_rx,
            Arc::clone(&self.state),
        ));
        tracing::info!(
            proxy_id = %id,
            listen = %addr,
            scheme = spec.listen_scheme.as_str(),
            forward = %spec.forward_authority(),
            insecure = spec.forward_insecure,
            "proxy listening"
        );
        state.entries.push(ProxyEntry {
            spec,
            status: ProxyStatus::Running,
            addr: Some(addr),
            last_error: None,
            handle: Some(ListenerHandle { shutdown_tx, join }),
        });
        Ok(id)
    }

    pub fn list(&self) -> Vec<ProxyInfo> {
        lock(&self.state)
            .entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| ProxyInfo {
                id: ProxyId(idx),
                spec: entry.spec.clone(),
                status: entry.status,
                addr: entry.addr,
                last_error: entry.last_error.clone(),
            })
            .collect()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.state).last_error.clone()
    }

    /// Stops every listener concurrently, each bounded by `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        let handles: Vec<(ProxyId, ListenerHandle)> = {
            let mut state = lock(&self.state);
            state
                .entries
                .iter_mut()
                .enumerate()
                .filter_map(|(idx, entry)| entry.handle.take().map(|handle| (ProxyId(idx), handle)))
                .collect()
        };

        let mut tasks = JoinSet::new();
        for (id, handle) in handles {
            tasks.spawn(async move { (id, stop_listener(handle, deadline).await) });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(err))) => failures.push((id, err)),
                Err(err) => tracing::error!("listener shutdown task failed: {err}"),
            }
        }
        failures.sort_by_key(|(id, _)| *id);

        if failures.is_empty() {
            return Ok(());
        }
        let mut state = lock(&self.state);
        for (id, err) in &failures {
            if let Some(entry) = state.entries.get_mut(id.0) {
                entry.status = ProxyStatus::Stopped;
                entry.last_error = Some(err.to_string());
            }
        }
        state.last_error = failures.last().map(|(_, err)| err.to_string());
        Err(ShutdownError { failures })
    }
}

async fn stop_listener(handle: ListenerHandle, deadline: Duration) -> Result<(), ProxyError> {
    let ListenerHandle {
        shutdown_tx,
        mut join,
    } = handle;
    let _ = shutdown_tx.send(());
    match tokio::time::timeout(deadline, &mut join).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => Err(ProxyError::Listener(format!("listener task failed: {err}"))),
        Err(_) => {
            join.abort();
            Err(ProxyError::Listener(format!(
                "shutdown deadline of {}ms exceeded with connections still active",
                deadline.as_millis()
            )))
        }
    }
}

struct Route {
    id: ProxyId,
    forward_base: Uri,
    forward_authority: String,
    recorder: Arc<dyn Transport>,
}

async fn run_listener(
    tcp: TcpListener,
    acceptor: Option<TlsAcceptor>,
    route: Arc<Route>,
    mut shutdown_rx: oneshot::Receiver<()>,
    state: SharedState,
) -> Result<(), ProxyError> {
    let connections_token = CancellationToken::new();
    let mut connections = JoinSet::new();

    let result = loop {
        tokio::select! {
            _ = &mut shutdown_rx => break Ok(()),
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accept = tcp.accept() => {
                let (stream, peer) = match accept {
                    Ok(accepted) => accepted,
                    Err(err) if is_connection_error(&err) => {
                        tracing::debug!(proxy_id = %route.id, "accept error: {err}");
                        continue;
                    }
                    Err(err) => break Err(ProxyError::Listener(format!("accept: {err}"))),
                };
                let route = Arc::clone(&route);
                let token = connections_token.clone();
                let acceptor = acceptor.clone();
                connections.spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls) => serve_connection(tls, peer, route, token).await,
                            Err(err) => {
                                tracing::debug!(proxy_id = %route.id, %peer, "TLS handshake failed: {err}");
                            }
                        },
                        None => serve_connection(stream, peer, route, token).await,
                    }
                });
            }
        }
    };

    drop(tcp);
    connections_token.cancel();
    while connections.join_next().await.is_some() {}

    let mut state = lock(&state);
    if let Some(entry) = state.entries.get_mut(route.id.0) {
        entry.status = ProxyStatus::Stopped;
        if let Err(err) = &result {
            entry.last_error = Some(err.to_string());
        }
    }
    match &result {
        Ok(()) => tracing::info!(proxy_id = %route.id, "proxy stopped"),
        Err(err) => {
            tracing::error!(proxy_id = %route.id, "proxy listener terminated: {err}");
            state.last_error = Some(err.to_string());
        }
    }
    result
}

fn is_connection_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

async fn serve_connection<I>(io: I, peer: SocketAddr, route: Arc<Route>, token: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| proxy_handler(req, peer, Arc::clone(&route)));
    let builder = ConnectionBuilder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = token.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(err) = result {
        tracing::debug!(%peer, "connection error: {err}");
    }
}

async fn proxy_handler(
    req: Request<Incoming>,
    peer: SocketAddr,
    route: Arc<Route>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!(proxy_id = %route.id, "read client request body: {err}");
            return Ok(proxy_simple_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
            ));
        }
    };
    let mut upstream_req = Request::from_parts(parts, body);
    if let Err(err) = direct(&mut upstream_req, &route, peer) {
        tracing::debug!(proxy_id = %route.id, "rewrite request: {err}");
        return Ok(proxy_simple_response(
            StatusCode::BAD_REQUEST,
            "invalid request target",
        ));
    }

    match route.recorder.round_trip(upstream_req).await {
        Ok(response) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop_headers(&mut parts.headers);
            parts.version = Version::HTTP_11;
            Ok(Response::from_parts(parts, Full::new(body)))
        }
        Err(err) => {
            tracing::warn!(
                proxy_id = %route.id,
                forward = %route.forward_authority,
                "upstream request failed: {err}"
            );
            Ok(proxy_simple_response(StatusCode::BAD_GATEWAY, "bad gateway"))
        }
    }
}

/// Rewrites a client request so it targets the forward host.
fn direct(req: &mut Request<Bytes>, route: &Route, peer: SocketAddr) -> Result<(), String> {
    *req.uri_mut() = build_upstream_uri(&route.forward_base, req.uri())?;
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    strip_hop_by_hop_headers(headers);
    let host = HeaderValue::from_str(&route.forward_authority)
        .map_err(|err| format!("invalid forward authority: {err}"))?;
    headers.insert(header::HOST, host);
    append_forwarded_for(headers, peer);
    Ok(())
}

fn build_upstream_uri(upstream_base: &Uri, original: &Uri) -> Result<Uri, String> {
    let mut parts = original.clone().into_parts();
    parts.scheme = upstream_base.scheme().cloned();
    parts.authority = upstream_base.authority().cloned();
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(hyper::http::uri::PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts).map_err(|err| format!("construct upstream uri: {err}"))
}

fn append_forwarded_for(headers: &mut hyper::HeaderMap, peer: SocketAddr) {
    let forwarded_for = HeaderName::from_static("x-forwarded-for");
    let peer_ip = peer.ip().to_string();
    let value = match headers
        .get(&forwarded_for)
        .and_then(|existing| existing.to_str().ok())
    {
        Some(existing) => format!("{existing}, {peer_ip}"),
        None => peer_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(forwarded_for, value);
    }
}

fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }

    const STANDARD: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in STANDARD {
        headers.remove(*header_name);
    }
    headers.remove("proxy-connection");
}

/// Mints a `CN=localhost` leaf from the end-entity key and wraps it in a TLS acceptor.
fn build_leaf_tls_acceptor(ca: &CertificateAuthority) -> Result<TlsAcceptor, ProxyError> {
    transport::ensure_rustls_crypto_provider().map_err(ProxyError::Transport)?;

    let mut params = CertificateParams::new(vec![LEAF_COMMON_NAME.to_owned()])
        .map_err(|err| ProxyError::Tls(format!("initialize CSR parameters: {err}")))?;
    params
        .distinguished_name
        .push(DnType::CommonName, LEAF_COMMON_NAME);
    let csr = params
        .serialize_request(ca.ee_key())
        .map_err(|err| ProxyError::Tls(format!("serialize CSR: {err}")))?;
    let leaf_der = ca
        .issue_leaf(csr.der().as_ref())
        .map_err(ProxyError::Certificate)?;

    let client_verifier = WebPkiClientVerifier::builder(Arc::new(ca.trust_pool()))
        .allow_unauthenticated()
        .build()
        .map_err(|err| ProxyError::Tls(format!("build client verifier: {err}")))?;
    let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(ca.ee_key().serialize_der()));
    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(vec![CertificateDer::from(leaf_der)], private_key)
        .map_err(|err| ProxyError::Tls(format!("build TLS server certificate: {err}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn proxy_simple_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use async_trait::async_trait;
    use bytes::Bytes;
    use hyper::{HeaderMap, Request, Uri, header::HeaderValue};

    use super::{
        ProxyError, ProxySpec, Route, Scheme, build_upstream_uri, direct,
        strip_hop_by_hop_headers,
    };
    use crate::transport::{Transport, TransportError};

    struct Unused;

    #[async_trait]
    impl Transport for Unused {
        async fn round_trip(
            &self,
            _request: Request<Bytes>,
        ) -> Result<hyper::Response<Bytes>, TransportError> {
            Err(TransportError::Request("unused".to_owned()))
        }
    }

    fn spec() -> ProxySpec {
        ProxySpec {
            listen_host: "127.0.0.1".to_owned(),
            listen_port: 0,
            listen_scheme: Scheme::Http,
            forward_host: "api.internal".to_owned(),
            forward_port: 8443,
            forward_scheme: Scheme::Https,
            forward_insecure: false,
        }
    }

    #[test]
    fn spec_validation_rejects_missing_fields() {
        assert!(spec().validate().is_ok());

        let mut no_host = spec();
        no_host.forward_host = " ".to_owned();
        assert!(matches!(no_host.validate(), Err(ProxyError::InvalidConfig(_))));

        let mut no_port = spec();
        no_port.forward_port = 0;
        let err = no_port.validate().expect_err("zero port");
        assert!(err.to_string().contains("forward_port"), "unexpected: {err}");
    }

    #[test]
    fn spec_parses_from_form_json() {
        let parsed: ProxySpec = serde_json::from_str(
            r#"{"listen_host":"0.0.0.0","listen_port":8080,"listen_scheme":"https",
                "forward_host":"::1","forward_port":443,"forward_scheme":"https"}"#,
        )
        .expect("spec json");
        assert_eq!(parsed.listen_scheme, Scheme::Https);
        assert!(!parsed.forward_insecure);
        assert_eq!(parsed.forward_authority(), "[::1]:443");
    }

    #[test]
    fn upstream_uri_keeps_path_and_query() {
        let base: Uri = "https://api.internal:8443".parse().expect("base");
        let original: Uri = "/v1/items?page=2".parse().expect("original");
        assert_eq!(
            build_upstream_uri(&base, &original).expect("uri").to_string(),
            "https://api.internal:8443/v1/items?page=2"
        );
    }

    #[test]
    fn director_sets_host_and_forwarded_for() {
        let route = Route {
            id: super::ProxyId(0),
            forward_base: "https://api.internal:8443".parse().expect("base"),
            forward_authority: spec().forward_authority(),
            recorder: Arc::new(Unused),
        };
        let mut req = Request::builder()
            .uri("/login")
            .header("host", "localhost:9000")
            .header("x-forwarded-for", "10.0.0.1")
            .header("connection", "keep-alive, x-hop")
            .header("x-hop", "1")
            .body(Bytes::new())
            .expect("request");
        let peer: SocketAddr = "127.0.0.1:55555".parse().expect("peer");

        direct(&mut req, &route, peer).expect("direct");

        assert_eq!(req.uri().to_string(), "https://api.internal:8443/login");
        assert_eq!(req.headers()["host"], "api.internal:8443");
        assert_eq!(req.headers()["x-forwarded-for"], "10.0.0.1, 127.0.0.1");
        assert!(req.headers().get("x-hop").is_none());
        assert!(req.headers().get("connection").is_none());
    }

    #[test]
    fn strips_standard_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }
}
