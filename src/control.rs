//! Operator control API: proxy creation/enumeration and session start/stop.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use hyper::{Method, Request, StatusCode, body::Incoming};
use serde::{Deserialize, Serialize};

use crate::{
    api::{
        ApiHandle, ApiResponse, error_response, json_response, method_not_allowed, not_found,
        read_json, serve_json_api, status_for_sink_error,
    },
    proxy::{ProxyError, ProxyId, ProxyManager, ProxySpec},
    session::{SessionError, SessionGate},
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartSessionRequest {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StopSessionRequest {
    #[serde(default)]
    desc: String,
}

#[derive(Debug, Serialize)]
struct CreatedProxy {
    id: ProxyId,
}

struct ControlState {
    proxies: Arc<ProxyManager>,
    session: Arc<SessionGate>,
}

pub async fn serve_control_api(
    listen: SocketAddr,
    proxies: Arc<ProxyManager>,
    session: Arc<SessionGate>,
) -> anyhow::Result<ApiHandle> {
    serve_json_api(
        listen,
        "control",
        Arc::new(ControlState { proxies, session }),
        control_handler,
    )
    .await
}

fn status_for_proxy_error(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        ProxyError::Certificate(_)
        | ProxyError::Tls(_)
        | ProxyError::Transport(_)
        | ProxyError::Listener(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn status_for_session_error(err: &SessionError) -> StatusCode {
    match err {
        SessionError::InvalidName(_) => StatusCode::BAD_REQUEST,
        SessionError::Conflict(_) | SessionError::NotRecording => StatusCode::CONFLICT,
        SessionError::Sink(err) => status_for_sink_error(err),
    }
}

async fn control_handler(
    req: Request<Incoming>,
    state: Arc<ControlState>,
) -> Result<ApiResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    match path.as_str() {
        "/proxies" => match method {
            Method::GET => Ok(json_response(StatusCode::OK, &state.proxies.list())),
            Method::POST => {
                let spec: ProxySpec = match read_json(req).await {
                    Ok(spec) => spec,
                    Err(response) => return Ok(response),
                };
                match state.proxies.create_proxy(spec).await {
                    Ok(id) => Ok(json_response(StatusCode::CREATED, &CreatedProxy { id })),
                    Err(err) => Ok(error_response(status_for_proxy_error(&err), err.to_string())),
                }
            }
            _ => Ok(method_not_allowed()),
        },
        "/session" => {
            if method != Method::GET {
                return Ok(method_not_allowed());
            }
            Ok(json_response(StatusCode::OK, &state.session.status().await))
        }
        "/session/start" => {
            if method != Method::POST {
                return Ok(method_not_allowed());
            }
            let start: StartSessionRequest = match read_json(req).await {
                Ok(start) => start,
                Err(response) => return Ok(response),
            };
            match state.session.start(&start.name).await {
                Ok(()) => Ok(json_response(StatusCode::OK, &state.session.status().await)),
                Err(err) => Ok(error_response(status_for_session_error(&err), err.to_string())),
            }
        }
        "/session/stop" => {
            if method != Method::POST {
                return Ok(method_not_allowed());
            }
            let stop: StopSessionRequest = match read_json(req).await {
                Ok(stop) => stop,
                Err(response) => return Ok(response),
            };
            match state.session.stop(&stop.desc).await {
                Ok(project) => Ok(json_response(StatusCode::OK, &project)),
                Err(err) => Ok(error_response(status_for_session_error(&err), err.to_string())),
            }
        }
        _ => Ok(not_found()),
    }
}
