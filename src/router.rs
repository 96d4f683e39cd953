//! Purpose: HTTP routes for the session-multiplexed network endpoint.
//! Exports: `build_router`, `SESSION_HEADER`.
//! Role: Classifies each request by verb, session header, and body, then hands it to a session.
//! Invariants: Every failure body is a JSON-RPC error envelope with a null id.
//! Invariants: An initialize request carrying a session header is never treated as a resume.
//! Invariants: Sessions are created only from POST initialize; GET and DELETE never create.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::core::error::{Error, ErrorKind};
use crate::mcp::{
    DispatchOutcome, INTERNAL_ERROR_CODE, JSON_RPC_VERSION, PARSE_ERROR_CODE, SESSION_ERROR_CODE,
    SESSION_TERMINATED_CODE, is_initialize_request,
};
use crate::session::{SHUTTING_DOWN, SessionManager};

pub const SESSION_HEADER: &str = "mcp-session-id";

const NO_VALID_SESSION: &str = "Bad Request: No valid session ID provided";
const INVALID_SESSION: &str = "Invalid or missing session ID";

#[derive(Clone)]
struct RouterState {
    sessions: Arc<SessionManager>,
}

pub fn build_router(
    config: &GatewayConfig,
    sessions: Arc<SessionManager>,
) -> Result<Router, Error> {
    let state = RouterState { sessions };
    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route(
            &config.endpoint_path,
            post(handle_post).get(handle_get).delete(handle_delete),
        )
        .layer(DefaultBodyLimit::max(config.body_limit()?))
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Where a POST body goes, decided from the header and the body alone.
#[derive(Debug, PartialEq, Eq)]
enum PostRoute<'a> {
    Existing(&'a str),
    Create,
    Reject,
}

fn classify_post(session_id: Option<&str>, initialize: bool) -> PostRoute<'_> {
    match (session_id, initialize) {
        (Some(_), true) => PostRoute::Reject,
        (Some(id), false) => PostRoute::Existing(id),
        (None, true) => PostRoute::Create,
        (None, false) => PostRoute::Reject,
    }
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

async fn healthz() -> Response {
    Json(json!({ "ok": true })).into_response()
}

async fn handle_post(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message = match serde_json::from_slice::<Value>(&body) {
        Ok(message) => message,
        Err(_) => {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                PARSE_ERROR_CODE,
                "Parse error: invalid JSON",
            );
        }
    };

    let route = classify_post(session_header(&headers), is_initialize_request(&message));
    let (transport, created) = match route {
        PostRoute::Create => match state.sessions.create() {
            Ok(session) => (Arc::clone(session.transport()), Some(session.id().to_string())),
            Err(err) => return error_response(err),
        },
        PostRoute::Existing(id) => match state.sessions.lookup(id) {
            Ok(transport) => (transport, None),
            Err(_) => {
                debug!(session = %id, "request for unknown session");
                return no_valid_session();
            }
        },
        PostRoute::Reject => return no_valid_session(),
    };

    let outcome = match transport.handle(message).await {
        Ok(outcome) => outcome,
        Err(err) => return error_response(err),
    };

    let mut response = match outcome {
        DispatchOutcome::Response(reply) => Json(reply).into_response(),
        DispatchOutcome::NoResponse => StatusCode::ACCEPTED.into_response(),
    };
    if let Some(id) = created {
        insert_session_header(&mut response, &id);
    }
    response
}

async fn handle_get(State(state): State<RouterState>, headers: HeaderMap) -> Response {
    let Some((id, transport)) = session_header(&headers)
        .and_then(|id| state.sessions.lookup(id).ok().map(|transport| (id, transport)))
    else {
        return rpc_error_response(StatusCode::BAD_REQUEST, SESSION_ERROR_CODE, INVALID_SESSION);
    };
    let receiver = match transport.subscribe() {
        Ok(receiver) => receiver,
        Err(err) => return error_response(err),
    };
    debug!(session = %transport.session_id(), "push stream opened");

    let opened = tokio_stream::once(Ok::<Event, Infallible>(
        Event::default().comment("stream open"),
    ));
    let pushed = ReceiverStream::new(receiver).map(|message| Ok(push_event(&message)));
    let mut response = Sse::new(opened.chain(pushed))
        .keep_alive(KeepAlive::default())
        .into_response();
    insert_session_header(&mut response, id);
    response
}

async fn handle_delete(State(state): State<RouterState>, headers: HeaderMap) -> Response {
    let Some(id) = session_header(&headers) else {
        return rpc_error_response(StatusCode::BAD_REQUEST, SESSION_ERROR_CODE, INVALID_SESSION);
    };
    match state.sessions.terminate(id) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => rpc_error_response(StatusCode::BAD_REQUEST, SESSION_ERROR_CODE, INVALID_SESSION),
    }
}

fn push_event(message: &Value) -> Event {
    match serde_json::to_string(message) {
        Ok(data) => Event::default().event("message").data(data),
        Err(err) => {
            warn!(error = %err, "failed to encode push message");
            Event::default().comment("dropped unencodable message")
        }
    }
}

fn insert_session_header(response: &mut Response, id: &str) {
    match HeaderValue::from_str(id) {
        Ok(value) => {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
        Err(err) => warn!(error = %err, "session id is not a valid header value"),
    }
}

fn error_response(err: Error) -> Response {
    let (status, code, message) = match err.kind() {
        ErrorKind::Protocol => (StatusCode::BAD_REQUEST, SESSION_ERROR_CODE, NO_VALID_SESSION),
        ErrorKind::Busy if err.message() == Some(SHUTTING_DOWN) => (
            StatusCode::SERVICE_UNAVAILABLE,
            SESSION_ERROR_CODE,
            "Service Unavailable: gateway is shutting down",
        ),
        ErrorKind::Busy => (
            StatusCode::SERVICE_UNAVAILABLE,
            SESSION_ERROR_CODE,
            "Service Unavailable: session limit reached",
        ),
        ErrorKind::AlreadyExists => (
            StatusCode::CONFLICT,
            SESSION_ERROR_CODE,
            "Conflict: push stream already open",
        ),
        ErrorKind::Transport => (
            StatusCode::NOT_FOUND,
            SESSION_TERMINATED_CODE,
            "Session terminated",
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            INTERNAL_ERROR_CODE,
            "Internal error",
        ),
    };
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    } else {
        debug!(error = %err, "request rejected");
    }
    rpc_error_response(status, code, message)
}

fn no_valid_session() -> Response {
    rpc_error_response(StatusCode::BAD_REQUEST, SESSION_ERROR_CODE, NO_VALID_SESSION)
}

fn rpc_error_response(status: StatusCode, code: i32, message: &str) -> Response {
    let body = json!({
        "jsonrpc": JSON_RPC_VERSION,
        "error": { "code": code, "message": message },
        "id": null,
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[test]
    fn post_classification_table() {
        assert_eq!(classify_post(None, true), PostRoute::Create);
        assert_eq!(classify_post(None, false), PostRoute::Reject);
        assert_eq!(classify_post(Some("abc"), false), PostRoute::Existing("abc"));
        assert_eq!(classify_post(Some("abc"), true), PostRoute::Reject);
    }

    #[test]
    fn blank_session_header_counts_as_absent() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_header(&headers), None);
        headers.insert(SESSION_HEADER, HeaderValue::from_static("  "));
        assert_eq!(session_header(&headers), None);
        headers.insert(SESSION_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(session_header(&headers), Some("abc"));
    }

    #[tokio::test]
    async fn error_kinds_map_to_status_and_code() {
        let cases = [
            (ErrorKind::Protocol, StatusCode::BAD_REQUEST, SESSION_ERROR_CODE),
            (ErrorKind::Busy, StatusCode::SERVICE_UNAVAILABLE, SESSION_ERROR_CODE),
            (ErrorKind::AlreadyExists, StatusCode::CONFLICT, SESSION_ERROR_CODE),
            (ErrorKind::Transport, StatusCode::NOT_FOUND, SESSION_TERMINATED_CODE),
            (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_CODE),
        ];
        for (kind, status, code) in cases {
            let response = error_response(Error::new(kind));
            assert_eq!(response.status(), status, "{kind:?}");
            let body = body_json(response).await;
            assert_eq!(body["jsonrpc"], json!("2.0"));
            assert_eq!(body["id"], Value::Null);
            assert_eq!(body["error"]["code"], json!(code), "{kind:?}");
        }
    }

    #[tokio::test]
    async fn busy_while_draining_says_shutting_down() {
        let err = Error::new(ErrorKind::Busy).with_message(SHUTTING_DOWN);
        let response = error_response(err);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], json!(SESSION_ERROR_CODE));
        assert_eq!(
            body["error"]["message"],
            json!("Service Unavailable: gateway is shutting down")
        );
    }

    #[tokio::test]
    async fn session_terminated_message_is_stable() {
        let body = body_json(error_response(Error::new(ErrorKind::Transport))).await;
        assert_eq!(body["error"]["message"], json!("Session terminated"));
    }
}
