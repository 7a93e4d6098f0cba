/// Messenger REST API + SSE over the sync engine (loopback only)
///
/// Endpoints:
///   GET  /api/status
///   GET  /api/conversations
///   GET  /api/conversations/:peer_id          loads pair history on demand
///   POST /api/conversations/:peer_id/read     mark all read
///   POST /api/send                            body: {"receiverId":"...","content":"..."}
///   PUT  /api/messages/:id/read
///   PUT  /api/active                          body: {"peerId":"..."|null}
///   GET  /events                              SSE stream of EngineEvent JSON
use crate::engine::ChatEngine;
use crate::error::{Result, SyncError};
use crate::model::{EngineEvent, MessageId};
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn empty_body() -> BoxBody {
    Full::new(bytes::Bytes::new()).boxed()
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn json_status(status: StatusCode, value: serde_json::Value) -> Resp {
    json_resp(status, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_status(StatusCode::OK, value)
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_status(status, serde_json::json!({ "error": msg }))
}

/// HTTP status for an engine error
fn error_status(e: &SyncError) -> StatusCode {
    match e {
        SyncError::InvalidPeer(_) | SyncError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
        SyncError::SendFailed(_) => StatusCode::BAD_GATEWAY,
        SyncError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn sse_resp(rx: broadcast::Receiver<EngineEvent>) -> Resp {
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    let data = format!("data: {}\n\n", json);
                    let frame = Frame::data(bytes::Bytes::from(data));
                    return Some((Ok::<_, Infallible>(frame), rx));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(BodyExt::boxed(StreamBody::new(first.chain(events))))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// Bind `addr` and serve until the task is dropped
pub async fn start_messenger_api(engine: ChatEngine, addr: SocketAddr) -> Result<()> {
    if !addr.ip().is_loopback() {
        return Err(SyncError::Config(format!(
            "messenger API must bind a loopback address, got {}",
            addr
        )));
    }
    let listener = TcpListener::bind(addr).await?;
    info!("Messenger API started on http://{}", addr);
    serve(engine, listener).await
}

/// Serve on an already bound listener
pub async fn serve(engine: ChatEngine, listener: TcpListener) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Messenger API connection");
                let io = TokioIo::new(stream);
                let engine = engine.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let engine = engine.clone();
                        async move { Ok::<_, Infallible>(handle(req, engine).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // Client disconnects are normal for SSE
                        if !e.is_incomplete_message() {
                            error!("Messenger API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Messenger API accept error: {}", e),
        }
    }
}

async fn handle(req: Request<hyper::body::Incoming>, engine: ChatEngine) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body()));
    }

    match (method.clone(), path.as_str()) {
        (Method::GET, "/api/status") => get_status(&engine).await,
        (Method::GET, "/api/conversations") => get_conversations(&engine).await,
        (Method::POST, "/api/send") => post_send(req, &engine).await,
        (Method::PUT, "/api/active") => put_active(req, &engine).await,
        (Method::GET, "/events") => sse_resp(engine.subscribe()),
        _ => {
            if let Some(rest) = path.strip_prefix("/api/conversations/") {
                if method == Method::POST {
                    if let Some(peer) = rest.strip_suffix("/read") {
                        return post_mark_all_read(&segment(peer), &engine).await;
                    }
                }
                if method == Method::GET && !rest.contains('/') {
                    return get_conversation(&segment(rest), &engine).await;
                }
            }
            if method == Method::PUT {
                if let Some(id) = path
                    .strip_prefix("/api/messages/")
                    .and_then(|rest| rest.strip_suffix("/read"))
                {
                    return put_mark_read(&segment(id), &engine).await;
                }
            }
            json_err(StatusCode::NOT_FOUND, "not found")
        }
    }
}

async fn get_status(engine: &ChatEngine) -> Resp {
    match engine.status().await {
        Ok(status) => json_ok(serde_json::to_value(status).unwrap_or_default()),
        Err(e) => json_err(error_status(&e), &e.to_string()),
    }
}

async fn get_conversations(engine: &ChatEngine) -> Resp {
    match engine.conversations().await {
        Ok(conversations) => json_ok(serde_json::json!({ "conversations": conversations })),
        Err(e) => json_err(error_status(&e), &e.to_string()),
    }
}

async fn get_conversation(peer_id: &str, engine: &ChatEngine) -> Resp {
    let messages = match engine.open_conversation(peer_id).await {
        Ok(messages) => messages,
        Err(e) => return json_err(error_status(&e), &e.to_string()),
    };
    match engine.conversation(peer_id).await {
        Ok(conversation) => json_ok(serde_json::json!({
            "conversation": conversation,
            "messages": messages,
        })),
        Err(e) => json_err(error_status(&e), &e.to_string()),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    receiver_id: String,
    content: String,
}

async fn post_send(req: Request<hyper::body::Incoming>, engine: &ChatEngine) -> Resp {
    let r: SendRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match engine.send(&r.receiver_id, &r.content).await {
        Ok(message) => json_ok(serde_json::json!({ "message": message })),
        Err(e) => json_err(error_status(&e), &e.to_string()),
    }
}

async fn put_mark_read(id: &str, engine: &ChatEngine) -> Resp {
    match engine.mark_read(&MessageId::parse(id)).await {
        Ok(changed) => json_ok(serde_json::json!({ "changed": changed })),
        Err(e) if e.is_soft() => json_status(
            StatusCode::ACCEPTED,
            serde_json::json!({ "changed": true, "warning": e.to_string() }),
        ),
        Err(e) => json_err(error_status(&e), &e.to_string()),
    }
}

async fn post_mark_all_read(peer_id: &str, engine: &ChatEngine) -> Resp {
    match engine.mark_all_read(peer_id).await {
        Ok(marked) => json_ok(serde_json::json!({ "marked": marked })),
        Err(e) if e.is_soft() => json_status(
            StatusCode::ACCEPTED,
            serde_json::json!({ "warning": e.to_string() }),
        ),
        Err(e) => json_err(error_status(&e), &e.to_string()),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveRequest {
    peer_id: Option<String>,
}

async fn put_active(req: Request<hyper::body::Incoming>, engine: &ChatEngine) -> Resp {
    let r: ActiveRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match engine.set_active_conversation(r.peer_id.as_deref()).await {
        Ok(marked) => json_ok(serde_json::json!({ "activePeerId": r.peer_id, "marked": marked })),
        Err(e) => json_err(error_status(&e), &e.to_string()),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<hyper::body::Incoming>) -> std::result::Result<T, Resp> {
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)))?;
    serde_json::from_slice(&body).map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)))
}

/// Percent-decoded path segment
fn segment(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}
