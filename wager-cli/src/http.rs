use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::body::HttpBody;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, warn};
use wager_engine::{IngestionService, TransactionRequest};
use wager_ledger::LedgerStore;

/// Header carrying the origin tag of a wager.
pub const SOURCE_TYPE_HEADER: &str = "Source-Type";

/// Largest request body accepted by the transaction endpoint.
pub const MAX_BODY_BYTES: usize = 16 * 1024;

/// JSON body of `POST /transactions`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransactionPayload {
    pub transaction_id: String,
    pub state: String,
    pub amount: String,
}

/// Bind the transaction endpoint and serve it until `shutdown` resolves.
pub fn spawn_http_server<S, F>(
    addr: SocketAddr,
    service: Arc<IngestionService<S>>,
    shutdown: F,
) -> Result<(SocketAddr, JoinHandle<()>)>
where
    S: LedgerStore + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let make_svc = make_service_fn(move |_conn| {
        let service = Arc::clone(&service);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let service = Arc::clone(&service);
                async move { Ok::<_, Infallible>(route(req, service).await) }
            }))
        }
    });
    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?
        .serve(make_svc);
    let local_addr = server.local_addr();
    info!(addr = %local_addr, "transaction endpoint listening");
    let handle = tokio::spawn(async move {
        if let Err(err) = server.with_graceful_shutdown(shutdown).await {
            warn!(error = %err, "HTTP server exited with error");
        }
    });
    Ok((local_addr, handle))
}

/// Dispatch a request to its handler.
pub async fn route<S: LedgerStore + 'static>(
    req: Request<Body>,
    service: Arc<IngestionService<S>>,
) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/transactions") => handle_transaction(req, service).await,
        (_, "/transactions") => respond(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn handle_transaction<S: LedgerStore + 'static>(
    req: Request<Body>,
    service: Arc<IngestionService<S>>,
) -> Response<Body> {
    let source = req
        .headers()
        .get(SOURCE_TYPE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = match read_limited(req.into_body(), MAX_BODY_BYTES).await {
        Ok(Some(body)) => body,
        Ok(None) => {
            warn!(limit = MAX_BODY_BYTES, "request body too large");
            return respond(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {MAX_BODY_BYTES} bytes"),
            );
        }
        Err(err) => return internal(format!("read request body: {err}")),
    };
    let payload: TransactionPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => return internal(format!("decode request body: {err}")),
    };

    let request = TransactionRequest {
        account: service.default_account(),
        transaction_id: payload.transaction_id,
        state: payload.state,
        amount: payload.amount,
        source,
    };
    match task::spawn_blocking(move || service.apply(&request)).await {
        Ok(Ok(_)) => respond(StatusCode::OK, ""),
        Ok(Err(err)) if err.is_client_error() => respond(StatusCode::BAD_REQUEST, err.to_string()),
        Ok(Err(err)) => internal(err.to_string()),
        Err(err) => internal(format!("ingestion task failed: {err}")),
    }
}

/// Collect at most `limit` bytes; `None` when the body is larger.
async fn read_limited(mut body: Body, limit: usize) -> Result<Option<Vec<u8>>, hyper::Error> {
    // a Content-Length above the limit is refused without reading
    if body.size_hint().lower() > limit as u64 {
        return Ok(None);
    }
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if collected.len() + chunk.len() > limit {
            return Ok(None);
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(Some(collected))
}

fn internal(message: String) -> Response<Body> {
    error!(error = %message, "transaction request failed");
    respond(StatusCode::INTERNAL_SERVER_ERROR, message)
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}
