//! Network binding for the broker protocol.
//!
//! Every operation is POST `/v1/ops/{op}` with a JSON params body; error
//! kinds map to stable HTTP statuses with the same JSON error body the
//! stdio binding uses.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::info;

use toolgate_broker::{error_body, Broker, BrokerError};

pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/v1/ops/{op}", post(run_op))
        .route("/v1/servers", get(list_servers))
        .with_state(broker)
}

pub async fn serve(addr: SocketAddr, broker: Arc<Broker>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("broker listening on {}", addr);
    axum::serve(listener, router(broker)).await?;
    Ok(())
}

async fn run_op(
    State(broker): State<Arc<Broker>>,
    Path(op): Path<String>,
    params: Option<Json<Value>>,
) -> Response {
    let params = params.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    match broker.dispatch(&op, params).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_servers(State(broker): State<Arc<Broker>>) -> Response {
    match broker.dispatch("list_servers", json!({})).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &BrokerError) -> Response {
    (status_for(err), Json(json!({"error": error_body(err)}))).into_response()
}

fn status_for(err: &BrokerError) -> StatusCode {
    match err {
        BrokerError::ConfigNotFound(_)
        | BrokerError::ActionNotFound { .. }
        | BrokerError::SetNotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::ConfigDisabled(_) => StatusCode::FORBIDDEN,
        BrokerError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
        BrokerError::NotConnected(_) => StatusCode::CONFLICT,
        BrokerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        BrokerError::LaunchFailed { .. }
        | BrokerError::HandshakeFailed { .. }
        | BrokerError::ServerUnavailable(_) => StatusCode::BAD_GATEWAY,
        BrokerError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        BrokerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
