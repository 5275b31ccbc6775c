//! `POST /command`: one host request in, one envelope out.

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use scanbridge_core::{BridgeError, Inbound, RequestEnvelope, Responder, ResponseEnvelope};

use crate::api::error::ApiResult;
use crate::state::HttpState;

/// Executes a host command.
///
/// The body must be a request envelope. Rejected commands (unknown code,
/// unknown device) still answer `200` with a `t: 2` envelope; only bodies
/// that are not envelopes get `400`.
#[utoipa::path(
    post,
    path = "/command",
    tag = "bridge",
    operation_id = "postCommand",
    summary = "Send a command to the bridge",
    description = "Start (`c: 1`, optional `rssi` and `did`), stop (`c: 2`, optional `did`) \
        or probe status (`c: 3`). The reply uses the same envelope as the event stream.",
    request_body = RequestEnvelope,
    responses(
        (status = 200, description = "Command handled", body = ResponseEnvelope),
        (status = 400, description = "Body is not a request envelope", body = ResponseEnvelope),
        (status = 500, description = "Command was not answered", body = ResponseEnvelope),
        (status = 503, description = "Bridge is not accepting commands", body = ResponseEnvelope)
    )
)]
pub async fn post_command(
    State(state): State<HttpState>,
    body: Bytes,
) -> ApiResult<Json<ResponseEnvelope>> {
    serde_json::from_slice::<RequestEnvelope>(&body)
        .map_err(|e| BridgeError::InvalidRequest(e.to_string()))?;
    let payload = String::from_utf8_lossy(&body).into_owned();

    let inbound = state.inbound().await.ok_or(BridgeError::ShuttingDown)?;

    let (respond, reply) = Responder::channel();
    inbound
        .send(Inbound::Data { payload, respond })
        .await
        .map_err(|_| BridgeError::ShuttingDown)?;

    let reply = reply
        .await
        .map_err(|_| BridgeError::Internal("command was dropped unanswered".into()))?;
    let envelope = serde_json::from_str::<ResponseEnvelope>(&reply)
        .map_err(|e| BridgeError::Internal(e.to_string()))?;
    Ok(Json(envelope))
}
