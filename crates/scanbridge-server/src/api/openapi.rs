//! OpenAPI specification for the HTTP transport.

use axum::Json;
use scanbridge_core::{RequestEnvelope, ResponseEnvelope};
use utoipa::OpenApi;

use super::health::HealthResponse;

/// Serve the OpenAPI specification as JSON at `/openapi.json`.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty JSON (for writing to file).
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for scanbridge.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "scanbridge API",
        version = "0.1.0",
        description = r#"
# scanbridge API

scanbridge drives serial BLE observer modules and reports which device
manufacturers are advertising nearby.

## Envelopes

Requests are `{"c": <code>, "d": {...}}`:

- `1` start scanning and reporting (`rssi`, `did` optional)
- `2` stop (`did` optional)
- `3` status probe

Replies and events are `{"t": <type>, "d": {...}}`:

- `1` status, `2` error, `3` device sighting, `4` heartbeat
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local scanbridge daemon")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "bridge", description = "Host commands and the event stream")
    ),
    paths(
        super::health::health_check,
        super::command::post_command,
        super::events::stream_events,
    ),
    components(
        schemas(
            HealthResponse,
            RequestEnvelope,
            ResponseEnvelope,
        )
    )
)]
pub struct ApiDoc;
