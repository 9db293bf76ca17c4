//! OpenAPI documentation, served as JSON at `/openapi.json` and rendered at `/docs`.

use utoipa::OpenApi;

use crate::api;
use crate::errors::ErrorBody;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Splitter API",
        description = "Separate audio tracks into stems and publish them to object storage."
    ),
    paths(api::handlers::process::process, api::handlers::health::health),
    components(schemas(
        api::models::process::ProcessRequest,
        api::models::process::ProcessResponse,
        api::models::health::HealthResponse,
        ErrorBody
    )),
    tags(
        (name = "process", description = "Stem separation"),
        (name = "health", description = "Liveness"),
    )
)]
pub struct ApiDoc;
