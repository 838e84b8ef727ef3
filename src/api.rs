use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, Responder, ResponseError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{NumberingError, ValidationError};
use crate::sequence_definition::{DefinitionUpdate, NewSequenceDefinition};
use crate::sequence_service::{ResetRequest, SequenceService};

pub const ACTOR_HEADER: &str = "X-Actor";

impl ResponseError for NumberingError {
    fn status_code(&self) -> StatusCode {
        match self {
            NumberingError::Validation(_) => StatusCode::BAD_REQUEST,
            NumberingError::DuplicateType(_) => StatusCode::CONFLICT,
            NumberingError::NotFound(_) => StatusCode::NOT_FOUND,
            NumberingError::Inactive(_) => StatusCode::CONFLICT,
            NumberingError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            NumberingError::Overflow(_) | NumberingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let code = match self {
            NumberingError::Validation(_) => "validation_error",
            NumberingError::DuplicateType(_) => "duplicate_document_type",
            NumberingError::NotFound(_) => "not_found",
            NumberingError::Inactive(_) => "inactive_definition",
            NumberingError::Busy(_) => "busy",
            NumberingError::Overflow(_) => "counter_overflow",
            NumberingError::Store(_) => "store_error",
        };
        if self.status_code().is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        HttpResponse::build(self.status_code()).json(json!({
            "error": code,
            "message": self.to_string(),
        }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub preview_number: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct WarehouseQuery {
    #[serde(default)]
    pub warehouse: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IssuePayload {
    #[serde(default)]
    pub warehouse: String,
}

fn actor(request: &HttpRequest) -> String {
    request
        .headers()
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Reads an optional JSON body. An empty body means defaults; anything else
/// must parse, whatever its content type.
fn optional_json<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, NumberingError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| ValidationError::MalformedBody(err.to_string()).into())
}

async fn list_definitions(service: web::Data<SequenceService>) -> Result<impl Responder> {
    Ok(web::Json(service.list().await?))
}

async fn create_definition(
    payload: web::Json<NewSequenceDefinition>,
    service: web::Data<SequenceService>,
) -> Result<impl Responder> {
    let created = service.create(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(created))
}

async fn get_definition(document_type: web::Path<String>, service: web::Data<SequenceService>) -> Result<impl Responder> {
    Ok(web::Json(service.get(&document_type).await?))
}

async fn update_definition(
    document_type: web::Path<String>,
    payload: web::Json<DefinitionUpdate>,
    service: web::Data<SequenceService>,
) -> Result<impl Responder> {
    Ok(web::Json(service.update(&document_type, payload.into_inner()).await?))
}

async fn preview_number(
    document_type: web::Path<String>,
    query: web::Query<WarehouseQuery>,
    service: web::Data<SequenceService>,
) -> Result<impl Responder> {
    let warehouse = query.into_inner().warehouse.unwrap_or_default();
    let preview_number = service.preview_next(&document_type, &warehouse).await?;
    Ok(web::Json(PreviewResponse { preview_number }))
}

async fn reset_counter(
    request: HttpRequest,
    document_type: web::Path<String>,
    body: web::Bytes,
    service: web::Data<SequenceService>,
) -> Result<impl Responder> {
    let reset: ResetRequest = optional_json(&body)?;
    let result = service.reset_counter(&document_type, reset, &actor(&request)).await?;
    Ok(web::Json(result))
}

async fn reset_history(document_type: web::Path<String>, service: web::Data<SequenceService>) -> Result<impl Responder> {
    Ok(web::Json(service.reset_history(&document_type).await?))
}

async fn issue_number(
    document_type: web::Path<String>,
    body: web::Bytes,
    service: web::Data<SequenceService>,
) -> Result<impl Responder> {
    let payload: IssuePayload = optional_json(&body)?;
    Ok(web::Json(service.allocate(&document_type, &payload.warehouse).await?))
}

async fn metrics(service: web::Data<SequenceService>) -> HttpResponse {
    match service.metrics().render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode metrics");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

/// Mounts every route on an actix `App`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/document-definitions", web::get().to(list_definitions))
        .route("/document-definitions", web::post().to(create_definition))
        .route("/document-definitions/{document_type}", web::get().to(get_definition))
        .route("/document-definitions/{document_type}", web::patch().to(update_definition))
        .route("/document-definitions/{document_type}/preview", web::get().to(preview_number))
        .route("/document-definitions/{document_type}/reset", web::post().to(reset_counter))
        .route("/document-definitions/{document_type}/resets", web::get().to(reset_history))
        .route("/internal/document-numbers/{document_type}", web::post().to(issue_number))
        .route("/metrics", web::get().to(metrics))
        .route("/health", web::get().to(health));
}
