use crate::amount::body_error;
use crate::errors::IssuanceError;
use crate::metrics;
use crate::models::{
    CreateTokenRequest, DepositOutcome, DepositResponse, DepositResult, RedeemOutcome,
    RedeemRequest, RedeemResponse, ResumeRequest, TransferRequest, TransferResponse,
};
use crate::orchestrator::IssuanceOrchestrator;
use crate::security_middleware::{JwtAuth, RateLimiter};
use crate::{SERVICE_NAME, VERSION};
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

const DEFAULT_RELOG_LIMIT: i64 = 100;
const AUDIT_TOPIC_MEMO: &str = "issuance audit log";

/// Shared handler state
pub struct AppState {
    pub orchestrator: Arc<IssuanceOrchestrator>,
    /// Header carrying the PSP callback signature, lowercase
    pub signature_header: String,
}

impl AppState {
    pub fn new(orchestrator: Arc<IssuanceOrchestrator>, signature_header: &str) -> Self {
        Self {
            orchestrator,
            signature_header: signature_header.to_ascii_lowercase(),
        }
    }
}

fn deposit_response(result: DepositResult, replayed: bool) -> HttpResponse {
    HttpResponse::Ok().json(DepositResponse {
        status: "ok",
        mint_receipt: result.mint_receipt,
        transfer_receipt: result.transfer_receipt,
        hcs: result.hcs,
        replayed,
    })
}

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": VERSION
    }))
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            tracing::error!("Failed to gather metrics: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "internal" }))
        }
    }
}

/// PSP deposit callback. The body is taken raw so the signature is checked
/// against the exact bytes that were signed.
pub async fn deposit_callback(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, IssuanceError> {
    let signature = req
        .headers()
        .get(state.signature_header.as_str())
        .and_then(|value| value.to_str().ok());

    let outcome = state
        .orchestrator
        .handle_deposit_callback(&body, signature)
        .await?;

    Ok(match outcome {
        DepositOutcome::Completed(result) => deposit_response(result, false),
        DepositOutcome::Replayed(result) => deposit_response(result, true),
        DepositOutcome::InProgress { deposit_id } => HttpResponse::Accepted().json(json!({
            "status": "processing",
            "depositId": deposit_id
        })),
    })
}

/// Redeem tokens for a fiat payout
pub async fn redeem(
    state: web::Data<AppState>,
    request: web::Json<RedeemRequest>,
) -> Result<HttpResponse, IssuanceError> {
    let (result, replayed) = match state
        .orchestrator
        .process_redeem(request.into_inner())
        .await?
    {
        RedeemOutcome::Completed(result) => (result, false),
        RedeemOutcome::Replayed(result) => (result, true),
    };

    Ok(HttpResponse::Ok().json(RedeemResponse {
        status: "ok",
        redeem_id: result.redeem_id,
        burn_receipt: result.burn_receipt,
        hcs: result.hcs,
        payout: result.payout,
        replayed,
    }))
}

/// Transfer tokens from the treasury
pub async fn transfer(
    state: web::Data<AppState>,
    request: web::Json<TransferRequest>,
) -> Result<HttpResponse, IssuanceError> {
    let result = state
        .orchestrator
        .process_transfer(request.into_inner())
        .await?;

    Ok(HttpResponse::Ok().json(TransferResponse {
        status: "ok",
        transfer_receipt: result.transfer_receipt,
        hcs: result.hcs,
    }))
}

pub async fn create_topic(state: web::Data<AppState>) -> Result<HttpResponse, IssuanceError> {
    let topic_id = state.orchestrator.create_topic(AUDIT_TOPIC_MEMO).await?;
    Ok(HttpResponse::Ok().json(json!({ "topicId": topic_id })))
}

pub async fn create_token(
    state: web::Data<AppState>,
    request: web::Json<CreateTokenRequest>,
) -> Result<HttpResponse, IssuanceError> {
    let token_id = state
        .orchestrator
        .create_token(request.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "tokenId": token_id })))
}

pub async fn get_deposit(
    state: web::Data<AppState>,
    deposit_id: web::Path<String>,
) -> Result<HttpResponse, IssuanceError> {
    let deposit = state.orchestrator.get_deposit(&deposit_id).await?;
    Ok(HttpResponse::Ok().json(deposit))
}

/// Operator resume of a FAILED or stale PENDING deposit. An empty body resumes
/// with default options.
pub async fn resume_deposit(
    state: web::Data<AppState>,
    deposit_id: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, IssuanceError> {
    let request = if body.is_empty() {
        ResumeRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| IssuanceError::Validation(format!("malformed resume request: {}", e)))?
    };

    let result = state.orchestrator.resume_deposit(&deposit_id, request).await?;
    Ok(deposit_response(result, false))
}

#[derive(Debug, Deserialize)]
pub struct RelogQuery {
    limit: Option<i64>,
}

pub async fn relog_audits(
    state: web::Data<AppState>,
    query: web::Query<RelogQuery>,
) -> Result<HttpResponse, IssuanceError> {
    let limit = query.limit.unwrap_or(DEFAULT_RELOG_LIMIT).clamp(1, 1000);
    let report = state.orchestrator.relog_pending_audits(limit).await?;
    Ok(HttpResponse::Ok().json(report))
}

/// Configure routes. Operator routes sit behind `auth`; the PSP callback is
/// authenticated by its signature and throttled by `limiter`.
pub fn configure_routes(cfg: &mut web::ServiceConfig, auth: JwtAuth, limiter: RateLimiter) {
    let json_config = web::JsonConfig::default()
        .error_handler(|err, _req| body_error(err.to_string()).into());

    cfg.app_data(json_config)
        .route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(metrics_endpoint))
        .service(
            web::resource("/deposit/callback")
                .wrap(limiter)
                .route(web::post().to(deposit_callback)),
        )
        .service(
            web::resource("/redeem")
                .wrap(auth.clone())
                .route(web::post().to(redeem)),
        )
        .service(
            web::resource("/transfer")
                .wrap(auth.clone())
                .route(web::post().to(transfer)),
        )
        .service(
            web::scope("/admin")
                .wrap(auth)
                .route("/create-topic", web::post().to(create_topic))
                .route("/create-token", web::post().to(create_token))
                .route("/deposits/{deposit_id}", web::get().to(get_deposit))
                .route("/deposits/{deposit_id}/resume", web::post().to(resume_deposit))
                .route("/audit/relog", web::post().to(relog_audits)),
        );
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{body::to_bytes, http::StatusCode};

    #[actix_web::test]
    async fn test_health_reports_service() {
        let resp = health_check().await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["service"], SERVICE_NAME);
    }

    #[actix_web::test]
    async fn test_metrics_are_text() {
        let resp = metrics_endpoint().await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
