use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use issuance_engine::{
    audit_log::{AuditLog, MemoryAuditLog, NatsAuditLog},
    config::{AuditBackend, Config, LedgerBackend, StoreBackend},
    database::{Database, MemoryStore, TransactionStore},
    handlers::{self, AppState},
    ledger::{GatewayLedgerClient, LedgerClient, MemoryLedger},
    security_middleware::{JwtAuth, RateLimiter},
    IssuanceOrchestrator, PipelineConfig, SERVICE_NAME, VERSION,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_ledger(config: &Config, pipeline: &PipelineConfig) -> anyhow::Result<Arc<dyn LedgerClient>> {
    Ok(match config.ledger.backend {
        LedgerBackend::Gateway => Arc::new(
            GatewayLedgerClient::new(config.ledger.gateway_url.clone(), config.ledger.timeout_secs)
                .context("Failed to build ledger gateway client")?,
        ),
        LedgerBackend::Memory => {
            warn!("Using in-memory ledger; balances are lost on restart");
            let ledger = MemoryLedger::new(pipeline.operator_account.clone());
            ledger
                .register_token(&pipeline.token_id, &pipeline.treasury_account)
                .await;
            Arc::new(ledger)
        }
    })
}

async fn build_audit_log(config: &Config, pipeline: &PipelineConfig) -> anyhow::Result<Arc<dyn AuditLog>> {
    Ok(match config.audit.backend {
        AuditBackend::Nats => Arc::new(
            NatsAuditLog::connect(&config.nats.url, &config.nats.stream_prefix)
                .await
                .context("Failed to connect to NATS")?,
        ),
        AuditBackend::Memory => {
            warn!("Using in-memory audit log; messages are lost on restart");
            Arc::new(MemoryAuditLog::with_topic(&pipeline.audit_topic_id).await)
        }
    })
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn TransactionStore>> {
    Ok(match config.store.backend {
        StoreBackend::Postgres => {
            let db = Database::new(&config.database.url, config.database.max_connections)
                .await
                .context("Failed to connect to database")?;
            db.run_migrations()
                .await
                .context("Failed to apply database schema")?;
            Arc::new(db)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory transaction store; records are lost on restart");
            Arc::new(MemoryStore::new())
        }
    })
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    info!("Starting {} v{} on port {}", SERVICE_NAME, VERSION, config.server.port);

    let pipeline = config.pipeline();
    let ledger = build_ledger(&config, &pipeline).await?;
    let audit = build_audit_log(&config, &pipeline).await?;
    let store = build_store(&config).await?;

    info!(
        "Pipeline configured: token {} ({} decimals, {}), treasury {}, audit topic {}",
        pipeline.token_id,
        pipeline.token_decimals,
        pipeline.fiat_currency,
        pipeline.treasury_account,
        pipeline.audit_topic_id
    );

    let orchestrator = Arc::new(IssuanceOrchestrator::new(pipeline, ledger, audit, store)?);
    let state = web::Data::new(AppState::new(
        orchestrator,
        &config.security.signature_header,
    ));

    let jwt_secret = config.security.jwt_secret.as_ref().map(|s| s.expose());
    let auth = JwtAuth::new(jwt_secret);
    if !auth.is_enabled() {
        warn!("No JWT secret configured; operator routes are unauthenticated");
    }
    let limiter = RateLimiter::new(config.security.webhook_requests_per_minute);

    HttpServer::new(move || {
        let cors = Cors::permissive();
        let auth = auth.clone();
        let limiter = limiter.clone();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(state.clone())
            .configure(|cfg| handlers::configure_routes(cfg, auth, limiter))
    })
    .workers(config.server.workers.max(1))
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    Ok(())
}
