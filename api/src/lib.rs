pub mod fanout;
pub mod projection;
pub mod routes;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod time;

use actix_cors::Cors;
use actix_web::dev::Server;
use actix_web::http::header::CACHE_CONTROL;
use actix_web::{App, HttpServer, middleware::DefaultHeaders, web};
use jiff::SignedDuration;
use sqlx::PgPool;
use std::net::TcpListener;

use crate::fanout::EventFanout;
use crate::projection::Projection;
use crate::time::TimeSource;

/// Build the server, but not await it.
///
/// Returns the port that the server has bound to by modifying the config.
/// The pool and fan-out are passed in so the scheduler and the HTTP surface
/// share them; spawning the scheduler and the fan-out flush loop is the
/// caller's job.
pub async fn build(
    config: &mut Config,
    engine_config: EngineConfig,
    time_source: TimeSource,
    pool: PgPool,
    fanout: EventFanout,
) -> std::io::Result<Server> {
    let projection = Projection::new(
        pool.clone(),
        time_source.clone(),
        SignedDuration::from_millis(engine_config.dashboard_ttl_running_ms),
        SignedDuration::from_millis(engine_config.dashboard_ttl_completed_ms),
    );

    let db_pool = web::Data::new(pool);
    let time_source = web::Data::new(time_source);
    let fanout = web::Data::new(fanout);
    let projection = web::Data::new(projection);
    let engine_config = web::Data::new(engine_config);

    let allowed_origins = config.allowed_origins.clone();

    // OS assigns the port if binding to 0
    let listener = TcpListener::bind(format!("{}:{}", config.ip, config.port))?;
    config.port = listener.local_addr()?.port();
    let server = HttpServer::new(move || {
        // Configure CORS based on allowed origins
        let cors = if allowed_origins.contains(&"*".to_string()) {
            Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
        } else {
            let mut cors = Cors::default()
                .allow_any_method()
                .allow_any_header();
            for origin in &allowed_origins {
                cors = cors.allowed_origin(origin);
            }
            cors
        };

        App::new()
            .wrap(cors)
            // Balances and dashboards change by the second; intermediaries
            // must not serve stale copies.
            .wrap(DefaultHeaders::new().add((CACHE_CONTROL, "no-store")))
            .service(routes::api_services())
            .app_data(db_pool.clone())
            .app_data(time_source.clone())
            .app_data(fanout.clone())
            .app_data(projection.clone())
            .app_data(engine_config.clone())
    })
    .listen(listener)?
    .run();
    Ok(server)
}

/// Configuration loaded from environment variables at startup.
/// Used only during server initialization, not shared as app_data.
pub struct Config {
    pub database_url: String,
    /// set to "0.0.0.0" for public access, "127.0.0.1" for local dev
    pub ip: String,
    /// set to 0 to get an os-assigned port
    pub port: u16,
    /// List of allowed CORS origins. Use "*" to allow any origin (development only)
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        use std::env::var;

        let allowed_origins = var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Config {
            database_url: var("DATABASE_URL").unwrap(),
            ip: var("IP_ADDRESS").unwrap(),
            port: var("PORT").unwrap().parse().unwrap(),
            allowed_origins,
        }
    }
}

/// Engine tunables, shared as app_data and with the scheduler.
///
/// Every key has a production default; malformed values are startup errors
/// rather than silent fallbacks.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline sweep cadence.
    pub scheduler_tick_ms: u64,
    /// Bounded in-process retries for transient conflicts.
    pub scheduler_max_retries: u32,
    /// Bids refunded per finalization transaction.
    pub finalize_batch_size: i64,
    /// Bid-update coalescing interval.
    pub fanout_tick_ms: u64,
    /// Dashboard cache TTL while the auction is live.
    pub dashboard_ttl_running_ms: i64,
    /// Dashboard cache TTL once the auction completed.
    pub dashboard_ttl_completed_ms: i64,
    /// Serve the identity-unchecked bot routes. Never in production.
    pub enable_bot_api: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler_tick_ms: 1_000,
            scheduler_max_retries: 3,
            finalize_batch_size: 1_000,
            fanout_tick_ms: 100,
            dashboard_ttl_running_ms: 250,
            dashboard_ttl_completed_ms: 5_000,
            enable_bot_api: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            scheduler_tick_ms: parse_env(
                "SCHEDULER_TICK_MS",
                defaults.scheduler_tick_ms,
            ),
            scheduler_max_retries: parse_env(
                "SCHEDULER_MAX_RETRIES",
                defaults.scheduler_max_retries,
            ),
            finalize_batch_size: parse_env(
                "FINALIZE_BATCH_SIZE",
                defaults.finalize_batch_size,
            ),
            fanout_tick_ms: parse_env(
                "FANOUT_TICK_MS",
                defaults.fanout_tick_ms,
            ),
            dashboard_ttl_running_ms: parse_env(
                "DASHBOARD_TTL_RUNNING_MS",
                defaults.dashboard_ttl_running_ms,
            ),
            dashboard_ttl_completed_ms: parse_env(
                "DASHBOARD_TTL_COMPLETED_MS",
                defaults.dashboard_ttl_completed_ms,
            ),
            enable_bot_api: parse_env(
                "ENABLE_BOT_API",
                defaults.enable_bot_api,
            ),
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|e| panic!("invalid value for {key}: {e}")),
        Err(_) => default,
    }
}
