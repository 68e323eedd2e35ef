mod availability;
mod booking;
mod calendar;
mod config;
mod db;
mod dialog;
mod error;
mod extractor;
mod handlers;
mod normalize;
mod notify;
mod openai_types;
mod orchestrator;
mod prompts;
mod session;
mod session_store;
mod tasks;
#[cfg(test)]
mod testing;
mod twilio_types;
mod types;
mod utils;

use crate::calendar::{CalendarBackend, MemoryCalendar};
use crate::config::Settings;
use crate::db::{PgCalendar, PgSessionStore};
use crate::error::{handle_error, AppError};
use crate::extractor::OpenAiExtractor;
use crate::notify::{LogNotifier, Notifier, TwilioClient};
use crate::orchestrator::{Collaborators, Orchestrator};
use crate::session_store::{MemorySessionStore, SessionStore};
use crate::types::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

pub mod consts {
    pub const SPEECH_ROUTE: &str = "/twilio/speech";
    pub const SPEECH_TIMEOUT: &str = "auto";
    pub const CALENDAR_RETRIES: usize = 1;
    /// Lines of the call kept for the model, caller and receptionist together.
    pub const HISTORY_LINES: usize = 6;
    pub const HEALTH_TIMEOUT_MILLIS: u64 = 2_000;
    pub const DB_MAX_CONNECTIONS: u32 = 10;
}

fn init_tracing(level: LevelFilter) {
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", LevelFilter::OFF),
            ("sqlx", LevelFilter::WARN),
            ("barber_rs", level),
        ]));
    tracing::subscriber::set_global_default(subscriber).expect("tracing subscriber already set");
}

async fn backends(
    settings: &Settings,
) -> Result<(Arc<dyn SessionStore>, Arc<dyn CalendarBackend>), AppError> {
    let Some(url) = &settings.database_url else {
        warn!("DATABASE_URL not set, sessions and bookings live in memory");
        return Ok((
            Arc::new(MemorySessionStore::new(settings.session_inactivity)),
            Arc::new(MemoryCalendar::new(settings.hours.clone())),
        ));
    };
    let pool = PgPoolOptions::new()
        .max_connections(consts::DB_MAX_CONNECTIONS)
        .connect(url)
        .await
        .map_err(|e| AppError::Config(format!("DATABASE_URL ({e})")))?;
    sqlx::migrate!()
        .run(&pool)
        .await
        .map_err(|e| AppError::Internal(format!("migrations failed: {e}")))?;
    info!("connected to postgres");
    Ok((
        Arc::new(PgSessionStore::new(pool.clone(), settings.session_inactivity)),
        Arc::new(PgCalendar::new(pool, settings.hours.clone())),
    ))
}

async fn run(settings: Settings) -> Result<(), AppError> {
    let http_client = reqwest::Client::new();
    let (store, calendar) = backends(&settings).await?;

    let notifier: Arc<dyn Notifier> = match &settings.twilio {
        Some(twilio) => Arc::new(TwilioClient {
            http_client: http_client.clone(),
            base_url: twilio.base_url.clone(),
            account_sid: twilio.account_sid.clone(),
            auth_token: twilio.auth_token.clone(),
            from_number: twilio.from_number.clone(),
            shop_name: settings.shop_name.clone(),
        }),
        None => {
            warn!("Twilio credentials not set, confirmations are only logged");
            Arc::new(LogNotifier {
                shop_name: settings.shop_name.clone(),
            })
        }
    };
    let extractor = Arc::new(OpenAiExtractor {
        http_client,
        api_key: settings.openai_api_key.clone(),
        model: settings.openai_model.clone(),
        base_url: settings.openai_base_url.clone(),
    });

    let orchestrator = Orchestrator::new(
        Collaborators {
            store: store.clone(),
            extractor,
            calendar,
            notifier,
        },
        settings.dialog_policy(),
        settings.turn_limits(),
        settings.shop(),
    );
    let sweeper =
        tasks::spawn_session_sweeper(store, settings.sweep_interval, settings.session_grace);

    let app_state = Arc::new(AppState { orchestrator });
    let app = Router::new()
        .route("/twilio/voice", post(handlers::voice_handler))
        .route(consts::SPEECH_ROUTE, post(handlers::speech_handler))
        .route("/twilio/status", post(handlers::status_handler))
        .route("/api/turn", post(handlers::turn_handler))
        .route("/health", get(handlers::health_handler))
        .with_state(app_state);

    info!(addr=%settings.bind_addr, shop=%settings.shop_name, "listening");
    let served = axum::Server::bind(&settings.bind_addr)
        .serve(app.into_make_service())
        .await;
    sweeper.abort();
    served.map_err(|e| AppError::Internal(format!("server error: {e}")))
}

#[tokio::main]
async fn main() {
    let settings = Settings::from_env();
    init_tracing(
        settings
            .as_ref()
            .map(|s| s.log_level)
            .unwrap_or(LevelFilter::DEBUG),
    );
    let result = match settings {
        Ok(settings) => run(settings).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        handle_error(&e);
        std::process::exit(1);
    }
}
