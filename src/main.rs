use jerry_calls::generator::{GeminiConfig, GeminiGenerator};
use jerry_calls::handlers;
use jerry_calls::session::CallSessionManager;
use jerry_calls::store::{BackupQueue, PgCallLogStore};
use jerry_calls::stt::SttConfig;
use jerry_calls::tts::TtsConfig;
use jerry_calls::types::{AppState, VoiceOptions};

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().unwrap();
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            ("jerry_calls", tracing_subscriber::filter::LevelFilter::DEBUG),
        ]));
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let gemini_api_key = env::var("GEMINI_API_KEY").expect("GEMINI_API_KEY not set!");
    let gemini_model =
        env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash-exp".to_string());
    let gemini_base_url = env::var("GEMINI_BASE_URL")
        .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".to_string());
    let stt_ws_url = env::var("STT_WS_URL").expect("STT_WS_URL not set!");
    let stt_api_key = env::var("STT_API_KEY").expect("STT_API_KEY not set!");
    let tts_url = env::var("TTS_URL").expect("TTS_URL not set!");
    let tts_api_key = env::var("TTS_API_KEY").expect("TTS_API_KEY not set!");
    let tts_voice = env::var("TTS_VOICE").unwrap_or_else(|_| "en-IN-Standard-A".to_string());
    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL not set!");
    let backup_path =
        env::var("BACKUP_QUEUE_PATH").unwrap_or_else(|_| "failed_call_saves.jsonl".to_string());

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("failed to connect to database");
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("failed to run migrations");

    let http_client = reqwest::Client::new();
    let generator = GeminiGenerator::new(
        http_client.clone(),
        GeminiConfig {
            api_key: gemini_api_key,
            model: gemini_model,
            base_url: gemini_base_url,
            temperature: 0.7,
            max_output_tokens: 256,
        },
    );
    let manager = Arc::new(CallSessionManager::new(
        Arc::new(generator),
        Arc::new(PgCallLogStore::new(pool)),
        BackupQueue::new(backup_path),
        VoiceOptions {
            voice: Some(tts_voice.clone()),
            ..Default::default()
        },
    ));

    let app_state = Arc::new(AppState {
        manager,
        http_client,
        stt: SttConfig {
            ws_url: stt_ws_url,
            api_key: stt_api_key,
        },
        tts: TtsConfig {
            url: tts_url,
            api_key: tts_api_key,
            default_voice: tts_voice,
        },
    });

    let app = Router::new()
        .route("/calls/connect", get(handlers::ws_handler))
        .route("/calls", get(handlers::list_calls_handler))
        .route("/calls/retry-saves", post(handlers::retry_saves_handler))
        .route("/", get(handlers::liveness_handler))
        .with_state(app_state);

    axum::Server::bind(&"0.0.0.0:3000".parse().unwrap())
        .serve(app.into_make_service())
        .await
        .unwrap();
}
