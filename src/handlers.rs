use crate::error::{handle_error, AppError};
use crate::session::CallRequest;
use crate::speech::SpeechGateway;
use crate::stt::WsRecognitionBackend;
use crate::tasks::{
    forward_synthesized_audio, pump_client_messages, run_voice_interaction, send_server_messages,
};
use crate::tts::HttpSynthesisBackend;
use crate::types::AppState;
use crate::wire::ServerMessage;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::{SplitStream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const AUDIO_CHANNEL_CAPACITY: usize = 32;

/// Capture the start message from the beginning of a call websocket stream
/// for the call parameters.
async fn get_call_start(
    client_stream: &mut SplitStream<WebSocket>,
) -> Result<CallRequest, AppError> {
    loop {
        match client_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        crate::wire::ClientMessage::Start { start } => break Ok(start),
                        _ => {
                            break Err(AppError(
                                "the first message on a call stream must be a start message",
                            ));
                        }
                    },
                    Err(e) => {
                        error!(error=%e, "failed to deserialize client text message");
                        break Err(AppError("error deserializing client text message"));
                    }
                },
                Ok(Message::Ping(_)) => continue,
                _ => {
                    break Err(AppError("got unexpected websocket message type from client"));
                }
            },
            None => break Err(AppError("end of stream before start message")),
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| socket_handler(socket, app_state))
}

async fn socket_handler(socket: WebSocket, app_state: Arc<AppState>) {
    let (client_sink, mut client_stream) = socket.split();

    let request = match get_call_start(&mut client_stream).await {
        Ok(request) => request,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };
    debug!(?request, "got start message from client stream");

    // Per-connection speech plumbing: client mic audio feeds recognition,
    // synthesized audio flows back out as media messages.
    let (caller_audio_tx, caller_audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_CHANNEL_CAPACITY);
    let (agent_audio_tx, agent_audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_CHANNEL_CAPACITY);
    let gateway = SpeechGateway::new(
        Arc::new(WsRecognitionBackend::new(
            app_state.stt.clone(),
            caller_audio_rx,
        )),
        Arc::new(HttpSynthesisBackend::new(
            app_state.http_client.clone(),
            app_state.tts.clone(),
            agent_audio_tx,
        )),
    );

    let (outbound_tx, outbound_rx) = mpsc::channel::<ServerMessage>(1);
    let sender_task = tokio::spawn(send_server_messages(outbound_rx, client_sink));
    let audio_task = tokio::spawn(forward_synthesized_audio(agent_audio_rx, outbound_tx.clone()));

    let manager = app_state.manager.clone();
    let started = manager.initiate_call(request, &gateway).await;
    let session_id = started.id;

    if outbound_tx
        .send(ServerMessage::Opened { session_id })
        .await
        .is_err()
    {
        error!(%session_id, "client went away before the call opened");
        manager.end_call(session_id, &gateway).await;
        return;
    }
    for entry in started.transcript.entries() {
        if outbound_tx
            .send(ServerMessage::Transcript {
                entry: entry.clone(),
            })
            .await
            .is_err()
        {
            break;
        }
    }

    let res = tokio::join!(
        pump_client_messages(client_stream, caller_audio_tx),
        run_voice_interaction(&manager, &gateway, session_id, outbound_tx.clone()),
    );
    if let (Err(e), _) | (_, Err(e)) = res {
        handle_error(e).await;
    }

    if let Some(ended) = manager.end_call(session_id, &gateway).await {
        let _ = outbound_tx
            .send(ServerMessage::Ended {
                session_id,
                duration_secs: ended.duration_secs,
            })
            .await;
    }
    info!(%session_id, "call socket closing");

    // Dropping the senders lets the funnel tasks drain and exit.
    drop(outbound_tx);
    drop(gateway);
    let _ = audio_task.await;
    let _ = sender_task.await;
}

pub async fn list_calls_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.manager.list_call_logs().await)
}

pub async fn retry_saves_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    match app_state.manager.retry_failed_saves().await {
        Ok(replayed) => Json(serde_json::json!({ "replayed": replayed })),
        Err(e) => {
            error!(error=%e, "backup queue sweep failed");
            Json(serde_json::json!({ "replayed": 0, "error": e.to_string() }))
        }
    }
}

pub async fn liveness_handler() -> impl IntoResponse {
    "jerry-calls is up"
}
