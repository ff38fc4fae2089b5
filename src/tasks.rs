use crate::error::AppError;
use crate::session::CallSessionManager;
use crate::speech::{RecognizedSpeech, SpeechEvent, SpeechGateway};
use crate::utils::{b64_decode, b64_encode};
use crate::wire::{ClientMessage, MediaPayload, ServerMessage};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Task that funnels server messages from every producer onto the client
/// websocket. The sink is single-owner; everything else talks through the
/// channel.
pub async fn send_server_messages(
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut client_sink: SplitSink<WebSocket, Message>,
) -> Result<(), AppError> {
    while let Some(msg) = outbound.recv().await {
        let json = serde_json::to_string(&msg)
            .map_err(|_| AppError("failed to serialize server message"))?;
        if let Err(e) = client_sink.send(Message::Text(json)).await {
            error!(error=%e, "failed to send message to client");
            return Err(AppError("failed to send message to client"));
        }
    }
    debug!("server message funnel closed");
    Ok(())
}

/// Task that wraps synthesized audio chunks as base64 media messages for the
/// client to play.
pub async fn forward_synthesized_audio(
    mut audio: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<ServerMessage>,
) {
    while let Some(chunk) = audio.recv().await {
        let msg = ServerMessage::Media {
            media: MediaPayload {
                payload: b64_encode(&chunk),
            },
        };
        if outbound.send(msg).await.is_err() {
            debug!("outbound channel closed; dropping synthesized audio");
            return;
        }
    }
}

/// Task that relays client microphone audio into the recognition pipeline.
/// Runs until the client sends `stop` or closes the socket.
pub async fn pump_client_messages(
    mut client_stream: SplitStream<WebSocket>,
    caller_audio: mpsc::Sender<Vec<u8>>,
) -> Result<(), AppError> {
    loop {
        match client_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        ClientMessage::Media { media } => {
                            let chunk = match b64_decode(&media.payload) {
                                Ok(chunk) => chunk,
                                Err(e) => {
                                    warn!(error=%e, "undecodable media payload; skipping");
                                    continue;
                                }
                            };
                            if caller_audio.send(chunk).await.is_err() {
                                // Recognition went away first; nothing left
                                // to feed.
                                break Ok(());
                            }
                        }
                        ClientMessage::Stop => {
                            debug!("got stop message from client");
                            break Ok(());
                        }
                        ClientMessage::Start { .. } => {
                            break Err(AppError("unexpected second start message"));
                        }
                    },
                    Err(e) => {
                        error!(error=%e, "failed to parse client text message");
                        break Err(AppError("failed to parse incoming text message"));
                    }
                },
                Ok(Message::Ping(_)) => (),
                Ok(Message::Close(_)) => {
                    debug!("client closed the socket");
                    break Ok(());
                }
                Ok(m) => {
                    warn!(message=?m, "unsupported message type from client");
                    continue;
                }
                Err(e) => {
                    error!(error=%e, "failed to receive message from client");
                    break Err(AppError("failed to receive message from client stream"));
                }
            },
            None => {
                info!("end of client stream");
                break Ok(());
            }
        }
    }
}

/// Task that drives the conversation: consumes recognition events, hands each
/// final utterance to the session manager and forwards new transcript entries
/// to the client. Returns when recognition ends or the session is gone.
pub async fn run_voice_interaction(
    manager: &CallSessionManager,
    gateway: &SpeechGateway,
    session_id: Uuid,
    outbound: mpsc::Sender<ServerMessage>,
) -> Result<(), AppError> {
    let mut handle = match gateway.start_listening() {
        Ok(handle) => handle,
        Err(crate::error::SpeechError::AlreadyActive) => {
            warn!(%session_id, "recognition already active; not starting another stream");
            return Ok(());
        }
        Err(e) => {
            error!(error=%e, %session_id, "failed to start recognition");
            return Err(AppError("failed to start recognition"));
        }
    };

    while let Some(event) = handle.next().await {
        match event {
            SpeechEvent::Recognized(RecognizedSpeech::Final(text)) => {
                let outcome = manager.process_utterance(session_id, &text, gateway).await;
                for entry in outcome.entries {
                    if outbound
                        .send(ServerMessage::Transcript { entry })
                        .await
                        .is_err()
                    {
                        debug!(%session_id, "outbound channel closed mid-conversation");
                        return Ok(());
                    }
                }
                // An agent-ended call is already evicted, so this is the only
                // place its ended frame can come from.
                if let Some(ended) = outcome.ended {
                    let _ = outbound
                        .send(ServerMessage::Ended {
                            session_id,
                            duration_secs: ended.duration_secs,
                        })
                        .await;
                    debug!(%session_id, "call ended by agent action; leaving interaction loop");
                    return Ok(());
                }
                if manager.get_session(session_id).is_none() {
                    debug!(%session_id, "session ended; leaving interaction loop");
                    return Ok(());
                }
            }
            // Interim hypotheses are provisional; only finals drive replies.
            SpeechEvent::Recognized(RecognizedSpeech::Interim(text)) => {
                debug!(%session_id, interim=%text, "interim recognition");
            }
            SpeechEvent::Error(reason) => {
                error!(%session_id, %reason, "recognition fault");
                manager.record_recognition_fault(session_id, &reason);
            }
            SpeechEvent::Started => debug!(%session_id, "recognition started"),
            SpeechEvent::Ended => debug!(%session_id, "recognition ended"),
        }
    }
    Ok(())
}
