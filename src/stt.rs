use crate::error::SpeechError;
use crate::speech::{RecognitionBackend, RecognizedSpeech};

use async_trait::async_trait;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::client::IntoClientRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

#[derive(Clone, Debug)]
pub struct SttConfig {
    pub ws_url: String,
    pub api_key: String,
}

/// One streaming recognition result. `is_final` marks a settled segment; any
/// earlier hypotheses for the same audio are superseded.
#[derive(Deserialize, Clone, Debug)]
pub struct StreamSegment {
    pub is_final: bool,
    pub channel: Channel,
}

#[derive(Deserialize, Clone, Default, Debug)]
pub struct Channel {
    pub alternatives: Vec<Alternative>,
}

#[derive(Deserialize, Clone, Default, Debug)]
pub struct Alternative {
    pub transcript: String,
    pub confidence: f32,
}

/// Recognition backend that relays caller audio to a streaming speech-to-text
/// websocket and funnels hypotheses back through the gateway. The audio
/// receiver is single use; a backend instance serves exactly one capture.
pub struct WsRecognitionBackend {
    config: SttConfig,
    audio: tokio::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl WsRecognitionBackend {
    pub fn new(config: SttConfig, audio: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            config,
            audio: tokio::sync::Mutex::new(Some(audio)),
        }
    }
}

#[async_trait]
impl RecognitionBackend for WsRecognitionBackend {
    async fn run_stream(
        &self,
        sink: mpsc::Sender<RecognizedSpeech>,
        cancel: CancellationToken,
    ) -> Result<(), SpeechError> {
        let mut audio = self
            .audio
            .lock()
            .await
            .take()
            .ok_or_else(|| SpeechError::Recognition("audio source already consumed".to_string()))?;

        trace!("connecting to recognition stream");
        let mut rq = self
            .config
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| SpeechError::Recognition(format!("bad recognition url: {e}")))?;
        let token = http::header::HeaderValue::from_str(&format!("Token {}", self.config.api_key))
            .map_err(|e| SpeechError::Recognition(format!("bad recognition key: {e}")))?;
        rq.headers_mut().insert(http::header::AUTHORIZATION, token);
        let (ws_stream, _) = connect_async(rq)
            .await
            .map_err(|e| SpeechError::Recognition(format!("recognition connect failed: {e}")))?;
        let (mut stt_sink, mut stt_stream) = ws_stream.split();

        let mut audio_open = true;
        loop {
            tokio::select! {
                chunk = audio.recv(), if audio_open => match chunk {
                    Some(bytes) => {
                        if let Err(e) = stt_sink.send(tungstenite::Message::Binary(bytes)).await {
                            return Err(SpeechError::Recognition(format!(
                                "failed to send audio upstream: {e}"
                            )));
                        }
                    }
                    None => {
                        // Caller audio is done; close the upstream write half
                        // and drain remaining hypotheses.
                        audio_open = false;
                        let _ = stt_sink.send(tungstenite::Message::Close(None)).await;
                    }
                },
                _ = cancel.cancelled() => {
                    debug!("recognition stream cancelled");
                    let _ = stt_sink.send(tungstenite::Message::Close(None)).await;
                    return Ok(());
                }
                msg = stt_stream.next() => match msg {
                    Some(Ok(tungstenite::Message::Text(json))) => {
                        let segment: StreamSegment = match serde_json::from_str(&json) {
                            Ok(segment) => segment,
                            Err(e) => {
                                warn!(error=%e, "unparseable recognition message; skipping");
                                continue;
                            }
                        };
                        let Some(alternative) = segment.channel.alternatives.first() else {
                            continue;
                        };
                        let text = alternative.transcript.trim().to_string();
                        if text.is_empty() {
                            continue;
                        }
                        let speech = if segment.is_final {
                            RecognizedSpeech::Final(text)
                        } else {
                            RecognizedSpeech::Interim(text)
                        };
                        if sink.send(speech).await.is_err() {
                            // Gateway hung up; nothing left to deliver to.
                            return Ok(());
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        debug!("recognition stream closed upstream");
                        return Ok(());
                    }
                    Some(Ok(_)) => (),
                    Some(Err(e)) => {
                        error!(error=%e, "recognition stream receive error");
                        return Err(SpeechError::Recognition(format!(
                            "recognition stream failed: {e}"
                        )));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_segments_deserialize() {
        let json = r#"{
            "is_final": true,
            "channel": {"alternatives": [{"transcript": "hello there", "confidence": 0.98}]}
        }"#;
        let segment: StreamSegment = serde_json::from_str(json).unwrap();
        assert!(segment.is_final);
        assert_eq!(segment.channel.alternatives[0].transcript, "hello there");
    }

    #[test]
    fn segments_without_alternatives_deserialize() {
        let json = r#"{"is_final": false, "channel": {"alternatives": []}}"#;
        let segment: StreamSegment = serde_json::from_str(json).unwrap();
        assert!(segment.channel.alternatives.is_empty());
    }
}
