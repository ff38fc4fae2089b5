use crate::consts::TTS_CHUNK_BYTES;
use crate::error::SpeechError;
use crate::speech::SynthesisBackend;
use crate::types::VoiceOptions;
use crate::utils::b64_decode;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Clone, Debug)]
pub struct TtsConfig {
    pub url: String,
    pub api_key: String,
    pub default_voice: String,
}

#[derive(Serialize, Debug)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice: &'a str,
    rate: f32,
    pitch: f32,
    volume: f32,
}

#[derive(Deserialize, Debug)]
struct SynthesizeResponse {
    audio_content: String,
}

/// Synthesis backend that posts text to an HTTP text-to-speech endpoint and
/// streams the decoded audio to the caller in fixed-size chunks. Cancellation
/// is checked between chunks so an interrupted utterance stops mid-playback.
pub struct HttpSynthesisBackend {
    http_client: reqwest::Client,
    config: TtsConfig,
    audio_out: mpsc::Sender<Vec<u8>>,
}

impl HttpSynthesisBackend {
    pub fn new(
        http_client: reqwest::Client,
        config: TtsConfig,
        audio_out: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            http_client,
            config,
            audio_out,
        }
    }
}

#[async_trait]
impl SynthesisBackend for HttpSynthesisBackend {
    async fn synthesize(
        &self,
        text: &str,
        options: &VoiceOptions,
        cancel: CancellationToken,
    ) -> Result<(), SpeechError> {
        let voice = options
            .voice
            .as_deref()
            .unwrap_or(self.config.default_voice.as_str());
        let payload = SynthesizeRequest {
            text,
            voice,
            rate: options.rate,
            pitch: options.pitch,
            volume: options.volume,
        };
        let resp = self
            .http_client
            .post(&self.config.url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.config.api_key),
            )
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send synthesis request");
                SpeechError::Synthesis(format!("synthesis request failed: {e}"))
            })?;
        let resp = resp.error_for_status().map_err(|e| {
            error!(error=%e, "synthesis endpoint returned error status");
            SpeechError::Synthesis(format!("synthesis bad status: {e}"))
        })?;
        let body = resp.json::<SynthesizeResponse>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize synthesis response");
            SpeechError::Synthesis(format!("synthesis deserialize error: {e}"))
        })?;
        let audio = b64_decode(&body.audio_content)
            .map_err(|e| SpeechError::Synthesis(format!("synthesis audio decode error: {e}")))?;

        for chunk in audio.chunks(TTS_CHUNK_BYTES) {
            if cancel.is_cancelled() {
                debug!("synthesis playback interrupted");
                return Ok(());
            }
            if self.audio_out.send(chunk.to_vec()).await.is_err() {
                // Listener went away; stopping playback is not an error.
                debug!("synthesis audio sink closed");
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::b64_encode;
    use httpmock::prelude::*;

    fn backend(url: &str, audio_out: mpsc::Sender<Vec<u8>>) -> HttpSynthesisBackend {
        HttpSynthesisBackend::new(
            reqwest::Client::new(),
            TtsConfig {
                url: url.to_string(),
                api_key: "tts-key".to_string(),
                default_voice: "en-IN-Standard-A".to_string(),
            },
            audio_out,
        )
    }

    #[tokio::test]
    async fn synthesized_audio_is_decoded_and_streamed() {
        let server = MockServer::start();
        let audio: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .header("authorization", "Bearer tts-key")
                .json_body_partial(r#"{"voice": "en-IN-Standard-A"}"#);
            then.status(200)
                .json_body(serde_json::json!({ "audio_content": b64_encode(&audio) }));
        });

        let (tx, mut rx) = mpsc::channel(8);
        let backend = backend(&server.url("/"), tx);
        backend
            .synthesize("Hello", &VoiceOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        mock.assert();

        let mut received = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            assert!(chunk.len() <= TTS_CHUNK_BYTES);
            received.extend(chunk);
        }
        assert_eq!(received, audio);
    }

    #[tokio::test]
    async fn server_error_surfaces_as_synthesis_fault() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(500);
        });

        let (tx, _rx) = mpsc::channel(8);
        let backend = backend(&server.url("/"), tx);
        let err = backend
            .synthesize("Hello", &VoiceOptions::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpeechError::Synthesis(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_playback_between_chunks() {
        let server = MockServer::start();
        let audio = vec![7u8; TTS_CHUNK_BYTES * 4];
        server.mock(|when, then| {
            when.method(POST);
            then.status(200)
                .json_body(serde_json::json!({ "audio_content": b64_encode(&audio) }));
        });

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::channel(8);
        let backend = backend(&server.url("/"), tx);
        backend
            .synthesize("Hello", &VoiceOptions::default(), cancel)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
