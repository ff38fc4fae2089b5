use crate::error::SpeechError;
use crate::types::VoiceOptions;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A recognized span of caller speech. Interim results are provisional and
/// may be re-emitted for the same utterance; only a `Final` result may be
/// committed to a transcript.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RecognizedSpeech {
    Interim(String),
    Final(String),
}

/// Event delivered on a [`ListenHandle`]. Exactly one `Ended` is delivered
/// per granted listen stream, whatever closed it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SpeechEvent {
    Started,
    Recognized(RecognizedSpeech),
    Error(String),
    Ended,
}

/// Continuous speech-to-text source. Implementations push recognized spans
/// into `sink` until the stream closes, `cancel` fires, or the sink is
/// dropped (all of which end the stream cleanly).
#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    fn supported(&self) -> bool {
        true
    }

    async fn run_stream(
        &self,
        sink: mpsc::Sender<RecognizedSpeech>,
        cancel: CancellationToken,
    ) -> Result<(), SpeechError>;
}

/// Text-to-speech sink. `synthesize` resolves when playback of the utterance
/// completes; observing `cancel` and returning `Ok` early is how an utterance
/// is cut off.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        options: &VoiceOptions,
        cancel: CancellationToken,
    ) -> Result<(), SpeechError>;
}

/// Cancellable handle to one granted recognition stream.
pub struct ListenHandle {
    events: mpsc::Receiver<SpeechEvent>,
    cancel: CancellationToken,
}

impl ListenHandle {
    pub async fn next(&mut self) -> Option<SpeechEvent> {
        self.events.recv().await
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

// A handle dropped without `stop` must still release the stream, or the
// relay task parks forever and the gateway stays latched as listening.
impl Drop for ListenHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Abstraction over the platform's continuous recognition and synthesis
/// primitives.
///
/// STT and TTS are two independent single-slot resources: never more than one
/// recognition stream and one in-flight utterance per gateway instance.
/// Overlapping playback or overlapping recognition streams produce garbled
/// audio and duplicate transcripts on real speech hardware, so each is
/// serialized here rather than left to callers.
pub struct SpeechGateway {
    recognizer: Arc<dyn RecognitionBackend>,
    synthesizer: Arc<dyn SynthesisBackend>,
    listening: Arc<AtomicBool>,
    speaking: Arc<AtomicBool>,
    listen_cancel: Mutex<Option<CancellationToken>>,
    speak_cancel: Mutex<Option<CancellationToken>>,
    speak_generation: AtomicU64,
}

impl SpeechGateway {
    pub fn new(
        recognizer: Arc<dyn RecognitionBackend>,
        synthesizer: Arc<dyn SynthesisBackend>,
    ) -> Self {
        Self {
            recognizer,
            synthesizer,
            listening: Arc::new(AtomicBool::new(false)),
            speaking: Arc::new(AtomicBool::new(false)),
            listen_cancel: Mutex::new(None),
            speak_cancel: Mutex::new(None),
            speak_generation: AtomicU64::new(0),
        }
    }

    /// Begin continuous recognition. Rejects with `Unsupported` when the
    /// backend offers no capability and with `AlreadyActive` while a stream
    /// is open: overlapping listen requests are refused, never queued.
    pub fn start_listening(&self) -> Result<ListenHandle, SpeechError> {
        if !self.recognizer.supported() {
            return Err(SpeechError::Unsupported);
        }
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(SpeechError::AlreadyActive);
        }

        let cancel = CancellationToken::new();
        {
            let mut slot = self.listen_cancel.lock().unwrap();
            *slot = Some(cancel.clone());
        }

        let (event_tx, event_rx) = mpsc::channel::<SpeechEvent>(16);
        let recognizer = self.recognizer.clone();
        let listening = self.listening.clone();
        let stream_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = event_tx.send(SpeechEvent::Started).await;
            let (speech_tx, mut speech_rx) = mpsc::channel::<RecognizedSpeech>(16);
            let run = recognizer.run_stream(speech_tx, stream_cancel);
            tokio::pin!(run);
            let result = loop {
                tokio::select! {
                    res = &mut run => break res,
                    Some(speech) = speech_rx.recv() => {
                        let _ = event_tx.send(SpeechEvent::Recognized(speech)).await;
                    }
                }
            };
            // Flush spans the backend emitted right before closing.
            while let Ok(speech) = speech_rx.try_recv() {
                let _ = event_tx.send(SpeechEvent::Recognized(speech)).await;
            }
            if let Err(e) = result {
                error!(error=%e, "recognition stream fault");
                let _ = event_tx.send(SpeechEvent::Error(e.to_string())).await;
            }
            let _ = event_tx.send(SpeechEvent::Ended).await;
            listening.store(false, Ordering::SeqCst);
            debug!("recognition stream closed");
        });

        Ok(ListenHandle {
            events: event_rx,
            cancel,
        })
    }

    /// Idempotent: no-op when not listening, otherwise halts the stream and
    /// lets the pending `Ended` fire.
    pub fn stop_listening(&self) {
        let token = {
            let mut slot = self.listen_cancel.lock().unwrap();
            slot.take()
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Speak one utterance, cancelling any utterance still playing first.
    /// Empty or blank text resolves immediately without producing audio. A
    /// cancelled utterance resolves `Ok`.
    pub async fn speak(&self, text: &str, options: &VoiceOptions) -> Result<(), SpeechError> {
        if text.trim().is_empty() {
            return Ok(());
        }

        let generation = self.speak_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = {
            let mut slot = self.speak_cancel.lock().unwrap();
            if let Some(prev) = slot.take() {
                prev.cancel();
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };

        self.speaking.store(true, Ordering::SeqCst);
        let result = self.synthesizer.synthesize(text, options, cancel).await;
        // Only the most recent utterance owns the speaking flag; an older
        // call resolving late must not clear state for its successor.
        if self.speak_generation.load(Ordering::SeqCst) == generation {
            self.speaking.store(false, Ordering::SeqCst);
            let mut slot = self.speak_cancel.lock().unwrap();
            *slot = None;
        }
        result
    }

    /// Idempotent cancellation of any in-flight utterance.
    pub fn stop_speaking(&self) {
        let slot = self.speak_cancel.lock().unwrap();
        if let Some(token) = slot.as_ref() {
            token.cancel();
        }
    }

    pub fn is_currently_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn is_currently_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }
}

/// Recognition backend that replays a fixed script of spans and then closes
/// (or stays open until cancelled). Useful where actual speech hardware isn't
/// available, which includes every test in this crate.
pub struct ScriptedRecognition {
    script: Mutex<Vec<RecognizedSpeech>>,
    hold_open: bool,
}

impl ScriptedRecognition {
    pub fn new(script: Vec<RecognizedSpeech>) -> Self {
        Self {
            script: Mutex::new(script),
            hold_open: false,
        }
    }

    /// Replay the script, then keep the stream open until it is cancelled.
    pub fn hold_open(script: Vec<RecognizedSpeech>) -> Self {
        Self {
            script: Mutex::new(script),
            hold_open: true,
        }
    }
}

#[async_trait]
impl RecognitionBackend for ScriptedRecognition {
    async fn run_stream(
        &self,
        sink: mpsc::Sender<RecognizedSpeech>,
        cancel: CancellationToken,
    ) -> Result<(), SpeechError> {
        let script: Vec<RecognizedSpeech> = {
            let mut guard = self.script.lock().unwrap();
            guard.drain(..).collect()
        };
        for span in script {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if sink.send(span).await.is_err() {
                return Ok(());
            }
        }
        if self.hold_open {
            cancel.cancelled().await;
        }
        Ok(())
    }
}

/// Recognition backend for hosts with no capability at all.
pub struct UnsupportedRecognition;

#[async_trait]
impl RecognitionBackend for UnsupportedRecognition {
    fn supported(&self) -> bool {
        false
    }

    async fn run_stream(
        &self,
        _sink: mpsc::Sender<RecognizedSpeech>,
        _cancel: CancellationToken,
    ) -> Result<(), SpeechError> {
        Err(SpeechError::Unsupported)
    }
}

/// Synthesis backend that records spoken text for later inspection instead of
/// producing audio.
pub struct CapturingSynthesis {
    log: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

/// Shared log returned by [`CapturingSynthesis::new`].
#[derive(Clone)]
pub struct SpokenLog(pub Arc<Mutex<Vec<String>>>);

impl SpokenLog {
    pub fn last(&self) -> Option<String> {
        self.0.lock().ok().and_then(|v| v.last().cloned())
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl CapturingSynthesis {
    pub fn new() -> (Self, SpokenLog) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                log: log.clone(),
                fail: false,
            },
            SpokenLog(log),
        )
    }

    /// Variant whose every utterance faults, for exercising the playback
    /// error path.
    pub fn failing() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        }
    }
}

#[async_trait]
impl SynthesisBackend for CapturingSynthesis {
    async fn synthesize(
        &self,
        text: &str,
        _options: &VoiceOptions,
        cancel: CancellationToken,
    ) -> Result<(), SpeechError> {
        if self.fail {
            return Err(SpeechError::Synthesis("playback fault".to_string()));
        }
        if cancel.is_cancelled() {
            return Ok(());
        }
        if let Ok(mut log) = self.log.lock() {
            log.push(text.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(recognizer: ScriptedRecognition) -> (SpeechGateway, SpokenLog) {
        let (synth, log) = CapturingSynthesis::new();
        (
            SpeechGateway::new(Arc::new(recognizer), Arc::new(synth)),
            log,
        )
    }

    #[tokio::test]
    async fn unsupported_host_is_rejected_up_front() {
        let (synth, _) = CapturingSynthesis::new();
        let gw = SpeechGateway::new(Arc::new(UnsupportedRecognition), Arc::new(synth));
        assert!(matches!(
            gw.start_listening(),
            Err(SpeechError::Unsupported)
        ));
        assert!(!gw.is_currently_listening());
    }

    #[tokio::test]
    async fn overlapping_listen_requests_are_rejected_not_queued() {
        let (gw, _) = gateway(ScriptedRecognition::hold_open(vec![]));
        let mut handle = gw.start_listening().expect("first stream granted");
        assert_eq!(handle.next().await, Some(SpeechEvent::Started));
        assert!(matches!(
            gw.start_listening(),
            Err(SpeechError::AlreadyActive)
        ));

        gw.stop_listening();
        let mut ended = 0;
        while let Some(event) = handle.next().await {
            if event == SpeechEvent::Ended {
                ended += 1;
            }
        }
        assert_eq!(ended, 1, "exactly one Ended per granted stream");
        assert!(!gw.is_currently_listening());
        // Stream closed, gateway is listenable again.
        assert!(gw.start_listening().is_ok());
    }

    #[tokio::test]
    async fn scripted_spans_are_delivered_in_order() {
        let (gw, _) = gateway(ScriptedRecognition::new(vec![
            RecognizedSpeech::Interim("tell".to_string()),
            RecognizedSpeech::Final("tell me more".to_string()),
        ]));
        let mut handle = gw.start_listening().unwrap();
        let mut events = Vec::new();
        while let Some(event) = handle.next().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                SpeechEvent::Started,
                SpeechEvent::Recognized(RecognizedSpeech::Interim("tell".to_string())),
                SpeechEvent::Recognized(RecognizedSpeech::Final("tell me more".to_string())),
                SpeechEvent::Ended,
            ]
        );
    }

    #[tokio::test]
    async fn blank_text_resolves_without_audio() {
        let (gw, log) = gateway(ScriptedRecognition::new(vec![]));
        gw.speak("   ", &VoiceOptions::default()).await.unwrap();
        assert!(log.all().is_empty());
        assert!(!gw.is_currently_speaking());
    }

    #[tokio::test]
    async fn speak_records_text_and_clears_flag() {
        let (gw, log) = gateway(ScriptedRecognition::new(vec![]));
        gw.speak("Hello there", &VoiceOptions::default())
            .await
            .unwrap();
        assert_eq!(log.last().as_deref(), Some("Hello there"));
        assert!(!gw.is_currently_speaking());
    }

    #[tokio::test]
    async fn synthesis_fault_is_surfaced() {
        let gw = SpeechGateway::new(
            Arc::new(ScriptedRecognition::new(vec![])),
            Arc::new(CapturingSynthesis::failing()),
        );
        let err = gw
            .speak("anything", &VoiceOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SpeechError::Synthesis(_)));
    }

    #[tokio::test]
    async fn handle_stop_closes_a_held_open_stream() {
        let (gw, _) = gateway(ScriptedRecognition::hold_open(vec![]));
        let mut handle = gw.start_listening().unwrap();
        assert_eq!(handle.next().await, Some(SpeechEvent::Started));
        handle.stop();
        let mut last = None;
        while let Some(event) = handle.next().await {
            last = Some(event);
        }
        assert_eq!(last, Some(SpeechEvent::Ended));
        assert!(!gw.is_currently_listening());
    }

    #[tokio::test]
    async fn dropped_handle_releases_a_held_open_stream() {
        let (gw, _) = gateway(ScriptedRecognition::hold_open(vec![]));
        let handle = gw.start_listening().unwrap();
        drop(handle);
        while gw.is_currently_listening() {
            tokio::task::yield_now().await;
        }
        // A fresh stream can be granted once the dropped one unwinds.
        assert!(gw.start_listening().is_ok());
    }

    #[tokio::test]
    async fn stop_operations_are_idempotent() {
        let (gw, _) = gateway(ScriptedRecognition::new(vec![]));
        gw.stop_listening();
        gw.stop_listening();
        gw.stop_speaking();
        gw.stop_speaking();
        assert!(!gw.is_currently_listening());
        assert!(!gw.is_currently_speaking());
    }
}
