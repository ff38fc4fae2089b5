pub mod error;
pub mod generator;
pub mod gemini_types;
pub mod handlers;
pub mod session;
pub mod speech;
pub mod store;
pub mod stt;
pub mod tasks;
pub mod transcript;
pub mod tts;
pub mod types;
pub mod utils;
pub mod wire;

pub mod consts {
    /// Transcript entries included in the generation context window.
    pub const CONTEXT_WINDOW: usize = 6;
    /// Interview questions asked before an evaluation fires.
    pub const INTERVIEW_QUESTION_TARGET: usize = 5;
    /// Pause after a farewell reply before the call is torn down.
    pub const END_CALL_GRACE_MILLIS: u64 = 2_000;
    /// Synthesized audio chunk size on the playback channel.
    pub const TTS_CHUNK_BYTES: usize = 4_096;
    /// Ceiling on one remote generation round trip.
    pub const GENERATION_TIMEOUT_SECS: u64 = 10;
}
