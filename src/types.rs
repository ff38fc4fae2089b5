use crate::session::CallSessionManager;
use crate::stt::SttConfig;
use crate::tts::TtsConfig;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The human party on a call: a student applicant or a training/placement
/// officer (TPO).
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum ContactType {
    Student,
    Tpo,
}

impl ContactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::Student => "student",
            ContactType::Tpo => "tpo",
        }
    }
}

/// Fixes which opening line and prompt template the response generator uses.
/// Set once at session creation, never changed.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Introduction,
    TelephonicInterview,
    TeamsScheduling,
    TpoOutreach,
}

impl CallType {
    pub fn label(&self) -> &'static str {
        match self {
            CallType::Introduction => "introduction",
            CallType::TelephonicInterview => "telephonic interview",
            CallType::TeamsScheduling => "Teams scheduling",
            CallType::TpoOutreach => "TPO outreach",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Active,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Active => "active",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::Active)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Contact,
    Jerry,
}

/// Classifies a transcript entry as a spoken line, a system-action record or
/// an evaluation summary.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Speech,
    Action,
    Evaluation,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    StronglyRecommend,
    Recommend,
    Consider,
    NotRecommend,
}

/// Structured interview score record. Attached to a session at most once and
/// immutable thereafter; persisted onward to the student's record exactly
/// once.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct StudentEvaluation {
    pub technical_skills: f32,
    pub communication: f32,
    pub problem_solving: f32,
    pub overall_score: f32,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub opportunities: Vec<String>,
    pub threats: Vec<String>,
    pub recommendation: Recommendation,
}

/// Parameters for one synthesized utterance.
#[derive(Serialize, Clone, Debug)]
pub struct VoiceOptions {
    pub voice: Option<String>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            voice: None,
            rate: 0.9,
            pitch: 1.0,
            volume: 0.8,
        }
    }
}

pub struct AppState {
    pub manager: Arc<CallSessionManager>,
    pub http_client: reqwest::Client,
    pub stt: SttConfig,
    pub tts: TtsConfig,
}
