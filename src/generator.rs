use crate::consts::{CONTEXT_WINDOW, GENERATION_TIMEOUT_SECS, INTERVIEW_QUESTION_TARGET};
use crate::error::AppError;
use crate::gemini_types::{
    Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part,
};
use crate::types::{CallType, ContactType, Speaker};

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error};

const REMOTE_CONFIDENCE: f32 = 0.9;
const FALLBACK_CONFIDENCE: f32 = 0.8;
const DEFAULT_FALLBACK_CONFIDENCE: f32 = 0.6;

/// Structured intent detected in a generated reply. Triggers a side effect in
/// the session manager.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AgentAction {
    SendJotform,
    ScheduleTeamsMeeting { scheduled_time: String },
    ConductEvaluation,
    RequestEmail,
    EndCall,
}

#[derive(Clone, PartialEq, Debug)]
pub struct GeneratedReply {
    pub text: String,
    pub action: Option<AgentAction>,
    /// Coarse observability score: remote success vs. canned fallback. Never
    /// used for control flow.
    pub confidence: f32,
}

/// Everything the generator may see about one session. `window` is the
/// bounded tail of the transcript, never the full history.
#[derive(Clone, Debug)]
pub struct ReplyContext {
    pub contact_type: ContactType,
    pub contact_name: String,
    pub call_type: CallType,
    pub window: Vec<(Speaker, String)>,
    pub questions_asked: usize,
    pub resume_summary: Option<String>,
    pub job_summary: Option<String>,
}

/// Turns one recognized utterance plus session context into a spoken reply
/// and an optional action. `generate_reply` is infallible by contract: remote
/// failure always degrades to the canned-reply table, never to an error.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Deterministic canned opener, chosen purely from the
    /// (contact type, call type) pair so the agent always speaks first
    /// without waiting on network latency.
    fn opening_line(&self, contact_type: ContactType, call_type: CallType) -> &'static str {
        opening_line(contact_type, call_type)
    }

    async fn generate_reply(&self, utterance: &str, context: &ReplyContext) -> GeneratedReply;
}

#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

pub struct GeminiGenerator {
    http_client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiGenerator {
    pub fn new(http_client: reqwest::Client, config: GeminiConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    async fn call_remote(&self, utterance: &str, context: &ReplyContext) -> Result<String, AppError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model,
            self.config.api_key,
        );
        let payload = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: build_prompt(utterance, context),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
                top_p: 0.8,
                top_k: 10,
            },
        };
        let resp = self
            .http_client
            .post(url)
            .timeout(Duration::from_secs(GENERATION_TIMEOUT_SECS))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to text-generation endpoint");
                AppError("text generation request failed")
            })?;
        let resp = resp.error_for_status().map_err(|e| {
            error!(error=%e, "text-generation endpoint returned error status");
            AppError("text generation bad status")
        })?;
        let body = resp.json::<GenerateContentResponse>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize text-generation response");
            AppError("text generation deserialize error")
        })?;
        let text = body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(AppError("no candidate text generated"));
        }
        Ok(text)
    }
}

#[async_trait]
impl ReplyGenerator for GeminiGenerator {
    async fn generate_reply(&self, utterance: &str, context: &ReplyContext) -> GeneratedReply {
        match self.call_remote(utterance, context).await {
            Ok(raw) => {
                let text = clean_reply(&raw);
                if text.is_empty() {
                    return fallback_reply(context);
                }
                let action = detect_action(&text, utterance, context);
                debug!(action=?action, "generated reply");
                GeneratedReply {
                    text,
                    action,
                    confidence: REMOTE_CONFIDENCE,
                }
            }
            Err(e) => {
                error!(error=%e, "text generation unavailable; using canned reply");
                fallback_reply(context)
            }
        }
    }
}

pub fn opening_line(contact_type: ContactType, call_type: CallType) -> &'static str {
    match (contact_type, call_type) {
        (ContactType::Tpo, _) => {
            "Good day. This is Jerry calling from Solar Industries India Ltd. \
             I would like to discuss internship opportunities for your students. \
             Do you have a moment?"
        }
        (ContactType::Student, CallType::Introduction) => {
            "Hello, this is Jerry from Solar Industries India Ltd. I'm calling about \
             an internship opportunity that matches your background. Is this a good \
             time to talk?"
        }
        (ContactType::Student, CallType::TelephonicInterview) => {
            "Hello, this is Jerry from Solar Industries India Ltd. Thank you for your \
             interest in our internship program. I'd like to ask you a few questions \
             about your background and experience. Shall we begin?"
        }
        (ContactType::Student, CallType::TeamsScheduling) => {
            "Hello, this is Jerry from Solar Industries India Ltd. Congratulations on \
             clearing the telephonic round! I'm calling to schedule your Microsoft \
             Teams interview. Which day works best for you?"
        }
        (ContactType::Student, CallType::TpoOutreach) => {
            "Hello, this is Jerry calling from Solar Industries India Ltd about our \
             internship program. How can I help you today?"
        }
    }
}

fn build_prompt(utterance: &str, context: &ReplyContext) -> String {
    let mut prompt = system_prompt(context);
    prompt.push_str("\n\nCONVERSATION SO FAR:\n");
    for (speaker, text) in context.window.iter().rev().take(CONTEXT_WINDOW).rev() {
        let who = match speaker {
            Speaker::Jerry => "Jerry",
            Speaker::Contact => context.contact_name.as_str(),
        };
        prompt.push_str(who);
        prompt.push_str(": ");
        prompt.push_str(text);
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\n{}: {utterance}\n\nProvide Jerry's professional reply:",
        context.contact_name
    ));
    prompt
}

fn system_prompt(context: &ReplyContext) -> String {
    let base = format!(
        "You are Jerry, a professional assistant from Solar Industries India Ltd, \
         conducting a {} call with {} ({}).\nSolar Industries India Ltd is a leading \
         manufacturer of industrial explosives and propellants and offers internship \
         opportunities for students.",
        context.call_type.label(),
        context.contact_name,
        context.contact_type.as_str(),
    );

    if context.contact_type == ContactType::Tpo {
        return format!(
            "{base}\n\nTPO CALL GUIDELINES:\n\
             1. Introduce Solar Industries India Ltd professionally.\n\
             2. Request the TPO to distribute the JotForm link to eligible students.\n\
             3. If no email address is on file, ask respectfully for one.\n\
             4. Maintain utmost respect; keep replies to two or three sentences.\n\
             5. Confirm they will distribute the form and ask about the timeline."
        );
    }

    match context.call_type {
        CallType::Introduction => format!(
            "{base}\n\nSTUDENT INTRODUCTION CALL:\n\
             1. Introduce the internship opportunity tailored to their background.\n\
             2. Address questions and concerns, and gauge interest.\n\
             3. Friendly but professional; keep replies under thirty words for voice delivery."
        ),
        CallType::TelephonicInterview => {
            let mut prompt = format!(
                "{base}\n\nTELEPHONIC INTERVIEW GUIDELINES:\n\
                 1. Ask one question at a time, grounded in the candidate's resume.\n\
                 2. Evaluate technical skills, communication and problem solving.\n\
                 3. Reference specific projects and align questions with the job requirements.\n\
                 4. Provide encouraging feedback and keep questions concise."
            );
            if let Some(resume) = &context.resume_summary {
                prompt.push_str("\n\nCANDIDATE RESUME SUMMARY:\n");
                prompt.push_str(resume);
            }
            if let Some(job) = &context.job_summary {
                prompt.push_str("\n\nJOB REQUIREMENTS:\n");
                prompt.push_str(job);
            }
            prompt
        }
        CallType::TeamsScheduling => format!(
            "{base}\n\nTEAMS INTERVIEW SCHEDULING:\n\
             1. Congratulate the candidate on the telephonic round.\n\
             2. Propose Microsoft Teams slots, check availability, confirm details.\n\
             3. Congratulatory, positive, flexible with rescheduling."
        ),
        CallType::TpoOutreach => format!(
            "{base}\n\nGENERAL GUIDELINES:\n\
             Be helpful and professional, provide accurate information and maintain \
             Solar Industries' reputation."
        ),
    }
}

/// Strip markup the TTS voice would read aloud: bold/italic markers, heading
/// hashes, runs of blank lines.
pub fn clean_reply(raw: &str) -> String {
    let unstyled = raw.replace("**", "").replace('*', "");
    let mut pieces: Vec<&str> = Vec::new();
    for line in unstyled.lines() {
        let line = line.trim_start_matches('#').trim();
        if !line.is_empty() {
            pieces.push(line);
        }
    }
    pieces.join(" ")
}

/// Best-effort keyword classifier over the cleaned reply. False negatives and
/// false positives are both possible and acceptable; this is a signal, not a
/// contract.
pub fn detect_action(text: &str, utterance: &str, context: &ReplyContext) -> Option<AgentAction> {
    let lower = text.to_lowercase();
    let lower_input = utterance.to_lowercase();

    let mut action = match context.contact_type {
        ContactType::Tpo => {
            if lower.contains("send") && (lower.contains("form") || lower.contains("jotform")) {
                Some(AgentAction::SendJotform)
            } else if lower_input.contains("email") && lower.contains("provide") {
                Some(AgentAction::RequestEmail)
            } else {
                None
            }
        }
        ContactType::Student => match context.call_type {
            CallType::TelephonicInterview => {
                if context.questions_asked >= INTERVIEW_QUESTION_TARGET {
                    Some(AgentAction::ConductEvaluation)
                } else {
                    None
                }
            }
            CallType::TeamsScheduling => {
                if lower.contains("schedule") || lower.contains("meeting") {
                    Some(AgentAction::ScheduleTeamsMeeting {
                        scheduled_time: extract_schedule_time(text),
                    })
                } else {
                    None
                }
            }
            _ => None,
        },
    };

    if lower.contains("goodbye")
        || lower.contains("thank you for your time")
        || contains_word(&lower, "end")
    {
        action = Some(AgentAction::EndCall);
    }

    action
}

/// Whole-word match so "end" never fires on "send" or "recommend".
fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == word)
}

/// Pull a proposed meeting time out of free text: `h:mm` clocks or an
/// `N am/pm` pair. Falls back to a placeholder; the acceptable input formats
/// are implementation-defined.
pub fn extract_schedule_time(text: &str) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    for (i, token) in tokens.iter().enumerate() {
        let trimmed = token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != ':');
        if looks_like_clock(trimmed) {
            return trimmed.to_string();
        }
        let lower = trimmed.to_lowercase();
        if (lower == "am" || lower == "pm") && i > 0 {
            let prev = tokens[i - 1].trim_matches(|c: char| !c.is_ascii_digit() && c != ':');
            if !prev.is_empty() && prev.chars().all(|c| c.is_ascii_digit() || c == ':') {
                return format!("{prev} {lower}");
            }
        }
        if lower.len() > 2 && (lower.ends_with("am") || lower.ends_with("pm")) {
            let (number, suffix) = lower.split_at(lower.len() - 2);
            if number.chars().all(|c| c.is_ascii_digit() || c == ':') {
                return format!("{number} {suffix}");
            }
        }
    }
    "proposed time".to_string()
}

fn looks_like_clock(token: &str) -> bool {
    let Some((hours, minutes)) = token.split_once(':') else {
        return false;
    };
    (1..=2).contains(&hours.len())
        && hours.chars().all(|c| c.is_ascii_digit())
        && minutes.len() == 2
        && minutes.chars().all(|c| c.is_ascii_digit())
}

/// Deterministic canned replies keyed by (contact type, call type), with the
/// matching action attached explicitly. The session must never stall because
/// the remote service is unavailable.
pub fn fallback_reply(context: &ReplyContext) -> GeneratedReply {
    match (context.contact_type, context.call_type) {
        (ContactType::Tpo, _) => GeneratedReply {
            text: "I appreciate you taking my call. Solar Industries India Ltd offers \
                   internships your students may value, and I will send the JotForm \
                   link so you can share it with eligible students."
                .to_string(),
            action: Some(AgentAction::SendJotform),
            confidence: FALLBACK_CONFIDENCE,
        },
        (ContactType::Student, CallType::Introduction) => GeneratedReply {
            text: "I'm excited to tell you about this internship opportunity at Solar \
                   Industries India Ltd. It's a great chance to gain industry \
                   experience. What interests you most about internships?"
                .to_string(),
            action: None,
            confidence: FALLBACK_CONFIDENCE,
        },
        (ContactType::Student, CallType::TelephonicInterview) => {
            let action = if context.questions_asked >= INTERVIEW_QUESTION_TARGET {
                Some(AgentAction::ConductEvaluation)
            } else {
                None
            };
            GeneratedReply {
                text: "Thanks for that answer. Could you walk me through a project \
                       you have worked on that you are particularly proud of?"
                    .to_string(),
                action,
                confidence: FALLBACK_CONFIDENCE,
            }
        }
        (ContactType::Student, CallType::TeamsScheduling) => GeneratedReply {
            text: "Great! Let me check our available slots for the Microsoft Teams \
                   interview. Are you available this week for a forty-five minute \
                   session?"
                .to_string(),
            action: Some(AgentAction::ScheduleTeamsMeeting {
                scheduled_time: "proposed time".to_string(),
            }),
            confidence: FALLBACK_CONFIDENCE,
        },
        (ContactType::Student, CallType::TpoOutreach) => GeneratedReply {
            text: "I understand. How can I assist you further with your internship \
                   application at Solar Industries India Ltd?"
                .to_string(),
            action: None,
            confidence: DEFAULT_FALLBACK_CONFIDENCE,
        },
    }
}
