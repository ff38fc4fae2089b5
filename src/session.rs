use crate::consts::{CONTEXT_WINDOW, END_CALL_GRACE_MILLIS};
use crate::error::AppError;
use crate::generator::{AgentAction, ReplyContext, ReplyGenerator};
use crate::speech::SpeechGateway;
use crate::store::{BackupQueue, CallLogRow, CallLogStore};
use crate::transcript::{Transcript, TranscriptEntry};
use crate::types::{
    CallStatus, CallType, ContactType, EntryType, Recommendation, Speaker, StudentEvaluation,
    VoiceOptions,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Parameters for starting a call, as received on the wire.
#[derive(Deserialize, Clone, Debug)]
pub struct CallRequest {
    pub contact_type: ContactType,
    pub contact_id: String,
    pub contact_name: Option<String>,
    pub call_type: CallType,
    pub resume_summary: Option<String>,
    pub job_summary: Option<String>,
}

/// Full state of one live or just-finished call. Owned by the manager map;
/// callers only ever see clones.
#[derive(Serialize, Clone, Debug)]
pub struct CallSession {
    pub id: Uuid,
    pub contact_type: ContactType,
    pub contact_id: String,
    pub contact_name: String,
    pub call_type: CallType,
    pub status: CallStatus,
    pub transcript: Transcript,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub duration_secs: i64,
    pub notes: String,
    pub jotform_sent: bool,
    pub teams_scheduled: bool,
    pub scheduled_time: Option<String>,
    pub evaluation: Option<StudentEvaluation>,
    pub resume_summary: Option<String>,
    pub job_summary: Option<String>,
}

impl CallSession {
    fn questions_asked(&self) -> usize {
        self.transcript
            .entries()
            .iter()
            .filter(|e| {
                e.speaker == Speaker::Jerry
                    && e.entry_type == EntryType::Speech
                    && e.text.contains('?')
            })
            .count()
    }

    fn reply_context(&self) -> ReplyContext {
        let window = self
            .transcript
            .recent(CONTEXT_WINDOW)
            .iter()
            .filter(|e| e.entry_type == EntryType::Speech)
            .map(|e| (e.speaker, e.text.clone()))
            .collect();
        ReplyContext {
            contact_type: self.contact_type,
            contact_name: self.contact_name.clone(),
            call_type: self.call_type,
            window,
            questions_asked: self.questions_asked(),
            resume_summary: self.resume_summary.clone(),
            job_summary: self.job_summary.clone(),
        }
    }

    fn to_row(&self) -> CallLogRow {
        let transcript = serde_json::to_value(self.transcript.entries())
            .unwrap_or_else(|_| serde_json::Value::Array(Vec::new()));
        CallLogRow {
            id: self.id,
            student_id: (self.contact_type == ContactType::Student)
                .then(|| self.contact_id.clone()),
            tpo_id: (self.contact_type == ContactType::Tpo).then(|| self.contact_id.clone()),
            contact_type: self.contact_type.as_str().to_string(),
            duration_secs: self.duration_secs,
            status: self.status.as_str().to_string(),
            notes: self.notes.clone(),
            transcript,
            jotform_sent: self.jotform_sent,
            teams_scheduled: self.teams_scheduled,
            completed_at: self.end_time,
            created_at: self.start_time,
        }
    }
}

/// Result of one utterance exchange: the transcript entries the turn
/// appended, plus the finalized session when a detected action ended the
/// call. The connection loop needs the latter to emit the ended lifecycle
/// frame; the post-disconnect `end_call` would find the session already
/// evicted.
#[derive(Default, Debug)]
pub struct TurnOutcome {
    pub entries: Vec<TranscriptEntry>,
    pub ended: Option<CallSession>,
}

/// Owns all live sessions and drives each call through its lifecycle:
/// initiate, exchange utterances, dispatch actions, end, persist. All session
/// state lives behind one mutex keyed by session id; the lock is never held
/// across an await.
pub struct CallSessionManager {
    sessions: Mutex<HashMap<Uuid, CallSession>>,
    generator: Arc<dyn ReplyGenerator>,
    store: Arc<dyn CallLogStore>,
    backup: BackupQueue,
    voice: VoiceOptions,
}

impl CallSessionManager {
    pub fn new(
        generator: Arc<dyn ReplyGenerator>,
        store: Arc<dyn CallLogStore>,
        backup: BackupQueue,
        voice: VoiceOptions,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            generator,
            store,
            backup,
            voice,
        }
    }

    /// Create a session and speak the canned opener. The opener is in the
    /// returned snapshot's transcript before any audio plays, so the session
    /// is observable immediately. Playback failure never fails the call.
    pub async fn initiate_call(
        &self,
        request: CallRequest,
        gateway: &SpeechGateway,
    ) -> CallSession {
        let contact_name = request.contact_name.unwrap_or_else(|| {
            match request.contact_type {
                ContactType::Student => "Unknown Student",
                ContactType::Tpo => "TPO Contact",
            }
            .to_string()
        });
        let opener = self
            .generator
            .opening_line(request.contact_type, request.call_type);

        let mut session = CallSession {
            id: Uuid::new_v4(),
            contact_type: request.contact_type,
            contact_id: request.contact_id,
            contact_name,
            call_type: request.call_type,
            status: CallStatus::Active,
            transcript: Transcript::new(),
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            duration_secs: 0,
            notes: String::new(),
            jotform_sent: false,
            teams_scheduled: false,
            scheduled_time: None,
            evaluation: None,
            resume_summary: request.resume_summary,
            job_summary: request.job_summary,
        };
        session
            .transcript
            .append(Speaker::Jerry, opener, EntryType::Speech);

        let snapshot = session.clone();
        info!(session_id=%snapshot.id, contact_type=?snapshot.contact_type, call_type=?snapshot.call_type, "call initiated");
        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(session.id, session);
        }

        if let Err(e) = gateway.speak(opener, &self.voice).await {
            error!(error=%e, session_id=%snapshot.id, "failed to speak opening line");
        }
        snapshot
    }

    /// Handle one final recognized utterance: record it, generate and speak
    /// the reply, run any detected action. The outcome carries every
    /// transcript entry the exchange appended and, when the action ended the
    /// call, the finalized session. Unknown or already-ended sessions drop
    /// the utterance silently.
    pub async fn process_utterance(
        &self,
        session_id: Uuid,
        utterance: &str,
        gateway: &SpeechGateway,
    ) -> TurnOutcome {
        let (contact_entry, context) = {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(&session_id) else {
                debug!(%session_id, "utterance for unknown session dropped");
                return TurnOutcome::default();
            };
            if session.status.is_terminal() {
                debug!(%session_id, "utterance after call end dropped");
                return TurnOutcome::default();
            }
            let entry = session
                .transcript
                .append(Speaker::Contact, utterance, EntryType::Speech);
            (entry, session.reply_context())
        };

        let reply = self.generator.generate_reply(utterance, &context).await;

        let jerry_entry = {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(&session_id) else {
                return TurnOutcome {
                    entries: vec![contact_entry],
                    ended: None,
                };
            };
            if session.status.is_terminal() {
                return TurnOutcome {
                    entries: vec![contact_entry],
                    ended: None,
                };
            }
            session
                .transcript
                .append(Speaker::Jerry, &reply.text, EntryType::Speech)
        };

        if let Err(e) = gateway.speak(&reply.text, &self.voice).await {
            error!(error=%e, %session_id, "failed to speak reply");
        }

        let mut outcome = TurnOutcome {
            entries: vec![contact_entry, jerry_entry],
            ended: None,
        };
        if let Some(action) = reply.action {
            let action_outcome = self.execute_action(session_id, action, gateway).await;
            outcome.entries.extend(action_outcome.entries);
            outcome.ended = action_outcome.ended;
        }
        outcome
    }

    /// Dispatch one detected action. Flag-setting actions are idempotent:
    /// repeats append a transcript note but never re-fire the side effect.
    async fn execute_action(
        &self,
        session_id: Uuid,
        action: AgentAction,
        gateway: &SpeechGateway,
    ) -> TurnOutcome {
        debug!(%session_id, ?action, "executing call action");
        match action {
            AgentAction::SendJotform => {
                let (entry, first_send, snapshot) = {
                    let mut sessions = self.sessions.lock().unwrap();
                    let Some(session) = sessions.get_mut(&session_id) else {
                        return TurnOutcome::default();
                    };
                    let first_send = !session.jotform_sent;
                    session.jotform_sent = true;
                    let entry = session.transcript.append(
                        Speaker::Jerry,
                        "JotForm link sent to contact via email and SMS",
                        EntryType::Action,
                    );
                    (entry, first_send, session.clone())
                };
                // Interim persist so the sent flag survives a crash before
                // call end.
                if first_send {
                    self.persist_row(&snapshot).await;
                }
                TurnOutcome {
                    entries: vec![entry],
                    ended: None,
                }
            }
            AgentAction::ScheduleTeamsMeeting { scheduled_time } => {
                let mut sessions = self.sessions.lock().unwrap();
                let Some(session) = sessions.get_mut(&session_id) else {
                    return TurnOutcome::default();
                };
                session.teams_scheduled = true;
                session.scheduled_time = Some(scheduled_time.clone());
                let entry = session.transcript.append(
                    Speaker::Jerry,
                    format!("Microsoft Teams interview scheduled for {scheduled_time}"),
                    EntryType::Action,
                );
                TurnOutcome {
                    entries: vec![entry],
                    ended: None,
                }
            }
            AgentAction::ConductEvaluation => {
                let built = {
                    let mut sessions = self.sessions.lock().unwrap();
                    let Some(session) = sessions.get_mut(&session_id) else {
                        return TurnOutcome::default();
                    };
                    let eligible = session.contact_type == ContactType::Student
                        && session.call_type == CallType::TelephonicInterview;
                    if !eligible || session.evaluation.is_some() {
                        return TurnOutcome::default();
                    }
                    let evaluation = build_evaluation(session);
                    session.evaluation = Some(evaluation.clone());
                    let entry = session.transcript.append(
                        Speaker::Jerry,
                        format!(
                            "Interview evaluation recorded: overall {:.1}, {:?}",
                            evaluation.overall_score, evaluation.recommendation
                        ),
                        EntryType::Evaluation,
                    );
                    (entry, session.contact_id.clone(), evaluation)
                };
                let (entry, student_id, evaluation) = built;
                if let Err(e) = self
                    .store
                    .update_student_evaluation(&student_id, &evaluation)
                    .await
                {
                    error!(error=%e, %session_id, "failed to persist student evaluation");
                }
                TurnOutcome {
                    entries: vec![entry],
                    ended: None,
                }
            }
            AgentAction::RequestEmail => {
                let mut sessions = self.sessions.lock().unwrap();
                let Some(session) = sessions.get_mut(&session_id) else {
                    return TurnOutcome::default();
                };
                let entry = session.transcript.append(
                    Speaker::Jerry,
                    "Email address requested from contact",
                    EntryType::Action,
                );
                TurnOutcome {
                    entries: vec![entry],
                    ended: None,
                }
            }
            AgentAction::EndCall => {
                // Let the farewell finish playing before tearing down.
                tokio::time::sleep(std::time::Duration::from_millis(END_CALL_GRACE_MILLIS)).await;
                let Some(ended) = self.end_call(session_id, gateway).await else {
                    return TurnOutcome::default();
                };
                // Include the closing entry so the client transcript shows
                // how the call ended.
                let entries = ended.transcript.entries().last().cloned().into_iter().collect();
                TurnOutcome {
                    entries,
                    ended: Some(ended),
                }
            }
        }
    }

    /// Finish a call: finalize fields, stop audio, persist, then evict. The
    /// record is durable (primary store or backup queue) before the session
    /// leaves the map. Idempotent; only the first caller gets the snapshot.
    pub async fn end_call(
        &self,
        session_id: Uuid,
        gateway: &SpeechGateway,
    ) -> Option<CallSession> {
        let snapshot = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.get_mut(&session_id)?;
            if session.status.is_terminal() {
                return None;
            }
            let now = OffsetDateTime::now_utc();
            session.end_time = Some(now);
            session.duration_secs = (now - session.start_time).whole_seconds().max(0);
            session.status = CallStatus::Completed;
            session.notes = format!(
                "{} call with {}; {} transcript entries",
                session.call_type.label(),
                session.contact_name,
                session.transcript.len(),
            );
            session.transcript.append(
                Speaker::Jerry,
                format!("Call ended. Duration: {} seconds", session.duration_secs),
                EntryType::Action,
            );
            session.clone()
        };

        gateway.stop_listening();
        gateway.stop_speaking();

        self.persist_row(&snapshot).await;

        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.remove(&session_id);
        }
        info!(%session_id, duration_secs = snapshot.duration_secs, "call ended");
        Some(snapshot)
    }

    /// Write one call record, falling back to the local backup queue when the
    /// primary store rejects it.
    async fn persist_row(&self, session: &CallSession) {
        let row = session.to_row();
        if let Err(e) = self.store.upsert_call_log(&row).await {
            warn!(error=%e, call_id=%row.id, "primary store rejected call log; queueing backup");
            if let Err(e) = self.backup.push(&row).await {
                error!(error=%e, call_id=%row.id, "backup queue write failed; record lost");
            }
        }
    }

    /// Replay queued call logs into the primary store. Each entry leaves the
    /// queue only after its own write is confirmed; entries that still fail
    /// stay queued for the next sweep. Returns how many were replayed.
    pub async fn retry_failed_saves(&self) -> Result<usize, AppError> {
        let pending = self.backup.load().await?;
        let mut replayed = 0;
        for row in pending {
            match self.store.upsert_call_log(&row).await {
                Ok(()) => {
                    if let Err(e) = self.backup.remove(row.id).await {
                        error!(error=%e, call_id=%row.id, "failed to dequeue replayed call log");
                    } else {
                        replayed += 1;
                    }
                }
                Err(e) => {
                    warn!(error=%e, call_id=%row.id, "call log replay failed; keeping queued");
                }
            }
        }
        info!(replayed, "backup queue sweep finished");
        Ok(replayed)
    }

    pub async fn list_call_logs(&self) -> Vec<CallLogRow> {
        match self.store.list_call_logs().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error=%e, "failed to list call logs");
                Vec::new()
            }
        }
    }

    /// Note a recognition fault in the transcript so the audit trail shows
    /// why a stretch of the call has no contact utterances.
    pub fn record_recognition_fault(&self, session_id: Uuid, reason: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(&session_id) {
            if !session.status.is_terminal() {
                session.transcript.append(
                    Speaker::Jerry,
                    format!("Speech recognition fault: {reason}"),
                    EntryType::Action,
                );
            }
        }
    }

    pub fn get_session(&self, session_id: Uuid) -> Option<CallSession> {
        self.sessions.lock().unwrap().get(&session_id).cloned()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

/// Deterministic interview score derived from transcript shape. A richer
/// rubric would ask the generator to grade answers; scoring from response
/// count keeps the evaluation reproducible for the same transcript.
fn build_evaluation(session: &CallSession) -> StudentEvaluation {
    let responses = session
        .transcript
        .entries()
        .iter()
        .filter(|e| e.speaker == Speaker::Contact && e.entry_type == EntryType::Speech)
        .count();

    let communication = (6.0 + responses as f32 * 0.5).min(9.0);
    let technical_skills = (communication + 0.5).min(9.5);
    let problem_solving = (communication - 0.5).max(5.0);
    let overall_score = (technical_skills + communication + problem_solving) / 3.0;

    let recommendation = if overall_score >= 8.5 {
        Recommendation::StronglyRecommend
    } else if overall_score >= 7.0 {
        Recommendation::Recommend
    } else if overall_score >= 5.0 {
        Recommendation::Consider
    } else {
        Recommendation::NotRecommend
    };

    StudentEvaluation {
        technical_skills,
        communication,
        problem_solving,
        overall_score,
        strengths: vec![
            "Engaged throughout the interview".to_string(),
            "Communicates clearly over the phone".to_string(),
        ],
        weaknesses: vec!["Depth of answers varies across topics".to_string()],
        opportunities: vec!["Would benefit from hands-on industrial project exposure".to_string()],
        threats: vec!["Competing offers from other internship programs".to_string()],
        recommendation,
    }
}
