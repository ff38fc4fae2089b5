use async_trait::async_trait;
use jerry_calls::generator::{
    AgentAction, GeminiConfig, GeminiGenerator, GeneratedReply, ReplyContext, ReplyGenerator,
};
use jerry_calls::session::{CallRequest, CallSessionManager};
use jerry_calls::speech::{
    CapturingSynthesis, RecognizedSpeech, ScriptedRecognition, SpeechGateway,
};
use jerry_calls::store::{BackupQueue, MemoryCallStore};
use jerry_calls::tasks::run_voice_interaction;
use jerry_calls::types::{CallType, ContactType, VoiceOptions};
use jerry_calls::wire::ServerMessage;

use std::sync::Arc;
use tokio::sync::mpsc;

/// Generator wired to an address nothing listens on, so every reply comes
/// from the deterministic canned table.
fn offline_generator() -> GeminiGenerator {
    GeminiGenerator::new(
        reqwest::Client::new(),
        GeminiConfig {
            api_key: "unused".to_string(),
            model: "gemini-2.0-flash-exp".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            temperature: 0.7,
            max_output_tokens: 256,
        },
    )
}

fn manager(store: Arc<MemoryCallStore>, dir: &tempfile::TempDir) -> CallSessionManager {
    CallSessionManager::new(
        Arc::new(offline_generator()),
        store,
        BackupQueue::new(dir.path().join("pending.jsonl")),
        VoiceOptions::default(),
    )
}

fn tpo_request() -> CallRequest {
    CallRequest {
        contact_type: ContactType::Tpo,
        contact_id: "tpo-9".to_string(),
        contact_name: Some("Dr. Mehta".to_string()),
        call_type: CallType::TpoOutreach,
        resume_summary: None,
        job_summary: None,
    }
}

#[tokio::test]
async fn tpo_call_runs_end_to_end_without_the_remote_service() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCallStore::new());
    let mgr = manager(store.clone(), &dir);
    let (synth, spoken) = CapturingSynthesis::new();
    let gateway = SpeechGateway::new(
        Arc::new(ScriptedRecognition::hold_open(vec![])),
        Arc::new(synth),
    );

    let started = mgr.initiate_call(tpo_request(), &gateway).await;
    let id = started.id;
    assert_eq!(started.transcript.len(), 1);
    assert!(started.transcript.entries()[0].text.contains("Solar Industries"));
    assert_eq!(spoken.all().len(), 1);

    // Remote generation is unreachable, so the canned TPO reply fires and
    // carries the JotForm action.
    let outcome = mgr
        .process_utterance(id, "tell me about the program", &gateway)
        .await;
    assert_eq!(outcome.entries.len(), 3);
    let session = mgr.get_session(id).unwrap();
    assert!(session.jotform_sent);

    let ended = mgr.end_call(id, &gateway).await.unwrap();
    assert_eq!(ended.status.as_str(), "completed");
    assert!(mgr.get_session(id).is_none());

    let rows = store.rows();
    // One interim persist for the JotForm send plus the final record, same id.
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].status, "completed");
    assert!(rows[0].jotform_sent);
    assert_eq!(rows[0].tpo_id.as_deref(), Some("tpo-9"));
}

#[tokio::test]
async fn voice_interaction_processes_finals_and_forwards_transcripts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCallStore::new());
    let mgr = manager(store, &dir);
    let (synth, _spoken) = CapturingSynthesis::new();
    let gateway = SpeechGateway::new(
        Arc::new(ScriptedRecognition::new(vec![
            RecognizedSpeech::Interim("tell me".to_string()),
            RecognizedSpeech::Final("tell me about the internship".to_string()),
        ])),
        Arc::new(synth),
    );

    let mut request = tpo_request();
    request.contact_type = ContactType::Student;
    request.contact_id = "stu-3".to_string();
    request.call_type = CallType::Introduction;
    let id = mgr.initiate_call(request, &gateway).await.id;

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(16);
    run_voice_interaction(&mgr, &gateway, id, outbound_tx)
        .await
        .unwrap();

    // The interim hypothesis produced no transcript traffic; the final
    // produced the contact line and the reply.
    let mut transcripts = Vec::new();
    while let Ok(msg) = outbound_rx.try_recv() {
        if let ServerMessage::Transcript { entry } = msg {
            transcripts.push(entry);
        }
    }
    assert_eq!(transcripts.len(), 2);
    assert_eq!(transcripts[0].text, "tell me about the internship");

    let session = mgr.get_session(id).unwrap();
    assert_eq!(session.transcript.len(), 3);
}

/// Generator whose every reply is a farewell carrying the end-call action.
struct FarewellGenerator;

#[async_trait]
impl ReplyGenerator for FarewellGenerator {
    async fn generate_reply(&self, _utterance: &str, _context: &ReplyContext) -> GeneratedReply {
        GeneratedReply {
            text: "Thank you for your time. Goodbye!".to_string(),
            action: Some(AgentAction::EndCall),
            confidence: 0.9,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn agent_ended_call_still_delivers_the_ended_frame() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCallStore::new());
    let mgr = CallSessionManager::new(
        Arc::new(FarewellGenerator),
        store.clone(),
        BackupQueue::new(dir.path().join("pending.jsonl")),
        VoiceOptions::default(),
    );
    let (synth, _) = CapturingSynthesis::new();
    let gateway = SpeechGateway::new(
        Arc::new(ScriptedRecognition::new(vec![RecognizedSpeech::Final(
            "that's everything, thanks".to_string(),
        )])),
        Arc::new(synth),
    );

    let id = mgr.initiate_call(tpo_request(), &gateway).await.id;
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(16);
    run_voice_interaction(&mgr, &gateway, id, outbound_tx)
        .await
        .unwrap();

    // The action evicted the session, so a follow-up end_call has nothing
    // left to report.
    assert!(mgr.get_session(id).is_none());
    assert!(mgr.end_call(id, &gateway).await.is_none());

    let mut saw_closing_entry = false;
    let mut saw_ended_frame = false;
    while let Ok(msg) = outbound_rx.try_recv() {
        match msg {
            ServerMessage::Transcript { entry } => {
                saw_closing_entry |= entry.text.starts_with("Call ended.");
            }
            ServerMessage::Ended { session_id, .. } => {
                assert_eq!(session_id, id);
                saw_ended_frame = true;
            }
            _ => {}
        }
    }
    assert!(saw_closing_entry);
    assert!(saw_ended_frame);
    assert_eq!(store.rows().len(), 1);
    assert_eq!(store.rows()[0].status, "completed");
}

#[tokio::test]
async fn failed_saves_replay_through_the_retry_endpoint_path() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCallStore::new());
    store.set_fail_writes(true);
    let mgr = manager(store.clone(), &dir);
    let (synth, _) = CapturingSynthesis::new();
    let gateway = SpeechGateway::new(
        Arc::new(ScriptedRecognition::hold_open(vec![])),
        Arc::new(synth),
    );

    let id = mgr.initiate_call(tpo_request(), &gateway).await.id;
    mgr.end_call(id, &gateway).await.unwrap();
    assert!(store.rows().is_empty());
    assert!(mgr.list_call_logs().await.is_empty());

    store.set_fail_writes(false);
    assert_eq!(mgr.retry_failed_saves().await.unwrap(), 1);
    let rows = mgr.list_call_logs().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
}
