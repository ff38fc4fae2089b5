use crate::types::{EntryType, Speaker};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// One atomic recorded utterance or system action within a session. Never
/// edited after append.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct TranscriptEntry {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub speaker: Speaker,
    pub text: String,
    pub entry_type: EntryType,
}

/// Append-only log of utterances for one call session. Insertion order is
/// chronological order; the entries vector is private so no caller can mutate
/// or remove what has been appended. The transcript is the audit trail of the
/// call.
#[derive(Serialize, Deserialize, Clone, Default, Debug)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always succeeds: assigns a fresh id and current timestamp and pushes
    /// to the end. No size bound is enforced beyond session duration.
    pub fn append(
        &mut self,
        speaker: Speaker,
        text: impl Into<String>,
        entry_type: EntryType,
    ) -> TranscriptEntry {
        let entry = TranscriptEntry {
            id: Uuid::new_v4(),
            timestamp: OffsetDateTime::now_utc(),
            speaker,
            text: text.into(),
            entry_type,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Last `n` entries in chronological order. The generator context window
    /// is built from this; the unbounded full history is never sent to the
    /// remote API.
    pub fn recent(&self, n: usize) -> &[TranscriptEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_preserves_prior_entries() {
        let mut transcript = Transcript::new();
        let first = transcript.append(Speaker::Jerry, "Hello", EntryType::Speech);
        let mut last_len = transcript.len();
        for i in 0..10 {
            transcript.append(Speaker::Contact, format!("utterance {i}"), EntryType::Speech);
            assert!(transcript.len() > last_len, "length must be monotonic");
            last_len = transcript.len();
            assert_eq!(transcript.entries()[0], first, "prior entries never change");
        }
    }

    #[test]
    fn recent_returns_chronological_tail() {
        let mut transcript = Transcript::new();
        for i in 0..9 {
            transcript.append(Speaker::Contact, format!("line {i}"), EntryType::Speech);
        }
        let window = transcript.recent(6);
        assert_eq!(window.len(), 6);
        assert_eq!(window[0].text, "line 3");
        assert_eq!(window[5].text, "line 8");
    }

    #[test]
    fn recent_caps_at_available_entries() {
        let mut transcript = Transcript::new();
        transcript.append(Speaker::Jerry, "opener", EntryType::Speech);
        assert_eq!(transcript.recent(6).len(), 1);
        assert!(Transcript::new().recent(6).is_empty());
    }
}
