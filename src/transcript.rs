//! # Transcript Assembly
//!
//! The backend streams transcription of both sides of the conversation as small text
//! fragments. Fragments are buffered per speaker for the current turn and turned into
//! finished entries when the turn completes.
//!
//! ## Rules:
//! - Fragments are appended verbatim in arrival order (no spacing fix-ups)
//! - `on_turn_complete` emits the user entry first, then the model entry
//! - Empty (after trimming) buffers emit nothing, so a turn yields at most one entry per speaker
//! - Both buffers are cleared in the same call that emits them

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Who said it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Model,
}

/// One finished line of the conversation. Never modified after it is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Unique, increasing across every session of the machine that produced it
    pub id: u64,
    pub speaker: Speaker,
    pub text: String,
}

/// Text gathered so far in the current turn.
#[derive(Debug, Default)]
struct TurnBuffers {
    user: String,
    model: String,
}

/// Accumulates fragments and emits entries on turn boundaries.
///
/// ## Ids:
/// The id counter is shared (`Arc<AtomicU64>`) so a fresh assembler per session keeps
/// handing out ids that never collide with earlier sessions.
#[derive(Debug)]
pub struct TranscriptAssembler {
    turn: TurnBuffers,
    ids: Arc<AtomicU64>,
}

impl TranscriptAssembler {
    pub fn new(ids: Arc<AtomicU64>) -> Self {
        Self {
            turn: TurnBuffers::default(),
            ids,
        }
    }

    pub fn on_fragment(&mut self, speaker: Speaker, text: &str) {
        match speaker {
            Speaker::User => self.turn.user.push_str(text),
            Speaker::Model => self.turn.model.push_str(text),
        }
    }

    /// Close the current turn.
    pub fn on_turn_complete(&mut self) -> Vec<TranscriptEntry> {
        let TurnBuffers { user, model } = std::mem::take(&mut self.turn);

        [(Speaker::User, user), (Speaker::Model, model)]
            .into_iter()
            .filter_map(|(speaker, text)| {
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                Some(TranscriptEntry {
                    id: self.ids.fetch_add(1, Ordering::Relaxed) + 1,
                    speaker,
                    text: text.to_string(),
                })
            })
            .collect()
    }

    /// Whether any text is waiting for the end of the turn.
    pub fn has_pending(&self) -> bool {
        !self.turn.user.is_empty() || !self.turn.model.is_empty()
    }
}

impl Default for TranscriptAssembler {
    fn default() -> Self {
        Self::new(Arc::new(AtomicU64::new(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_fragments_join_into_one_entry() {
        let mut assembler = TranscriptAssembler::default();
        assembler.on_fragment(Speaker::Model, "Hello");
        assembler.on_fragment(Speaker::Model, " there");

        let entries = assembler.on_turn_complete();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].speaker, Speaker::Model);
        assert_eq!(entries[0].text, "Hello there");
    }

    #[test]
    fn test_user_entry_comes_first() {
        let mut assembler = TranscriptAssembler::default();
        assembler.on_fragment(Speaker::Model, "Sure.");
        assembler.on_fragment(Speaker::User, " Can you ");
        assembler.on_fragment(Speaker::User, "help? ");

        let entries = assembler.on_turn_complete();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].speaker, Speaker::User);
        assert_eq!(entries[0].text, "Can you help?");
        assert_eq!(entries[1].speaker, Speaker::Model);
        assert!(entries[0].id < entries[1].id);
    }

    #[test]
    fn test_blank_turn_emits_nothing() {
        let mut assembler = TranscriptAssembler::default();
        assert!(assembler.on_turn_complete().is_empty());

        assembler.on_fragment(Speaker::User, "   ");
        assembler.on_fragment(Speaker::Model, "\n");
        assert!(assembler.on_turn_complete().is_empty());
    }

    #[test]
    fn test_buffers_reset_between_turns() {
        let mut assembler = TranscriptAssembler::default();
        assembler.on_fragment(Speaker::User, "first");
        assembler.on_turn_complete();
        assert!(!assembler.has_pending());

        assembler.on_fragment(Speaker::User, "second");
        let entries = assembler.on_turn_complete();
        assert_eq!(entries[0].text, "second");
    }

    #[test]
    fn test_ids_stay_unique_across_assemblers() {
        let ids = Arc::new(AtomicU64::new(0));
        let mut first = TranscriptAssembler::new(Arc::clone(&ids));
        first.on_fragment(Speaker::User, "a");
        let a = first.on_turn_complete();

        let mut second = TranscriptAssembler::new(ids);
        second.on_fragment(Speaker::User, "b");
        let b = second.on_turn_complete();

        assert!(b[0].id > a[0].id);
    }

    #[test]
    fn test_speaker_serializes_lowercase() {
        let entry = TranscriptEntry {
            id: 7,
            speaker: Speaker::Model,
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["speaker"], "model");
    }
}
