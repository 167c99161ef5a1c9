use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog song as surfaced to clients. The full catalog row carries more
/// (tags, phrases, embedding); this is the broadcast-facing slice.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SongRef {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
}

/// A KNN candidate before re-ranking. `artist_primary` is the canonical
/// primary artist used by the diversity cap; `popularity` is 0-100.
#[derive(Debug, Clone)]
pub struct SongCandidate {
    pub song: SongRef,
    pub artist_primary: String,
    pub popularity: i32,
    pub similarity: f32,
}

/// Per-candidate score as recorded in the `scores` blob.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CandidateScore {
    pub song_id: String,
    pub similarity: f32,
}

/// The matcher's raw result, persisted alongside the message and echoed
/// on the wire so identical-result regressions stay debuggable.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Scores {
    /// "semantic" or "fallback"
    pub mode: String,
    pub model: String,
    pub ef_search: u32,
    pub candidates: Vec<CandidateScore>,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub very_weak: bool,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub primary: Option<SongRef>,
    /// Up to N-1, ordered by similarity desc.
    pub alternates: Vec<SongRef>,
    pub scores: Scores,
    pub reasoning: String,
    pub fingerprint: String,
}

impl MatchResult {
    /// Similarity of the primary pick; 0.0 when no candidate survived.
    pub fn similarity(&self) -> f32 {
        self.scores
            .candidates
            .first()
            .map(|c| c.similarity)
            .unwrap_or(0.0)
    }
}

/// Anonymous actor. The client-held UUID is the authoritative identity
/// token; `anon_handle` never changes for the lifetime of the row.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub anon_handle: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub name: String,
    pub message_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// A persisted message joined with its author handle and chosen song.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Uuid,
    pub room: String,
    pub user_id: Uuid,
    pub handle: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub reply_to_message_id: Option<Uuid>,
    pub song: Option<SongRef>,
    pub scores: serde_json::Value,
}

impl StoredMessage {
    /// Rebuild the broadcast envelope from a persisted row. The scores
    /// blob carries the matcher's reasoning and per-candidate
    /// similarities, so history replays look exactly like live frames.
    pub fn into_display(self) -> DisplayMessage {
        let reasoning = self.scores["reasoning"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let similarity = self.scores["candidates"][0]["similarity"]
            .as_f64()
            .unwrap_or(0.0) as f32;
        DisplayMessage {
            id: self.id,
            room: self.room,
            user_id: self.user_id,
            handle: self.handle,
            text: self.text,
            created_at: self.created_at,
            reply_to_message_id: self.reply_to_message_id,
            song: self.song,
            scores: self.scores,
            reasoning,
            similarity,
            durable: true,
        }
    }
}

/// The outbound chat envelope: what every peer in the room receives and
/// what history replays. `durable:false` marks a message broadcast
/// despite a failed write.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMessage {
    pub id: Uuid,
    pub room: String,
    pub user_id: Uuid,
    pub handle: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub song: Option<SongRef>,
    pub scores: serde_json::Value,
    pub reasoning: String,
    pub similarity: f32,
    pub durable: bool,
}

/// Reactions on one message grouped by emoji, reactor handles included.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: i64,
    pub users: Vec<String>,
}

/// History entry: the display envelope plus aggregated reactions.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HistoryMessage {
    #[serde(flatten)]
    pub message: DisplayMessage,
    pub reactions: Vec<ReactionGroup>,
}

/// Cross-instance roster element. `instance_id` and `last_seen` are
/// bookkeeping for the staleness sweeper, not client-visible.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub handle: String,
    pub joined_at: DateTime<Utc>,
    pub instance_id: String,
    pub last_seen: DateTime<Utc>,
}

/// Roster entry as serialized to clients (snapshot frames and REST).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RosterUser {
    pub user_id: Uuid,
    pub handle: String,
    pub joined_at: DateTime<Utc>,
}

impl From<&PresenceEntry> for RosterUser {
    fn from(e: &PresenceEntry) -> Self {
        RosterUser {
            user_id: e.user_id,
            handle: e.handle.clone(),
            joined_at: e.joined_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RosterResponse {
    pub room: String,
    pub users: Vec<RosterUser>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_message_wire_shape() {
        let msg = DisplayMessage {
            id: Uuid::new_v4(),
            room: "default".into(),
            user_id: Uuid::new_v4(),
            handle: "happy-fox-a3b".into(),
            text: "hello".into(),
            created_at: Utc::now(),
            reply_to_message_id: None,
            song: Some(SongRef {
                id: "s1".into(),
                title: "Happy".into(),
                artist: "Pharrell Williams".into(),
                year: Some(2013),
            }),
            scores: serde_json::json!({"mode": "semantic"}),
            reasoning: "closest match".into(),
            similarity: 0.73,
            durable: true,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert!(v.get("userId").is_some());
        assert!(v.get("createdAt").is_some());
        assert!(v.get("replyToMessageId").is_none());
        assert_eq!(v["song"]["artist"], "Pharrell Williams");
        assert_eq!(v["durable"], true);
    }

    #[test]
    fn stored_rows_rebuild_the_display_envelope() {
        let stored = StoredMessage {
            id: Uuid::new_v4(),
            room: "default".into(),
            user_id: Uuid::new_v4(),
            handle: "swift-hare-7c1".into(),
            text: "dance all night".into(),
            created_at: Utc::now(),
            reply_to_message_id: None,
            song: None,
            scores: serde_json::json!({
                "mode": "semantic",
                "reasoning": "semantic match: top similarity 0.812 across 5 candidates",
                "candidates": [{"songId": "s9", "similarity": 0.812}],
            }),
        };
        let display = stored.into_display();
        assert!(display.reasoning.starts_with("semantic match"));
        assert!((display.similarity - 0.812).abs() < 1e-6);
        assert!(display.durable);
    }

    #[test]
    fn scores_omits_very_weak_when_false() {
        let scores = Scores {
            mode: "semantic".into(),
            model: "m".into(),
            ef_search: 100,
            candidates: vec![],
            fingerprint: "f".into(),
            very_weak: false,
        };
        let v = serde_json::to_value(&scores).unwrap();
        assert!(v.get("veryWeak").is_none());

        let round: Scores = serde_json::from_value(v).unwrap();
        assert!(!round.very_weak);
    }
}
