//! Modelos de dominio: registros del widget de valoración, ficheros de
//! conversación guardados y el documento de analíticas que sirve el backend.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::AnalysisResult;
use crate::rating::StarRating;

/// Resultado de un turno analizado, tal y como se guarda en `feedbackData`.
/// Nunca se modifica una vez creado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    #[serde(rename = "rating")]
    pub rating_stars: StarRating,
    pub nps_score: u8,
    pub transcription: String,
    pub sentiment: String,
    #[serde(rename = "feedback", default)]
    pub feedback_points: Vec<String>,
    pub conversational_response: String,
    pub requires_follow_up: bool,
    pub timestamp: DateTime<Utc>,
}

impl FeedbackEntry {
    pub fn from_analysis(rating: StarRating, analysis: &AnalysisResult, at: DateTime<Utc>) -> Self {
        Self {
            rating_stars: rating,
            nps_score: rating.nps_score(),
            transcription: analysis.transcription.clone(),
            sentiment: analysis.sentiment.clone(),
            feedback_points: analysis.feedback.clone(),
            conversational_response: analysis.conversational_response.clone(),
            requires_follow_up: analysis.requires_follow_up,
            timestamp: at,
        }
    }
}

/// Grabación cruda guardada en `audioRecordings` como data URL base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioRecording {
    #[serde(rename = "base64")]
    pub audio_data: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "rating")]
    pub rating_stars: StarRating,
}

/// Quién habla en un turno del historial enviado al servicio de análisis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// Entrada del historial de la conversación (sólo texto; el audio se
/// representa con un marcador).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

impl HistoryTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self { role: Role::Model, text: text.into() }
    }
}

// --- Ficheros de conversación (directorio `conversations/`) ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub ai: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalAnalysis {
    pub transcription: Option<String>,
    pub conversational_response: Option<String>,
    pub requires_follow_up: Option<bool>,
    pub conversation_complete: Option<bool>,
    pub score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
}

/// Conversación completa persistida por el backend (un fichero JSON).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedConversation {
    pub score: Option<u8>,
    pub sentiment: Option<String>,
    pub initial_transcription: Option<String>,
    pub initial_feedback_points: Option<Vec<String>>,
    /// Nombre heredado de la lista; sólo se usa si la nueva falta o está vacía.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_feedback: Option<Vec<String>>,
    #[serde(default)]
    pub turns: Vec<TurnRecord>,
    pub final_analysis: Option<FinalAnalysis>,
    pub metadata: Option<serde_json::Value>,
    pub saved_at: Option<String>,
}

// --- Documento de analíticas (GET /analytics/summary) ---

/// Una fila por conversación guardada.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub filename: String,
    pub saved_at: Option<String>,
    pub score: Option<u8>,
    pub sentiment: Option<String>,
    pub requires_followup: Option<bool>,
    pub conversation_complete: Option<bool>,
    pub total_turns: usize,
    pub initial_transcription: Option<String>,
    pub final_transcription: Option<String>,
    pub final_response: Option<String>,
    #[serde(default)]
    pub initial_feedback_points: Vec<String>,
}

impl ConversationRecord {
    pub fn saved_at_utc(&self) -> Option<DateTime<Utc>> {
        self.saved_at.as_deref().and_then(parse_saved_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_conversations: usize,
    pub avg_score: Option<f64>,
    pub median_score: Option<f64>,
    #[serde(default)]
    pub sentiment_breakdown: BTreeMap<String, usize>,
    pub followup_required_pct: f64,
    pub avg_turns: f64,
    pub max_turns: usize,
    pub completed_pct: f64,
}

impl Summary {
    /// Reparto de sentimientos de mayor a menor; empates por nombre.
    pub fn sentiments_by_count(&self) -> Vec<(&str, usize)> {
        let mut ranked: Vec<(&str, usize)> = self
            .sentiment_breakdown
            .iter()
            .map(|(name, count)| (name.as_str(), *count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopFeedback {
    pub text: String,
    pub count: usize,
}

/// Instantánea inmutable que el dashboard recibe en cada petición.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub summary: Summary,
    #[serde(default)]
    pub conversations: Vec<ConversationRecord>,
    #[serde(default)]
    pub top_feedback: Vec<TopFeedback>,
}

/// Interpreta `saved_at` de forma tolerante: RFC 3339, el formato heredado
/// `...+00:00Z` (offset y `Z` a la vez) o una fecha sin zona (se asume UTC).
pub fn parse_saved_at(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Some(stripped) = trimmed.strip_suffix('Z') {
        if let Ok(dt) = DateTime::parse_from_rfc3339(stripped) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(stripped, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(naive.and_utc());
        }
    }

    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_rfc3339_and_legacy_timestamps() {
        let plain = parse_saved_at("2025-03-04T10:20:30Z").unwrap();
        assert_eq!((plain.month(), plain.day(), plain.hour()), (3, 4, 10));

        let legacy = parse_saved_at("2025-03-04T10:20:30.123456+00:00Z").unwrap();
        assert_eq!(legacy.minute(), 20);

        let naive = parse_saved_at("2025-03-04T10:20:30").unwrap();
        assert_eq!(naive.second(), 30);

        assert!(parse_saved_at("yesterday").is_none());
    }

    #[test]
    fn feedback_entry_uses_storage_field_names() {
        let entry = FeedbackEntry {
            rating_stars: StarRating::try_from(2).unwrap(),
            nps_score: 4,
            transcription: "Slow checkout".into(),
            sentiment: "Negative".into(),
            feedback_points: vec!["checkout".into()],
            conversational_response: "Sorry to hear that.".into(),
            requires_follow_up: true,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["rating"], 2);
        assert_eq!(value["npsScore"], 4);
        assert_eq!(value["feedback"][0], "checkout");
        assert_eq!(value["requiresFollowUp"], true);
        assert_eq!(value["conversationalResponse"], "Sorry to hear that.");
    }

    #[test]
    fn saved_conversation_reads_legacy_and_new_feedback_keys_together() {
        let raw = r#"{"score": 5, "initial_feedback_points": null, "initial_feedback": ["Slow checkout"],
                      "turns": [{"user": "a", "ai": "b"}]}"#;
        let conv: SavedConversation = serde_json::from_str(raw).unwrap();
        assert_eq!(conv.initial_feedback_points, None);
        assert_eq!(conv.initial_feedback, Some(vec!["Slow checkout".to_string()]));
        assert_eq!(conv.turns.len(), 1);
        assert!(conv.final_analysis.is_none());

        let value = serde_json::to_value(SavedConversation::default()).unwrap();
        assert!(value.get("initial_feedback").is_none());
    }
}
