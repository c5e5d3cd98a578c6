//! Generador de conversaciones de prueba para poblar el dashboard.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::models::{FinalAnalysis, SavedConversation, TurnRecord};

const SCORE_WEIGHTS: [u32; 11] = [2, 2, 3, 3, 4, 5, 6, 7, 8, 9, 10];
const TURN_WEIGHTS: [u32; 5] = [30, 35, 20, 10, 5];
const SPREAD_DAYS: i64 = 30;

pub const COURSE_CONVERSATIONS_DIR: &str = "courseconversations";

/// Reparto fijo de las primeras conversaciones de la tienda:
/// 8 negativas, 6 positivas y 6 neutras o mixtas.
const SHOP_SENTIMENT_PLAN: [&str; 20] = [
    "Negative", "Frustrated", "Negative", "Frustrated", "Disappointed", "Negative", "Frustrated", "Angry",
    "Positive", "Happy", "Satisfied", "Positive", "Happy", "Satisfied",
    "Neutral", "Neutral", "Satisfied", "Neutral", "Positive", "Neutral",
];

const TRANSCRIPTIONS: &[&str] = &[
    "The delivery arrived a day early and everything was well packed.",
    "Checkout kept failing on the payment step, I had to try three times.",
    "Honestly the product is fine but the size guide was confusing.",
    "Support answered quickly and fixed my order the same day.",
    "The website is slow on mobile and the menu is hard to find.",
    "Great quality for the price, I will buy again.",
    "My package was damaged and the refund process took weeks.",
    "It does what it says. Nothing special, nothing wrong.",
];

const FEEDBACK_POINTS: &[[&str; 2]] = &[
    ["Fast shipping", "Good packaging"],
    ["Slow checkout", "Confusing navigation"],
    ["Excellent quality", "Great value"],
    ["Poor customer service", "Long wait times"],
    ["Easy to use", "Intuitive design"],
    ["Product damaged", "Poor packaging"],
    ["Helpful support", "Quick response"],
    ["Website bugs", "Technical issues"],
    ["Return process", "Complicated refund"],
    ["Payment issues", "Checkout problems"],
    ["Shipping delay", "Late delivery"],
    ["High quality", "Durable product"],
];

const FOLLOW_UP_ANSWERS: &[&str] = &[
    "Mostly the waiting, I never got a tracking update.",
    "The button did nothing after I entered my card.",
    "I would like clearer sizes on the product page.",
    "A discount code for the next order would help.",
    "It was the second time it happened this month.",
];

const AI_REPLIES: &[&str] = &[
    "Thanks for the detail. Which step was the most frustrating?",
    "I'm sorry about that. What would have made it easier?",
    "That helps a lot. Anything else we could improve?",
    "Understood, we'll pass this on to the team.",
];

/// Nota 0–10 con más peso en las altas.
fn pick_score(rng: &mut impl Rng) -> u8 {
    let dist = WeightedIndex::new(SCORE_WEIGHTS).expect("pesos constantes válidos");
    dist.sample(rng) as u8
}

/// Sentimiento coherente con la nota.
fn pick_sentiment(score: u8, rng: &mut impl Rng) -> &'static str {
    let options: &[&str] = match score {
        9..=10 => &["Positive", "Happy", "Satisfied"],
        7..=8 => &["Neutral", "Satisfied", "Positive"],
        _ => &["Negative", "Frustrated", "Disappointed"],
    };
    options.choose(rng).copied().unwrap_or("Neutral")
}

/// Polaridad de un sentimiento del plan; decide la franja de notas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Negative,
    Positive,
    Neutral,
}

impl Tone {
    fn of(sentiment: &str) -> Self {
        match sentiment {
            "Negative" | "Frustrated" | "Disappointed" | "Angry" => Self::Negative,
            "Positive" | "Happy" | "Satisfied" => Self::Positive,
            _ => Self::Neutral,
        }
    }

    fn pick_score(self, rng: &mut impl Rng) -> u8 {
        match self {
            Self::Negative => rng.gen_range(1..=6),
            Self::Positive => rng.gen_range(8..=10),
            Self::Neutral => rng.gen_range(6..=8),
        }
    }
}

fn random_saved_at(rng: &mut impl Rng, now: DateTime<Utc>) -> String {
    let saved_at = now
        - Duration::days(rng.gen_range(0..SPREAD_DAYS))
        - Duration::hours(rng.gen_range(0..24))
        - Duration::minutes(rng.gen_range(0..60));
    saved_at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Genera una conversación terminada, guardada en algún momento de los
/// últimos 30 días respecto a `now`.
pub fn generate_conversation(rng: &mut impl Rng, now: DateTime<Utc>) -> SavedConversation {
    let score = pick_score(rng);
    let sentiment = pick_sentiment(score, rng);
    shop_conversation(rng, now, score, sentiment)
}

/// Conversación de la tienda con un sentimiento ya decidido.
fn planned_conversation(rng: &mut impl Rng, now: DateTime<Utc>, sentiment: &'static str) -> SavedConversation {
    let score = Tone::of(sentiment).pick_score(rng);
    shop_conversation(rng, now, score, sentiment)
}

fn shop_conversation(rng: &mut impl Rng, now: DateTime<Utc>, score: u8, sentiment: &str) -> SavedConversation {
    let saved_at = random_saved_at(rng, now);
    let requires_followup = score < 7 || (score < 9 && rng.gen_bool(0.4));

    let num_turns = if requires_followup {
        let dist = WeightedIndex::new(TURN_WEIGHTS).expect("pesos constantes válidos");
        dist.sample(rng) + 1
    } else {
        0
    };
    let turns: Vec<TurnRecord> = (0..num_turns)
        .map(|_| TurnRecord {
            user: FOLLOW_UP_ANSWERS.choose(rng).copied().unwrap_or_default().to_string(),
            ai: AI_REPLIES.choose(rng).copied().unwrap_or_default().to_string(),
        })
        .collect();

    let transcription = TRANSCRIPTIONS.choose(rng).copied().unwrap_or_default().to_string();
    let points = FEEDBACK_POINTS
        .choose(rng)
        .map(|pair| pair.iter().map(|p| p.to_string()).collect())
        .unwrap_or_default();

    let final_analysis = FinalAnalysis {
        transcription: Some(
            turns
                .last()
                .map_or_else(|| transcription.clone(), |turn| turn.user.clone()),
        ),
        conversational_response: Some("Thank you for your feedback!".to_string()),
        requires_follow_up: Some(false),
        conversation_complete: Some(true),
        score: Some(score),
        sentiment: None,
    };

    SavedConversation {
        score: Some(score),
        sentiment: Some(sentiment.to_string()),
        initial_transcription: Some(transcription),
        initial_feedback_points: Some(points),
        initial_feedback: None,
        metadata: Some(json!({ "total_turns": turns.len(), "completed_at": saved_at })),
        turns,
        final_analysis: Some(final_analysis),
        saved_at: Some(saved_at),
    }
}

// --- Curso online ---

const COURSE_NEGATIVE_SENTIMENTS: &[&str] = &["Negative", "Frustrated", "Disappointed"];
const COURSE_POSITIVE_SENTIMENTS: &[&str] = &["Positive", "Happy", "Satisfied"];
const COURSE_NEUTRAL_SENTIMENTS: &[&str] = &["Neutral", "Satisfied"];

struct CourseTemplates {
    feedback: &'static [&'static str],
    points: &'static [&'static str],
}

static COURSE_POSITIVE: CourseTemplates = CourseTemplates {
    feedback: &[
        "The course content was well structured and I learned the web basics quickly.",
        "Clear explanations from the instructor and the examples really helped.",
        "The practical exercises made the concepts stick.",
        "I feel confident building a small website after this course.",
    ],
    points: &["Clear explanations", "Well-structured content", "Good examples", "Helpful exercises", "Practical projects", "Easy to follow"],
};

static COURSE_NEGATIVE: CourseTemplates = CourseTemplates {
    feedback: &[
        "The pace was too fast and I could not keep up with the modules.",
        "Some examples were outdated and did not work anymore.",
        "There was not enough practice, mostly theory.",
        "The structure was confusing and topics jumped around.",
    ],
    points: &["Too fast-paced", "Outdated content", "Not enough practice", "Confusing structure", "Too much theory", "Shallow content"],
};

static COURSE_FRUSTRATED: CourseTemplates = CourseTemplates {
    feedback: &[
        "The videos kept buffering and I could not finish the lessons.",
        "Several modules had broken links to the materials.",
        "My questions went unanswered for days.",
        "The description promised much more than the course delivered.",
    ],
    points: &["Technical issues", "Incomplete materials", "Lack of support", "Misleading description", "Platform problems", "Missing topics"],
};

static COURSE_NEUTRAL: CourseTemplates = CourseTemplates {
    feedback: &[
        "The course was okay, it covered the basics and nothing more.",
        "Some modules were good, others could be improved.",
        "Decent content but the delivery could be more engaging.",
        "Fine for beginners, a bit basic if you already know some HTML.",
    ],
    points: &["Average quality", "Basic coverage", "Decent content", "Room for improvement", "Mixed quality", "Could be better"],
};

fn course_templates(sentiment: &str) -> &'static CourseTemplates {
    match sentiment {
        "Positive" | "Happy" | "Satisfied" => &COURSE_POSITIVE,
        "Negative" | "Disappointed" => &COURSE_NEGATIVE,
        "Frustrated" | "Angry" => &COURSE_FRUSTRATED,
        _ => &COURSE_NEUTRAL,
    }
}

/// Conversación del curso. `index` fija el reparto: 0–4 negativas, 5–9
/// positivas y 10–14 neutras (se repite cada 15).
pub fn generate_course_conversation(rng: &mut impl Rng, now: DateTime<Utc>, index: usize) -> SavedConversation {
    let saved_at = random_saved_at(rng, now);
    let (sentiments, score): (&[&str], u8) = match index % 15 {
        0..=4 => (COURSE_NEGATIVE_SENTIMENTS, rng.gen_range(1..=6)),
        5..=9 => (COURSE_POSITIVE_SENTIMENTS, rng.gen_range(8..=10)),
        _ => (COURSE_NEUTRAL_SENTIMENTS, rng.gen_range(6..=8)),
    };
    let sentiment = sentiments.choose(rng).copied().unwrap_or("Neutral");
    let templates = course_templates(sentiment);
    let positive = matches!(sentiment, "Positive" | "Happy" | "Satisfied");

    let feedback_text = templates.feedback.choose(rng).copied().unwrap_or_default().to_string();
    let amount = rng.gen_range(2..=4);
    let points: Vec<String> = templates
        .points
        .choose_multiple(rng, amount)
        .map(|p| p.to_string())
        .collect();

    let num_turns = if score < 7 { rng.gen_range(0..=3) } else { rng.gen_range(0..=1) };
    let turns: Vec<TurnRecord> = (0..num_turns)
        .map(|_| TurnRecord {
            user: templates.feedback.choose(rng).copied().unwrap_or_default().to_string(),
            ai: if positive {
                "Thank you for that additional feedback. We appreciate you taking the time to share more details."
            } else {
                "Thank you for that additional feedback. We understand your concerns and will work on improving this."
            }
            .to_string(),
        })
        .collect();

    let requires_followup = num_turns < 2 && score < 7;
    let complete = !requires_followup;
    let final_analysis = FinalAnalysis {
        transcription: Some(turns.last().map_or_else(|| feedback_text.clone(), |turn| turn.user.clone())),
        conversational_response: Some(
            if complete {
                "Thank you for your feedback! We appreciate you taking the time to share your experience with our course."
            } else {
                "We'd love to hear more about your experience. Could you tell us what specific aspects you'd like to see improved?"
            }
            .to_string(),
        ),
        requires_follow_up: Some(requires_followup),
        conversation_complete: Some(complete),
        score: None,
        sentiment: Some(sentiment.to_string()),
    };

    SavedConversation {
        score: Some(score),
        sentiment: Some(sentiment.to_string()),
        initial_transcription: Some(feedback_text),
        initial_feedback_points: Some(points),
        initial_feedback: None,
        metadata: Some(json!({ "total_turns": turns.len(), "completed_at": saved_at })),
        turns,
        final_analysis: Some(final_analysis),
        saved_at: Some(saved_at),
    }
}

/// Qué conjunto de datos de prueba se genera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedProfile {
    /// Tienda: reparto planificado en las 20 primeras, aleatorio después.
    Shop,
    /// Curso online: 5 negativas, 5 positivas, 5 neutras.
    Course,
}

impl SeedProfile {
    pub fn default_count(self) -> usize {
        match self {
            Self::Shop => SHOP_SENTIMENT_PLAN.len(),
            Self::Course => 15,
        }
    }

    fn generate(self, rng: &mut impl Rng, now: DateTime<Utc>, index: usize) -> SavedConversation {
        match self {
            Self::Shop => match SHOP_SENTIMENT_PLAN.get(index) {
                Some(&sentiment) => planned_conversation(rng, now, sentiment),
                None => generate_conversation(rng, now),
            },
            Self::Course => generate_course_conversation(rng, now, index),
        }
    }
}

/// `conversation_<AAAAMMDDTHHMMSS>_<id>.json`; el sufijo evita colisiones
/// entre conversaciones del mismo segundo.
pub fn file_name_for(conv: &SavedConversation) -> String {
    let stamp: String = conv
        .saved_at
        .as_deref()
        .unwrap_or_default()
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    let id = Uuid::new_v4().simple().to_string();
    format!("conversation_{stamp}_{}.json", &id[..8])
}

/// Escribe `count` conversaciones del perfil en `dir` (se crea si no existe).
pub fn seed_directory(dir: &Path, count: usize, profile: SeedProfile) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .with_context(|| format!("No se pudo crear el directorio {}", dir.display()))?;

    let mut rng = thread_rng();
    let now = Utc::now();
    let mut written = Vec::with_capacity(count);
    for index in 0..count {
        let conv = profile.generate(&mut rng, now, index);
        let path = dir.join(file_name_for(&conv));
        let body = serde_json::to_string_pretty(&conv)?;
        fs::write(&path, body).with_context(|| format!("Error escribiendo {}", path.display()))?;
        info!(
            "Generada {} (nota {}, {}, {} turnos)",
            path.display(),
            conv.score.unwrap_or_default(),
            conv.sentiment.as_deref().unwrap_or_default(),
            conv.turns.len()
        );
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics;
    use rand::rngs::StdRng;

    #[test]
    fn generated_conversations_are_internally_consistent() {
        let mut rng = StdRng::seed_from_u64(7);
        let now = Utc::now();
        for _ in 0..200 {
            let conv = generate_conversation(&mut rng, now);
            let score = conv.score.unwrap();
            assert!(score <= 10);

            let sentiment = conv.sentiment.as_deref().unwrap();
            if score < 7 {
                assert!(["Negative", "Frustrated", "Disappointed"].contains(&sentiment));
                assert!((1..=5).contains(&conv.turns.len()));
            }
            if score >= 9 {
                assert!(conv.turns.is_empty());
            }
            assert!(conv.turns.len() <= 5);
            assert_eq!(conv.metadata.as_ref().unwrap()["total_turns"], conv.turns.len());

            let saved = crate::models::parse_saved_at(conv.saved_at.as_deref().unwrap()).unwrap();
            assert!(saved <= now && saved > now - Duration::days(SPREAD_DAYS));
        }
    }

    #[test]
    fn file_names_follow_the_timestamp_pattern() {
        let conv = SavedConversation {
            saved_at: Some("2025-04-02T08:09:10.123456Z".into()),
            ..Default::default()
        };
        let name = file_name_for(&conv);
        assert!(name.starts_with("conversation_20250402T080910_"));
        assert!(name.ends_with(".json"));
    }

    #[test]
    fn shop_plan_fixes_the_first_twenty_sentiments() {
        let mut rng = StdRng::seed_from_u64(11);
        let now = Utc::now();
        let convs: Vec<_> = (0..SeedProfile::Shop.default_count())
            .map(|i| SeedProfile::Shop.generate(&mut rng, now, i))
            .collect();

        let tones: Vec<Tone> = convs
            .iter()
            .map(|c| Tone::of(c.sentiment.as_deref().unwrap()))
            .collect();
        let negatives = tones.iter().filter(|t| **t == Tone::Negative).count();
        assert_eq!(negatives, 8);
        for (conv, planned) in convs.iter().zip(SHOP_SENTIMENT_PLAN) {
            assert_eq!(conv.sentiment.as_deref(), Some(planned));
            let score = conv.score.unwrap();
            match Tone::of(planned) {
                Tone::Negative => assert!((1..=6).contains(&score)),
                Tone::Positive => assert!((8..=10).contains(&score)),
                Tone::Neutral => assert!((6..=8).contains(&score)),
            }
        }
    }

    #[test]
    fn course_profile_splits_five_five_five() {
        let mut rng = StdRng::seed_from_u64(3);
        let now = Utc::now();
        for index in 0..15 {
            let conv = generate_course_conversation(&mut rng, now, index);
            let score = conv.score.unwrap();
            let sentiment = conv.sentiment.clone().unwrap();
            let analysis = conv.final_analysis.as_ref().unwrap();
            assert_eq!(analysis.sentiment.as_deref(), Some(sentiment.as_str()));

            match index {
                0..=4 => {
                    assert!(["Negative", "Frustrated", "Disappointed"].contains(&sentiment.as_str()));
                    assert!((1..=6).contains(&score));
                    assert!(conv.turns.len() <= 3);
                }
                5..=9 => {
                    assert!(["Positive", "Happy", "Satisfied"].contains(&sentiment.as_str()));
                    assert!((8..=10).contains(&score));
                }
                _ => {
                    assert!(["Neutral", "Satisfied"].contains(&sentiment.as_str()));
                    assert!((6..=8).contains(&score));
                }
            }
            if score >= 7 {
                assert!(conv.turns.len() <= 1);
            }

            let points = conv.initial_feedback_points.as_ref().unwrap();
            assert!((2..=4).contains(&points.len()));
            let mut unique = points.clone();
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), points.len());

            let pending = conv.turns.len() < 2 && score < 7;
            assert_eq!(analysis.requires_follow_up, Some(pending));
            assert_eq!(analysis.conversation_complete, Some(!pending));
        }
    }

    #[test]
    fn course_seed_is_readable_by_the_analyzer() {
        let dir = tempfile::tempdir().unwrap();
        seed_directory(dir.path(), SeedProfile::Course.default_count(), SeedProfile::Course).unwrap();

        let records = analytics::load_conversations(dir.path()).unwrap();
        assert_eq!(records.len(), 15);
        let summary = analytics::summarize(&records);
        assert_eq!(summary.sentiment_breakdown.values().sum::<usize>(), 15);
    }

    #[test]
    fn seeded_directory_is_readable_by_the_analyzer() {
        let dir = tempfile::tempdir().unwrap();
        let written = seed_directory(dir.path(), 12, SeedProfile::Shop).unwrap();
        assert_eq!(written.len(), 12);

        let records = analytics::load_conversations(dir.path()).unwrap();
        assert_eq!(records.len(), 12);
        assert!(records.iter().all(|r| r.conversation_complete == Some(true)));
        assert!(records.iter().all(|r| r.initial_feedback_points.len() == 2));
    }
}
