//! Analíticas sobre las conversaciones guardadas en disco.
//!
//! Cada fichero `*.json` del directorio de conversaciones es una
//! `SavedConversation`. A partir de ellos se calculan las métricas del
//! resumen y los temas de feedback más repetidos.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveDate};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::models::{AnalyticsSummary, ConversationRecord, SavedConversation, Summary, TopFeedback};

pub const TOP_FEEDBACK_LIMIT: usize = 10;

/// Rango de fechas inclusivo sobre `saved_at`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateFilter {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateFilter {
    pub fn is_active(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    /// Sin filtro entra todo; con filtro, las conversaciones sin fecha quedan fuera.
    pub fn matches(&self, record: &ConversationRecord) -> bool {
        if !self.is_active() {
            return true;
        }
        let Some(date) = record.saved_at_utc().map(|dt| dt.date_naive()) else {
            return false;
        };
        self.start.map_or(true, |start| date >= start) && self.end.map_or(true, |end| date <= end)
    }
}

/// Convierte un fichero guardado en una fila de analíticas.
pub fn to_record(filename: &str, conv: SavedConversation) -> ConversationRecord {
    let final_analysis = conv.final_analysis.unwrap_or_default();
    ConversationRecord {
        filename: filename.to_string(),
        saved_at: conv.saved_at,
        score: conv.score.or(final_analysis.score),
        sentiment: conv
            .sentiment
            .filter(|s| !s.is_empty())
            .or(final_analysis.sentiment),
        requires_followup: final_analysis.requires_follow_up,
        conversation_complete: final_analysis.conversation_complete,
        total_turns: conv.turns.len(),
        initial_transcription: conv.initial_transcription,
        final_transcription: final_analysis.transcription,
        final_response: final_analysis.conversational_response,
        initial_feedback_points: conv
            .initial_feedback_points
            .filter(|points| !points.is_empty())
            .or(conv.initial_feedback)
            .unwrap_or_default(),
    }
}

/// Carga todas las conversaciones del directorio (sin recursión), ordenadas
/// por nombre de fichero. Los ficheros ilegibles se omiten con un aviso.
pub fn load_conversations(dir: &Path) -> Result<Vec<ConversationRecord>> {
    if !dir.is_dir() {
        return Err(anyhow!("Directory '{}' not found.", dir.display()));
    }

    let mut entries: Vec<_> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        .collect();
    entries.sort_by(|a, b| a.file_name().cmp(b.file_name()));

    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().to_string();
        let parsed = fs::read_to_string(path)
            .with_context(|| format!("Error leyendo {}", path.display()))
            .and_then(|raw| {
                serde_json::from_str::<SavedConversation>(&raw)
                    .with_context(|| format!("JSON inválido en {}", path.display()))
            });
        match parsed {
            Ok(conv) => records.push(to_record(&filename, conv)),
            Err(e) => warn!("Conversación omitida: {e:#}"),
        }
    }
    debug!("{} conversaciones cargadas de {}", records.len(), dir.display());
    Ok(records)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn pct(flags: impl Iterator<Item = bool>, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let hits = flags.filter(|flag| *flag).count();
    round2(100.0 * hits as f64 / total as f64)
}

fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

/// Métricas globales. Las puntuaciones ausentes no cuentan para media ni
/// mediana; los indicadores ausentes cuentan como `false`.
pub fn summarize(records: &[ConversationRecord]) -> Summary {
    let total = records.len();

    let mut scores: Vec<f64> = records.iter().filter_map(|r| r.score).map(f64::from).collect();
    scores.sort_by(|a, b| a.total_cmp(b));
    let avg_score = if scores.is_empty() {
        None
    } else {
        Some(round2(scores.iter().sum::<f64>() / scores.len() as f64))
    };

    let mut sentiment_breakdown = BTreeMap::new();
    for sentiment in records.iter().filter_map(|r| r.sentiment.as_deref()) {
        *sentiment_breakdown.entry(sentiment.to_string()).or_insert(0) += 1;
    }

    let turns_total: usize = records.iter().map(|r| r.total_turns).sum();
    let avg_turns = if total == 0 { 0.0 } else { round2(turns_total as f64 / total as f64) };

    Summary {
        total_conversations: total,
        avg_score,
        median_score: median(&scores),
        sentiment_breakdown,
        followup_required_pct: pct(records.iter().map(|r| r.requires_followup.unwrap_or(false)), total),
        avg_turns,
        max_turns: records.iter().map(|r| r.total_turns).max().unwrap_or(0),
        completed_pct: pct(records.iter().map(|r| r.conversation_complete.unwrap_or(false)), total),
    }
}

/// Puntos de feedback iniciales más frecuentes. Empates: primero el que
/// apareció antes.
pub fn top_feedback_points(records: &[ConversationRecord], top_n: usize) -> Vec<TopFeedback> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut order = 0usize;
    for point in records.iter().flat_map(|r| r.initial_feedback_points.iter()) {
        let text = point.trim();
        if text.is_empty() {
            continue;
        }
        let slot = counts.entry(text.to_string()).or_insert_with(|| {
            order += 1;
            (0, order)
        });
        slot.0 += 1;
    }

    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(text, (count, first_seen))| (text, count, first_seen))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(top_n)
        .map(|(text, count, _)| TopFeedback { text, count })
        .collect()
}

/// Por qué una consulta de analíticas no devolvió datos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmptyReason {
    NoConversations,
    NoneInRange,
}

impl EmptyReason {
    pub fn detail(&self) -> &'static str {
        match self {
            Self::NoConversations => "No conversations found",
            Self::NoneInRange => "No conversations found in the selected date range",
        }
    }
}

/// Construye el documento completo para un filtro dado.
pub fn build_summary(
    all: Vec<ConversationRecord>,
    filter: &DateFilter,
) -> std::result::Result<AnalyticsSummary, EmptyReason> {
    if all.is_empty() {
        return Err(EmptyReason::NoConversations);
    }
    let conversations: Vec<ConversationRecord> = all.into_iter().filter(|r| filter.matches(r)).collect();
    if conversations.is_empty() {
        return Err(EmptyReason::NoneInRange);
    }
    Ok(AnalyticsSummary {
        summary: summarize(&conversations),
        top_feedback: top_feedback_points(&conversations, TOP_FEEDBACK_LIMIT),
        conversations,
    })
}

/// Informe del comando `analyze`: resumen + temas principales.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub summary: Summary,
    pub top_feedback: Vec<TopFeedback>,
    pub conversations: Vec<ConversationRecord>,
}

impl AnalyticsReport {
    pub fn from_dir(dir: &Path, top_n: usize) -> Result<Self> {
        let conversations = load_conversations(dir)?;
        if conversations.is_empty() {
            return Err(anyhow!("No JSON files found in '{}'.", dir.display()));
        }
        Ok(Self {
            summary: summarize(&conversations),
            top_feedback: top_feedback_points(&conversations, top_n),
            conversations,
        })
    }
}

/// Fila del informe CSV. La lista de puntos va unida en una sola celda.
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    filename: &'a str,
    saved_at: Option<&'a str>,
    score: Option<u8>,
    sentiment: Option<&'a str>,
    requires_followup: Option<bool>,
    conversation_complete: Option<bool>,
    total_turns: usize,
    initial_transcription: Option<&'a str>,
    final_transcription: Option<&'a str>,
    final_response: Option<&'a str>,
    initial_feedback_points: String,
}

impl<'a> From<&'a ConversationRecord> for CsvRow<'a> {
    fn from(r: &'a ConversationRecord) -> Self {
        Self {
            filename: &r.filename,
            saved_at: r.saved_at.as_deref(),
            score: r.score,
            sentiment: r.sentiment.as_deref(),
            requires_followup: r.requires_followup,
            conversation_complete: r.conversation_complete,
            total_turns: r.total_turns,
            initial_transcription: r.initial_transcription.as_deref(),
            final_transcription: r.final_transcription.as_deref(),
            final_response: r.final_response.as_deref(),
            initial_feedback_points: r.initial_feedback_points.join("; "),
        }
    }
}

/// `conversation_report_<AAAAMMDD_HHMMSS>.csv` en el directorio actual.
pub fn default_report_path(now: DateTime<Local>) -> PathBuf {
    PathBuf::from(format!("conversation_report_{}.csv", now.format("%Y%m%d_%H%M%S")))
}

/// Escribe una fila por conversación, con cabecera.
pub fn export_csv(records: &[ConversationRecord], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("No se pudo crear {}", path.display()))?;
    for record in records {
        writer.serialize(CsvRow::from(record))?;
    }
    writer.flush()?;
    debug!("{} filas exportadas a {}", records.len(), path.display());
    Ok(())
}

impl fmt::Display for AnalyticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.summary;
        let opt = |v: Option<f64>| v.map_or_else(|| "N/A".to_string(), |v| format!("{v}"));

        writeln!(f, "=== Conversation Summary ===")?;
        writeln!(f, "Conversations: {}", s.total_conversations)?;
        writeln!(f, "Avg Score: {}", opt(s.avg_score))?;
        writeln!(f, "Median Score: {}", opt(s.median_score))?;
        writeln!(f, "Sentiment Breakdown:")?;
        for (sentiment, count) in s.sentiments_by_count() {
            writeln!(f, "  - {sentiment}: {count}")?;
        }
        writeln!(f, "Followup Required Pct: {}", s.followup_required_pct)?;
        writeln!(f, "Avg Turns: {}", s.avg_turns)?;
        writeln!(f, "Max Turns: {}", s.max_turns)?;
        writeln!(f, "Completed Pct: {}", s.completed_pct)?;

        if self.top_feedback.is_empty() {
            writeln!(f, "\nNo feedback points available.")
        } else {
            writeln!(f, "\n=== Top Feedback Themes ===")?;
            for item in &self.top_feedback {
                writeln!(f, "- {}: {} mention(s)", item.text, item.count)?;
            }
            Ok(())
        }
    }
}
