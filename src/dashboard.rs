//! Dashboard de analíticas: pide el resumen al backend y deriva los datos de
//! cada gráfico (reparto de valoraciones, sentimientos, tendencia, temas y
//! turnos). Las derivaciones son sólo de presentación.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::models::AnalyticsSummary;

pub const TOP_THEMES: usize = 8;
pub const THEME_LABEL_CHARS: usize = 40;
pub const GENERIC_FAILURE: &str = "Failed to load analytics";

const NONE_IN_RANGE_DETAIL: &str = "No conversations found in the selected date range";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DashboardError {
    #[error("{0}")]
    Validation(String),
    #[error("No conversations found in the selected date range")]
    NoDataInRange,
    #[error("No conversations found")]
    NoData,
    #[error("Cannot reach the analytics backend ({0})")]
    Unreachable(String),
    #[error("{0}")]
    Failed(String),
}

impl DashboardError {
    /// Texto que se muestra en la pantalla de error.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

// --- Selección de rango ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateRange {
    Last7Days,
    Last30Days,
    AllTime,
    Custom {
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
}

/// Parámetros ya validados de una petición al backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub label: String,
}

impl RangeQuery {
    pub fn all_time() -> Self {
        Self {
            start: None,
            end: None,
            label: "All time".to_string(),
        }
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(start) = self.start {
            params.push(("start_date", start.format("%Y-%m-%d").to_string()));
        }
        if let Some(end) = self.end {
            params.push(("end_date", end.format("%Y-%m-%d").to_string()));
        }
        params
    }
}

impl DateRange {
    /// Resuelve el rango respecto a `today`. Los presets sólo fijan el inicio.
    pub fn resolve(&self, today: NaiveDate) -> Result<RangeQuery, DashboardError> {
        let query = match self {
            Self::Last7Days => RangeQuery {
                start: Some(today - Duration::days(6)),
                end: None,
                label: "Last 7 days".to_string(),
            },
            Self::Last30Days => RangeQuery {
                start: Some(today - Duration::days(29)),
                end: None,
                label: "Last 30 days".to_string(),
            },
            Self::AllTime => RangeQuery::all_time(),
            Self::Custom { start, end } => {
                let (Some(start), Some(end)) = (*start, *end) else {
                    return Err(DashboardError::Validation("Both dates required".to_string()));
                };
                if start > end {
                    return Err(DashboardError::Validation("Invalid range".to_string()));
                }
                RangeQuery {
                    start: Some(start),
                    end: Some(end),
                    label: format!("Custom: {start} → {end}"),
                }
            }
        };
        Ok(query)
    }
}

// --- Origen de datos ---

#[allow(async_fn_in_trait)]
pub trait SummarySource {
    async fn fetch(&self, query: &RangeQuery) -> Result<AnalyticsSummary, DashboardError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
}

/// Cliente HTTP del endpoint `/analytics/summary`.
#[derive(Clone)]
pub struct DashboardClient {
    http: Client,
    summary_url: Url,
}

impl DashboardClient {
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let summary_url = cfg
            .backend_url
            .join("analytics/summary")
            .with_context(|| format!("BACKEND_URL inválida: {}", cfg.backend_url))?;
        Ok(Self {
            http: Client::new(),
            summary_url,
        })
    }

    pub fn summary_url(&self) -> &Url {
        &self.summary_url
    }
}

impl SummarySource for DashboardClient {
    async fn fetch(&self, query: &RangeQuery) -> Result<AnalyticsSummary, DashboardError> {
        info!("Consultando {} ({})", self.summary_url, query.label);
        let resp = self
            .http
            .get(self.summary_url.clone())
            .query(&query.params())
            .send()
            .await
            .map_err(|e| {
                warn!("Backend de analíticas inaccesible: {e}");
                DashboardError::Unreachable(self.summary_url.to_string())
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|body| body.detail);
            warn!("El backend respondió {status}: {detail:?}");
            return Err(categorize(status.as_u16(), detail));
        }

        resp.json::<AnalyticsSummary>().await.map_err(|e| {
            warn!("Resumen de analíticas ilegible: {e}");
            DashboardError::Failed(GENERIC_FAILURE.to_string())
        })
    }
}

fn categorize(status: u16, detail: Option<String>) -> DashboardError {
    match (status, detail) {
        (404, Some(detail)) if detail == NONE_IN_RANGE_DETAIL => DashboardError::NoDataInRange,
        (404, _) => DashboardError::NoData,
        (_, Some(detail)) if !detail.trim().is_empty() => DashboardError::Failed(detail),
        _ => DashboardError::Failed(GENERIC_FAILURE.to_string()),
    }
}

/// Estados de la pantalla del dashboard.
#[derive(Debug, Clone, PartialEq)]
pub enum DashboardScreen {
    Loading,
    Error { message: String },
    Ready(Box<DashboardView>),
}

/// Controlador de la pantalla: cada carga correcta sustituye la vista entera.
pub struct Dashboard<C> {
    source: C,
    screen: DashboardScreen,
    inline_error: Option<String>,
}

impl<C: SummarySource> Dashboard<C> {
    pub fn new(source: C) -> Self {
        Self {
            source,
            screen: DashboardScreen::Loading,
            inline_error: None,
        }
    }

    pub fn screen(&self) -> &DashboardScreen {
        &self.screen
    }

    /// Error de validación del rango personalizado, si lo hay.
    pub fn inline_error(&self) -> Option<&str> {
        self.inline_error.as_deref()
    }

    /// Aplica un rango. Si no valida no se hace ninguna petición y la pantalla
    /// actual se mantiene.
    pub async fn apply(&mut self, range: &DateRange, today: NaiveDate) -> &DashboardScreen {
        match range.resolve(today) {
            Ok(query) => {
                self.inline_error = None;
                self.load(query).await
            }
            Err(err) => {
                self.inline_error = Some(err.user_message());
                &self.screen
            }
        }
    }

    /// Reintento desde la pantalla de error: siempre sin filtro de fechas.
    pub async fn retry(&mut self) -> &DashboardScreen {
        self.load(RangeQuery::all_time()).await
    }

    async fn load(&mut self, query: RangeQuery) -> &DashboardScreen {
        self.screen = DashboardScreen::Loading;
        self.screen = match self.source.fetch(&query).await {
            Ok(summary) => DashboardScreen::Ready(Box::new(DashboardView::build(&summary, &query.label))),
            Err(err) => DashboardScreen::Error {
                message: err.user_message(),
            },
        };
        &self.screen
    }
}

// --- Derivaciones para los gráficos ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatCard {
    pub label: &'static str,
    pub value: String,
    pub trend: Option<Trend>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    pub name: String,
    pub value: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendPoint {
    pub at: DateTime<Utc>,
    pub date: String,
    pub score: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeBar {
    pub name: String,
    pub count: usize,
    pub full: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnBar {
    pub turns: usize,
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardView {
    pub range_label: String,
    pub stats: Vec<StatCard>,
    pub ratings: Vec<Slice>,
    pub sentiments: Vec<Slice>,
    pub trend: Vec<TrendPoint>,
    pub top_feedback: Vec<ThemeBar>,
    pub turns: Vec<TurnBar>,
}

pub fn rating_bucket(score: u8) -> &'static str {
    if score >= 9 {
        "High"
    } else if score >= 7 {
        "Medium"
    } else {
        "Low"
    }
}

fn truncate_label(text: &str) -> String {
    if text.chars().count() > THEME_LABEL_CHARS {
        let head: String = text.chars().take(THEME_LABEL_CHARS).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

fn turn_label(turns: usize) -> String {
    if turns == 1 {
        "1 turn".to_string()
    } else {
        format!("{turns} turns")
    }
}

impl DashboardView {
    pub fn build(data: &AnalyticsSummary, range_label: &str) -> Self {
        let summary = &data.summary;
        let stats = vec![
            StatCard {
                label: "Total Conversations",
                value: summary.total_conversations.to_string(),
                trend: None,
            },
            StatCard {
                label: "Average Rating",
                value: summary
                    .avg_score
                    .map_or_else(|| "N/A".to_string(), |avg| format!("{avg:.1}")),
                trend: Some(if summary.avg_score.is_some_and(|avg| avg >= 7.0) {
                    Trend::Up
                } else {
                    Trend::Down
                }),
            },
            StatCard {
                label: "Follow-ups Needed",
                value: format!("{}%", summary.followup_required_pct),
                trend: None,
            },
            StatCard {
                label: "Avg Turns",
                value: format!("{:.1}", summary.avg_turns),
                trend: None,
            },
        ];

        let ratings = ["High", "Medium", "Low"]
            .into_iter()
            .map(|bucket| Slice {
                name: bucket.to_string(),
                value: data
                    .conversations
                    .iter()
                    .filter(|c| rating_bucket(c.score.unwrap_or(0)) == bucket)
                    .count(),
            })
            .collect();

        let sentiments = summary
            .sentiments_by_count()
            .into_iter()
            .map(|(name, value)| Slice {
                name: name.to_string(),
                value,
            })
            .collect();

        let mut trend: Vec<TrendPoint> = data
            .conversations
            .iter()
            .filter_map(|c| {
                c.saved_at_utc().map(|at| TrendPoint {
                    at,
                    date: at.format("%b %-d").to_string(),
                    score: c.score.unwrap_or(0),
                })
            })
            .collect();
        trend.sort_by_key(|point| point.at);

        // El backend es externo: no se da por hecho que llegue ordenado.
        let mut ranked: Vec<_> = data.top_feedback.iter().collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count));
        let top_feedback = ranked
            .into_iter()
            .take(TOP_THEMES)
            .map(|item| ThemeBar {
                name: truncate_label(&item.text),
                count: item.count,
                full: item.text.clone(),
            })
            .collect();

        let mut histogram: BTreeMap<usize, usize> = BTreeMap::new();
        for conv in &data.conversations {
            *histogram.entry(conv.total_turns).or_insert(0) += 1;
        }
        let turns = histogram
            .into_iter()
            .map(|(turns, count)| TurnBar {
                turns,
                label: turn_label(turns),
                count,
            })
            .collect();

        Self {
            range_label: range_label.to_string(),
            stats,
            ratings,
            sentiments,
            trend,
            top_feedback,
            turns,
        }
    }
}

fn bar(count: usize) -> String {
    "█".repeat(count.min(50))
}

impl fmt::Display for DashboardView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Analytics Dashboard ({})", self.range_label)?;
        writeln!(f)?;
        for card in &self.stats {
            let arrow = match card.trend {
                Some(Trend::Up) => " ↑",
                Some(Trend::Down) => " ↓",
                None => "",
            };
            writeln!(f, "{:<20} {}{}", card.label, card.value, arrow)?;
        }

        writeln!(f, "\nRating Distribution")?;
        for slice in &self.ratings {
            writeln!(f, "  {:<8} {:>4} {}", slice.name, slice.value, bar(slice.value))?;
        }

        writeln!(f, "\nSentiment Breakdown")?;
        for slice in &self.sentiments {
            writeln!(f, "  {:<10} {:>4} {}", slice.name, slice.value, bar(slice.value))?;
        }

        writeln!(f, "\nRating Trend")?;
        for point in &self.trend {
            writeln!(f, "  {:<7} {:>2} {}", point.date, point.score, bar(point.score as usize))?;
        }

        writeln!(f, "\nTop Feedback")?;
        for theme in &self.top_feedback {
            writeln!(f, "  {:<43} {:>4}", theme.name, theme.count)?;
        }

        writeln!(f, "\nTurns Distribution")?;
        for turn in &self.turns {
            writeln!(f, "  {:<9} {:>4} {}", turn.label, turn.count, bar(turn.count))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationRecord, Summary, TopFeedback};
    use std::cell::RefCell;

    fn conversation(score: Option<u8>, saved_at: Option<&str>, turns: usize) -> ConversationRecord {
        ConversationRecord {
            filename: "conversation.json".into(),
            saved_at: saved_at.map(str::to_string),
            score,
            sentiment: None,
            requires_followup: None,
            conversation_complete: None,
            total_turns: turns,
            initial_transcription: None,
            final_transcription: None,
            final_response: None,
            initial_feedback_points: Vec::new(),
        }
    }

    fn summary_with(conversations: Vec<ConversationRecord>, top_feedback: Vec<TopFeedback>) -> AnalyticsSummary {
        AnalyticsSummary {
            summary: Summary {
                total_conversations: conversations.len(),
                avg_score: Some(7.4),
                median_score: Some(7.0),
                sentiment_breakdown: BTreeMap::from([("Negative".to_string(), 2), ("Positive".to_string(), 3)]),
                followup_required_pct: 40.0,
                avg_turns: 1.5,
                max_turns: 3,
                completed_pct: 100.0,
            },
            conversations,
            top_feedback,
        }
    }

    struct StubSource {
        calls: RefCell<Vec<RangeQuery>>,
        reply: Result<AnalyticsSummary, DashboardError>,
    }

    impl StubSource {
        fn new(reply: Result<AnalyticsSummary, DashboardError>) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                reply,
            }
        }
    }

    impl SummarySource for &StubSource {
        async fn fetch(&self, query: &RangeQuery) -> Result<AnalyticsSummary, DashboardError> {
            self.calls.borrow_mut().push(query.clone());
            self.reply.clone()
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn buckets_scores_into_high_medium_low() {
        let convs = [9, 7, 5, 10, 6]
            .into_iter()
            .map(|s| conversation(Some(s), None, 0))
            .collect();
        let view = DashboardView::build(&summary_with(convs, Vec::new()), "All time");
        let buckets: Vec<_> = view.ratings.iter().map(|s| (s.name.as_str(), s.value)).collect();
        assert_eq!(buckets, vec![("High", 2), ("Medium", 1), ("Low", 2)]);
    }

    #[test]
    fn missing_score_counts_as_low() {
        let view = DashboardView::build(&summary_with(vec![conversation(None, None, 0)], Vec::new()), "x");
        assert_eq!(view.ratings[2].value, 1);
    }

    #[test]
    fn keeps_top_eight_themes_with_truncated_labels() {
        let themes: Vec<TopFeedback> = (0..15)
            .map(|i| TopFeedback {
                text: format!("Theme {i:02} about the checkout flow being much slower than expected"),
                count: 15 - i,
            })
            .collect();
        let view = DashboardView::build(&summary_with(Vec::new(), themes), "x");

        assert_eq!(view.top_feedback.len(), TOP_THEMES);
        assert_eq!(view.top_feedback[0].count, 15);
        for bar in &view.top_feedback {
            assert!(bar.name.ends_with("..."));
            assert_eq!(bar.name.chars().count(), THEME_LABEL_CHARS + 3);
            assert!(bar.full.starts_with(bar.name.trim_end_matches("...")));
        }

        let short = truncate_label("Fast shipping");
        assert_eq!(short, "Fast shipping");
    }

    #[test]
    fn themes_are_ranked_by_count_whatever_the_backend_order() {
        let themes: Vec<TopFeedback> = (1..=15)
            .map(|count| TopFeedback {
                text: format!("Theme {count}"),
                count,
            })
            .collect();
        let view = DashboardView::build(&summary_with(Vec::new(), themes), "x");
        let counts: Vec<_> = view.top_feedback.iter().map(|bar| bar.count).collect();
        assert_eq!(counts, vec![15, 14, 13, 12, 11, 10, 9, 8]);

        let tied = vec![
            TopFeedback { text: "Slow".into(), count: 1 },
            TopFeedback { text: "Late".into(), count: 3 },
            TopFeedback { text: "Rude".into(), count: 1 },
        ];
        let view = DashboardView::build(&summary_with(Vec::new(), tied), "x");
        let names: Vec<_> = view.top_feedback.iter().map(|bar| bar.name.as_str()).collect();
        assert_eq!(names, vec!["Late", "Slow", "Rude"]);
    }

    #[test]
    fn sentiments_are_listed_by_count() {
        let view = DashboardView::build(&summary_with(Vec::new(), Vec::new()), "x");
        let slices: Vec<_> = view.sentiments.iter().map(|s| (s.name.as_str(), s.value)).collect();
        assert_eq!(slices, vec![("Positive", 3), ("Negative", 2)]);
    }

    #[test]
    fn trend_is_sorted_ascending_and_skips_undated() {
        let convs = vec![
            conversation(Some(8), Some("2025-01-07T09:00:00Z"), 0),
            conversation(None, Some("2025-01-05T09:00:00Z"), 0),
            conversation(Some(3), None, 0),
        ];
        let view = DashboardView::build(&summary_with(convs, Vec::new()), "x");
        let points: Vec<_> = view.trend.iter().map(|p| (p.date.as_str(), p.score)).collect();
        assert_eq!(points, vec![("Jan 5", 0), ("Jan 7", 8)]);
    }

    #[test]
    fn turn_histogram_is_sorted_with_plural_labels() {
        let convs = vec![
            conversation(Some(5), None, 2),
            conversation(Some(5), None, 0),
            conversation(Some(5), None, 1),
            conversation(Some(5), None, 2),
        ];
        let view = DashboardView::build(&summary_with(convs, Vec::new()), "x");
        let bars: Vec<_> = view.turns.iter().map(|t| (t.label.as_str(), t.count)).collect();
        assert_eq!(bars, vec![("0 turns", 1), ("1 turn", 1), ("2 turns", 2)]);
    }

    #[test]
    fn stat_cards_format_like_the_dashboard() {
        let view = DashboardView::build(&summary_with(Vec::new(), Vec::new()), "x");
        assert_eq!(view.stats[1].value, "7.4");
        assert_eq!(view.stats[1].trend, Some(Trend::Up));
        assert_eq!(view.stats[2].value, "40%");
        assert_eq!(view.stats[3].value, "1.5");

        let mut data = summary_with(Vec::new(), Vec::new());
        data.summary.avg_score = None;
        let view = DashboardView::build(&data, "x");
        assert_eq!(view.stats[1].value, "N/A");
        assert_eq!(view.stats[1].trend, Some(Trend::Down));
    }

    #[test]
    fn presets_resolve_relative_to_today() {
        let today = day(2025, 3, 31);
        let week = DateRange::Last7Days.resolve(today).unwrap();
        assert_eq!(week.start, Some(day(2025, 3, 25)));
        assert_eq!(week.label, "Last 7 days");

        let month = DateRange::Last30Days.resolve(today).unwrap();
        assert_eq!(month.start, Some(day(2025, 3, 2)));
        assert!(month.params().iter().all(|(k, _)| *k == "start_date"));

        let all = DateRange::AllTime.resolve(today).unwrap();
        assert!(all.params().is_empty());
    }

    #[test]
    fn custom_range_validation_never_reaches_the_network() {
        let stub = StubSource::new(Ok(summary_with(Vec::new(), Vec::new())));
        let mut dashboard = Dashboard::new(&stub);
        let today = day(2025, 3, 31);

        let inverted = DateRange::Custom {
            start: Some(day(2025, 3, 10)),
            end: Some(day(2025, 3, 1)),
        };
        assert_eq!(
            inverted.resolve(today).unwrap_err(),
            DashboardError::Validation("Invalid range".into())
        );
        tokio_test::block_on(dashboard.apply(&inverted, today));
        assert_eq!(dashboard.inline_error(), Some("Invalid range"));

        let missing = DateRange::Custom {
            start: Some(day(2025, 3, 10)),
            end: None,
        };
        tokio_test::block_on(dashboard.apply(&missing, today));
        assert_eq!(dashboard.inline_error(), Some("Both dates required"));

        assert!(stub.calls.borrow().is_empty());
        assert_eq!(dashboard.screen(), &DashboardScreen::Loading);
    }

    #[test]
    fn custom_range_sends_both_bounds() {
        let stub = StubSource::new(Ok(summary_with(Vec::new(), Vec::new())));
        let mut dashboard = Dashboard::new(&stub);
        let range = DateRange::Custom {
            start: Some(day(2025, 3, 1)),
            end: Some(day(2025, 3, 10)),
        };
        let screen = tokio_test::block_on(dashboard.apply(&range, day(2025, 3, 31)));
        let DashboardScreen::Ready(view) = screen else {
            panic!("expected a ready dashboard, got {screen:?}");
        };
        assert_eq!(view.range_label, "Custom: 2025-03-01 → 2025-03-10");

        let calls = stub.calls.borrow();
        assert_eq!(
            calls[0].params(),
            vec![("start_date", "2025-03-01".to_string()), ("end_date", "2025-03-10".to_string())]
        );
    }

    #[test]
    fn errors_show_message_and_retry_loads_all_time() {
        let stub = StubSource::new(Err(DashboardError::NoDataInRange));
        let mut dashboard = Dashboard::new(&stub);
        tokio_test::block_on(dashboard.apply(&DateRange::Last7Days, day(2025, 3, 31)));
        assert_eq!(
            dashboard.screen(),
            &DashboardScreen::Error {
                message: "No conversations found in the selected date range".into()
            }
        );

        tokio_test::block_on(dashboard.retry());
        assert_eq!(stub.calls.borrow().last(), Some(&RangeQuery::all_time()));
    }

    #[test]
    fn categorizes_backend_failures() {
        assert_eq!(
            categorize(404, Some(NONE_IN_RANGE_DETAIL.to_string())),
            DashboardError::NoDataInRange
        );
        assert_eq!(
            categorize(404, Some("No conversations found".to_string())),
            DashboardError::NoData
        );
        assert_eq!(
            categorize(500, Some("disk full".to_string())),
            DashboardError::Failed("disk full".into())
        );
        assert_eq!(categorize(502, None).user_message(), GENERIC_FAILURE);
        assert!(DashboardError::Unreachable("http://x".into())
            .user_message()
            .starts_with("Cannot reach"));
    }

    #[test]
    fn text_render_lists_every_section() {
        let convs = vec![conversation(Some(9), Some("2025-01-05T09:00:00Z"), 1)];
        let themes = vec![TopFeedback { text: "Fast shipping".into(), count: 1 }];
        let text = DashboardView::build(&summary_with(convs, themes), "Last 7 days").to_string();
        for section in ["Last 7 days", "Rating Distribution", "Sentiment Breakdown", "Rating Trend", "Top Feedback", "1 turn"] {
            assert!(text.contains(section), "missing {section}");
        }
    }
}
