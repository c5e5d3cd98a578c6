//! Controlador de la conversación de valoración.
//!
//! Flujo: estrellas → puntuación NPS → grabación → análisis → (otra ronda o
//! fin). Estados: Idle, Recording, Processing, AwaitingNextTurn, Ended.
//!
//! Al terminar (por decisión del servicio o manualmente) se muestra el
//! agradecimiento y, pasado `THANK_YOU_DELAY`, todo el estado vuelve a los
//! valores iniciales. Cada nueva valoración incrementa la generación de la
//! sesión; un reinicio programado sólo se aplica si la generación no cambió.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::audio::{AudioClip, AudioSource, CaptureError, RecordingTimer};
use crate::llm::{user_turn_placeholder, AnalysisRequest, AnalysisResult, FeedbackAnalyzer, FeedbackError};
use crate::models::{AudioRecording, FeedbackEntry, HistoryTurn};
use crate::rating::StarRating;
use crate::store::{append_record, KeyValueStore, AUDIO_KEY, FEEDBACK_KEY};

pub const THANK_YOU_DELAY: Duration = Duration::from_secs(3);
pub const OPENING_QUESTION: &str = "What was the experience like?";
pub const THANK_YOU_MESSAGE: &str = "Thanks for sharing, it's great to know we're on the right track!";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("Failed to submit feedback: {0}. Please try again.")]
    Submission(#[from] FeedbackError),
    #[error("{0}")]
    InvalidState(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Recording,
    Processing,
    AwaitingNextTurn,
    Ended,
}

/// Estado visible de la conversación en curso.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    pub rating: Option<StarRating>,
    pub show_question: bool,
    pub is_recording: bool,
    pub recording_seconds: u32,
    pub is_processing: bool,
    pub is_first_turn: bool,
    pub ended: bool,
    pub show_thank_you: bool,
    /// Pregunta o réplica que se muestra al usuario.
    pub prompt: String,
    /// Turnos previos enviados como contexto al servicio.
    pub history: Vec<HistoryTurn>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            rating: None,
            show_question: false,
            is_recording: false,
            recording_seconds: 0,
            is_processing: false,
            is_first_turn: true,
            ended: false,
            show_thank_you: false,
            prompt: String::new(),
            history: Vec::new(),
        }
    }
}

impl ConversationState {
    pub fn phase(&self) -> Phase {
        if self.is_recording {
            Phase::Recording
        } else if self.is_processing {
            Phase::Processing
        } else if self.ended {
            Phase::Ended
        } else if self.show_question && self.rating.is_some() {
            Phase::AwaitingNextTurn
        } else {
            Phase::Idle
        }
    }

    pub fn nps_score(&self) -> Option<u8> {
        self.rating.map(StarRating::nps_score)
    }
}

/// Resultado de un turno enviado con éxito.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// El servicio pide otra respuesta; el panel sigue abierto.
    FollowUp(AnalysisResult),
    /// Conversación terminada; el reinicio ya está programado.
    Completed(AnalysisResult),
}

impl TurnOutcome {
    pub fn analysis(&self) -> &AnalysisResult {
        match self {
            Self::FollowUp(analysis) | Self::Completed(analysis) => analysis,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: ConversationState,
    generation: u64,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct FeedbackSession<A, S> {
    shared: Arc<Mutex<Shared>>,
    analyzer: A,
    store: S,
    timer: Option<RecordingTimer>,
    pending_reset: Option<JoinHandle<()>>,
    reset_delay: Duration,
}

impl<A, S> FeedbackSession<A, S>
where
    A: FeedbackAnalyzer,
    S: KeyValueStore,
{
    pub fn new(analyzer: A, store: S) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            analyzer,
            store,
            timer: None,
            pending_reset: None,
            reset_delay: THANK_YOU_DELAY,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn snapshot(&self) -> ConversationState {
        lock(&self.shared).state.clone()
    }

    pub fn phase(&self) -> Phase {
        lock(&self.shared).state.phase()
    }

    pub fn recording_seconds(&self) -> u32 {
        lock(&self.shared).state.recording_seconds
    }

    /// Clic en una estrella: fija la puntuación, abre la pregunta y descarta
    /// cualquier conversación anterior.
    pub fn select_rating(&mut self, rating: StarRating) {
        let mut shared = lock(&self.shared);
        shared.generation += 1;
        let state = &mut shared.state;
        state.rating = Some(rating);
        state.show_question = true;
        state.show_thank_you = false;
        state.prompt = OPENING_QUESTION.to_string();
        state.is_first_turn = true;
        state.ended = false;
        state.history.clear();
        info!(
            "Valoración {} → NPS {}/10 ({})",
            rating,
            rating.nps_score(),
            rating.category()
        );
    }

    pub fn start_recording<R: AudioSource + ?Sized>(&mut self, source: &mut R) -> Result<(), SessionError> {
        {
            let shared = lock(&self.shared);
            let state = &shared.state;
            if state.rating.is_none() || !state.show_question {
                return Err(SessionError::InvalidState("Select a star rating first"));
            }
            if state.is_recording {
                return Err(SessionError::InvalidState("Already recording"));
            }
            if state.is_processing {
                return Err(SessionError::InvalidState("Still processing the previous answer"));
            }
        }

        // Si el dispositivo falla el estado queda intacto.
        source.start().map_err(|e| {
            error!("No se pudo acceder al micrófono: {e}");
            e
        })?;

        {
            let mut shared = lock(&self.shared);
            shared.state.is_recording = true;
            shared.state.recording_seconds = 0;
        }

        let shared = Arc::clone(&self.shared);
        self.timer = Some(RecordingTimer::start(move || {
            lock(&shared).state.recording_seconds += 1;
        }));
        debug!("Grabación iniciada");
        Ok(())
    }

    /// Detiene la grabación, guarda el audio en local y lo envía a analizar.
    pub async fn stop_recording<R: AudioSource + ?Sized>(
        &mut self,
        source: &mut R,
    ) -> Result<TurnOutcome, SessionError> {
        let rating = {
            let shared = lock(&self.shared);
            if !shared.state.is_recording {
                return Err(SessionError::InvalidState("No recording in progress"));
            }
            shared.state.rating
        };

        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        lock(&self.shared).state.is_recording = false;

        let clip = source.stop()?;
        if let Some(rating) = rating {
            self.persist_audio(&clip, rating);
        }
        self.submit(clip).await
    }

    /// Envía un audio ya grabado junto con el historial de la conversación.
    /// Si falla, la conversación queda como estaba para reintentar a mano.
    pub async fn submit(&mut self, clip: AudioClip) -> Result<TurnOutcome, SessionError> {
        if clip.is_empty() {
            return Err(CaptureError::Empty.into());
        }
        let (rating, first_turn, history) = {
            let mut shared = lock(&self.shared);
            let state = &mut shared.state;
            let rating = match state.rating {
                Some(rating) if state.show_question => rating,
                _ => return Err(SessionError::InvalidState("Select a star rating first")),
            };
            if state.is_processing {
                return Err(SessionError::InvalidState("Still processing the previous answer"));
            }
            state.is_processing = true;
            (rating, state.is_first_turn, state.history.clone())
        };

        let score = rating.nps_score();
        let request = AnalysisRequest {
            score,
            first_turn,
            history: &history,
            clip: &clip,
        };
        let analysis = match self.analyzer.analyze(request).await {
            Ok(analysis) => analysis,
            Err(e) => {
                lock(&self.shared).state.is_processing = false;
                error!("Error enviando el feedback: {e}");
                return Err(e.into());
            }
        };

        let entry = FeedbackEntry::from_analysis(rating, &analysis, Utc::now());
        if let Err(e) = append_record(&self.store, FEEDBACK_KEY, &entry) {
            error!("Error guardando el feedback en el almacén local: {e:#}");
        }
        info!(
            "Turno analizado: sentimiento={}, seguimiento={}",
            analysis.sentiment, analysis.requires_follow_up
        );

        {
            let mut shared = lock(&self.shared);
            let state = &mut shared.state;
            state.history.push(HistoryTurn::user(user_turn_placeholder(score, first_turn)));
            state.history.push(HistoryTurn::model(analysis.conversational_response.clone()));
            state.prompt = analysis.conversational_response.clone();
            state.is_processing = false;
            if analysis.requires_follow_up {
                state.is_first_turn = false;
            }
        }

        if analysis.requires_follow_up {
            Ok(TurnOutcome::FollowUp(analysis))
        } else {
            self.finish();
            Ok(TurnOutcome::Completed(analysis))
        }
    }

    /// Fin manual; sólo disponible tras el primer turno.
    pub fn end_conversation(&mut self) -> Result<(), SessionError> {
        {
            let shared = lock(&self.shared);
            let state = &shared.state;
            if state.rating.is_none() || state.is_first_turn || state.ended {
                return Err(SessionError::InvalidState(
                    "Record at least one answer before ending the conversation",
                ));
            }
            if state.is_recording || state.is_processing {
                return Err(SessionError::InvalidState("Wait for the current answer to finish"));
            }
        }
        info!("Conversación terminada manualmente");
        self.finish();
        Ok(())
    }

    /// Espera a que se aplique (o descarte) el reinicio pendiente.
    pub async fn wait_for_reset(&mut self) {
        if let Some(handle) = self.pending_reset.take() {
            if let Err(e) = handle.await {
                error!("La tarea de reinicio terminó de forma inesperada: {e}");
            }
        }
    }

    fn finish(&mut self) {
        let generation = {
            let mut shared = lock(&self.shared);
            let state = &mut shared.state;
            state.ended = true;
            state.show_thank_you = true;
            state.show_question = false;
            shared.generation
        };

        let shared = Arc::clone(&self.shared);
        let delay = self.reset_delay;
        self.pending_reset = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut guard = lock(&shared);
            if guard.generation == generation {
                guard.state = ConversationState::default();
                debug!("Estado de la conversación reiniciado");
            } else {
                debug!("Reinicio descartado: hay una valoración más reciente");
            }
        }));
    }

    fn persist_audio(&self, clip: &AudioClip, rating: StarRating) {
        let record = AudioRecording {
            audio_data: clip.to_data_url(),
            timestamp: Utc::now(),
            rating_stars: rating,
        };
        match append_record(&self.store, AUDIO_KEY, &record) {
            Ok(count) => debug!("Audio guardado en local ({count} grabaciones)"),
            Err(e) => error!("Error guardando el audio en el almacén local: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{load_records, MemoryStore};
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    struct SeenRequest {
        score: u8,
        first_turn: bool,
        history_len: usize,
    }

    #[derive(Default)]
    struct ScriptedAnalyzer {
        replies: Mutex<VecDeque<Result<AnalysisResult, FeedbackError>>>,
        seen: Mutex<Vec<SeenRequest>>,
    }

    impl ScriptedAnalyzer {
        fn with(replies: Vec<Result<AnalysisResult, FeedbackError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::default(),
            }
        }

        fn seen(&self) -> Vec<SeenRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl FeedbackAnalyzer for ScriptedAnalyzer {
        async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisResult, FeedbackError> {
            self.seen.lock().unwrap().push(SeenRequest {
                score: request.score,
                first_turn: request.first_turn,
                history_len: request.history.len(),
            });
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FeedbackError::Network("no scripted reply".into())))
        }
    }

    impl FeedbackAnalyzer for &ScriptedAnalyzer {
        async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisResult, FeedbackError> {
            (**self).analyze(request).await
        }
    }

    struct FakeMic {
        fail: bool,
        started: bool,
    }

    impl FakeMic {
        fn working() -> Self {
            Self { fail: false, started: false }
        }
    }

    impl AudioSource for FakeMic {
        fn start(&mut self) -> Result<(), CaptureError> {
            if self.fail {
                return Err(CaptureError::Unavailable("permission denied".into()));
            }
            self.started = true;
            Ok(())
        }

        fn stop(&mut self) -> Result<AudioClip, CaptureError> {
            if !std::mem::take(&mut self.started) {
                return Err(CaptureError::NotStarted);
            }
            Ok(AudioClip::new(b"fake-webm".to_vec(), "audio/webm"))
        }
    }

    fn reply(text: &str, follow_up: bool) -> AnalysisResult {
        AnalysisResult {
            transcription: "It was slow".into(),
            sentiment: (if follow_up { "Frustrated" } else { "Positive" }).to_string(),
            feedback: vec!["Slow checkout".into()],
            conversational_response: text.into(),
            requires_follow_up: follow_up,
        }
    }

    fn stars(n: u8) -> StarRating {
        StarRating::try_from(n).unwrap()
    }

    #[tokio::test]
    async fn empty_clip_is_rejected_without_calling_the_analyzer() {
        let analyzer = ScriptedAnalyzer::with(vec![Ok(reply("unused", false))]);
        let mut session = FeedbackSession::new(&analyzer, MemoryStore::default());
        session.select_rating(stars(3));

        let err = session.submit(AudioClip::new(Vec::new(), "audio/webm")).await.unwrap_err();
        assert!(matches!(err, SessionError::Capture(CaptureError::Empty)));
        assert!(analyzer.seen().is_empty());
        assert_eq!(session.phase(), Phase::AwaitingNextTurn);
    }

    #[tokio::test(start_paused = true)]
    async fn two_turn_conversation_ends_and_resets_after_delay() {
        let analyzer = ScriptedAnalyzer::with(vec![
            Ok(reply("Sorry to hear that. What was slow?", true)),
            Ok(reply("Thanks, we've noted it.", false)),
        ]);
        let mut session = FeedbackSession::new(&analyzer, MemoryStore::default());
        let mut mic = FakeMic::working();

        session.select_rating(stars(2));
        assert_eq!(session.snapshot().nps_score(), Some(4));
        assert_eq!(session.phase(), Phase::AwaitingNextTurn);

        session.start_recording(&mut mic).unwrap();
        assert_eq!(session.phase(), Phase::Recording);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(session.recording_seconds(), 2);

        let first = session.stop_recording(&mut mic).await.unwrap();
        assert!(matches!(first, TurnOutcome::FollowUp(_)));
        let state = session.snapshot();
        assert!(state.show_question);
        assert!(!state.is_first_turn);
        assert_eq!(state.prompt, "Sorry to hear that. What was slow?");
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].text, "NPS Score: 4/10. Audio feedback provided.");

        session.start_recording(&mut mic).unwrap();
        let second = session.stop_recording(&mut mic).await.unwrap();
        assert!(matches!(second, TurnOutcome::Completed(_)));
        let state = session.snapshot();
        assert!(state.show_thank_you);
        assert!(state.ended);
        assert!(!state.show_question);
        assert_eq!(state.phase(), Phase::Ended);

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert!(session.snapshot().show_thank_you);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.snapshot(), ConversationState::default());
        assert_eq!(session.phase(), Phase::Idle);

        assert_eq!(
            analyzer.seen(),
            vec![
                SeenRequest { score: 4, first_turn: true, history_len: 0 },
                SeenRequest { score: 4, first_turn: false, history_len: 2 },
            ]
        );

        let feedback: Vec<FeedbackEntry> = load_records(session.store(), FEEDBACK_KEY).unwrap();
        assert_eq!(feedback.len(), 2);
        assert_eq!(feedback[0].nps_score, 4);
        let audio: Vec<AudioRecording> = load_records(session.store(), AUDIO_KEY).unwrap();
        assert_eq!(audio.len(), 2);
        assert!(audio[0].audio_data.starts_with("data:audio/webm;base64,"));
    }

    #[tokio::test(start_paused = true)]
    async fn no_follow_up_on_first_turn_reaches_thank_you_then_initial_state() {
        let analyzer = ScriptedAnalyzer::with(vec![Ok(reply("That's wonderful to hear!", false))]);
        let mut session = FeedbackSession::new(&analyzer, MemoryStore::default());

        session.select_rating(stars(5));
        let outcome = session
            .submit(AudioClip::new(vec![1, 2], "audio/webm"))
            .await
            .unwrap();
        assert_eq!(outcome.analysis().conversational_response, "That's wonderful to hear!");
        assert!(session.snapshot().show_thank_you);

        session.wait_for_reset().await;
        assert_eq!(session.snapshot(), ConversationState::default());
    }

    #[tokio::test]
    async fn failed_submission_keeps_conversation_open() {
        let analyzer = ScriptedAnalyzer::with(vec![Err(FeedbackError::MissingCredential)]);
        let mut session = FeedbackSession::new(&analyzer, MemoryStore::default());
        let mut mic = FakeMic::working();

        session.select_rating(stars(3));
        session.start_recording(&mut mic).unwrap();
        let err = session.stop_recording(&mut mic).await.unwrap_err();
        assert!(matches!(err, SessionError::Submission(FeedbackError::MissingCredential)));

        let state = session.snapshot();
        assert!(state.show_question);
        assert!(state.is_first_turn);
        assert!(!state.ended);
        assert!(!state.is_processing);
        assert_eq!(state.phase(), Phase::AwaitingNextTurn);

        // El audio se guarda aunque el envío falle.
        let audio: Vec<AudioRecording> = load_records(session.store(), AUDIO_KEY).unwrap();
        assert_eq!(audio.len(), 1);
        let feedback: Vec<FeedbackEntry> = load_records(session.store(), FEEDBACK_KEY).unwrap();
        assert!(feedback.is_empty());
    }

    #[tokio::test]
    async fn microphone_failure_leaves_state_untouched() {
        let analyzer = ScriptedAnalyzer::default();
        let mut session = FeedbackSession::new(&analyzer, MemoryStore::default());
        session.select_rating(stars(4));
        let before = session.snapshot();

        let mut broken = FakeMic { fail: true, started: false };
        let err = session.start_recording(&mut broken).unwrap_err();
        assert!(matches!(err, SessionError::Capture(CaptureError::Unavailable(_))));
        assert_eq!(session.snapshot(), before);
    }

    #[tokio::test]
    async fn recording_requires_a_rating() {
        let analyzer = ScriptedAnalyzer::default();
        let mut session = FeedbackSession::new(&analyzer, MemoryStore::default());
        let mut mic = FakeMic::working();
        assert!(matches!(
            session.start_recording(&mut mic),
            Err(SessionError::InvalidState(_))
        ));
        assert!(matches!(
            session.stop_recording(&mut mic).await,
            Err(SessionError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_end_only_after_first_turn() {
        let analyzer = ScriptedAnalyzer::with(vec![Ok(reply("Could you say more?", true))]);
        let mut session = FeedbackSession::new(&analyzer, MemoryStore::default());

        session.select_rating(stars(4));
        assert!(session.end_conversation().is_err());

        session.submit(AudioClip::new(vec![7], "audio/webm")).await.unwrap();
        session.end_conversation().unwrap();
        assert!(session.snapshot().show_thank_you);

        tokio::time::sleep(THANK_YOU_DELAY + Duration::from_millis(10)).await;
        assert_eq!(session.snapshot(), ConversationState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn new_rating_during_thank_you_window_wins_over_reset() {
        let analyzer = ScriptedAnalyzer::with(vec![Ok(reply("Thank you!", false))]);
        let mut session = FeedbackSession::new(&analyzer, MemoryStore::default());

        session.select_rating(stars(5));
        session.submit(AudioClip::new(vec![1], "audio/webm")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        session.select_rating(stars(1));
        session.wait_for_reset().await;

        let state = session.snapshot();
        assert_eq!(state.rating, Some(stars(1)));
        assert!(state.show_question);
        assert_eq!(state.prompt, OPENING_QUESTION);
    }

    #[tokio::test]
    async fn selecting_a_rating_clears_previous_transcript() {
        let analyzer = ScriptedAnalyzer::with(vec![Ok(reply("Tell me more", true))]);
        let mut session = FeedbackSession::new(&analyzer, MemoryStore::default());

        session.select_rating(stars(2));
        session.submit(AudioClip::new(vec![1], "audio/webm")).await.unwrap();
        assert_eq!(session.snapshot().history.len(), 2);

        session.select_rating(stars(3));
        let state = session.snapshot();
        assert!(state.history.is_empty());
        assert!(state.is_first_turn);
        assert_eq!(state.nps_score(), Some(6));
    }
}
