//! Cliente del servicio de análisis (Gemini) para el feedback por voz.
//!
//! Cada turno sube el audio, espera a que el fichero quede procesado y pide
//! una respuesta JSON con transcripción, sentimiento, puntos clave, réplica
//! conversacional y si hace falta otra pregunta. Los umbrales de decisión
//! viajan en el prompt; localmente sólo se mira `requiresFollowUp`.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::audio::AudioClip;
use crate::config::AppConfig;
use crate::models::{HistoryTurn, Role};

const FILE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const FILE_POLL_ATTEMPTS: u32 = 30;
const UPLOAD_DISPLAY_NAME: &str = "feedback-recording";

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("Gemini API key not found. Please set GEMINI_API_KEY in your environment variables.")]
    MissingCredential,
    #[error("Network error talking to the analysis service: {0}")]
    Network(String),
    #[error("Analysis service returned {status}: {message}")]
    Service { status: u16, message: String },
    #[error("Failed to parse JSON response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for FeedbackError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Respuesta estructurada esperada del servicio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub transcription: String,
    pub sentiment: String,
    #[serde(default)]
    pub feedback: Vec<String>,
    pub conversational_response: String,
    pub requires_follow_up: bool,
}

/// Datos de un turno que se envían al servicio.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisRequest<'a> {
    pub score: u8,
    pub first_turn: bool,
    pub history: &'a [HistoryTurn],
    pub clip: &'a AudioClip,
}

#[allow(async_fn_in_trait)]
pub trait FeedbackAnalyzer {
    async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisResult, FeedbackError>;
}

// ---------------------------------------------------------------------
// PARSEO DE LA RESPUESTA
// ---------------------------------------------------------------------

fn fenced_json_regex() -> &'static Regex {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    FENCED.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("regex de bloque JSON válida")
    })
}

/// Interpreta el texto devuelto por el modelo. Si no es JSON válido se busca
/// el primer bloque de código (```json ... ```) que contenga un objeto.
pub fn parse_analysis(raw: &str) -> Result<AnalysisResult, FeedbackError> {
    match serde_json::from_str::<AnalysisResult>(raw.trim()) {
        Ok(result) => Ok(result),
        Err(bare_err) => {
            let block = fenced_json_regex()
                .captures(raw)
                .and_then(|caps| caps.get(1))
                .ok_or_else(|| FeedbackError::MalformedResponse(bare_err.to_string()))?;
            debug!("Respuesta no era JSON puro; usando el bloque de código embebido");
            serde_json::from_str(block.as_str())
                .map_err(|e| FeedbackError::MalformedResponse(e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------
// PROMPTS
// ---------------------------------------------------------------------

const ANALYSIS_TASKS: &str = r#"1. Transcribe the user's audio feedback exactly.

2. Provide a single-word sentiment (e.g., "Positive", "Negative", "Frustrated", "Confused").

3. Extract the key feedback points or action items as a list of strings.

4. *Decide the Next Step:*

○ *IF score is 0-6 (Detractor):* The user is unhappy. Reply with empathy and ask a follow-up question to get more detail. Set requiresFollowUp to true.

○ *IF score is 7-8 (Passive) AND feedback is vague:* Ask a clarifying question. Set requiresFollowUp to true.

○ *IF score is 9-10 (Promoter) OR score is 7-8 and feedback is clear:* The user is satisfied. Just say thank you, do not ask a question. Set requiresFollowUp to false.

○ *IF audio is unclear:* Ask them to type their feedback instead. Set requiresFollowUp to true.

5. *Respond ONLY with a valid JSON object in this exact format:*

{
  "transcription": "...",
  "sentiment": "...",
  "feedback": ["..."],
  "conversationalResponse": "...",
  "requiresFollowUp": true
}"#;

pub fn first_turn_prompt(score: u8) -> String {
    format!(
        "You are a conversational customer feedback analyst. Your job is to analyze NPS \
(Net Promoter Score) feedback and decide the correct response.\n\n\
The user gave a score of: {score}/10\n\n\
Their audio feedback is attached.\n\n\
Instructions:\n\n{ANALYSIS_TASKS}"
    )
}

pub fn follow_up_prompt(score: u8, history: &[HistoryTurn]) -> String {
    let context = history
        .iter()
        .map(|turn| match turn.role {
            Role::User => format!("User: {}", turn.text),
            Role::Model => format!("Assistant: {}", turn.text),
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are a conversational customer feedback analyst. The user gave an NPS score of {score}/10.\n\n\
Previous conversation:\n{context}\n\n\
The user just provided additional audio feedback. Your tasks:\n\n{ANALYSIS_TASKS}"
    )
}

/// Marcador de texto que sustituye al audio del usuario en el historial.
pub fn user_turn_placeholder(score: u8, first_turn: bool) -> String {
    if first_turn {
        format!("NPS Score: {score}/10. Audio feedback provided.")
    } else {
        "Additional audio feedback provided.".to_string()
    }
}

/// Cuerpo de `generateContent`: historial previo (en turnos posteriores) y un
/// turno de usuario con el prompt y la referencia al fichero subido.
pub fn build_generate_request(
    request: &AnalysisRequest<'_>,
    file_uri: &str,
    mime_type: &str,
) -> serde_json::Value {
    let prompt = if request.first_turn {
        first_turn_prompt(request.score)
    } else {
        follow_up_prompt(request.score, request.history)
    };

    let mut contents: Vec<serde_json::Value> = Vec::new();
    if !request.first_turn {
        contents.extend(request.history.iter().map(|turn| {
            let role = match turn.role {
                Role::User => "user",
                Role::Model => "model",
            };
            json!({ "role": role, "parts": [{ "text": turn.text }] })
        }));
    }
    contents.push(json!({
        "role": "user",
        "parts": [
            { "text": prompt },
            { "fileData": { "mimeType": mime_type, "fileUri": file_uri } },
        ],
    }));

    json!({
        "contents": contents,
        "generationConfig": { "responseMimeType": "application/json" },
    })
}

// ---------------------------------------------------------------------
// CLIENTE GEMINI
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFile {
    name: String,
    uri: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: GeminiFile,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Analizador que habla con la API REST de Gemini.
#[derive(Debug, Clone)]
pub struct GeminiAnalyzer {
    http: Client,
    api_key: Option<String>,
    model: String,
    base_url: Url,
    poll_interval: Duration,
}

impl GeminiAnalyzer {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            http: Client::new(),
            api_key: cfg.gemini_api_key.clone(),
            model: cfg.gemini_model.clone(),
            base_url: cfg.gemini_base_url.clone(),
            poll_interval: FILE_POLL_INTERVAL,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, FeedbackError> {
        self.base_url
            .join(path)
            .map_err(|e| FeedbackError::Network(format!("URL inválida '{path}': {e}")))
    }

    async fn upload(&self, api_key: &str, clip: &AudioClip) -> Result<GeminiFile, FeedbackError> {
        // Subida reanudable en dos pasos: iniciar y enviar + finalizar.
        let start = self
            .http
            .post(self.endpoint("upload/v1beta/files")?)
            .header("x-goog-api-key", api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", clip.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", clip.mime_type.as_str())
            .json(&json!({ "file": { "display_name": UPLOAD_DISPLAY_NAME } }))
            .send()
            .await?;
        let start = ensure_success(start).await?;
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| FeedbackError::MalformedResponse("falta x-goog-upload-url".into()))?;

        let finish = self
            .http
            .post(upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(clip.bytes.clone())
            .send()
            .await?;
        let uploaded: UploadResponse = ensure_success(finish)
            .await?
            .json()
            .await
            .map_err(|e| FeedbackError::MalformedResponse(e.to_string()))?;
        info!("Audio subido como {}", uploaded.file.name);
        Ok(uploaded.file)
    }

    /// Consulta el estado del fichero hasta `FILE_POLL_ATTEMPTS` veces; el
    /// resultado de la última consulta también se evalúa.
    async fn wait_for_processing(&self, api_key: &str, file: GeminiFile) -> Result<GeminiFile, FeedbackError> {
        let mut current = file;
        let mut polls = 0;
        loop {
            let state = current.state.clone();
            match state.as_deref() {
                Some("PROCESSING") if polls < FILE_POLL_ATTEMPTS => {
                    polls += 1;
                    tokio::time::sleep(self.poll_interval).await;
                    let resp = self
                        .http
                        .get(self.endpoint(&format!("v1beta/{}", current.name))?)
                        .header("x-goog-api-key", api_key)
                        .send()
                        .await?;
                    current = ensure_success(resp)
                        .await?
                        .json()
                        .await
                        .map_err(|e| FeedbackError::MalformedResponse(e.to_string()))?;
                }
                Some("PROCESSING") => {
                    return Err(FeedbackError::Network(format!(
                        "El fichero {} sigue en proceso tras {FILE_POLL_ATTEMPTS} intentos",
                        current.name
                    )))
                }
                Some("FAILED") => {
                    return Err(FeedbackError::Service {
                        status: 422,
                        message: format!("Audio processing failed for {}", current.name),
                    })
                }
                _ => return Ok(current),
            }
        }
    }

    async fn generate(&self, api_key: &str, body: &serde_json::Value) -> Result<String, FeedbackError> {
        let url = self.endpoint(&format!("v1beta/models/{}:generateContent", self.model))?;
        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(body)
            .send()
            .await?;
        let parsed: GenerateResponse = ensure_success(resp)
            .await?
            .json()
            .await
            .map_err(|e| FeedbackError::MalformedResponse(e.to_string()))?;

        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(FeedbackError::MalformedResponse("respuesta vacía del modelo".into()));
        }
        Ok(text)
    }
}

impl FeedbackAnalyzer for GeminiAnalyzer {
    async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisResult, FeedbackError> {
        // La credencial se comprueba antes de cualquier llamada de red.
        let api_key = self.api_key.as_deref().ok_or(FeedbackError::MissingCredential)?;

        let uploaded = self.upload(api_key, request.clip).await?;
        let file = self.wait_for_processing(api_key, uploaded).await?;
        let mime_type = file.mime_type.as_deref().unwrap_or(&request.clip.mime_type);

        let body = build_generate_request(&request, &file.uri, mime_type);
        let raw = self.generate(api_key, &body).await?;

        parse_analysis(&raw).map_err(|e| {
            warn!("No se pudo interpretar la respuesta de Gemini: {e}. Respuesta: '{raw}'");
            e
        })
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, FeedbackError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        });
    Err(FeedbackError::Service {
        status: status.as_u16(),
        message: if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            format!("credential rejected ({message})")
        } else {
            message
        },
    })
}
