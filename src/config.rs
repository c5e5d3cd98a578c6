//! Carga y gestión de configuración de la aplicación (Gemini + backend de analíticas).

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use url::Url;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Credencial de Gemini. Su ausencia sólo falla al enviar feedback.
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: Url,

    pub backend_url: Url,
    pub server_addr: String,

    pub conversations_dir: PathBuf,
    pub store_dir: PathBuf,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let gemini_api_key = env::var("GEMINI_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        let gemini_model =
            env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string());

        let gemini_base_url = parse_url(
            "GEMINI_BASE_URL",
            &env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_GEMINI_BASE_URL.to_string()),
        )?;
        let backend_url = parse_url(
            "BACKEND_URL",
            &env::var("BACKEND_URL").unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string()),
        )?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8000".to_string());

        let conversations_dir = env::var("CONVERSATIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("conversations"));

        let store_dir = env::var("STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_store_dir());

        Ok(Self {
            gemini_api_key,
            gemini_model,
            gemini_base_url,
            backend_url,
            server_addr,
            conversations_dir,
            store_dir,
        })
    }
}

#[cfg(test)]
impl AppConfig {
    /// Configuración aislada para tests: sin credencial y con URLs locales.
    pub fn for_tests(conversations_dir: impl Into<PathBuf>) -> Self {
        let local = Url::parse("http://127.0.0.1:9").expect("URL de test válida");
        Self {
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            gemini_base_url: local.clone(),
            backend_url: local,
            server_addr: "127.0.0.1:0".to_string(),
            conversations_dir: conversations_dir.into(),
            store_dir: PathBuf::from(".asklet-test"),
        }
    }
}

/// Directorio del almacén local: `<data_dir>/asklet`, o `./.asklet` si la
/// plataforma no expone uno.
pub fn default_store_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("asklet"))
        .unwrap_or_else(|| PathBuf::from(".asklet"))
}

fn parse_url(var: &str, raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).map_err(|e| anyhow!("Valor inválido en {var} ('{raw}'): {e}"))
}
