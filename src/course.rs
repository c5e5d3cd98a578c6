//! Demo del curso online: acceso del propietario con credencial fija,
//! reproductor de módulos con avance automático y certificado final.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info};

use crate::store::KeyValueStore;

pub const DEMO_EMAIL: &str = "owner@course.com";
pub const DEMO_PASSWORD: &str = "course123";
pub const LOGGED_IN_KEY: &str = "courseOwnerLoggedIn";
pub const EMAIL_KEY: &str = "courseOwnerEmail";

pub const AUTO_ADVANCE_DELAY: Duration = Duration::from_secs(2);
/// Espera antes de ofrecer la valoración en la página de finalización.
pub const FEEDBACK_PROMPT_DELAY: Duration = Duration::from_millis(1500);

pub const COURSE_TITLE: &str = "Introduction to Web Development";
pub const INSTRUCTOR: &str = "Sarah Johnson";
pub const COMPLETION_PATH: &str = "/shop/complete?business_category=online_course&course_id=webdev101";

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Invalid email or password. Use: owner@course.com / course123")]
    InvalidCredentials,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Comprueba la credencial de demo y deja la sesión marcada en el almacén.
pub fn login<S: KeyValueStore + ?Sized>(store: &S, email: &str, password: &str) -> Result<(), LoginError> {
    if email.trim() != DEMO_EMAIL || password != DEMO_PASSWORD {
        debug!("Intento de acceso rechazado para {email}");
        return Err(LoginError::InvalidCredentials);
    }
    store.set(LOGGED_IN_KEY, "true")?;
    store.set(EMAIL_KEY, DEMO_EMAIL)?;
    info!("Propietario del curso autenticado");
    Ok(())
}

/// Email de la sesión activa, si la hay.
pub fn logged_in_email<S: KeyValueStore + ?Sized>(store: &S) -> Result<Option<String>> {
    if store.get(LOGGED_IN_KEY)?.as_deref() != Some("true") {
        return Ok(None);
    }
    store.get(EMAIL_KEY)
}

pub fn logout<S: KeyValueStore + ?Sized>(store: &S) -> Result<()> {
    store.set(LOGGED_IN_KEY, "false")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CourseModule {
    pub number: usize,
    pub title: &'static str,
    pub video_url: &'static str,
}

pub const MODULES: [CourseModule; 4] = [
    CourseModule {
        number: 1,
        title: "HTML Basics",
        video_url: "https://commondatastorage.googleapis.com/gtv-videos-bucket/sample/ForBiggerBlazes.mp4",
    },
    CourseModule {
        number: 2,
        title: "CSS Styling",
        video_url: "https://commondatastorage.googleapis.com/gtv-videos-bucket/sample/ForBiggerEscapes.mp4",
    },
    CourseModule {
        number: 3,
        title: "JavaScript Fundamentals",
        video_url: "https://commondatastorage.googleapis.com/gtv-videos-bucket/sample/ForBiggerFun.mp4",
    },
    CourseModule {
        number: 4,
        title: "Building Website",
        video_url: "https://commondatastorage.googleapis.com/gtv-videos-bucket/sample/ForBiggerJoyrides.mp4",
    },
];

/// Reproductor del curso. Abrir un módulo ya cuenta como visto.
#[derive(Debug, Clone)]
pub struct CoursePlayer {
    current: usize,
    watched: BTreeSet<usize>,
    playing: bool,
}

impl Default for CoursePlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl CoursePlayer {
    pub fn new() -> Self {
        let mut player = Self {
            current: 1,
            watched: BTreeSet::new(),
            playing: false,
        };
        player.open(1);
        player
    }

    pub fn current(&self) -> CourseModule {
        MODULES[self.current - 1]
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn watched(&self) -> impl Iterator<Item = usize> + '_ {
        self.watched.iter().copied()
    }

    /// Porcentaje de módulos vistos, redondeado.
    pub fn progress_pct(&self) -> u32 {
        (self.watched.len() as f64 / MODULES.len() as f64 * 100.0).round() as u32
    }

    pub fn is_completed(&self) -> bool {
        MODULES.iter().all(|m| self.watched.contains(&m.number))
    }

    /// Ruta de la página de finalización; sólo disponible con el curso completo.
    pub fn completion_path(&self) -> Option<&'static str> {
        self.is_completed().then_some(COMPLETION_PATH)
    }

    fn open(&mut self, number: usize) {
        self.current = number;
        self.playing = false;
        if self.watched.insert(number) {
            debug!("Módulo {number} visto ({}%)", self.progress_pct());
        }
    }

    pub fn toggle_play(&mut self) {
        self.playing = !self.playing;
        if self.playing {
            self.watched.insert(self.current);
        }
    }

    pub fn previous(&mut self) -> bool {
        if self.current > 1 {
            self.open(self.current - 1);
            true
        } else {
            false
        }
    }

    pub fn next(&mut self) -> bool {
        if self.current < MODULES.len() {
            self.open(self.current + 1);
            true
        } else {
            false
        }
    }

    /// Fin del vídeo actual: pasa al siguiente módulo tras
    /// `AUTO_ADVANCE_DELAY`, salvo en el último.
    pub async fn video_ended(&mut self) {
        self.playing = false;
        self.watched.insert(self.current);
        if self.current < MODULES.len() {
            tokio::time::sleep(AUTO_ADVANCE_DELAY).await;
            self.next();
        } else {
            info!("Último módulo terminado, curso completo: {}", self.is_completed());
        }
    }
}

/// Certificado mostrado en la página de finalización.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub course_title: String,
    pub student_name: String,
    pub instructor: String,
    pub issued_on: NaiveDate,
    pub business_category: String,
    pub course_id: String,
}

impl Certificate {
    /// Construye el certificado a partir de la query de la ruta de
    /// finalización; los parámetros que faltan toman sus valores por defecto.
    pub fn from_query(query: &str, issued_on: NaiveDate) -> Self {
        let mut business_category = None;
        let mut course_id = None;
        for (key, value) in url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            match key.as_ref() {
                "business_category" if !value.is_empty() => business_category = Some(value.into_owned()),
                "course_id" if !value.is_empty() => course_id = Some(value.into_owned()),
                _ => {}
            }
        }
        Self {
            course_title: COURSE_TITLE.to_string(),
            student_name: "Student Name".to_string(),
            instructor: INSTRUCTOR.to_string(),
            issued_on,
            business_category: business_category.unwrap_or_else(|| "online_course".to_string()),
            course_id: course_id.unwrap_or_else(|| "webdev101".to_string()),
        }
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Certificate of Completion")?;
        writeln!(f, "This certifies that")?;
        writeln!(f, "  {}", self.student_name)?;
        writeln!(f, "has successfully completed the course")?;
        writeln!(f, "  {}", self.course_title)?;
        writeln!(f, "{}", self.issued_on.format("%B %-d, %Y"))?;
        write!(f, "{}, Course Instructor", self.instructor)
    }
}
