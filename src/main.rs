// Módulos de la aplicación
mod analytics;
mod api;
mod app_state;
mod audio;
mod config;
mod conversation;
mod course;
mod dashboard;
mod llm;
mod mock_data;
mod models;
mod rating;
mod store;

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::analytics::{AnalyticsReport, TOP_FEEDBACK_LIMIT};
use crate::app_state::AppState;
use crate::audio::{AudioSource, FileAudioSource};
use crate::config::AppConfig;
use crate::conversation::{FeedbackSession, Phase, SessionError, TurnOutcome, THANK_YOU_MESSAGE};
use crate::course::CoursePlayer;
use crate::dashboard::{Dashboard, DashboardClient, DashboardScreen, DateRange};
use crate::llm::GeminiAnalyzer;
use crate::mock_data::SeedProfile;
use crate::models::{AudioRecording, FeedbackEntry};
use crate::rating::StarRating;
use crate::store::{load_records, FileStore, AUDIO_KEY, FEEDBACK_KEY};

#[derive(Parser)]
#[command(name = "asklet", version, about = "Valoraciones por voz con análisis Gemini y dashboard de analíticas")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Arranca el servidor de analíticas (GET /analytics/summary).
    Serve {
        #[arg(long)]
        addr: Option<String>,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Una conversación de valoración: estrellas + respuestas de audio.
    Rate {
        #[arg(long)]
        stars: u8,
        /// Ficheros de audio, uno por turno.
        #[arg(long = "audio", num_args = 1..)]
        audio: Vec<PathBuf>,
        /// Graba del micrófono (requiere la feature `microphone`).
        #[arg(long)]
        microphone: bool,
        /// Índice del dispositivo de entrada.
        #[arg(long)]
        device: Option<usize>,
    },
    /// Muestra el dashboard de analíticas del backend (últimos 30 días por defecto).
    Dashboard {
        #[arg(long, value_enum)]
        range: Option<RangeArg>,
        /// Con `--start`/`--end` el rango es personalizado.
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Resumen offline de las conversaciones guardadas.
    Analyze {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, default_value_t = TOP_FEEDBACK_LIMIT)]
        top: usize,
        /// CSV con una fila por conversación (por defecto `conversation_report_<fecha>.csv`).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Exporta además el informe completo en JSON.
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Genera conversaciones de prueba.
    Seed {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        count: Option<usize>,
        /// Conversaciones del curso online en `courseconversations/`.
        #[arg(long)]
        course: bool,
    },
    /// Lista el feedback y las grabaciones guardadas en local.
    History,
    /// Demo del curso online.
    Course {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// Cierra la sesión guardada y termina.
        #[arg(long)]
        logout: bool,
        /// Maneja el reproductor a mano en lugar del avance automático.
        #[arg(long)]
        interactive: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RangeArg {
    #[value(name = "7d")]
    Last7,
    #[value(name = "30d")]
    Last30,
    All,
    Custom,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 2. Cargar configuración
    let cfg = AppConfig::from_env().context("Error al cargar la configuración")?;

    match Cli::parse().command {
        Command::Serve { addr, dir } => serve(cfg, addr, dir).await,
        Command::Rate { stars, audio, microphone, device } => rate(cfg, stars, audio, microphone, device).await,
        Command::Dashboard { range, start, end } => show_dashboard(cfg, range, start, end).await,
        Command::Analyze { dir, top, output, json } => analyze(cfg, dir, top, output, json),
        Command::Seed { dir, count, course } => seed(cfg, dir, count, course),
        Command::History => history(cfg),
        Command::Course {
            email,
            password,
            logout,
            interactive,
        } => course_demo(cfg, email, password, logout, interactive).await,
    }
}

async fn serve(mut cfg: AppConfig, addr: Option<String>, dir: Option<PathBuf>) -> Result<()> {
    if let Some(addr) = addr {
        cfg.server_addr = addr;
    }
    if let Some(dir) = dir {
        cfg.conversations_dir = dir;
    }

    let app_state = AppState::new(cfg.clone());
    let app = api::create_router(app_state).layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo abrir {}", cfg.server_addr))?;
    info!(
        "🚀 Servidor de analíticas en http://{} (conversaciones en {})",
        cfg.server_addr,
        cfg.conversations_dir.display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("No se pudo escuchar Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}

async fn read_line(prompt: &str) -> Result<String> {
    println!("{prompt}");
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(line.trim().to_string())
}

fn open_sources(audio: Vec<PathBuf>, microphone: bool, device: Option<usize>) -> Result<Vec<Box<dyn AudioSource>>> {
    if microphone {
        #[cfg(feature = "microphone")]
        {
            return Ok(vec![Box::new(crate::audio::MicrophoneSource::new(device)) as Box<dyn AudioSource>]);
        }
        #[cfg(not(feature = "microphone"))]
        {
            let _ = device;
            bail!("Este binario se compiló sin micrófono; usa --features microphone o --audio");
        }
    }
    if audio.is_empty() {
        bail!("Indica al menos un fichero con --audio");
    }
    Ok(audio
        .into_iter()
        .map(|path| Box::new(FileAudioSource::new(path)) as Box<dyn AudioSource>)
        .collect())
}

async fn rate(cfg: AppConfig, stars: u8, audio: Vec<PathBuf>, microphone: bool, device: Option<usize>) -> Result<()> {
    let rating = StarRating::try_from(stars)?;
    let mut sources = open_sources(audio, microphone, device)?;
    let store = FileStore::open(&cfg.store_dir)?;
    let mut session = FeedbackSession::new(GeminiAnalyzer::from_config(&cfg), store);

    session.select_rating(rating);
    let state = session.snapshot();
    println!("{} → {}/10", rating, state.nps_score().unwrap_or_default());
    println!("💬 {}", state.prompt);

    let mut turn = 0usize;
    let mut completed = false;
    loop {
        // Con micrófono la misma fuente sirve para todos los turnos.
        let index = if microphone { 0 } else { turn };
        let Some(source) = sources.get_mut(index) else {
            break;
        };

        if microphone && turn > 0 {
            let answer = read_line("Enter para responder, 'fin' para terminar").await?;
            if answer.eq_ignore_ascii_case("fin") {
                break;
            }
        }

        if let Err(e) = session.start_recording(source.as_mut()) {
            eprintln!("⚠️ {e}");
            return Ok(());
        }
        if microphone {
            read_line("🎙️ Grabando… Enter para parar").await?;
        }
        let seconds = session.recording_seconds();

        match session.stop_recording(source.as_mut()).await {
            Ok(outcome) => {
                let analysis = outcome.analysis();
                println!("🎧 ({seconds}s) {}", analysis.transcription);
                println!("💬 {}", analysis.conversational_response);
                if let TurnOutcome::Completed(_) = outcome {
                    completed = true;
                    break;
                }
            }
            Err(e @ SessionError::Submission(_)) | Err(e @ SessionError::Capture(_)) => {
                eprintln!("⚠️ {e}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        turn += 1;
    }

    // Sin más respuestas y con una pregunta pendiente: fin manual.
    if !completed && session.phase() == Phase::AwaitingNextTurn {
        session.end_conversation()?;
        completed = true;
    }
    if completed {
        println!("🙏 {THANK_YOU_MESSAGE}");
        session.wait_for_reset().await;
    }

    let saved: Vec<FeedbackEntry> = load_records(session.store(), FEEDBACK_KEY)?;
    println!("📝 {} respuestas en el historial local", saved.len());
    Ok(())
}

/// `--start`/`--end` sin `--range` implican un rango personalizado; con un
/// preset se rechazan.
fn pick_range(range: Option<RangeArg>, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<DateRange> {
    let has_bounds = start.is_some() || end.is_some();
    Ok(match (range, has_bounds) {
        (Some(RangeArg::Custom), _) | (None, true) => DateRange::Custom { start, end },
        (Some(_), true) => bail!("--start/--end sólo se admiten con --range custom"),
        (Some(RangeArg::Last7), false) => DateRange::Last7Days,
        (Some(RangeArg::Last30), false) | (None, false) => DateRange::Last30Days,
        (Some(RangeArg::All), false) => DateRange::AllTime,
    })
}

async fn show_dashboard(
    cfg: AppConfig,
    range: Option<RangeArg>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<()> {
    let range = pick_range(range, start, end)?;

    let client = DashboardClient::from_config(&cfg)?;
    info!("Dashboard contra {}", client.summary_url());
    let mut dashboard = Dashboard::new(client);
    dashboard.apply(&range, Local::now().date_naive()).await;
    if let Some(message) = dashboard.inline_error() {
        bail!("{message}");
    }

    loop {
        match dashboard.screen().clone() {
            DashboardScreen::Ready(view) => {
                println!("{view}");
                return Ok(());
            }
            DashboardScreen::Error { message } => {
                eprintln!("⚠️ {message}");
                let answer = read_line("¿Reintentar? [s/N]").await?;
                if !matches!(answer.to_lowercase().as_str(), "s" | "si" | "sí" | "y" | "yes") {
                    return Err(anyhow!(message));
                }
                dashboard.retry().await;
            }
            DashboardScreen::Loading => return Ok(()),
        }
    }
}

fn analyze(
    cfg: AppConfig,
    dir: Option<PathBuf>,
    top: usize,
    output: Option<PathBuf>,
    json: Option<PathBuf>,
) -> Result<()> {
    let dir = dir.unwrap_or(cfg.conversations_dir);
    let report = AnalyticsReport::from_dir(&dir, top)?;
    println!("{report}");

    let csv_path = output.unwrap_or_else(|| analytics::default_report_path(Local::now()));
    analytics::export_csv(&report.conversations, &csv_path)?;
    println!("\n📄 Informe detallado exportado a {}", csv_path.display());

    if let Some(path) = json {
        let body = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, body).with_context(|| format!("Error escribiendo {}", path.display()))?;
        println!("Informe JSON guardado en {}", path.display());
    }
    Ok(())
}

fn seed(cfg: AppConfig, dir: Option<PathBuf>, count: Option<usize>, course: bool) -> Result<()> {
    let (profile, default_dir) = if course {
        (SeedProfile::Course, PathBuf::from(mock_data::COURSE_CONVERSATIONS_DIR))
    } else {
        (SeedProfile::Shop, cfg.conversations_dir)
    };
    let dir = dir.unwrap_or(default_dir);
    let written = mock_data::seed_directory(&dir, count.unwrap_or(profile.default_count()), profile)?;
    println!("✅ {} conversaciones generadas en {}", written.len(), dir.display());
    Ok(())
}

fn history(cfg: AppConfig) -> Result<()> {
    let store = FileStore::open(&cfg.store_dir)?;
    let entries: Vec<FeedbackEntry> = load_records(&store, FEEDBACK_KEY)?;
    let recordings: Vec<AudioRecording> = load_records(&store, AUDIO_KEY)?;

    println!("Almacén: {}", store.root().display());
    println!("{} respuestas analizadas, {} grabaciones", entries.len(), recordings.len());
    for entry in &entries {
        println!(
            "- {} {} NPS {} [{}] {}{}",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.rating_stars,
            entry.nps_score,
            entry.sentiment,
            entry.transcription,
            if entry.requires_follow_up { " (seguimiento)" } else { "" }
        );
    }
    Ok(())
}

async fn course_demo(
    cfg: AppConfig,
    email: Option<String>,
    password: Option<String>,
    logout: bool,
    interactive: bool,
) -> Result<()> {
    let store = FileStore::open(&cfg.store_dir)?;
    if logout {
        course::logout(&store)?;
        println!("👋 Sesión del curso cerrada");
        return Ok(());
    }
    if let (Some(email), Some(password)) = (email.as_deref(), password.as_deref()) {
        match course::login(&store, email, password) {
            Ok(()) => println!("🔐 Sesión iniciada como {email}"),
            Err(e @ course::LoginError::InvalidCredentials) => {
                eprintln!("⚠️ {e}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    } else if let Some(email) = course::logged_in_email(&store)? {
        println!("🔐 Sesión activa: {email}");
    }

    let mut player = CoursePlayer::new();
    if interactive {
        drive_player(&mut player).await?;
    } else {
        loop {
            print_module(&player);
            let module = player.current();
            player.video_ended().await;
            if player.current() == module {
                break;
            }
        }
    }

    let Some(path) = player.completion_path() else {
        println!("Curso sin terminar ({}% completado)", player.progress_pct());
        return Ok(());
    };
    let query = path.split_once('?').map_or("", |(_, query)| query);
    let certificate = course::Certificate::from_query(query, Local::now().date_naive());
    println!("\n🎓 Congratulations!\n\n{certificate}\n");

    tokio::time::sleep(course::FEEDBACK_PROMPT_DELAY).await;
    println!("¿Qué te ha parecido? Valóralo con: asklet rate --stars <1-5> --audio <fichero>");
    Ok(())
}

fn print_module(player: &CoursePlayer) {
    let module = player.current();
    let watched: Vec<String> = player.watched().map(|n| n.to_string()).collect();
    println!(
        "{} Módulo {}: {} ({}% completado, vistos: {})",
        if player.is_playing() { "▶️" } else { "⏸️" },
        module.number,
        module.title,
        player.progress_pct(),
        watched.join(", ")
    );
}

async fn drive_player(player: &mut CoursePlayer) -> Result<()> {
    loop {
        print_module(player);
        let command = read_line("[Enter] play/pausa · p anterior · n siguiente · f fin del vídeo · q salir").await?;
        match command.as_str() {
            "" => player.toggle_play(),
            "p" => {
                if !player.previous() {
                    println!("Ya estás en el primer módulo");
                }
            }
            "n" => {
                if !player.next() {
                    println!("No hay más módulos");
                }
            }
            "f" => player.video_ended().await,
            "q" => return Ok(()),
            other => println!("Orden desconocida: {other}"),
        }
    }
}
