//! Captura de audio para el widget de valoración.
//!
//! `AudioSource` modela el ciclo del grabador: `start` pide el dispositivo y
//! `stop` junta todos los fragmentos capturados en un único `AudioClip`,
//! liberando el dispositivo.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use thiserror::Error;
use tokio::task::JoinHandle;

pub const DEFAULT_MIME_TYPE: &str = "audio/webm";
const TIMER_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Could not access microphone. Please check permissions. ({0})")]
    Unavailable(String),
    #[error("No recording in progress")]
    NotStarted,
    #[error("Recorded audio is empty")]
    Empty,
}

/// Audio grabado listo para enviar al servicio de análisis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self { bytes, mime_type: mime_type.into() }
    }

    /// `data:<mime>;base64,<payload>`, el mismo formato que `FileReader.readAsDataURL`.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, B64.encode(&self.bytes))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub trait AudioSource {
    fn start(&mut self) -> Result<(), CaptureError>;
    fn stop(&mut self) -> Result<AudioClip, CaptureError>;
}

/// Fuente que "graba" un fichero ya existente. El tipo MIME se deduce de la
/// extensión; si no se reconoce se asume `audio/webm`.
#[derive(Debug, Clone)]
pub struct FileAudioSource {
    path: PathBuf,
    started: bool,
}

impl FileAudioSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), started: false }
    }

    fn mime_type(&self) -> String {
        mime_guess::from_path(&self.path)
            .first()
            .filter(|mime| mime.type_() == mime_guess::mime::AUDIO || mime.type_() == mime_guess::mime::VIDEO)
            .map(|mime| {
                // Los navegadores graban webm de sólo audio aunque la extensión diga vídeo.
                if mime.essence_str() == "video/webm" {
                    DEFAULT_MIME_TYPE.to_string()
                } else {
                    mime.essence_str().to_string()
                }
            })
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string())
    }
}

impl AudioSource for FileAudioSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        let meta = fs::metadata(&self.path)
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", self.path.display())))?;
        if !meta.is_file() {
            return Err(CaptureError::Unavailable(format!(
                "{} no es un fichero de audio",
                self.path.display()
            )));
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<AudioClip, CaptureError> {
        if !self.started {
            return Err(CaptureError::NotStarted);
        }
        self.started = false;
        let bytes = fs::read(&self.path)
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", self.path.display())))?;
        if bytes.is_empty() {
            return Err(CaptureError::Empty);
        }
        Ok(AudioClip::new(bytes, self.mime_type()))
    }
}

/// Contador de segundos de grabación. Se cancela al soltarlo.
#[derive(Debug)]
pub struct RecordingTimer {
    handle: JoinHandle<()>,
}

impl RecordingTimer {
    /// Invoca `on_tick` una vez por segundo hasta que se cancela.
    pub fn start<F>(mut on_tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TIMER_TICK);
            // El primer tick de `interval` es inmediato.
            interval.tick().await;
            loop {
                interval.tick().await;
                on_tick();
            }
        });
        Self { handle }
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for RecordingTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(feature = "microphone")]
pub use microphone::MicrophoneSource;

#[cfg(feature = "microphone")]
mod microphone {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, Stream};
    use tracing::{error, info};

    use super::{AudioClip, AudioSource, CaptureError};

    /// Graba del micrófono por defecto (o del índice indicado) y entrega WAV
    /// mono de 16 bits.
    pub struct MicrophoneSource {
        device_index: Option<usize>,
        stream: Option<Stream>,
        samples: Arc<Mutex<Vec<f32>>>,
        sample_rate_hz: u32,
    }

    impl MicrophoneSource {
        pub fn new(device_index: Option<usize>) -> Self {
            Self {
                device_index,
                stream: None,
                samples: Arc::new(Mutex::new(Vec::new())),
                sample_rate_hz: 0,
            }
        }

        fn resolve_device(&self, host: &cpal::Host) -> Result<cpal::Device, CaptureError> {
            if let Some(index) = self.device_index {
                return host
                    .input_devices()
                    .map_err(|e| CaptureError::Unavailable(e.to_string()))?
                    .nth(index)
                    .ok_or_else(|| CaptureError::Unavailable(format!("no microphone at index {index}")));
            }
            host.default_input_device()
                .ok_or_else(|| CaptureError::Unavailable("no input microphone is available".into()))
        }
    }

    impl AudioSource for MicrophoneSource {
        fn start(&mut self) -> Result<(), CaptureError> {
            let host = cpal::default_host();
            let device = self.resolve_device(&host)?;
            let supported = device
                .default_input_config()
                .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
            let sample_format = supported.sample_format();
            let config = supported.config();
            let channels = usize::from(config.channels.max(1));

            if let Ok(mut samples) = self.samples.lock() {
                samples.clear();
            }
            let sink = self.samples.clone();
            let on_error = |e| error!("Error en el stream del micrófono: {e}");

            let stream = match sample_format {
                SampleFormat::F32 => device.build_input_stream(
                    &config,
                    move |data: &[f32], _| push_mono(&sink, data.iter().copied(), channels),
                    on_error,
                    None,
                ),
                SampleFormat::I16 => device.build_input_stream(
                    &config,
                    move |data: &[i16], _| {
                        let scale = i16::MAX as f32;
                        push_mono(&sink, data.iter().map(|s| *s as f32 / scale), channels)
                    },
                    on_error,
                    None,
                ),
                other => {
                    return Err(CaptureError::Unavailable(format!(
                        "unsupported input sample format: {other:?}"
                    )))
                }
            }
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

            stream.play().map_err(|e| CaptureError::Unavailable(e.to_string()))?;
            self.sample_rate_hz = config.sample_rate.0;
            self.stream = Some(stream);
            info!("Micrófono abierto a {} Hz", self.sample_rate_hz);
            Ok(())
        }

        fn stop(&mut self) -> Result<AudioClip, CaptureError> {
            // Soltar el stream libera el dispositivo.
            let stream = self.stream.take().ok_or(CaptureError::NotStarted)?;
            drop(stream);

            let samples = self
                .samples
                .lock()
                .map(|mut samples| std::mem::take(&mut *samples))
                .unwrap_or_default();
            if samples.is_empty() {
                return Err(CaptureError::Empty);
            }
            let bytes = encode_wav(&samples, self.sample_rate_hz)
                .map_err(|e| CaptureError::Unavailable(format!("WAV encoding failed: {e}")))?;
            Ok(AudioClip::new(bytes, "audio/wav"))
        }
    }

    fn push_mono(sink: &Arc<Mutex<Vec<f32>>>, data: impl Iterator<Item = f32>, channels: usize) {
        let frame: Vec<f32> = data.collect();
        let Ok(mut samples) = sink.lock() else { return };
        if channels <= 1 {
            samples.extend_from_slice(&frame);
            return;
        }
        for chunk in frame.chunks_exact(channels) {
            samples.push(chunk.iter().sum::<f32>() / channels as f32);
        }
    }

    pub(super) fn encode_wav(samples: &[f32], sample_rate_hz: u32) -> Result<Vec<u8>, hound::Error> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: sample_rate_hz,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for sample in samples {
                writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn data_url_carries_mime_and_base64_payload() {
        let clip = AudioClip::new(b"abc".to_vec(), "audio/webm");
        assert_eq!(clip.to_data_url(), "data:audio/webm;base64,YWJj");
    }

    #[test]
    fn file_source_reads_clip_and_guesses_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answer.wav");
        fs::write(&path, b"RIFF....WAVE").unwrap();

        let mut source = FileAudioSource::new(&path);
        source.start().unwrap();
        let clip = source.stop().unwrap();
        assert_eq!(clip.len(), 12);
        assert!(clip.mime_type.contains("wav"), "mime was {}", clip.mime_type);
    }

    #[test]
    fn file_source_without_known_extension_defaults_to_webm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording");
        fs::write(&path, [1u8, 2, 3]).unwrap();

        let mut source = FileAudioSource::new(&path);
        source.start().unwrap();
        assert_eq!(source.stop().unwrap().mime_type, DEFAULT_MIME_TYPE);
    }

    #[test]
    fn missing_file_is_reported_as_unavailable_device() {
        let mut source = FileAudioSource::new("/definitely/not/here.webm");
        assert!(matches!(source.start(), Err(CaptureError::Unavailable(_))));
        assert!(matches!(source.stop(), Err(CaptureError::NotStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_ticks_every_second_until_cancelled() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let timer = RecordingTimer::start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        timer.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[cfg(feature = "microphone")]
    #[test]
    fn encodes_mono_wav_header() {
        let bytes = microphone::encode_wav(&[0.0, 0.5, -0.5], 16_000).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
    }
}
