//! Almacén clave-valor local (equivalente al `localStorage` del widget).
//!
//! Cada clave guarda una lista JSON que sólo crece: cada `append_record` lee
//! la lista completa, añade el registro y la vuelve a escribir.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

pub const FEEDBACK_KEY: &str = "feedbackData";
pub const AUDIO_KEY: &str = "audioRecordings";

pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Un fichero `<clave>.json` por clave dentro de `root`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("No se pudo crear el almacén en {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(anyhow!("Clave de almacén inválida: '{key}'"));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Error leyendo {}", path.display())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        // Escritura a fichero temporal + rename para no dejar JSON a medias.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).with_context(|| format!("Error escribiendo {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Error escribiendo {}", path.display()))?;
        Ok(())
    }
}

/// Almacén en memoria para tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

#[cfg(test)]
impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(|_| anyhow!("MemoryStore envenenado"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("MemoryStore envenenado"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for &S {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }
}

/// Añade `record` a la lista guardada bajo `key` y devuelve la nueva longitud.
/// Los registros previos se conservan tal cual aunque su forma haya cambiado.
pub fn append_record<S, T>(store: &S, key: &str, record: &T) -> Result<usize>
where
    S: KeyValueStore + ?Sized,
    T: Serialize,
{
    let mut existing: Vec<serde_json::Value> = match store.get(key)? {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .with_context(|| format!("El contenido de '{key}' no es una lista JSON"))?,
        _ => Vec::new(),
    };
    existing.push(serde_json::to_value(record)?);
    store.set(key, &serde_json::to_string(&existing)?)?;
    debug!("'{key}' ahora contiene {} registros", existing.len());
    Ok(existing.len())
}

pub fn load_records<S, T>(store: &S, key: &str) -> Result<Vec<T>>
where
    S: KeyValueStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key)? {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .with_context(|| format!("No se pudieron leer los registros de '{key}'")),
        _ => Ok(Vec::new()),
    }
}
