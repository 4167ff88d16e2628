use pipescope_core::{sanitize_component, SaveData};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("nothing is displayed")]
    NothingToSave,
    #[error("failed to save {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where exported dumps end up.
pub trait SaveSink: Send {
    fn save(&self, data: &SaveData) -> Result<PathBuf, SaveError>;
}

/// Writes exports into one directory, overwriting earlier exports of the
/// same pipeline.
#[derive(Debug, Clone)]
pub struct FileSaver {
    dir: PathBuf,
}

impl FileSaver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SaveSink for FileSaver {
    fn save(&self, data: &SaveData) -> Result<PathBuf, SaveError> {
        let path = self.dir.join(sanitize_component(&data.suggested_filename));
        std::fs::create_dir_all(&self.dir)
            .and_then(|()| std::fs::write(&path, &data.content))
            .map_err(|source| SaveError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}
