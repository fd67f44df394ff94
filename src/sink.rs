//! Persistence of decoded documents.

use crate::protocol::Document;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Document persistence errors.
#[derive(Debug)]
pub enum SinkError {
    /// Server-supplied name is not a plain file name.
    InvalidName(String),
    Io(PathBuf, std::io::Error),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::InvalidName(name) => {
                write!(f, "refusing to write document with name {:?}", name)
            }
            SinkError::Io(path, e) => write!(f, "failed to write '{}': {}", path.display(), e),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Io(_, e) => Some(e),
            SinkError::InvalidName(_) => None,
        }
    }
}

/// Receives fully decoded documents.
pub trait DocumentSink {
    fn persist(
        &mut self,
        document: &Document,
    ) -> impl std::future::Future<Output = Result<(), SinkError>> + Send;
}

/// Writes each document as a file in one directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path the document will be written to, if its name is acceptable.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, SinkError> {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !plain {
            return Err(SinkError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

impl DocumentSink for DirectorySink {
    async fn persist(&mut self, document: &Document) -> Result<(), SinkError> {
        let path = self.path_for(&document.name)?;
        tokio::fs::write(&path, &document.content)
            .await
            .map_err(|e| SinkError::Io(path.clone(), e))?;
        debug!(path = %path.display(), bytes = document.len(), "Document written");
        Ok(())
    }
}

/// Keeps documents in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub documents: Vec<Document>,
}

impl DocumentSink for MemorySink {
    async fn persist(&mut self, document: &Document) -> Result<(), SinkError> {
        self.documents.push(document.clone());
        Ok(())
    }
}
