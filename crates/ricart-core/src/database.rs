//! Fortune database: a text file of fortunes, each followed by a `%` line.
//!
//! Every node of a group opens the same file. Reads parse the file afresh so
//! they see fortunes appended by other nodes; writes append one record and
//! must be serialized by the caller (the distributed lock does this).

use crate::Result;
use rand::seq::IndexedRandom;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Separator line between two fortunes.
pub const SEPARATOR: &str = "\n%\n";

/// A fortune file on disk.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All fortunes in file order. A missing file is an empty database.
    pub async fn load(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(parse_fortunes(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// A random fortune, or `None` when there are none.
    pub async fn read(&self) -> Result<Option<String>> {
        let fortunes = self.load().await?;
        let picked = fortunes.choose(&mut rand::rng()).cloned();
        Ok(picked)
    }

    /// Append a fortune.
    pub async fn write(&self, fortune: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{}{}", fortune, SEPARATOR).as_bytes()).await?;
        file.flush().await?;
        debug!("Appended fortune to {}", self.path.display());
        Ok(())
    }
}

/// Split file content into fortunes.
///
/// Text after the last separator is an unfinished record and is ignored.
pub fn parse_fortunes(content: &str) -> Vec<String> {
    let mut fortunes: Vec<String> = content.split(SEPARATOR).map(str::to_string).collect();
    fortunes.pop();
    fortunes
}
