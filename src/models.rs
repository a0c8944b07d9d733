//! Core data models used throughout the pipeline.
//!
//! These types represent the documents, chunks, and chat records that flow
//! through ingestion and retrieval.

use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

/// Supported source file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Pdf,
    Docx,
    Txt,
}

impl FileType {
    /// Resolve a file type from a path's extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        Self::from_tag(&ext)
    }

    /// Resolve a file type from its stored tag.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "pdf" => Ok(FileType::Pdf),
            "docx" => Ok(FileType::Docx),
            "txt" => Ok(FileType::Txt),
            other => Err(Error::UnsupportedFileType(other.to_string())),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Txt => "txt",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A registered document owned by one user.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub file_type: String,
    pub path: String,
    pub processed: bool,
    pub created_at: i64,
}

/// A persisted embedding record: one text span of one document.
///
/// Immutable once written; replaced wholesale when the owning document
/// is reprocessed.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A conversation between one user and the bot.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub created_at: i64,
}

/// One turn in a chat session. Bot turns carry chunk references.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub text: String,
    pub is_user: bool,
    pub created_at: i64,
}
