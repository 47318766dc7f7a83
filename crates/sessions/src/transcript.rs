//! Append-only JSONL transcripts at `sessions/<id>/transcript.jsonl`.
//!
//! Every persisted turn is appended as one JSON line; the file is never
//! rewritten, only grown, so a crash mid-turn loses at most the in-flight
//! line.

use std::io::Write;
use std::path::{Path, PathBuf};

use ad_domain::error::{Error, Result};
use ad_domain::message::Message;
use ad_domain::trace::TraceEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted transcript line: a message plus when it was recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: Message,
}

pub struct TranscriptWriter {
    sessions_dir: PathBuf,
}

impl TranscriptWriter {
    pub fn new(sessions_dir: &Path) -> Self {
        Self { sessions_dir: sessions_dir.to_path_buf() }
    }

    fn transcript_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id).join("transcript.jsonl")
    }

    /// Append one message to a session's transcript, creating the session
    /// directory if needed.
    pub fn append(&self, session_id: &str, message: Message) -> Result<()> {
        let path = self.transcript_path(session_id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(Error::Io)?;
        }

        let line = TranscriptLine { timestamp: Utc::now(), message };
        let json = serde_json::to_string(&line).map_err(Error::Json)?;

        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path).map_err(Error::Io)?;
        file.write_all(json.as_bytes()).map_err(Error::Io)?;
        file.write_all(b"\n").map_err(Error::Io)?;
        file.flush().map_err(Error::Io)?;

        TraceEvent::TranscriptAppend { session_id: session_id.to_owned(), lines: 1 }.emit();
        Ok(())
    }

    /// Read back the full transcript for a session, skipping any
    /// malformed lines rather than failing the whole read.
    pub fn read(&self, session_id: &str) -> Result<Vec<TranscriptLine>> {
        let path = self.transcript_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut lines = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptLine>(line) {
                Ok(tl) => lines.push(tl),
                Err(e) => tracing::warn!(session_id, error = %e, "skipping malformed transcript line"),
            }
        }
        Ok(lines)
    }
}
