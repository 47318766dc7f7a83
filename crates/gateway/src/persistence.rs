//! Shared atomic-write helpers (C10).
//!
//! Every durable record this daemon writes follows the same discipline:
//! serialize, write to `<path>.tmp`, then rename over the final path. A
//! crash or power loss mid-write leaves either the old file or nothing —
//! never a half-written one. Directories are created lazily on first write.

use std::io::Write as _;
use std::path::Path;

use ad_domain::error::Result;
use serde::Serialize;

/// Atomically write `value` as pretty JSON to `path`.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Append one JSON-serialized record as a line to an append-only log,
/// flushing immediately after the write.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(value)?;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{json}")?;
    file.flush()?;
    Ok(())
}

/// Read every valid JSON line from an append-only log, skipping (and
/// logging) malformed lines rather than failing the whole read.
pub fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| match serde_json::from_str::<T>(line) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed jsonl line");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        id: String,
        n: u32,
    }

    #[test]
    fn atomic_write_json_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("record.json");
        let record = Record { id: "a".into(), n: 1 };
        atomic_write_json(&path, &record).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let back: Record = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn atomic_write_json_overwrites_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("record.json");
        atomic_write_json(&path, &Record { id: "a".into(), n: 1 }).unwrap();
        atomic_write_json(&path, &Record { id: "a".into(), n: 2 }).unwrap();
        let back: Record = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.n, 2);
    }

    #[test]
    fn append_and_read_jsonl_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log.jsonl");
        append_jsonl(&path, &Record { id: "a".into(), n: 1 }).unwrap();
        append_jsonl(&path, &Record { id: "b".into(), n: 2 }).unwrap();

        let records: Vec<Record> = read_jsonl(&path);
        assert_eq!(records, vec![Record { id: "a".into(), n: 1 }, Record { id: "b".into(), n: 2 }]);
    }

    #[test]
    fn read_jsonl_skips_malformed_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log.jsonl");
        std::fs::write(&path, "{\"id\":\"a\",\"n\":1}\nnot json\n{\"id\":\"b\",\"n\":2}\n").unwrap();

        let records: Vec<Record> = read_jsonl(&path);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn read_jsonl_missing_file_returns_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing.jsonl");
        let records: Vec<Record> = read_jsonl(&path);
        assert!(records.is_empty());
    }
}
