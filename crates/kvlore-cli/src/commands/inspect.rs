//! Inspect command - list the records of actor memory files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use kvlore_config::Config;
use kvlore_engine::{persist, ConversationMemory, MemoryKind};
use kvlore_tensor::KvGeometry;
use serde::Serialize;

use crate::output::{format_bytes, format_kv_list, format_table, preview};

/// Inspect command arguments.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Actor files (.def, .mem, .rag, .hst, .rec).
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Show full record content instead of a preview.
    #[arg(long)]
    pub full: bool,
}

/// One record, as reported.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    pub index: usize,
    pub materialized: bool,
    pub speaker: String,
    pub timestamp: String,
    pub n_tokens: usize,
    pub content: String,
}

/// One file, as reported.
#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub kind: Option<MemoryKind>,
    pub records: Vec<RecordInfo>,
    pub tokens: usize,
    pub kv_bytes: usize,
}

/// Read one actor file with the configured cache geometry.
pub fn inspect_file(path: &Path, geometry: &KvGeometry) -> Result<FileInfo> {
    let memories = persist::read_file(path, geometry)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let kind = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(MemoryKind::from_extension);
    let per_token = geometry.n_layer * (geometry.k_row_bytes() + geometry.v_row_bytes());

    let records: Vec<RecordInfo> = memories
        .iter()
        .enumerate()
        .map(|(index, m)| RecordInfo {
            index,
            materialized: matches!(m, ConversationMemory::Eidet(_)),
            speaker: m.speaker().to_string(),
            timestamp: m.timestamp().to_string(),
            n_tokens: m.n_tokens(),
            content: m.content().to_string(),
        })
        .collect();
    let kv_bytes = records
        .iter()
        .filter(|r| r.materialized)
        .map(|r| r.n_tokens * per_token)
        .sum();

    Ok(FileInfo {
        path: path.display().to_string(),
        kind,
        tokens: records.iter().map(|r| r.n_tokens).sum(),
        kv_bytes,
        records,
    })
}

/// Execute the inspect command.
pub fn execute(args: InspectArgs, config: &Config, json: bool) -> Result<()> {
    let geometry = KvGeometry::from_config(&config.session.cache);
    let files = args
        .files
        .iter()
        .map(|path| inspect_file(path, &geometry))
        .collect::<Result<Vec<_>>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }

    for file in &files {
        let kind = file
            .kind
            .map_or_else(|| "unknown kind".to_string(), |k| k.to_string());
        println!("\n{} ({})", file.path.bright_green().bold(), kind);
        println!(
            "{}",
            format_kv_list(&[
                ("records", file.records.len().to_string()),
                ("tokens", file.tokens.to_string()),
                ("kv bytes", format_bytes(file.kv_bytes)),
            ])
        );
        println!();

        let rows: Vec<Vec<String>> = file
            .records
            .iter()
            .map(|r| {
                vec![
                    r.index.to_string(),
                    if r.materialized { "eidet" } else { "plain" }.to_string(),
                    r.speaker.clone(),
                    r.n_tokens.to_string(),
                    r.timestamp.clone(),
                    if args.full {
                        r.content.clone()
                    } else {
                        preview(&r.content, 48)
                    },
                ]
            })
            .collect();
        print!(
            "{}",
            format_table(
                &["#", "type", "speaker", "tokens", "timestamp", "content"],
                &rows
            )
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kvlore_tensor::KvSnapshot;

    const GEOMETRY: KvGeometry = KvGeometry {
        n_layer: 2,
        n_embd_k: 2,
        n_embd_v: 2,
        elsize: 1,
    };

    #[test]
    fn test_inspect_mixed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ada.hst");
        let kv = KvSnapshot {
            n_tokens: 3,
            k: vec![Arc::from(vec![1u8; 6]), Arc::from(vec![2u8; 6])],
            v: vec![Arc::from(vec![3u8; 6]), Arc::from(vec![4u8; 6])],
        };
        let memories = [
            ConversationMemory::plain("bob", "hi there", 2, "10:00"),
            ConversationMemory::eidet("ada", "hello bob", "10:01", kv),
        ];
        persist::write_file(&path, &GEOMETRY, memories.iter()).unwrap();

        let info = inspect_file(&path, &GEOMETRY).unwrap();
        assert_eq!(info.kind, Some(MemoryKind::History));
        assert_eq!(info.records.len(), 2);
        assert!(!info.records[0].materialized);
        assert!(info.records[1].materialized);
        assert_eq!(info.tokens, 5);
        assert_eq!(info.kv_bytes, 3 * 2 * (2 + 2));
    }

    #[test]
    fn test_inspect_missing_file_names_path() {
        let err = inspect_file(Path::new("/nonexistent/ada.def"), &GEOMETRY).unwrap_err();
        assert!(format!("{err:#}").contains("ada.def"));
    }
}
