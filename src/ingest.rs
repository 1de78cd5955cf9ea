//! Markdown ingestion: read, chunk, embed, store.
//!
//! Every `*.md` file directly inside a directory becomes one
//! [`KnowledgeDocument`]; its chunks go through content-hash dedup into
//! SQLite. Failures on a single file or chunk are collected in the
//! [`IngestReport`] and do not stop the run. Without an embedder the
//! chunks are stored without vectors.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use second_brain_core::chunking::{
    chunk_markdown, markdown_title, DEFAULT_MAX_CHUNK_CHARS, DEFAULT_MIN_CHUNK_CHARS,
};
use second_brain_core::dedup::DeduplicationService;
use second_brain_core::knowledge::{KnowledgeChunk, KnowledgeDocument, KnowledgeType, SourceOrigin};
use second_brain_core::provider::{Embedder, InputType};
use second_brain_core::sanitize::sanitize_message;
use second_brain_core::BrainError;

use crate::knowledge_store::SqliteKnowledgeStore;
use crate::supabase::check_dimensions;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub knowledge_type: KnowledgeType,
    pub source_origin: SourceOrigin,
    pub dry_run: bool,
    pub max_chars: usize,
    pub min_chars: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            knowledge_type: KnowledgeType::Note,
            source_origin: SourceOrigin::Obsidian,
            dry_run: false,
            max_chars: DEFAULT_MAX_CHUNK_CHARS,
            min_chars: DEFAULT_MIN_CHUNK_CHARS,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestReport {
    pub files: usize,
    pub chunks: usize,
    pub documents_created: usize,
    pub chunks_embedded: usize,
    pub chunks_stored: usize,
    pub duplicates: usize,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

/// Sorted `*.md` files directly under `dir`.
pub fn markdown_files(dir: &Path) -> Result<Vec<PathBuf>, BrainError> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        BrainError::ingestion(format!("directory not found: {}", dir.display()))
            .with_context("directory", dir.display().to_string())
            .with_source(e)
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(
            BrainError::ingestion(format!("no .md files found in {}", dir.display()))
                .with_context("directory", dir.display().to_string()),
        );
    }
    Ok(files)
}

/// Title (first `# ` heading, else the file stem) and content.
pub fn read_markdown(path: &Path) -> Result<(String, String), BrainError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        BrainError::ingestion(format!("failed to read {}", path.display())).with_source(e)
    })?;
    let title = markdown_title(&content)
        .map(str::to_string)
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_default();
    Ok((title, content))
}

/// Ingest every markdown file in `dir`.
///
/// `store` may be `None` only for a dry run. A dry run chunks but neither
/// embeds nor writes.
pub async fn ingest_markdown_dir(
    dir: &Path,
    store: Option<&SqliteKnowledgeStore>,
    embedder: Option<&dyn Embedder>,
    options: &IngestOptions,
) -> Result<IngestReport, BrainError> {
    let store = match (store, options.dry_run) {
        (Some(store), false) => Some(store),
        (None, false) => {
            return Err(BrainError::configuration("ingestion needs a knowledge store unless dry-run"))
        }
        (_, true) => None,
    };
    let files = markdown_files(dir)?;
    let mut report = IngestReport {
        files: files.len(),
        dry_run: options.dry_run,
        ..Default::default()
    };

    for path in &files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Err(e) = ingest_file(path, &name, store, embedder, options, &mut report).await {
            warn!(file = %name, error = %e, "markdown file failed");
            report
                .errors
                .push(format!("{name}: {}", sanitize_message(e.message(), &[])));
        }
    }

    info!(
        files = report.files,
        chunks = report.chunks,
        stored = report.chunks_stored,
        duplicates = report.duplicates,
        errors = report.errors.len(),
        dry_run = report.dry_run,
        "markdown ingestion finished"
    );
    Ok(report)
}

async fn ingest_file(
    path: &Path,
    name: &str,
    store: Option<&SqliteKnowledgeStore>,
    embedder: Option<&dyn Embedder>,
    options: &IngestOptions,
    report: &mut IngestReport,
) -> Result<(), BrainError> {
    let (title, content) = read_markdown(path)?;
    let chunks = chunk_markdown(&content, options.max_chars, options.min_chars);
    if chunks.is_empty() {
        report.errors.push(format!("{name}: no chunks produced"));
        return Ok(());
    }

    let source_url = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string();
    let document = KnowledgeDocument::new(title, options.knowledge_type)
        .with_origin(options.source_origin)
        .with_source_url(source_url)
        .with_raw_content(content.as_str());

    let Some(store) = store else {
        report.chunks += chunks.len();
        return Ok(());
    };
    store.insert_document(&document).await?;
    report.documents_created += 1;

    let dedup = DeduplicationService::new(store);
    for (index, text) in chunks.iter().enumerate() {
        let embedding = match embed_chunk(embedder, text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                report.errors.push(format!(
                    "{name} chunk {index}: {}",
                    sanitize_message(e.message(), &[])
                ));
                continue;
            }
        };
        if embedding.is_some() {
            report.chunks_embedded += 1;
        }

        let chunk = KnowledgeChunk::new(text.as_str()).for_document(&document, index);
        match dedup.upsert_chunk(chunk, embedding.as_deref()).await {
            Ok(out) if out.is_duplicate => report.duplicates += 1,
            Ok(_) => report.chunks_stored += 1,
            Err(e) => report.errors.push(format!(
                "{name} chunk {index}: {}",
                sanitize_message(e.message(), &[])
            )),
        }
    }

    report.chunks += chunks.len();
    info!(file = %name, chunks = chunks.len(), "ingested markdown file");
    Ok(())
}

async fn embed_chunk(
    embedder: Option<&dyn Embedder>,
    text: &str,
) -> Result<Option<Vec<f32>>, BrainError> {
    let Some(embedder) = embedder else {
        return Ok(None);
    };
    let embedding = embedder.embed(text, InputType::Document).await?;
    check_dimensions(&embedding)?;
    Ok(Some(embedding))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_markdown_files_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("b.md"), "# B").unwrap();
        fs::write(tmp.path().join("a.md"), "# A").unwrap();
        fs::write(tmp.path().join("notes.txt"), "skip").unwrap();

        let files = markdown_files(tmp.path()).unwrap();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_owned()).collect();
        assert_eq!(names, vec!["a.md", "b.md"]);
    }

    #[test]
    fn test_missing_and_empty_directories() {
        let tmp = TempDir::new().unwrap();
        let err = markdown_files(&tmp.path().join("nope")).unwrap_err();
        assert_eq!(err.code(), "INGESTION_ERROR");

        let err = markdown_files(tmp.path()).unwrap_err();
        assert!(err.message().contains("no .md files"));
    }

    #[test]
    fn test_title_falls_back_to_file_stem() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("weekly-review.md");
        fs::write(&path, "## Wins\n\nshipped").unwrap();
        assert_eq!(read_markdown(&path).unwrap().0, "weekly-review");
    }

    #[tokio::test]
    async fn test_dry_run_counts_without_store() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.md"), "# A\n\nintro\n\n## One\n\nx\n\n## Two\n\ny").unwrap();
        fs::write(tmp.path().join("empty.md"), "   \n").unwrap();

        let options = IngestOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = ingest_markdown_dir(tmp.path(), None, None, &options).await.unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.chunks_stored, 0);
        assert_eq!(report.errors, vec!["empty.md: no chunks produced"]);
    }

    #[tokio::test]
    async fn test_real_run_requires_store() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.md"), "# A").unwrap();
        let err = ingest_markdown_dir(tmp.path(), None, None, &IngestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }
}
