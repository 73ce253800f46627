//! Finalizer (C11): consolidates a job's raw page log into the final
//! deduplicated output, a summary, and a markdown knowledge-base bundle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use crawlhub_core::{Artifact, ArtifactKind, BlockingEvidence, RawPageRecord, SiteStatus};

const MIN_TEXT_LENGTH_SUCCESS: usize = 200;
const MAX_HASHED_BYTES: u64 = 100 * 1024 * 1024;
const MAX_RECENT_ERRORS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("io error reading/writing job output: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed raw page record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub job_id: String,
    pub total_pages: u64,
    pub status_code_histogram: HashMap<u16, u64>,
    pub extraction_mode_histogram: HashMap<String, u64>,
    pub extraction_success_rate: f64,
    pub avg_text_length: f64,
    pub last_errors: Vec<String>,
    pub duration_seconds: i64,
    pub fallback_occurred: bool,
    pub site_status: SiteStatus,
    pub block_evidence: BlockingEvidence,
    pub generated_at: DateTime<Utc>,
}

pub struct FinalizeOutcome {
    pub summary: Summary,
    pub pages_exported: u64,
    pub artifacts: Vec<Artifact>,
}

/// Runs the full finalize pass over `out_dir`, which must already
/// contain `pages.raw.jsonl` and `blocking_evidence.json` written by the
/// fetcher. Steps 1-2 (dedup, write `pages.jsonl`) are the ones whose
/// I/O failure maps to `finalization_failed` per the caller's contract;
/// the raw file is never touched, so it survives any failure here.
pub async fn finalize(
    job_id: &str,
    out_dir: &Path,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    fallback_occurred: bool,
    site_status: SiteStatus,
) -> Result<FinalizeOutcome, FinalizeError> {
    let raw_path = out_dir.join("pages.raw.jsonl");
    let records = read_raw_records(&raw_path).await?;
    info!(job_id, raw_records = records.len(), "finalizer read raw log");

    let deduped = dedup_by_canonical_url(records);
    info!(job_id, deduped = deduped.len(), "finalizer deduped by canonical_url");

    let final_path = out_dir.join("pages.jsonl");
    write_jsonl(&final_path, &deduped).await?;

    let block_evidence = read_blocking_evidence(out_dir).await;

    let summary = compute_summary(
        job_id,
        &deduped,
        started_at,
        finished_at,
        fallback_occurred,
        site_status,
        block_evidence,
    );
    let summary_path = out_dir.join("summary.json");
    write_json(&summary_path, &summary).await?;

    let kb_dir = out_dir.join("kb");
    let manifest = write_kb_bundle(job_id, &kb_dir, &deduped).await?;
    let manifest_path = kb_dir.join("manifest.json");
    write_json(&manifest_path, &manifest).await?;

    let mut artifacts = Vec::new();
    artifacts.push(artifact_for(job_id, ArtifactKind::RawJsonl, &raw_path).await?);
    artifacts.push(artifact_for(job_id, ArtifactKind::FinalJsonl, &final_path).await?);
    artifacts.push(artifact_for(job_id, ArtifactKind::SummaryJson, &summary_path).await?);

    let pages_exported = deduped.len() as u64;

    Ok(FinalizeOutcome {
        summary,
        pages_exported,
        artifacts,
    })
}

async fn read_raw_records(path: &Path) -> Result<Vec<RawPageRecord>, FinalizeError> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let record: RawPageRecord = serde_json::from_str(&line)
            .map_err(|e| FinalizeError::Malformed(e.to_string()))?;
        records.push(record);
    }
    Ok(records)
}

/// Dedup law: for each `canonical_url`, keep only the last occurrence by
/// file order.
fn dedup_by_canonical_url(records: Vec<RawPageRecord>) -> Vec<RawPageRecord> {
    let mut order = Vec::new();
    let mut by_key: HashMap<String, RawPageRecord> = HashMap::new();

    for record in records {
        let key = record.canonical_url.clone();
        if !by_key.contains_key(&key) {
            order.push(key.clone());
        }
        by_key.insert(key, record);
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

async fn write_jsonl(path: &Path, records: &[RawPageRecord]) -> Result<(), FinalizeError> {
    let mut file = tokio::fs::File::create(path).await?;
    for record in records {
        let mut line = serde_json::to_vec(record).map_err(|e| FinalizeError::Malformed(e.to_string()))?;
        line.push(b'\n');
        file.write_all(&line).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FinalizeError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| FinalizeError::Malformed(e.to_string()))?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

async fn read_blocking_evidence(out_dir: &Path) -> BlockingEvidence {
    let path = out_dir.join("blocking_evidence.json");
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => BlockingEvidence::default(),
    }
}

fn compute_summary(
    job_id: &str,
    deduped: &[RawPageRecord],
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    fallback_occurred: bool,
    site_status: SiteStatus,
    block_evidence: BlockingEvidence,
) -> Summary {
    let mut status_code_histogram = HashMap::new();
    let mut extraction_mode_histogram: HashMap<String, u64> = HashMap::new();
    let mut successes = 0u64;
    let mut total_text_len = 0u64;
    let mut last_errors = Vec::new();

    for record in deduped {
        *status_code_histogram.entry(record.status_code).or_insert(0) += 1;
        let mode = format!("{:?}", record.extraction_mode).to_lowercase();
        *extraction_mode_histogram.entry(mode).or_insert(0) += 1;

        let len = record.text.chars().count();
        total_text_len += len as u64;
        if len >= MIN_TEXT_LENGTH_SUCCESS {
            successes += 1;
        }

        if let Some(ref error) = record.error {
            last_errors.push(error.clone());
        }
    }

    let total_pages = deduped.len() as u64;
    let extraction_success_rate = if total_pages == 0 {
        0.0
    } else {
        successes as f64 / total_pages as f64
    };
    let avg_text_length = if total_pages == 0 {
        0.0
    } else {
        total_text_len as f64 / total_pages as f64
    };

    if last_errors.len() > MAX_RECENT_ERRORS {
        let skip = last_errors.len() - MAX_RECENT_ERRORS;
        last_errors.drain(0..skip);
    }

    let duration_seconds = (finished_at - started_at).num_seconds();

    Summary {
        job_id: job_id.to_string(),
        total_pages,
        status_code_histogram,
        extraction_mode_histogram,
        extraction_success_rate,
        avg_text_length,
        last_errors,
        duration_seconds,
        fallback_occurred,
        site_status,
        block_evidence,
        generated_at: finished_at,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KbManifest {
    job_id: String,
    generated_at: DateTime<Utc>,
    format_version: String,
    total_pages: u64,
    pages: Vec<KbManifestPage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KbManifestPage {
    id: u64,
    filename: String,
    source_url: String,
    title: Option<String>,
    breadcrumbs: Vec<String>,
    sections: Vec<crawlhub_core::Section>,
    last_modified: Option<String>,
    fetched_at: DateTime<Utc>,
    text_length: usize,
}

async fn write_kb_bundle(
    job_id: &str,
    kb_dir: &Path,
    records: &[RawPageRecord],
) -> Result<KbManifest, FinalizeError> {
    let pages_dir = kb_dir.join("pages");
    tokio::fs::create_dir_all(&pages_dir).await?;

    let mut manifest_pages = Vec::with_capacity(records.len());

    for (idx, record) in records.iter().enumerate() {
        let id = idx as u64;
        let slug = slugify(&record.canonical_url, id);
        let filename = format!("{slug}.md");
        let path = pages_dir.join(&filename);

        let markdown = render_page_markdown(record);
        tokio::fs::write(&path, markdown).await?;

        manifest_pages.push(KbManifestPage {
            id,
            filename,
            source_url: record.canonical_url.clone(),
            title: record.title.clone(),
            breadcrumbs: record.breadcrumbs.clone(),
            sections: record.sections.clone(),
            last_modified: record.last_modified.clone(),
            fetched_at: record.fetched_at,
            text_length: record.text.chars().count(),
        });
    }

    Ok(KbManifest {
        job_id: job_id.to_string(),
        generated_at: Utc::now(),
        format_version: "1.0".to_string(),
        total_pages: records.len() as u64,
        pages: manifest_pages,
    })
}

fn render_page_markdown(record: &RawPageRecord) -> String {
    let title = record.title.clone().unwrap_or_else(|| record.canonical_url.clone());
    let breadcrumbs_yaml = if record.breadcrumbs.is_empty() {
        "[]".to_string()
    } else {
        format!(
            "[{}]",
            record
                .breadcrumbs
                .iter()
                .map(|b| format!("\"{}\"", b.replace('"', "\\\"")))
                .collect::<Vec<_>>()
                .join(", ")
        )
    };

    format!(
        "---\nsource_url: \"{}\"\ntitle: \"{}\"\nbreadcrumbs: {}\nlast_modified: {}\nfetched_at: \"{}\"\n---\n\n# {}\n\n{}\n\n---\nSource: {}\n",
        record.canonical_url.replace('"', "\\\""),
        title.replace('"', "\\\""),
        breadcrumbs_yaml,
        record
            .last_modified
            .as_ref()
            .map(|m| format!("\"{}\"", m.replace('"', "\\\"")))
            .unwrap_or_else(|| "null".to_string()),
        record.fetched_at.to_rfc3339(),
        title,
        record.markdown,
        record.canonical_url,
    )
}

fn slugify(canonical_url: &str, id: u64) -> String {
    let slug: String = canonical_url
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug = if slug.is_empty() { "page".to_string() } else { slug };
    format!("{id:04}-{}", &slug[..slug.len().min(80)])
}

async fn artifact_for(job_id: &str, kind: ArtifactKind, path: &Path) -> Result<Artifact, FinalizeError> {
    let metadata = tokio::fs::metadata(path).await?;
    let byte_size = metadata.len();

    let sha256 = if byte_size <= MAX_HASHED_BYTES {
        let bytes = tokio::fs::read(path).await?;
        Some(hex::encode(Sha256::digest(&bytes)))
    } else {
        None
    };

    Ok(Artifact {
        job_id: job_id.to_string(),
        kind,
        path: path.to_string_lossy().to_string(),
        byte_size,
        sha256,
    })
}

pub fn default_kb_dir(out_dir: &Path) -> PathBuf {
    out_dir.join("kb")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crawlhub_core::ExtractionMode;
    use tempfile::tempdir;

    fn sample_record(canonical_url: &str, text: &str) -> RawPageRecord {
        RawPageRecord {
            url: canonical_url.to_string(),
            canonical_url: canonical_url.to_string(),
            fetched_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            status_code: 200,
            content_type: Some("text/html".to_string()),
            title: Some("Sample".to_string()),
            text: text.to_string(),
            markdown: format!("# Sample\n\n{text}"),
            text_hash: "sha256:deadbeef".to_string(),
            extraction_mode: ExtractionMode::Primary,
            depth: 0,
            outlinks_count: 0,
            sections: Vec::new(),
            breadcrumbs: Vec::new(),
            last_modified: None,
            quality_score: 0.9,
            quality_passed: true,
            quality_reasons: Vec::new(),
            document_id: Some("doc_0".to_string()),
            is_duplicate: false,
            counts_toward_budget: true,
            error: None,
        }
    }

    #[test]
    fn dedup_keeps_last_occurrence() {
        let records = vec![
            sample_record("https://example.org/a", "first"),
            sample_record("https://example.org/a", "second"),
        ];
        let deduped = dedup_by_canonical_url(records);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].text, "second");
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let records = vec![
            sample_record("https://example.org/b", "b"),
            sample_record("https://example.org/a", "a"),
            sample_record("https://example.org/b", "b2"),
        ];
        let deduped = dedup_by_canonical_url(records);
        assert_eq!(deduped[0].canonical_url, "https://example.org/b");
        assert_eq!(deduped[1].canonical_url, "https://example.org/a");
    }

    #[tokio::test]
    async fn finalize_produces_expected_files() {
        let dir = tempdir().unwrap();
        let raw_path = dir.path().join("pages.raw.jsonl");
        let records = vec![
            sample_record("https://example.org/a", &"word ".repeat(100)),
            sample_record("https://example.org/a", &"word ".repeat(120)),
        ];
        let mut contents = String::new();
        for r in &records {
            contents.push_str(&serde_json::to_string(r).unwrap());
            contents.push('\n');
        }
        tokio::fs::write(&raw_path, contents).await.unwrap();

        let started = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let finished = Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap();

        let outcome = finalize(
            "job_test",
            dir.path(),
            started,
            finished,
            false,
            SiteStatus::Normal,
        )
        .await
        .unwrap();

        assert_eq!(outcome.pages_exported, 1);
        assert!(dir.path().join("pages.jsonl").exists());
        assert!(dir.path().join("summary.json").exists());
        assert!(dir.path().join("kb/manifest.json").exists());
        assert_eq!(outcome.artifacts.len(), 3);
    }
}
