//! File Discovery Batcher (C3, spec §4.3).
//!
//! Phase A walks the target directory (respecting a small built-in ignore
//! list plus any `DISCOVERY_IGNORE_GLOBS`-supplied patterns) and Phase B
//! packs the walked files into token-bounded batches, writing `File` rows
//! and a `file-analysis-queue` outbox event per batch.
//!
//! Both phases run in one task here rather than round-tripping through an
//! intermediate `files-to-batch` queue: the walker is cheap and
//! single-writer already, and folding the phases together lets the
//! check-on-write re-verification sit directly before each batch's emission
//! rather than needing to thread the lease through a second consumer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use pipeline_errors::PipelineError;
use redis_utils::DistributedLease;
use store::models::FileStatus;
use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::app::AppContext;
use crate::events::{BatchedFile, FileBatch};
use crate::queues;

const DEFAULT_IGNORE_DIRS: &[&str] = &[
    ".git", "node_modules", "target", "dist", "build", "vendor", ".venv", "__pycache__",
];

const LEASE_TTL_MS: u64 = 30_000;
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(10);

fn discovery_lock_key(target_dir: &Path) -> String {
    format!("discovery-lock:{}", target_dir.display())
}

fn ignore_globs() -> Vec<String> {
    pipeline_db::parse_env_optional::<String>("DISCOVERY_IGNORE_GLOBS")
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn matches_glob(name: &str, pattern: &str) -> bool {
    match pattern.split_once('*') {
        None => name == pattern,
        Some((prefix, suffix)) => name.starts_with(prefix) && name.ends_with(suffix),
    }
}

fn is_ignored(entry: &DirEntry, globs: &[String]) -> bool {
    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() && DEFAULT_IGNORE_DIRS.contains(&name.as_ref()) {
        return true;
    }
    globs.iter().any(|g| matches_glob(&name, g))
}

/// Whether adding `next_tokens` to a batch already holding `batch_len` files
/// and `batch_tokens` tokens would exceed either budget (spec §4.3: "batches
/// are emitted as soon as adding the next file would exceed the token
/// limit").
fn would_exceed_batch(batch_tokens: u64, batch_len: usize, next_tokens: u64, max_tokens: u64, max_files: usize) -> bool {
    batch_tokens + next_tokens > max_tokens || batch_len + 1 > max_files
}

/// Pure simulation of the greedy packing loop in [`run`], grouping a
/// sequence of per-file token sizes into batches by index. `run` itself
/// can't call this directly since it must interleave packing with streaming
/// file reads and lease renewal, but it applies the exact same
/// [`would_exceed_batch`] predicate per step.
#[cfg(test)]
fn pack_sizes(sizes: &[u64], max_tokens: u64, max_files: usize) -> Vec<Vec<usize>> {
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens: u64 = 0;

    for (i, &tokens) in sizes.iter().enumerate() {
        if would_exceed_batch(current_tokens, current.len(), tokens, max_tokens, max_files) && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(i);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Walks `target_dir`, packs discovered files into token-bounded batches,
/// and emits one `file-analysis-queue` outbox event per batch. Returns the
/// number of files discovered, or `Ok(0)` without walking if another
/// process already holds the discovery lease for this directory.
pub async fn run(
    ctx: &AppContext,
    target_dir: &Path,
    pipeline_id: &str,
    registry: &crate::registry::RegistryHandle,
) -> Result<u64, PipelineError> {
    let manager = ctx.redis_manager();
    let lease_key = discovery_lock_key(target_dir);

    let lease = match DistributedLease::acquire(&manager, &lease_key, LEASE_TTL_MS).await? {
        Some(lease) => lease,
        None => {
            info!(key = %lease_key, "discovery lease already held, skipping walk");
            return Ok(0);
        }
    };

    let globs = ignore_globs();
    let max_tokens = ctx.config.batch.max_tokens as u64;
    let max_files = ctx.config.batch.max_files as usize;

    let mut batch: Vec<(PathBuf, String)> = Vec::new();
    let mut batch_tokens: u64 = 0;
    let mut discovered: u64 = 0;
    let mut last_renew = tokio::time::Instant::now();

    let walker = WalkDir::new(target_dir).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| !is_ignored(e, &globs)) {
        if last_renew.elapsed() >= LEASE_RENEW_INTERVAL {
            if !lease.renew(&manager, LEASE_TTL_MS).await? {
                return Err(PipelineError::LeaseLost(lease.key().to_string()));
            }
            last_renew = tokio::time::Instant::now();
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "walk error, skipping entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let content = match tokio::fs::read_to_string(entry.path()).await {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "skipping unreadable or non-utf8 file");
                continue;
            }
        };

        let tokens = (content.len() as u64) / 4;
        let would_exceed = would_exceed_batch(batch_tokens, batch.len(), tokens, max_tokens, max_files);

        if would_exceed && !batch.is_empty() {
            emit_batch(ctx, &lease, &manager, std::mem::take(&mut batch)).await?;
            batch_tokens = 0;
        }

        batch_tokens += tokens;
        batch.push((entry.path().to_path_buf(), content));
        discovered += 1;
    }

    if !batch.is_empty() {
        emit_batch(ctx, &lease, &manager, batch).await?;
    }

    lease.release(&manager).await.ok();

    registry
        .increment(pipeline_id, crate::registry::CounterField::FilesDiscovered, discovered)
        .await;
    info!(target = %target_dir.display(), discovered, "file discovery complete");

    Ok(discovered)
}

async fn emit_batch(
    ctx: &AppContext,
    lease: &DistributedLease,
    manager: &redis_utils::SharedConnectionManager,
    files: Vec<(PathBuf, String)>,
) -> Result<(), PipelineError> {
    if !lease.verify_owned(manager).await? {
        return Err(PipelineError::LeaseLost(lease.key().to_string()));
    }

    let mut tx = ctx.pool.begin().await.map_err(PipelineError::from)?;
    let mut batched = Vec::with_capacity(files.len());

    for (path, content) in files {
        let path_str = path.to_string_lossy().to_string();
        let content_hash = format!("{:x}", md5_like_hash(content.as_bytes()));

        let row = sqlx::query(
            "INSERT INTO files (path, content_hash, last_modified, status) VALUES (?, ?, ?, 'discovered') \
             ON CONFLICT (path) DO UPDATE SET content_hash = excluded.content_hash, last_modified = excluded.last_modified \
             RETURNING id",
        )
        .bind(&path_str)
        .bind(&content_hash)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(PipelineError::from)?;

        let file_id: i64 = sqlx::Row::try_get(&row, "id").map_err(PipelineError::from)?;

        sqlx::query("UPDATE files SET status = ? WHERE id = ?")
            .bind(FileStatus::Analyzing.as_str())
            .bind(file_id)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::from)?;

        batched.push(BatchedFile {
            file_id,
            path: path_str,
            content,
            content_hash,
        });
    }

    let event = outbox::OutboxEvent::new(
        "file.batched",
        queues::FILE_ANALYSIS,
        serde_json::to_value(FileBatch {
            batch_id: uuid::Uuid::new_v4().to_string(),
            files: batched,
        })
        .map_err(|e| PipelineError::DataInvariant(e.to_string()))?,
    );

    outbox::OutboxRepository::insert(ctx.outbox.as_ref(), &mut tx, &event)
        .await
        .map_err(|e| PipelineError::DataInvariant(e.to_string()))?;

    tx.commit().await.map_err(PipelineError::from)?;
    Ok(())
}

/// Cheap non-cryptographic content fingerprint (spec only requires a stable
/// hash to detect unchanged files across runs, not collision resistance).
fn md5_like_hash(bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_glob_exact() {
        assert!(matches_glob("Cargo.lock", "Cargo.lock"));
        assert!(!matches_glob("Cargo.toml", "Cargo.lock"));
    }

    #[test]
    fn test_matches_glob_wildcard() {
        assert!(matches_glob("app.log", "*.log"));
        assert!(!matches_glob("app.log.gz", "*.log"));
    }

    #[test]
    fn test_discovery_lock_key_format() {
        let key = discovery_lock_key(Path::new("/tmp/repo"));
        assert_eq!(key, "discovery-lock:/tmp/repo");
    }

    /// Spec §8 boundary: a large file followed by two files small enough
    /// together to share a batch under the token limit. With `max_files`
    /// allowing at least 2 per batch, the second and third files combine
    /// into one batch while the first stands alone because pairing it with
    /// either neighbor alone would exceed the token limit.
    #[test]
    fn test_pack_sizes_combines_trailing_files_when_max_files_allows_two() {
        let sizes = [9u64, 2, 8];
        let batches = pack_sizes(&sizes, 10, 2);
        assert_eq!(batches, vec![vec![0], vec![1, 2]]);
    }

    /// Same sizes and token limit, but `max_files` of 1 forces every file
    /// into its own batch regardless of whether the token budget would
    /// have allowed combining the trailing two.
    #[test]
    fn test_pack_sizes_splits_every_file_when_max_files_is_one() {
        let sizes = [9u64, 2, 8];
        let batches = pack_sizes(&sizes, 10, 1);
        assert_eq!(batches, vec![vec![0], vec![1], vec![2]]);
    }
}
