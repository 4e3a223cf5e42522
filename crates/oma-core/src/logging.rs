//! Append-only JSONL run log with secret redaction and retention.
//!
//! Records land in `<OMA_LOG_DIR>/YYYY/MM/runs.jsonl`; when anything had to be
//! redacted an `audit.jsonl` entry is written next to it.

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::warn;

const LOG_DIR_ENV: &str = "OMA_LOG_DIR";
const RETENTION_ENV: &str = "OMA_LOG_RETENTION_DAYS";
const DEFAULT_LOG_DIR: &str = "data/logs";
const DEFAULT_RETENTION_DAYS: u64 = 90;
const RUN_LOG_FILE: &str = "runs.jsonl";
const AUDIT_LOG_FILE: &str = "audit.jsonl";
const SUMMARY_LIMIT: usize = 2_000;

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key",
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "secret",
            Regex::new(r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid secret regex"),
        ),
        (
            "bearer",
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "sk_token",
            Regex::new(r"(sk-[A-Za-z0-9\-]{16,})").expect("invalid sk_token regex"),
        ),
    ]
});

/// What a finished pipeline run leaves in the log.
#[derive(Debug, Clone)]
pub struct RunLogInput {
    pub run_id: String,
    pub agents: Vec<String>,
    pub backend: Option<String>,
    pub completed: bool,
    pub summary: String,
    pub error: Option<String>,
    pub context_keys: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Serialize)]
struct RunLogRecord {
    timestamp: String,
    run_id: String,
    agents: Vec<String>,
    backend: Option<String>,
    completed: bool,
    summary: String,
    error: Option<String>,
    context_keys: Vec<String>,
    duration_ms: u64,
    redactions: Vec<String>,
}

#[derive(Serialize)]
struct AuditLogRecord {
    timestamp: String,
    run_id: String,
    redactions: Vec<String>,
}

fn log_base_dir() -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR))
}

fn retention_days() -> u64 {
    std::env::var(RETENTION_ENV)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{}", line)
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// Mask anything that looks like a credential, noting which patterns fired.
pub fn sanitize_text(input: &str, redactions: &mut BTreeSet<String>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        if matched {
            redactions.insert(name.to_string());
        }
    }
    output
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Append a run record under `OMA_LOG_DIR` and apply retention.
pub fn log_run_completion(input: RunLogInput) -> Result<()> {
    log_run_completion_in(&log_base_dir(), retention_days(), input)
}

pub fn log_run_completion_in(base_dir: &Path, retention: u64, input: RunLogInput) -> Result<()> {
    let timestamp = Utc::now();
    let mut redactions = BTreeSet::new();

    let summary = sanitize_text(&truncate(&input.summary, SUMMARY_LIMIT), &mut redactions);
    let error = input
        .error
        .as_deref()
        .map(|value| sanitize_text(value, &mut redactions));

    let record = RunLogRecord {
        timestamp: timestamp.to_rfc3339(),
        run_id: input.run_id.clone(),
        agents: input.agents,
        backend: input.backend,
        completed: input.completed,
        summary,
        error,
        context_keys: input.context_keys,
        duration_ms: input.duration_ms,
        redactions: redactions.into_iter().collect(),
    };

    let month_dir = base_dir
        .join(format!("{:04}", timestamp.year()))
        .join(format!("{:02}", timestamp.month()));
    append_json_line(&month_dir.join(RUN_LOG_FILE), &record)?;

    if !record.redactions.is_empty() {
        let audit = AuditLogRecord {
            timestamp: record.timestamp.clone(),
            run_id: input.run_id.clone(),
            redactions: record.redactions.clone(),
        };
        append_json_line(&month_dir.join(AUDIT_LOG_FILE), &audit)?;
        warn!(
            run_id = %input.run_id,
            fields = ?record.redactions,
            "redacted potential secrets from run log"
        );
    }

    enforce_retention(base_dir, retention)
}

fn enforce_retention(base_dir: &Path, retention: u64) -> Result<()> {
    if retention == 0 || !base_dir.exists() {
        return Ok(());
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    prune_directory(base_dir, cutoff)
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata
                .modified()
                .map(|time| time < cutoff)
                .unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }
    Ok(())
}
