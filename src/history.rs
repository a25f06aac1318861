//! Delivery history and daily reports.
//!
//! Stores one JSON line per finished delivery in ~/.voice-relay-history/,
//! one file per day.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, error};

use crate::delivery::DeliveryReport;

/// Record of a single delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub timestamp: String,
    pub backend: String,
    pub artifact_id: Option<String>,
    pub outcome: String,
    pub attempts: u32,
    pub reason: Option<String>,
    pub address: Option<String>,
    pub reply_text: String,
    pub chat_latency_ms: i64,
    pub speech_latency_ms: i64,
    pub delivery_latency_ms: i64,
}

impl DeliveryRecord {
    pub fn from_report(report: &DeliveryReport, reply_text: &str) -> Self {
        Self {
            timestamp: Local::now().to_rfc3339(),
            backend: report.backend.to_string(),
            artifact_id: report.artifact_id.clone(),
            outcome: report.state.to_string().to_lowercase(),
            attempts: report.attempts.len() as u32,
            reason: report.reason.as_ref().map(ToString::to_string),
            address: report.address.clone(),
            reply_text: reply_text.to_string(),
            chat_latency_ms: 0,
            speech_latency_ms: 0,
            delivery_latency_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == "succeeded"
    }
}

/// Daily JSONL files under one directory.
#[derive(Debug, Clone)]
pub struct DeliveryHistory {
    dir: PathBuf,
}

impl DeliveryHistory {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// ~/.voice-relay-history, or None without a home directory.
    pub fn in_home() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".voice-relay-history")))
    }

    fn file_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", resolve_date(date)))
    }

    /// Append a record to today's file.
    pub fn save(&self, record: &DeliveryRecord) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            error!("Failed to create history dir: {e}");
            return;
        }

        let path = self.file_for("today");
        match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut file) => match serde_json::to_string(record) {
                Ok(json) => {
                    if let Err(e) = writeln!(file, "{json}") {
                        error!("Failed to write history record: {e}");
                    } else {
                        debug!("Saved delivery record to {}", path.display());
                    }
                }
                Err(e) => error!("Failed to serialize record: {e}"),
            },
            Err(e) => error!("Failed to open history file: {e}"),
        }
    }

    pub fn load(&self, date: &str) -> Vec<DeliveryRecord> {
        let path = self.file_for(date);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                error!("Failed to load history records: {e}");
                return Vec::new();
            }
        };

        std::io::BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<DeliveryRecord>(line.trim()) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!("Skipping malformed history line: {e}");
                    None
                }
            })
            .collect()
    }

    /// Dates with history, newest first.
    pub fn dates(&self) -> Vec<String> {
        let mut dates: Vec<String> = fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().to_string_lossy().to_string();
                name.strip_suffix(".jsonl").map(str::to_string)
            })
            .collect();

        dates.sort_by(|a, b| b.cmp(a));
        dates
    }

    /// Markdown report for one day.
    pub fn report(&self, date: &str) -> String {
        render_report(&resolve_date(date), &self.load(date))
    }
}

fn resolve_date(date: &str) -> String {
    if date == "today" {
        Local::now().format("%Y-%m-%d").to_string()
    } else {
        date.to_string()
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

fn average(values: impl Iterator<Item = i64>) -> f64 {
    let (sum, count) = values.fold((0i64, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

fn render_report(display_date: &str, records: &[DeliveryRecord]) -> String {
    if records.is_empty() {
        return format!("# Voice Relay Report - {display_date}\n\nNo deliveries recorded.");
    }

    let succeeded = records.iter().filter(|r| r.succeeded()).count();
    let success_rate = succeeded as f64 * 100.0 / records.len() as f64;

    let mut histogram: BTreeMap<u32, usize> = BTreeMap::new();
    for r in records {
        *histogram.entry(r.attempts).or_default() += 1;
    }

    let mut lines = vec![
        format!("# Voice Relay Report - {display_date}"),
        String::new(),
        "## Summary".to_string(),
        format!("- **Deliveries**: {}", records.len()),
        format!("- **Succeeded**: {succeeded}"),
        format!("- **Failed**: {}", records.len() - succeeded),
        format!("- **Success rate**: {success_rate:.0}%"),
        String::new(),
        "## Latency Averages".to_string(),
        format!("- Chat: {:.0}ms", average(records.iter().map(|r| r.chat_latency_ms))),
        format!("- Speech: {:.0}ms", average(records.iter().map(|r| r.speech_latency_ms))),
        format!("- Delivery: {:.0}ms", average(records.iter().map(|r| r.delivery_latency_ms))),
        String::new(),
        "## Attempts".to_string(),
    ];
    for (attempts, count) in &histogram {
        lines.push(format!("- {attempts} attempt(s): {count}"));
    }

    lines.extend([
        String::new(),
        "## Delivery Log".to_string(),
        String::new(),
        "| Time | Backend | Outcome | Attempts | Reply | Reason |".to_string(),
        "|------|---------|---------|----------|-------|--------|".to_string(),
    ]);

    for r in records {
        // HH:MM:SS out of an RFC 3339 timestamp
        let time_str = r.timestamp.get(11..19).unwrap_or(&r.timestamp);
        let reason = r.reason.as_deref().map(|s| truncate(s, 40)).unwrap_or_else(|| "-".into());
        lines.push(format!(
            "| {time_str} | {} | {} | {} | {} | {reason} |",
            r.backend,
            r.outcome,
            r.attempts,
            truncate(&r.reply_text, 30)
        ));
    }

    lines.join("\n")
}
