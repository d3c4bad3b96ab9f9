//! Traffic log for assistant exchanges
//!
//! Appends one line per request and per settled exchange to traffic.log.
//! Bodies are truncated and credentials redacted before they are written.

use config::PathManager;
use std::io::Write;
use std::path::Path;

use crate::transport::ChatRequest;

/// Maximum characters to log for a body
const MAX_CONTENT_LOG_CHARS: usize = 200;

fn truncate_for_log(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{}... ({} chars total)", truncated, char_count)
    }
}

pub fn log_stream_start(request: &ChatRequest) {
    let json = serde_json::to_string(&request.redacted())
        .unwrap_or_else(|_| "<serialization error>".to_string());
    log_traffic(
        "STREAM_START",
        &format!("[{}] {}", request.provider, truncate_for_log(&json, MAX_CONTENT_LOG_CHARS)),
    );
}

pub fn log_stream_end(provider: &str, reply: &str) {
    log_traffic(
        "STREAM_END",
        &format!("[{}] {}", provider, truncate_for_log(reply, MAX_CONTENT_LOG_CHARS)),
    );
}

pub fn log_error(provider: &str, error: &str) {
    log_traffic("ERROR", &format!("[{}] {}", provider, error));
}

fn log_traffic(event_type: &str, message: &str) {
    let Some(log_path) = PathManager::traffic_log_path() else {
        return;
    };
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let line = format!("[{}] [TRAFFIC] [{}] {}", timestamp, event_type, message);

    // Exchanges log from runtime tasks; keep file I/O off the async workers.
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || append_line(&log_path, &line));
        }
        Err(_) => append_line(&log_path, &line),
    }
}

fn append_line(path: &Path, line: &str) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        let _ = writeln!(file, "{}", line);
    }
}
