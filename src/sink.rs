//! Result and configuration sinks
//!
//! Two correctness-critical outputs leave the dispatch loop: snapshot
//! result records bound for the monitor's logger, and the merged osquery
//! configuration carrying the current recurring-query schedule. Both sit
//! behind traits so tests can record deliveries, and both are retried with
//! capped exponential backoff before a failure is allowed to stop the
//! process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::query::QueryLogItem;

/// Errors raised while delivering to a sink.
#[derive(Error, Debug)]
pub enum SinkError {
	/// Sink destination could not be written
	#[error("sink i/o error: {0}")]
	Io(#[from] std::io::Error),

	/// Record could not be serialized
	#[error("sink serialization error: {0}")]
	Serialize(#[from] serde_json::Error),
}

/// Delivery retry policy: capped exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	/// Total attempts before giving up (at least 1)
	pub attempts: u32,
	/// Delay before the second attempt
	pub initial_delay: Duration,
	/// Upper bound on any single delay
	pub max_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			attempts: 5,
			initial_delay: Duration::from_millis(100),
			max_delay: Duration::from_secs(30),
		}
	}
}

impl RetryPolicy {
	/// Policy with the given attempt budget and initial delay.
	pub fn new(attempts: u32, initial_delay: Duration) -> Self {
		Self {
			attempts: attempts.max(1),
			initial_delay,
			..Self::default()
		}
	}

	/// Backoff delay after the given zero-based failed attempt.
	pub fn delay_for(&self, failed_attempt: u32) -> Duration {
		let delay =
			self.initial_delay * 2_u32.pow(failed_attempt.min(10));
		delay.min(self.max_delay)
	}
}

/// Receives snapshot result records under a category.
#[allow(async_fn_in_trait)]
pub trait ResultSink {
	/// Delivers one snapshot record.
	async fn log_snapshot(
		&self,
		category: &str,
		item: &QueryLogItem,
	) -> Result<(), SinkError>;
}

/// Receives the merged configuration (source name to serialized config).
#[allow(async_fn_in_trait)]
pub trait ConfigSink {
	/// Applies a full configuration update.
	async fn apply(
		&self,
		sources: &HashMap<String, String>,
	) -> Result<(), SinkError>;
}

/// Result sink appending JSON lines to a file, or to stdout for the
/// conventional `-` path.
#[derive(Debug, Clone)]
pub struct FileResultSink {
	path: PathBuf,
}

impl FileResultSink {
	/// Sink writing to `path`; `-` means stdout.
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	fn is_stdout(&self) -> bool {
		self.path.as_os_str() == "-"
	}
}

impl ResultSink for FileResultSink {
	async fn log_snapshot(
		&self,
		category: &str,
		item: &QueryLogItem,
	) -> Result<(), SinkError> {
		let record = json!({
			"category": category,
			"snapshot": item,
		});
		let mut line = serde_json::to_vec(&record)?;
		line.push(b'\n');
		if self.is_stdout() {
			let mut stdout = tokio::io::stdout();
			stdout.write_all(&line).await?;
			stdout.flush().await?;
			return Ok(());
		}
		let mut file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.await?;
		file.write_all(&line).await?;
		file.flush().await?;
		Ok(())
	}
}

/// Config sink rewriting a JSON file with the merged sources.
#[derive(Debug, Clone)]
pub struct FileConfigSink {
	path: PathBuf,
}

impl FileConfigSink {
	/// Sink writing the merged configuration to `path`.
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ConfigSink for FileConfigSink {
	async fn apply(
		&self,
		sources: &HashMap<String, String>,
	) -> Result<(), SinkError> {
		let body = serde_json::to_vec_pretty(sources)?;
		tokio::fs::write(&self.path, body).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::identity::NodeIdentity;
	use crate::query::Row;

	#[test]
	fn backoff_doubles_and_caps() {
		let policy =
			RetryPolicy::new(5, Duration::from_millis(100));
		assert_eq!(policy.delay_for(0), Duration::from_millis(100));
		assert_eq!(policy.delay_for(1), Duration::from_millis(200));
		assert_eq!(policy.delay_for(2), Duration::from_millis(400));
		assert_eq!(policy.delay_for(30), policy.max_delay);
	}

	#[tokio::test]
	async fn file_result_sink_appends_json_lines() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("results.log");
		let sink = FileResultSink::new(&path);

		let node = NodeIdentity::from_string("H1");
		let mut row = Row::new();
		row.insert("n".to_owned(), "1".to_owned());
		let item = QueryLogItem::snapshot(
			"qid".to_owned(),
			&node,
			vec![row],
		);
		sink.log_snapshot("event", &item).await.unwrap();
		sink.log_snapshot("event", &item).await.unwrap();

		let body = std::fs::read_to_string(&path).unwrap();
		let lines: Vec<_> = body.lines().collect();
		assert_eq!(lines.len(), 2);
		let record: serde_json::Value =
			serde_json::from_str(lines[0]).unwrap();
		assert_eq!(record["category"], "event");
		assert_eq!(record["snapshot"]["identifier"], "H1");
	}

	#[tokio::test]
	async fn stdout_result_sink_accepts_records() {
		let sink = FileResultSink::new("-");
		let node = NodeIdentity::from_string("H1");
		let item = QueryLogItem::snapshot(
			"qid".to_owned(),
			&node,
			vec![Row::new()],
		);
		sink.log_snapshot("event", &item).await.unwrap();
	}

	#[tokio::test]
	async fn file_config_sink_rewrites_sources() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("merged.conf");
		let sink = FileConfigSink::new(&path);

		let mut sources = HashMap::new();
		sources.insert("bro".to_owned(), "{}".to_owned());
		sink.apply(&sources).await.unwrap();

		let body = std::fs::read_to_string(&path).unwrap();
		let parsed: HashMap<String, String> =
			serde_json::from_str(&body).unwrap();
		assert_eq!(parsed.get("bro").map(String::as_str), Some("{}"));
	}
}
