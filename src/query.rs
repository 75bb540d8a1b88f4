//! Query-engine seam
//!
//! The bridge never interprets SQL itself; it hands query text to an
//! external engine and forwards the rows that come back. The engine behind
//! the trait is osquery — in-process for the real deployment, a recording
//! fake in tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

use crate::identity::NodeIdentity;

/// One result row: column name to value.
pub type Row = BTreeMap<String, String>;

/// Errors surfaced by a query engine.
#[derive(Error, Debug)]
pub enum QueryError {
	/// Engine process could not be spawned or awaited
	#[error("query engine i/o error: {0}")]
	Io(#[from] std::io::Error),

	/// Engine ran but rejected the query
	#[error("query engine failed (status {status}): {stderr}")]
	Engine {
		/// Process exit status
		status: i32,
		/// Captured standard error
		stderr: String,
	},

	/// Engine output was not valid result JSON
	#[error("undecodable engine output: {0}")]
	Decode(#[from] serde_json::Error),
}

/// Executes SQL text against the host's query engine.
#[allow(async_fn_in_trait)]
pub trait QueryEngine {
	/// Runs one query to completion and returns all rows.
	async fn query(&self, sql: &str) -> Result<Vec<Row>, QueryError>;
}

/// Engine that shells out to the `osqueryi` binary with `--json` output.
#[derive(Debug, Clone)]
pub struct OsqueryiEngine {
	binary: PathBuf,
}

impl OsqueryiEngine {
	/// Uses the given `osqueryi` binary path.
	pub fn new(binary: impl Into<PathBuf>) -> Self {
		Self {
			binary: binary.into(),
		}
	}
}

impl QueryEngine for OsqueryiEngine {
	async fn query(&self, sql: &str) -> Result<Vec<Row>, QueryError> {
		let output = Command::new(&self.binary)
			.arg("--json")
			.arg(sql)
			.stdin(Stdio::null())
			.output()
			.await?;
		if !output.status.success() {
			return Err(QueryError::Engine {
				status: output.status.code().unwrap_or(-1),
				stderr: String::from_utf8_lossy(&output.stderr)
					.trim()
					.to_owned(),
			});
		}
		Ok(serde_json::from_slice(&output.stdout)?)
	}
}

/// Snapshot result record delivered to the result sink.
///
/// Field names follow the osquery snapshot log format so the monitor-side
/// logger can consume records unchanged.
#[derive(Debug, Clone, Serialize)]
pub struct QueryLogItem {
	/// Generated query id the result belongs to
	pub name: String,
	/// Node identity of the executing host
	pub identifier: String,
	/// Unix seconds at assembly time
	pub time: i64,
	/// Human-readable form of `time`
	pub calendar_time: String,
	/// All rows of the snapshot
	pub snapshot_results: Vec<Row>,
}

impl QueryLogItem {
	/// Assembles a snapshot record stamped with the current time.
	pub fn snapshot(
		name: String,
		identifier: &NodeIdentity,
		snapshot_results: Vec<Row>,
	) -> Self {
		let now = Utc::now();
		Self {
			name,
			identifier: identifier.as_str().to_owned(),
			time: now.timestamp(),
			calendar_time: now
				.format("%a %b %e %H:%M:%S %Y UTC")
				.to_string(),
			snapshot_results,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn snapshot_record_shape() {
		let node = NodeIdentity::from_string("H1");
		let mut row = Row::new();
		row.insert("address".to_owned(), "10.0.0.7".to_owned());
		let item =
			QueryLogItem::snapshot("qid-1".to_owned(), &node, vec![row]);

		let json: serde_json::Value =
			serde_json::to_value(&item).unwrap();
		assert_eq!(json["name"], "qid-1");
		assert_eq!(json["identifier"], "H1");
		assert_eq!(json["snapshot_results"][0]["address"], "10.0.0.7");
		assert!(json["time"].as_i64().unwrap() > 0);
		assert!(json["calendar_time"].as_str().unwrap().ends_with("UTC"));
	}
}
