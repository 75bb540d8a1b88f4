//! Query-entry registry
//!
//! Entries are keyed by a generated `QueryId` that is never reused.
//! Recurring entries also keep a query-text index because the wire
//! protocol cancels subscriptions by text; re-subscribing identical text
//! updates the existing entry in place instead of duplicating it.
//! One-time entries are id-only and never shadow a recurring
//! subscription that happens to carry the same text.

use std::collections::{BTreeMap, HashMap};

use serde_json::json;
use uuid::Uuid;

use super::error::BrokerError;
use crate::protocol::SubscriptionRequest;

/// Generated identifier of a registered query entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(String);

impl QueryId {
	fn generate() -> Self {
		Self(format!("bro_{}", Uuid::new_v4().simple()))
	}

	/// The identifier as a string slice.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for QueryId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

/// One registered query: either a pending one-time execution or an
/// installed recurring subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEntry {
	/// Generated id, never reused after removal
	pub id: QueryId,
	/// SQL text to execute
	pub query: String,
	/// Event name the monitor expects results under
	pub response_event: String,
	/// Part of the recurring schedule rather than a one-shot
	pub recurring: bool,
	/// Schedule interval in seconds (recurring entries only)
	pub interval: u64,
}

/// Owns all live query entries.
#[derive(Debug)]
pub struct SubscriptionRegistry {
	entries: HashMap<QueryId, QueryEntry>,
	by_query: HashMap<String, QueryId>,
	default_interval: u64,
}

impl SubscriptionRegistry {
	/// Empty registry assigning `default_interval` to recurring entries.
	pub fn new(default_interval: u64) -> Self {
		Self {
			entries: HashMap::new(),
			by_query: HashMap::new(),
			default_interval,
		}
	}

	/// Registers a one-time entry under a fresh id.
	///
	/// One-time entries never join the query-text index: identical text may
	/// name a live recurring subscription, and a one-shot execution must
	/// not touch it. Callers clean one-time entries up by id.
	pub fn add_one_time(
		&mut self,
		req: &SubscriptionRequest,
	) -> Result<QueryId, BrokerError> {
		let id = self.validate(req).map(|_| QueryId::generate())?;
		self.store(id.clone(), req, false);
		Ok(id)
	}

	/// Registers a recurring entry. Idempotent per query text: an existing
	/// recurring entry keeps its id and gets its metadata updated.
	pub fn add_recurring(
		&mut self,
		req: &SubscriptionRequest,
	) -> Result<QueryId, BrokerError> {
		self.validate(req)?;
		let id = match self.by_query.get(&req.query) {
			| Some(existing) => existing.clone(),
			| None => {
				let id = QueryId::generate();
				self.by_query.insert(req.query.clone(), id.clone());
				id
			}
		};
		self.store(id.clone(), req, true);
		Ok(id)
	}

	fn validate(&self, req: &SubscriptionRequest) -> Result<(), BrokerError> {
		if req.query.trim().is_empty() {
			return Err(BrokerError::EmptyQuery);
		}
		Ok(())
	}

	fn store(&mut self, id: QueryId, req: &SubscriptionRequest, recurring: bool) {
		self.entries.insert(id.clone(), QueryEntry {
			id,
			query: req.query.clone(),
			response_event: req.response_event.clone(),
			recurring,
			interval: self.default_interval,
		});
	}

	/// Removes the recurring entry for `query` if present; removal is
	/// terminal. One-time entries are invisible to text-keyed removal.
	pub fn remove_by_query(&mut self, query: &str) -> Option<QueryEntry> {
		let id = self.by_query.remove(query)?;
		self.entries.remove(&id)
	}

	/// Removes an entry by its generated id, keeping the query-text index
	/// consistent when the entry was recurring.
	pub fn remove_by_id(&mut self, id: &QueryId) -> Option<QueryEntry> {
		let entry = self.entries.remove(id)?;
		if entry.recurring {
			self.by_query.remove(&entry.query);
		}
		Some(entry)
	}

	/// Whether any live entry carries this query text.
	pub fn contains_query(&self, query: &str) -> bool {
		self.by_query.contains_key(query)
	}

	/// Looks up a live entry by query text.
	pub fn entry_by_query(&self, query: &str) -> Option<&QueryEntry> {
		self.entries.get(self.by_query.get(query)?)
	}

	/// Number of live entries.
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Whether the registry holds no entries.
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Serializes all recurring entries into the schedule section consumed
	/// by the scheduled-query engine. Pure: identical registry state always
	/// yields the identical string (entries sorted by id).
	pub fn schedule_config(&self) -> String {
		let schedule: BTreeMap<&str, serde_json::Value> = self
			.entries
			.values()
			.filter(|entry| entry.recurring)
			.map(|entry| {
				(entry.id.as_str(), json!({
					"query": entry.query,
					"interval": entry.interval,
					"response_event": entry.response_event,
				}))
			})
			.collect();
		json!({ "schedule": schedule }).to_string()
	}
}
