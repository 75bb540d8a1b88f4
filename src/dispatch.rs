//! Event-dispatch loop
//!
//! Single consumer of the inbound work queue fed by the endpoint driver.
//! Each message is decoded, routed by its event name to one of the three
//! protocol handlers, and fully processed before the next message is
//! looked at, so registry mutations always take effect before later
//! traffic. Per-message problems are logged and skipped; only an exhausted
//! sink-retry budget terminates the loop.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, info, warn};

use crate::broker::BrokerManager;
use crate::endpoint::{Endpoint, EndpointEvent};
use crate::protocol::{
	EVENT_HOST_QUERY, EVENT_HOST_SUBSCRIBE, EVENT_HOST_UNSUBSCRIBE, Frame,
	SubscriptionRequest,
};
use crate::query::{QueryEngine, QueryLogItem};
use crate::sink::{ConfigSink, ResultSink, RetryPolicy, SinkError};

/// Category attached to every outbound snapshot record.
const RESULT_CATEGORY: &str = "event";
/// Config source key carrying the recurring-query schedule.
const SCHEDULE_SOURCE: &str = "bro";

/// Fatal dispatch errors; everything else is handled per message.
#[derive(Error, Debug)]
pub enum DispatchError {
	/// Result sink still failing after the whole retry budget
	#[error("result sink failed after {attempts} attempts: {source}")]
	ResultSink {
		/// Delivery attempts made
		attempts: u32,
		/// Last sink error observed
		source: SinkError,
	},

	/// Config sink still failing after the whole retry budget
	#[error("config sink failed after {attempts} attempts: {source}")]
	ConfigSink {
		/// Delivery attempts made
		attempts: u32,
		/// Last sink error observed
		source: SinkError,
	},
}

/// Requests the dispatch loop to stop after the current message.
pub struct DispatchController {
	shutdown_tx: oneshot::Sender<()>,
}

impl DispatchController {
	/// Signals shutdown; the loop drains nothing further.
	pub fn shutdown(self) {
		let _ = self.shutdown_tx.send(());
	}
}

/// The dispatch loop: exclusive owner of the broker manager.
pub struct DispatchLoop<E, Q, RS, CS> {
	manager: BrokerManager<E>,
	engine: Q,
	result_sink: RS,
	config_sink: CS,
	static_sources: HashMap<String, String>,
	sink_retry: RetryPolicy,
	message_rx: Receiver<EndpointEvent>,
	shutdown_rx: oneshot::Receiver<()>,
}

impl<E, Q, RS, CS> DispatchLoop<E, Q, RS, CS>
where
	E: Endpoint,
	Q: QueryEngine,
	RS: ResultSink,
	CS: ConfigSink,
{
	/// Builds the loop plus the work-queue sender for the endpoint driver
	/// and the shutdown controller.
	pub fn new(
		manager: BrokerManager<E>,
		engine: Q,
		result_sink: RS,
		config_sink: CS,
		static_sources: HashMap<String, String>,
		sink_retry: RetryPolicy,
		queue_capacity: usize,
	) -> (Self, Sender<EndpointEvent>, DispatchController) {
		let (message_tx, message_rx) = channel(queue_capacity);
		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let dispatch = Self {
			manager,
			engine,
			result_sink,
			config_sink,
			static_sources,
			sink_retry,
			message_rx,
			shutdown_rx,
		};
		let controller = DispatchController { shutdown_tx };
		(dispatch, message_tx, controller)
	}

	/// Runs until shutdown, queue closure, or a fatal sink failure.
	pub async fn run(mut self) -> Result<(), DispatchError> {
		loop {
			tokio::select! {
				_ = &mut self.shutdown_rx => {
					info!("dispatch loop: shutdown signal received");
					break;
				}
				msg = self.message_rx.recv() => {
					match msg {
						| Some(EndpointEvent::Publish(topic, payload)) => {
							self.handle_message(&topic, &payload).await?;
						}
						| Some(EndpointEvent::Reconnected) => {
							self.handle_reconnected().await;
						}
						| None => {
							info!("dispatch loop: work queue closed, exiting");
							break;
						}
					}
				}
			}
		}
		Ok(())
	}

	/// Decodes one inbound message and routes it by event name.
	async fn handle_message(
		&mut self,
		topic: &str,
		payload: &[u8],
	) -> Result<(), DispatchError> {
		let frame = match Frame::decode(payload) {
			| Ok(frame) => frame,
			| Err(err) => {
				warn!(topic = %topic, error = %err, "dropping undecodable message");
				return Ok(());
			}
		};
		let event = match frame.event_name() {
			| Ok(event) => event,
			| Err(err) => {
				warn!(topic = %topic, error = %err, "dropping message without event name");
				return Ok(());
			}
		};
		info!(event = %event, topic = %topic, "received event");

		match event {
			| known @ (EVENT_HOST_QUERY
			| EVENT_HOST_SUBSCRIBE
			| EVENT_HOST_UNSUBSCRIBE) => {
				let req = match SubscriptionRequest::from_frame(
					&frame,
					arcstr::ArcStr::from(topic),
				) {
					| Ok(req) => req,
					| Err(err) => {
						warn!(
							event = %known,
							topic = %topic,
							error = %err,
							"dropping malformed request"
						);
						return Ok(());
					}
				};
				match known {
					| EVENT_HOST_QUERY => {
						self.handle_host_query(&req).await
					}
					| EVENT_HOST_SUBSCRIBE => {
						self.handle_subscribe(&req).await
					}
					| _ => self.handle_unsubscribe(&req).await,
				}
			}
			| other => {
				// Forward compatibility: unknown events are not errors.
				debug!(event = %other, "ignoring unknown event");
				Ok(())
			}
		}
	}

	/// Re-issues the open-queue subscriptions after the endpoint came back
	/// without session state. Failures are logged only; the next reconnect
	/// triggers another attempt.
	async fn handle_reconnected(&mut self) {
		info!("reopening message queues after reconnect");
		if let Err(err) = self.manager.resubscribe_open_queues().await {
			warn!(error = %err, "resubscribe after reconnect failed");
		}
	}

	/// One-time path: register under a fresh id, execute, deliver the
	/// snapshot, then drop the entry again. The generated id keeps a
	/// colliding recurring subscription with identical text untouched.
	async fn handle_host_query(
		&mut self,
		req: &SubscriptionRequest,
	) -> Result<(), DispatchError> {
		let id = match self.manager.add_one_time_entry(req) {
			| Ok(id) => id,
			| Err(err) => {
				warn!(
					query = %req.query,
					error = %err,
					"unable to add broker query entry"
				);
				return Ok(());
			}
		};
		info!(
			response_event = %req.response_event,
			query = %req.query,
			"executing one-time query"
		);
		let rows = match self.engine.query(&req.query).await {
			| Ok(rows) => rows,
			| Err(err) => {
				warn!(
					query = %req.query,
					error = %err,
					"one-time query execution failed"
				);
				self.manager.remove_entry_by_id(&id);
				return Ok(());
			}
		};
		if rows.is_empty() {
			// No wire contract for empty results: drop silently.
			info!(
				response_event = %req.response_event,
				"one-time query has no results"
			);
			self.manager.remove_entry_by_id(&id);
			return Ok(());
		}
		let item = QueryLogItem::snapshot(
			id.to_string(),
			self.manager.node_id(),
			rows,
		);
		self.deliver_snapshot(&item).await?;
		self.manager.remove_entry_by_id(&id);
		Ok(())
	}

	/// Recurring path: install the entry; the scheduled-query engine picks
	/// it up once the pushed schedule is applied.
	async fn handle_subscribe(
		&mut self,
		req: &SubscriptionRequest,
	) -> Result<(), DispatchError> {
		match self.manager.add_schedule_entry(req) {
			| Ok(id) => {
				info!(
					query_id = %id,
					query = %req.query,
					"installed recurring query"
				);
				self.push_schedule().await
			}
			| Err(err) => {
				warn!(
					query = %req.query,
					error = %err,
					"unable to install recurring query"
				);
				Ok(())
			}
		}
	}

	/// Removal path: unregister by query text.
	async fn handle_unsubscribe(
		&mut self,
		req: &SubscriptionRequest,
	) -> Result<(), DispatchError> {
		match self.manager.remove_entry(&req.query) {
			| Some(entry) => {
				info!(
					query_id = %entry.id,
					query = %req.query,
					"cancelled recurring query"
				);
				self.push_schedule().await
			}
			| None => {
				debug!(query = %req.query, "no entry to unsubscribe");
				Ok(())
			}
		}
	}

	/// Pushes the merged configuration (static sources plus the current
	/// schedule under the reserved `bro` key) so the scheduled-query
	/// engine picks up changes without a restart.
	async fn push_schedule(&mut self) -> Result<(), DispatchError> {
		let schedule = self.manager.schedule_config();
		info!(schedule = %schedule, "applying new schedule");
		let mut sources = self.static_sources.clone();
		sources.insert(SCHEDULE_SOURCE.to_owned(), schedule);

		let mut attempt = 0;
		loop {
			match self.config_sink.apply(&sources).await {
				| Ok(()) => return Ok(()),
				| Err(err) if attempt + 1 < self.sink_retry.attempts => {
					let delay = self.sink_retry.delay_for(attempt);
					warn!(
						error = %err,
						delay = ?delay,
						"config push failed, retrying"
					);
					time::sleep(delay).await;
					attempt += 1;
				}
				| Err(source) => {
					return Err(DispatchError::ConfigSink {
						attempts: attempt + 1,
						source,
					});
				}
			}
		}
	}

	/// Delivers one snapshot record; correctness depends on results
	/// reaching the monitor, so an exhausted retry budget is fatal.
	async fn deliver_snapshot(
		&mut self,
		item: &QueryLogItem,
	) -> Result<(), DispatchError> {
		let mut attempt = 0;
		loop {
			match self
				.result_sink
				.log_snapshot(RESULT_CATEGORY, item)
				.await
			{
				| Ok(()) => return Ok(()),
				| Err(err) if attempt + 1 < self.sink_retry.attempts => {
					let delay = self.sink_retry.delay_for(attempt);
					warn!(
						query_id = %item.name,
						error = %err,
						delay = ?delay,
						"snapshot delivery failed, retrying"
					);
					time::sleep(delay).await;
					attempt += 1;
				}
				| Err(source) => {
					return Err(DispatchError::ResultSink {
						attempts: attempt + 1,
						source,
					});
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::sync::{Arc, Mutex};
	use std::time::Duration;

	use super::*;
	use crate::endpoint::EndpointError;
	use crate::identity::NodeIdentity;
	use crate::protocol::{FrameValue, TOPIC_ALL};
	use crate::query::{QueryError, Row};

	#[derive(Debug, Clone, Default)]
	struct NullEndpoint;

	/// Endpoint recording subscribe calls, for reconnect coverage.
	#[derive(Debug, Clone, Default)]
	struct CountingEndpoint {
		subs: Arc<Mutex<Vec<String>>>,
	}

	impl Endpoint for CountingEndpoint {
		async fn subscribe(&self, topic: &str) -> Result<(), EndpointError> {
			self.subs.lock().unwrap().push(topic.to_owned());
			Ok(())
		}

		async fn unsubscribe(&self, _: &str) -> Result<(), EndpointError> {
			Ok(())
		}

		async fn publish(
			&self,
			_: &str,
			_: Vec<u8>,
		) -> Result<(), EndpointError> {
			Ok(())
		}
	}

	impl Endpoint for NullEndpoint {
		async fn subscribe(&self, _: &str) -> Result<(), EndpointError> {
			Ok(())
		}

		async fn unsubscribe(&self, _: &str) -> Result<(), EndpointError> {
			Ok(())
		}

		async fn publish(
			&self,
			_: &str,
			_: Vec<u8>,
		) -> Result<(), EndpointError> {
			Ok(())
		}
	}

	/// Engine answering from a fixed table; unknown SQL is an error.
	#[derive(Debug, Clone, Default)]
	struct FakeEngine {
		results: Arc<Mutex<HashMap<String, Vec<Row>>>>,
	}

	impl FakeEngine {
		fn with_result(&self, sql: &str, rows: Vec<Row>) {
			self.results
				.lock()
				.unwrap()
				.insert(sql.to_owned(), rows);
		}
	}

	impl QueryEngine for FakeEngine {
		async fn query(&self, sql: &str) -> Result<Vec<Row>, QueryError> {
			self.results
				.lock()
				.unwrap()
				.get(sql)
				.cloned()
				.ok_or_else(|| QueryError::Engine {
					status: 1,
					stderr: format!("no such table for {sql}"),
				})
		}
	}

	/// Records deliveries; fails the first `fail_first` calls.
	#[derive(Debug, Clone, Default)]
	struct RecordingResultSink {
		records: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
		fail_first: Arc<AtomicU32>,
	}

	impl RecordingResultSink {
		fn failing_first(n: u32) -> Self {
			let sink = Self::default();
			sink.fail_first.store(n, Ordering::SeqCst);
			sink
		}

		fn records(&self) -> Vec<(String, serde_json::Value)> {
			self.records.lock().unwrap().clone()
		}
	}

	impl ResultSink for RecordingResultSink {
		async fn log_snapshot(
			&self,
			category: &str,
			item: &QueryLogItem,
		) -> Result<(), SinkError> {
			if self
				.fail_first
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
					n.checked_sub(1)
				})
				.is_ok()
			{
				return Err(SinkError::Io(std::io::Error::other(
					"sink unavailable",
				)));
			}
			self.records.lock().unwrap().push((
				category.to_owned(),
				serde_json::to_value(item).unwrap(),
			));
			Ok(())
		}
	}

	#[derive(Debug, Clone, Default)]
	struct RecordingConfigSink {
		pushes: Arc<Mutex<Vec<HashMap<String, String>>>>,
	}

	impl RecordingConfigSink {
		fn last_schedule(&self) -> Option<String> {
			self.pushes
				.lock()
				.unwrap()
				.last()
				.and_then(|sources| sources.get(SCHEDULE_SOURCE).cloned())
		}
	}

	impl ConfigSink for RecordingConfigSink {
		async fn apply(
			&self,
			sources: &HashMap<String, String>,
		) -> Result<(), SinkError> {
			self.pushes.lock().unwrap().push(sources.clone());
			Ok(())
		}
	}

	struct Harness {
		dispatch: DispatchLoop<
			NullEndpoint,
			FakeEngine,
			RecordingResultSink,
			RecordingConfigSink,
		>,
		queue: Sender<EndpointEvent>,
		controller: DispatchController,
		engine: FakeEngine,
		result_sink: RecordingResultSink,
		config_sink: RecordingConfigSink,
	}

	fn harness_with(
		result_sink: RecordingResultSink,
		sink_retry: RetryPolicy,
	) -> Harness {
		let manager = BrokerManager::new(
			NullEndpoint,
			NodeIdentity::from_string("H1"),
			vec!["lab".to_owned()],
			10,
		);
		let engine = FakeEngine::default();
		let config_sink = RecordingConfigSink::default();
		let mut static_sources = HashMap::new();
		static_sources
			.insert("filesystem".to_owned(), "{\"bro\":{}}".to_owned());
		let (dispatch, queue, controller) = DispatchLoop::new(
			manager,
			engine.clone(),
			result_sink.clone(),
			config_sink.clone(),
			static_sources,
			sink_retry,
			16,
		);
		Harness {
			dispatch,
			queue,
			controller,
			engine,
			result_sink,
			config_sink,
		}
	}

	fn harness() -> Harness {
		harness_with(
			RecordingResultSink::default(),
			RetryPolicy::new(2, Duration::ZERO),
		)
	}

	fn request_payload(
		event: &str,
		response_event: &str,
		query: &str,
	) -> Vec<u8> {
		Frame::new(vec![
			FrameValue::Text(event.to_owned()),
			FrameValue::Text(response_event.to_owned()),
			FrameValue::Text(query.to_owned()),
		])
		.encode()
		.unwrap()
	}

	#[tokio::test]
	async fn subscribe_installs_entry_and_pushes_schedule() {
		let mut h = harness();
		let payload =
			request_payload(EVENT_HOST_SUBSCRIBE, "ev1", "SELECT 1");
		h.dispatch
			.handle_message("/bro/osquery/uid/H1", &payload)
			.await
			.unwrap();

		let registry = h.dispatch.manager.registry();
		assert_eq!(registry.len(), 1);
		assert!(registry.contains_query("SELECT 1"));

		let schedule = h.config_sink.last_schedule().unwrap();
		assert!(schedule.contains("ev1"));
		assert!(schedule.contains("SELECT 1"));
		// Static config rides along with the schedule push
		let pushes = h.config_sink.pushes.lock().unwrap().clone();
		assert_eq!(
			pushes.last().unwrap().get("filesystem").unwrap(),
			"{\"bro\":{}}"
		);
	}

	#[tokio::test]
	async fn unsubscribe_removes_entry_and_schedule() {
		let mut h = harness();
		let subscribe =
			request_payload(EVENT_HOST_SUBSCRIBE, "ev1", "SELECT 1");
		let unsubscribe =
			request_payload(EVENT_HOST_UNSUBSCRIBE, "ev1", "SELECT 1");
		h.dispatch
			.handle_message(TOPIC_ALL, &subscribe)
			.await
			.unwrap();
		h.dispatch
			.handle_message(TOPIC_ALL, &unsubscribe)
			.await
			.unwrap();

		assert!(h.dispatch.manager.registry().is_empty());
		let schedule = h.config_sink.last_schedule().unwrap();
		assert!(!schedule.contains("SELECT 1"));
	}

	#[tokio::test]
	async fn resubscribe_is_idempotent() {
		let mut h = harness();
		let payload =
			request_payload(EVENT_HOST_SUBSCRIBE, "ev1", "SELECT 1");
		h.dispatch
			.handle_message(TOPIC_ALL, &payload)
			.await
			.unwrap();
		h.dispatch
			.handle_message(TOPIC_ALL, &payload)
			.await
			.unwrap();

		assert_eq!(h.dispatch.manager.registry().len(), 1);
		assert_eq!(h.dispatch.manager.topics().len(), 0);
	}

	#[tokio::test]
	async fn host_query_with_rows_logs_one_snapshot() {
		let mut h = harness();
		let mut row = Row::new();
		row.insert("n".to_owned(), "2".to_owned());
		h.engine.with_result("SELECT 2", vec![row]);

		// A recurring entry first, to check id freshness against it
		let subscribe =
			request_payload(EVENT_HOST_SUBSCRIBE, "ev1", "SELECT 1");
		h.dispatch
			.handle_message(TOPIC_ALL, &subscribe)
			.await
			.unwrap();
		let recurring_id = h
			.dispatch
			.manager
			.registry()
			.entry_by_query("SELECT 1")
			.unwrap()
			.id
			.clone();

		let query = request_payload(EVENT_HOST_QUERY, "ev2", "SELECT 2");
		h.dispatch
			.handle_message(TOPIC_ALL, &query)
			.await
			.unwrap();

		let records = h.result_sink.records();
		assert_eq!(records.len(), 1);
		let (category, record) = &records[0];
		assert_eq!(category, "event");
		assert_eq!(record["identifier"], "H1");
		assert_eq!(record["snapshot_results"][0]["n"], "2");
		let name = record["name"].as_str().unwrap();
		assert!(!name.is_empty());
		assert_ne!(name, recurring_id.as_str());
		// The delivered one-time entry is gone again
		assert_eq!(h.dispatch.manager.registry().len(), 1);
	}

	#[tokio::test]
	async fn one_time_query_with_subscribed_text_keeps_subscription() {
		let mut h = harness();
		let mut row = Row::new();
		row.insert("n".to_owned(), "1".to_owned());
		h.engine.with_result("SELECT 1", vec![row]);

		let subscribe =
			request_payload(EVENT_HOST_SUBSCRIBE, "ev1", "SELECT 1");
		h.dispatch
			.handle_message(TOPIC_ALL, &subscribe)
			.await
			.unwrap();
		let recurring_id = h
			.dispatch
			.manager
			.registry()
			.entry_by_query("SELECT 1")
			.unwrap()
			.id
			.clone();

		// Same text as the live subscription, one-time this time
		let query = request_payload(EVENT_HOST_QUERY, "ev2", "SELECT 1");
		h.dispatch
			.handle_message(TOPIC_ALL, &query)
			.await
			.unwrap();

		let records = h.result_sink.records();
		assert_eq!(records.len(), 1);
		let name = records[0].1["name"].as_str().unwrap();
		assert_ne!(name, recurring_id.as_str());

		let registry = h.dispatch.manager.registry();
		let entry = registry.entry_by_query("SELECT 1").unwrap();
		assert_eq!(entry.id, recurring_id);
		assert!(entry.recurring);
		assert_eq!(entry.response_event, "ev1");
		assert_eq!(registry.len(), 1);
		assert!(registry.schedule_config().contains("SELECT 1"));
	}

	#[tokio::test]
	async fn empty_one_time_result_is_dropped_silently() {
		let mut h = harness();
		h.engine.with_result("SELECT 2", vec![]);

		let query = request_payload(EVENT_HOST_QUERY, "ev2", "SELECT 2");
		h.dispatch
			.handle_message(TOPIC_ALL, &query)
			.await
			.unwrap();

		assert!(h.result_sink.records().is_empty());
		assert!(!h.dispatch.manager.registry().contains_query("SELECT 2"));
	}

	#[tokio::test]
	async fn failed_one_time_query_is_not_fatal() {
		let mut h = harness();
		// No result installed: FakeEngine reports an engine error
		let query =
			request_payload(EVENT_HOST_QUERY, "ev2", "SELECT broken");
		h.dispatch
			.handle_message(TOPIC_ALL, &query)
			.await
			.unwrap();
		assert!(h.result_sink.records().is_empty());
		assert!(h.dispatch.manager.registry().is_empty());
	}

	#[tokio::test]
	async fn unknown_events_and_garbage_are_ignored() {
		let mut h = harness();
		let unknown =
			request_payload("osquery::host_reboot", "ev1", "SELECT 1");
		h.dispatch
			.handle_message(TOPIC_ALL, &unknown)
			.await
			.unwrap();
		h.dispatch
			.handle_message(TOPIC_ALL, b"\xff\xfe not a frame")
			.await
			.unwrap();

		assert!(h.dispatch.manager.registry().is_empty());
		assert!(h.config_sink.pushes.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn snapshot_delivery_retries_before_success() {
		let mut h = harness_with(
			RecordingResultSink::failing_first(1),
			RetryPolicy::new(3, Duration::ZERO),
		);
		let mut row = Row::new();
		row.insert("n".to_owned(), "2".to_owned());
		h.engine.with_result("SELECT 2", vec![row]);

		let query = request_payload(EVENT_HOST_QUERY, "ev2", "SELECT 2");
		h.dispatch
			.handle_message(TOPIC_ALL, &query)
			.await
			.unwrap();
		assert_eq!(h.result_sink.records().len(), 1);
	}

	#[tokio::test]
	async fn exhausted_snapshot_retries_are_fatal() {
		let mut h = harness_with(
			RecordingResultSink::failing_first(u32::MAX),
			RetryPolicy::new(2, Duration::ZERO),
		);
		let mut row = Row::new();
		row.insert("n".to_owned(), "2".to_owned());
		h.engine.with_result("SELECT 2", vec![row]);

		let query = request_payload(EVENT_HOST_QUERY, "ev2", "SELECT 2");
		let err = h
			.dispatch
			.handle_message(TOPIC_ALL, &query)
			.await
			.unwrap_err();
		assert!(matches!(
			err,
			DispatchError::ResultSink { attempts: 2, .. }
		));
	}

	#[tokio::test]
	async fn run_processes_queue_and_stops_on_shutdown() {
		let h = harness();
		let config_sink = h.config_sink.clone();
		let payload =
			request_payload(EVENT_HOST_SUBSCRIBE, "ev1", "SELECT 1");
		h.queue
			.send(EndpointEvent::Publish(
				TOPIC_ALL.to_owned(),
				payload.into(),
			))
			.await
			.unwrap();

		let handle = tokio::spawn(h.dispatch.run());
		let deadline = tokio::time::Instant::now()
			+ Duration::from_secs(2);
		while config_sink.last_schedule().is_none() {
			assert!(tokio::time::Instant::now() < deadline);
			time::sleep(Duration::from_millis(5)).await;
		}
		h.controller.shutdown();
		handle.await.unwrap().unwrap();

		assert!(config_sink.last_schedule().unwrap().contains("SELECT 1"));
	}

	#[tokio::test]
	async fn reconnect_signal_reopens_message_queues() {
		let endpoint = CountingEndpoint::default();
		let mut manager = BrokerManager::new(
			endpoint.clone(),
			NodeIdentity::from_string("H1"),
			vec!["lab".to_owned()],
			10,
		);
		manager.open_default_queues().await.unwrap();
		let before = endpoint.subs.lock().unwrap().clone();

		let (dispatch, queue, controller) = DispatchLoop::new(
			manager,
			FakeEngine::default(),
			RecordingResultSink::default(),
			RecordingConfigSink::default(),
			HashMap::new(),
			RetryPolicy::new(2, Duration::ZERO),
			16,
		);
		queue.send(EndpointEvent::Reconnected).await.unwrap();

		let handle = tokio::spawn(dispatch.run());
		let deadline =
			tokio::time::Instant::now() + Duration::from_secs(2);
		while endpoint.subs.lock().unwrap().len() < before.len() * 2 {
			assert!(tokio::time::Instant::now() < deadline);
			time::sleep(Duration::from_millis(5)).await;
		}
		controller.shutdown();
		handle.await.unwrap().unwrap();

		let subs = endpoint.subs.lock().unwrap().clone();
		assert_eq!(&subs[before.len() ..], &before[..]);
	}
}
