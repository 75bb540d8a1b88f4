//! Broker manager
//!
//! Single-owner coordinator for the pub/sub connection and all derived
//! subscription state. Explicitly constructed and handed to the dispatch
//! loop by value — there is no process-wide singleton, so tests run it
//! against fake endpoints.

use arcstr::ArcStr;
use tracing::{debug, info};

use super::error::BrokerError;
use super::registry::{QueryEntry, QueryId, SubscriptionRegistry};
use crate::endpoint::Endpoint;
use crate::identity::NodeIdentity;
use crate::protocol::{
	self, Frame, SubscriptionRequest, TOPIC_ALL, TOPIC_ANNOUNCES,
};

/// Owns the endpoint, the open-topic set and the subscription registry.
///
/// Only the dispatch loop mutates a manager, so no internal locking is
/// needed.
pub struct BrokerManager<E> {
	endpoint: E,
	node_id: NodeIdentity,
	groups: Vec<String>,
	topics: Vec<ArcStr>,
	registry: SubscriptionRegistry,
}

impl<E: Endpoint> BrokerManager<E> {
	/// Wires a manager around a peered endpoint and the immutable identity
	/// data established at startup.
	pub fn new(
		endpoint: E,
		node_id: NodeIdentity,
		groups: Vec<String>,
		default_interval: u64,
	) -> Self {
		Self {
			endpoint,
			node_id,
			groups,
			topics: Vec::new(),
			registry: SubscriptionRegistry::new(default_interval),
		}
	}

	/// Opens the default queues every bridge listens on: the global topic,
	/// the own-uid topic and one topic per group membership.
	pub async fn open_default_queues(&mut self) -> Result<(), BrokerError> {
		self.create_message_queue(ArcStr::from(TOPIC_ALL)).await?;
		self.create_message_queue(protocol::uid_topic(&self.node_id))
			.await?;
		let group_topics: Vec<ArcStr> = self
			.groups
			.iter()
			.map(|group| protocol::group_topic(group))
			.collect();
		for topic in group_topics {
			self.create_message_queue(topic).await?;
		}
		Ok(())
	}

	/// Starts listening on `topic`. Idempotent: re-creating an open topic
	/// is a no-op and reports `false`.
	pub async fn create_message_queue(
		&mut self,
		topic: ArcStr,
	) -> Result<bool, BrokerError> {
		if self.topics.contains(&topic) {
			debug!(topic = %topic, "message queue already open");
			return Ok(false);
		}
		self.endpoint.subscribe(&topic).await?;
		info!(topic = %topic, "opened message queue");
		self.topics.push(topic);
		Ok(true)
	}

	/// Stops listening on `topic`. Removing an unknown topic is a no-op
	/// and reports `false`.
	pub async fn remove_message_queue(
		&mut self,
		topic: &str,
	) -> Result<bool, BrokerError> {
		let Some(position) =
			self.topics.iter().position(|open| open.as_str() == topic)
		else {
			debug!(topic = %topic, "message queue not open");
			return Ok(false);
		};
		self.endpoint.unsubscribe(topic).await?;
		info!(topic = %topic, "removed message queue");
		self.topics.remove(position);
		Ok(true)
	}

	/// Currently open topics, in creation order.
	pub fn topics(&self) -> &[ArcStr] {
		&self.topics
	}

	/// Re-issues the broker subscription for every open queue.
	///
	/// Used after the connection was re-established without server-side
	/// session state, where the broker has forgotten all subscriptions.
	pub async fn resubscribe_open_queues(&self) -> Result<(), BrokerError> {
		for topic in &self.topics {
			self.endpoint.subscribe(topic).await?;
		}
		info!(
			count = self.topics.len(),
			"resubscribed open message queues"
		);
		Ok(())
	}

	/// Registers a one-time query entry and returns its generated id.
	pub fn add_one_time_entry(
		&mut self,
		req: &SubscriptionRequest,
	) -> Result<QueryId, BrokerError> {
		self.registry.add_one_time(req)
	}

	/// Registers (or updates) a recurring query entry.
	pub fn add_schedule_entry(
		&mut self,
		req: &SubscriptionRequest,
	) -> Result<QueryId, BrokerError> {
		self.registry.add_recurring(req)
	}

	/// Removes the recurring entry registered under `query`, if any.
	pub fn remove_entry(&mut self, query: &str) -> Option<QueryEntry> {
		self.registry.remove_by_query(query)
	}

	/// Removes the entry with the given id, if any.
	pub fn remove_entry_by_id(&mut self, id: &QueryId) -> Option<QueryEntry> {
		self.registry.remove_by_id(id)
	}

	/// Current recurring-query schedule; pure function of registry state.
	pub fn schedule_config(&self) -> String {
		self.registry.schedule_config()
	}

	/// This host's stable identity.
	pub fn node_id(&self) -> &NodeIdentity {
		&self.node_id
	}

	/// Group memberships established at startup.
	pub fn groups(&self) -> &[String] {
		&self.groups
	}

	/// Read access to the registry.
	pub fn registry(&self) -> &SubscriptionRegistry {
		&self.registry
	}

	/// Publishes the one-shot startup announcement: identity, groups and
	/// local addresses. Fire-and-forget; no acknowledgement is awaited.
	pub async fn announce(
		&self,
		addresses: &[String],
	) -> Result<(), BrokerError> {
		let frame =
			Frame::announce(&self.node_id, &self.groups, addresses);
		self.endpoint
			.publish(TOPIC_ANNOUNCES, frame.encode()?)
			.await?;
		info!(
			node_id = %self.node_id,
			groups = ?self.groups,
			"announced host to monitor"
		);
		Ok(())
	}
}
