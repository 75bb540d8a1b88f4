//! Wire protocol between hosts and the monitor
//!
//! Messages are ordered tuples whose first element is an event-name string;
//! the remaining elements are event-specific. Frames are encoded with
//! bincode. Unknown event names are not errors — they are skipped so newer
//! monitors can talk to older bridges.

use arcstr::ArcStr;
use bincode::{Decode, Encode};
use thiserror::Error;

use crate::identity::NodeIdentity;

/// One-time query execution request.
pub const EVENT_HOST_QUERY: &str = "osquery::host_query";
/// Recurring query installation request.
pub const EVENT_HOST_SUBSCRIBE: &str = "osquery::host_subscribe";
/// Recurring query cancellation request.
pub const EVENT_HOST_UNSUBSCRIBE: &str = "osquery::host_unsubscribe";
/// Startup announcement of a new host.
pub const EVENT_HOST_NEW: &str = "host_new";

/// Topic every bridge listens on.
pub const TOPIC_ALL: &str = "/bro/osquery/all";
/// Publish-only topic for startup announcements.
pub const TOPIC_ANNOUNCES: &str = "/bro/osquery/announces";

/// Topic addressing a single host by its node id.
pub fn uid_topic(node_id: &NodeIdentity) -> ArcStr {
	ArcStr::from(format!("/bro/osquery/uid/{}", node_id))
}

/// Topic addressing every host in a group.
pub fn group_topic(group: &str) -> ArcStr {
	ArcStr::from(format!("/bro/osquery/group/{group}"))
}

/// Errors raised while decoding or interpreting a wire frame.
#[derive(Error, Debug)]
pub enum ProtocolError {
	/// Payload could not be decoded as a frame
	#[error("undecodable frame: {0}")]
	Undecodable(#[from] bincode::error::DecodeError),

	/// Frame could not be re-encoded for publishing
	#[error("unencodable frame: {0}")]
	Unencodable(#[from] bincode::error::EncodeError),

	/// Frame has no leading event-name field
	#[error("frame carries no event name")]
	MissingEventName,

	/// Event-specific field is absent or has the wrong shape
	#[error("event '{event}' is missing field '{field}'")]
	MissingField {
		/// Event name the frame announced
		event: String,
		/// Name of the absent field
		field: &'static str,
	},
}

/// One positional element of a wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum FrameValue {
	/// A single string field
	Text(String),
	/// A list-of-strings field (group lists, address lists)
	List(Vec<String>),
}

/// An ordered tuple of fields; the first is always the event name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct Frame {
	fields: Vec<FrameValue>,
}

impl Frame {
	/// Builds a frame from its ordered fields.
	pub fn new(fields: Vec<FrameValue>) -> Self {
		Self { fields }
	}

	/// Builds the startup announce frame:
	/// (event, node id, group list, address list).
	pub fn announce(
		node_id: &NodeIdentity,
		groups: &[String],
		addresses: &[String],
	) -> Self {
		Self::new(vec![
			FrameValue::Text(EVENT_HOST_NEW.to_owned()),
			FrameValue::Text(node_id.as_str().to_owned()),
			FrameValue::List(groups.to_vec()),
			FrameValue::List(addresses.to_vec()),
		])
	}

	/// Decodes a frame from a raw payload.
	pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
		let (frame, _) = bincode::decode_from_slice(
			payload,
			bincode::config::standard(),
		)?;
		Ok(frame)
	}

	/// Encodes the frame for publishing.
	pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
		Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
	}

	/// The event name carried in the first field.
	pub fn event_name(&self) -> Result<&str, ProtocolError> {
		match self.fields.first() {
			| Some(FrameValue::Text(name)) => Ok(name),
			| _ => Err(ProtocolError::MissingEventName),
		}
	}

	/// The nth field as text, if present and textual.
	fn text_field(&self, index: usize) -> Option<&str> {
		match self.fields.get(index) {
			| Some(FrameValue::Text(s)) => Some(s),
			| _ => None,
		}
	}
}

/// Transient request parsed from a `host_query`/`host_subscribe`/
/// `host_unsubscribe` frame. Consumed to produce a registry entry; never
/// stored itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
	/// Topic the request arrived on
	pub topic: ArcStr,
	/// Event name the monitor expects results under
	pub response_event: String,
	/// SQL text to execute or schedule
	pub query: String,
	/// One-time execution rather than a recurring schedule
	pub one_time: bool,
}

impl SubscriptionRequest {
	/// Parses the event-specific fields
	/// (response event, query text) of a request frame.
	pub fn from_frame(
		frame: &Frame,
		topic: ArcStr,
	) -> Result<Self, ProtocolError> {
		let event = frame.event_name()?.to_owned();
		let missing = |field| ProtocolError::MissingField {
			event: event.clone(),
			field,
		};
		let response_event = frame
			.text_field(1)
			.ok_or_else(|| missing("response_event"))?
			.to_owned();
		let query =
			frame.text_field(2).ok_or_else(|| missing("query"))?.to_owned();
		Ok(Self {
			topic,
			response_event,
			query,
			one_time: event == EVENT_HOST_QUERY,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request_frame(event: &str, response_event: &str, query: &str) -> Frame {
		Frame::new(vec![
			FrameValue::Text(event.to_owned()),
			FrameValue::Text(response_event.to_owned()),
			FrameValue::Text(query.to_owned()),
		])
	}

	#[test]
	fn frame_round_trips_through_bincode() {
		let frame = request_frame(EVENT_HOST_SUBSCRIBE, "ev1", "SELECT 1");
		let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
		assert_eq!(decoded, frame);
		assert_eq!(decoded.event_name().unwrap(), EVENT_HOST_SUBSCRIBE);
	}

	#[test]
	fn subscription_request_carries_all_fields() {
		let frame = request_frame(EVENT_HOST_QUERY, "ev2", "SELECT 2");
		let req = SubscriptionRequest::from_frame(
			&frame,
			ArcStr::from(TOPIC_ALL),
		)
		.unwrap();
		assert_eq!(req.response_event, "ev2");
		assert_eq!(req.query, "SELECT 2");
		assert!(req.one_time);
	}

	#[test]
	fn subscribe_request_is_not_one_time() {
		let frame = request_frame(EVENT_HOST_SUBSCRIBE, "ev1", "SELECT 1");
		let req = SubscriptionRequest::from_frame(
			&frame,
			ArcStr::from(TOPIC_ALL),
		)
		.unwrap();
		assert!(!req.one_time);
	}

	#[test]
	fn truncated_frame_reports_missing_field() {
		let frame = Frame::new(vec![FrameValue::Text(
			EVENT_HOST_UNSUBSCRIBE.to_owned(),
		)]);
		let err = SubscriptionRequest::from_frame(
			&frame,
			ArcStr::from(TOPIC_ALL),
		)
		.unwrap_err();
		assert!(matches!(err, ProtocolError::MissingField { .. }));
	}

	#[test]
	fn empty_frame_has_no_event_name() {
		let frame = Frame::default();
		assert!(matches!(
			frame.event_name(),
			Err(ProtocolError::MissingEventName)
		));
	}

	#[test]
	fn announce_frame_shape() {
		let node = NodeIdentity::from_string("H1");
		let frame = Frame::announce(
			&node,
			&["lab".to_owned()],
			&["10.0.0.7".to_owned()],
		);
		assert_eq!(frame.event_name().unwrap(), EVENT_HOST_NEW);
		let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
		assert_eq!(decoded, frame);
	}

	#[test]
	fn topic_builders() {
		let node = NodeIdentity::from_string("H1");
		assert_eq!(uid_topic(&node).as_str(), "/bro/osquery/uid/H1");
		assert_eq!(group_topic("lab").as_str(), "/bro/osquery/group/lab");
	}
}
