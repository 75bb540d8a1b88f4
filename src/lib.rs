//! # osquery-bro-bridge
//!
//! Bridges a fleet of osquery hosts to a central Bro/Zeek network-security
//! monitor over MQTT pub/sub: inbound messages become host-query
//! executions, query results become outbound events.
//!
//! ## Architecture
//!
//! - [`endpoint`] owns the single broker connection; its driver task feeds
//!   every inbound publish into one ordered work queue.
//! - [`broker`] is the stateful core: the [`broker::BrokerManager`] facade
//!   over the open-topic set and the [`broker::SubscriptionRegistry`] of
//!   one-time and recurring query entries.
//! - [`dispatch`] is the control loop: it decodes each message, routes it
//!   by event name (`host_query`, `host_subscribe`, `host_unsubscribe`)
//!   and pushes schedule changes back into the host configuration.
//! - [`query`] and [`sink`] are the seams to the external query engine,
//!   the result logger and the configuration store.
//!
//! ## Protocol sketch
//!
//! Every bridge listens on `/bro/osquery/all`, its own
//! `/bro/osquery/uid/<id>` topic and one `/bro/osquery/group/<g>` topic
//! per membership. On startup it announces itself once on
//! `/bro/osquery/announces`. Messages are ordered tuples whose first
//! element is the event name; unknown events are ignored for forward
//! compatibility.

#![warn(missing_docs)]

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod identity;
pub mod protocol;
pub mod query;
pub mod sink;

// === Core public API ===
pub use broker::{BrokerManager, QueryEntry, QueryId, SubscriptionRegistry};
pub use config::{BridgeConfig, BrokerAddr, ConfigError};
pub use dispatch::{DispatchController, DispatchError, DispatchLoop};
pub use endpoint::{
	Endpoint, EndpointDriver, EndpointError, EndpointEvent, MqttEndpoint,
};
pub use identity::NodeIdentity;
pub use protocol::{Frame, FrameValue, ProtocolError, SubscriptionRequest};
pub use query::{OsqueryiEngine, QueryEngine, QueryError, QueryLogItem, Row};
pub use sink::{
	ConfigSink, FileConfigSink, FileResultSink, ResultSink, RetryPolicy,
	SinkError,
};
