//! Broker endpoint
//!
//! Owns the single pub/sub connection to the monitor-side broker. The
//! `Endpoint` trait is the seam the broker manager talks through, so tests
//! can substitute a recording fake; `MqttEndpoint` is the real
//! implementation over `rumqttc`. The event-loop driver forwards every
//! inbound publish into the dispatch work queue and never touches
//! subscription state itself.

use std::time::Duration;

use bytes::Bytes;
use rumqttc::Packet::{ConnAck, Disconnect, Publish};
use rumqttc::{AsyncClient, ConnectReturnCode, EventLoop, MqttOptions, QoS};
use rumqttc::{Event::Incoming, Event::Outgoing};
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::BrokerAddr;
use crate::sink::RetryPolicy;

/// Work item handed from the driver task to the dispatch loop.
#[derive(Debug)]
pub enum EndpointEvent {
	/// Inbound publish: topic and raw payload.
	Publish(String, Bytes),
	/// The connection came back without server-side session state, so
	/// all subscriptions must be re-issued.
	Reconnected,
}

/// Capacity of the rumqttc request channel.
const EVENT_LOOP_CAPACITY: usize = 10;
/// Consecutive poll errors tolerated before the driver gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
/// First retry delay after a poll error.
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Ceiling for poll-error retry delays.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Errors raised by the broker endpoint.
#[derive(Error, Debug)]
pub enum EndpointError {
	/// Request to the connection task failed
	#[error("endpoint client error: {0}")]
	Client(#[from] rumqttc::ClientError),

	/// Initial peering failed after the whole retry budget
	#[error("cannot peer with broker at {addr} after {attempts} attempts: {source}")]
	Peering {
		/// Broker address we tried to reach
		addr: BrokerAddr,
		/// Attempts made before giving up
		attempts: u32,
		/// Last connection error observed
		source: rumqttc::ConnectionError,
	},
}

/// Pub/sub operations the broker manager needs from a connection.
#[allow(async_fn_in_trait)]
pub trait Endpoint {
	/// Starts listening on a topic.
	async fn subscribe(&self, topic: &str) -> Result<(), EndpointError>;
	/// Stops listening on a topic.
	async fn unsubscribe(&self, topic: &str) -> Result<(), EndpointError>;
	/// Publishes a payload on a topic.
	async fn publish(
		&self,
		topic: &str,
		payload: Vec<u8>,
	) -> Result<(), EndpointError>;
}

/// Endpoint over a live MQTT connection.
#[derive(Clone)]
pub struct MqttEndpoint {
	client: AsyncClient,
}

/// Owns the MQTT event loop until it is spawned as the driver task.
pub struct EndpointDriver {
	event_loop: EventLoop,
}

impl MqttEndpoint {
	/// Connects to the broker, retrying the initial peering per `retry`.
	///
	/// Returns only after a CONNACK has been observed, so a returned
	/// endpoint is known to have reached the broker at least once.
	pub async fn connect(
		name: &str,
		addr: &BrokerAddr,
		retry: &RetryPolicy,
	) -> Result<(Self, EndpointDriver), EndpointError> {
		let mut attempt = 0;
		loop {
			let mut options =
				MqttOptions::new(name, &addr.host, addr.port);
			options.set_keep_alive(Duration::from_secs(10));
			let (client, mut event_loop) =
				AsyncClient::new(options, EVENT_LOOP_CAPACITY);
			match wait_for_connack(&mut event_loop).await {
				| Ok(()) => {
					info!(addr = %addr, "peered with broker");
					return Ok((
						Self { client },
						EndpointDriver { event_loop },
					));
				}
				| Err(err) if attempt + 1 < retry.attempts => {
					let delay = retry.delay_for(attempt);
					warn!(
						addr = %addr,
						attempt = attempt + 1,
						delay = ?delay,
						error = %err,
						"broker peering failed, retrying"
					);
					time::sleep(delay).await;
					attempt += 1;
				}
				| Err(err) => {
					return Err(EndpointError::Peering {
						addr: addr.clone(),
						attempts: attempt + 1,
						source: err,
					});
				}
			}
		}
	}

	/// Sends the MQTT disconnect, letting the driver task terminate.
	pub async fn disconnect(&self) -> Result<(), EndpointError> {
		self.client.disconnect().await?;
		Ok(())
	}
}

impl Endpoint for MqttEndpoint {
	async fn subscribe(&self, topic: &str) -> Result<(), EndpointError> {
		self.client.subscribe(topic, QoS::AtLeastOnce).await?;
		Ok(())
	}

	async fn unsubscribe(&self, topic: &str) -> Result<(), EndpointError> {
		self.client.unsubscribe(topic).await?;
		Ok(())
	}

	async fn publish(
		&self,
		topic: &str,
		payload: Vec<u8>,
	) -> Result<(), EndpointError> {
		self.client
			.publish(topic, QoS::AtLeastOnce, false, payload)
			.await?;
		Ok(())
	}
}

/// Polls until the broker acknowledges the connection.
async fn wait_for_connack(
	event_loop: &mut EventLoop,
) -> Result<(), rumqttc::ConnectionError> {
	loop {
		match event_loop.poll().await {
			| Ok(Incoming(ConnAck(_))) => return Ok(()),
			| Ok(notification) => {
				debug!(notification = ?notification, "pre-connack notification");
			}
			| Err(err) => return Err(err),
		}
	}
}

impl EndpointDriver {
	/// Spawns the event-loop task feeding inbound publishes into `queue`.
	///
	/// The task terminates when a disconnect passes in either direction or
	/// after too many consecutive poll errors.
	pub fn spawn(
		self,
		queue: Sender<EndpointEvent>,
	) -> tokio::task::JoinHandle<()> {
		tokio::spawn(Self::run(self.event_loop, queue))
	}

	async fn run(mut event_loop: EventLoop, queue: Sender<EndpointEvent>) {
		let mut error_count = 0;
		loop {
			match event_loop.poll().await {
				| Ok(Incoming(Publish(p))) => {
					error_count = 0;
					debug!(
						topic = %p.topic,
						payload_size = p.payload.len(),
						"received publish"
					);
					let event = EndpointEvent::Publish(p.topic, p.payload);
					if queue.send(event).await.is_err() {
						info!("dispatch queue closed, stopping driver");
						break;
					}
				}
				| Ok(Incoming(ConnAck(ack))) => {
					// The initial CONNACK is consumed before the driver
					// starts, so any seen here follows an auto-reconnect.
					error_count = 0;
					match (ack.code, ack.session_present) {
						| (ConnectReturnCode::Success, false) => {
							info!(
								"reconnected without session, \
								 requesting resubscribe"
							);
							if queue
								.send(EndpointEvent::Reconnected)
								.await
								.is_err()
							{
								info!("dispatch queue closed, stopping driver");
								break;
							}
						}
						| (ConnectReturnCode::Success, true) => {
							info!(
								"reconnected with session preserved, \
								 subscriptions maintained by broker"
							);
						}
						| (code, _) => {
							warn!(code = ?code, "reconnect refused by broker");
						}
					}
				}
				| Ok(Incoming(Disconnect)) => {
					info!("broker sent disconnect");
					break;
				}
				| Ok(Outgoing(rumqttc::Outgoing::Disconnect)) => {
					info!("disconnect sent to broker");
					break;
				}
				| Ok(notification) => {
					error_count = 0;
					debug!(notification = ?notification, "broker notification");
				}
				| Err(err) => {
					error_count += 1;
					error!(
						error_count = error_count,
						error = %err,
						"endpoint event loop error"
					);
					if error_count >= MAX_CONSECUTIVE_ERRORS {
						error!(
							max_errors = MAX_CONSECUTIVE_ERRORS,
							"too many consecutive errors, terminating driver"
						);
						break;
					}
					let delay = INITIAL_RETRY_DELAY
						* 2_u32.pow((error_count - 1).min(10));
					let delay = delay.min(MAX_RETRY_DELAY);
					warn!(delay = ?delay, "retrying broker connection");
					time::sleep(delay).await;
				}
			}
		}
		info!("endpoint driver terminated");
	}
}
