use thiserror::Error;

use crate::endpoint::EndpointError;
use crate::protocol::ProtocolError;

/// Errors raised by broker-management operations.
#[derive(Error, Debug)]
pub enum BrokerError {
	/// Registration refused: query text is empty or blank
	#[error("refusing to register entry with empty query text")]
	EmptyQuery,

	/// Endpoint operation failed
	#[error(transparent)]
	Endpoint(#[from] EndpointError),

	/// Outbound frame could not be encoded
	#[error(transparent)]
	Protocol(#[from] ProtocolError),
}
