//! Connection handshake and out-of-band metadata.
//!
//! The server writes a [`ServerConfiguration`] frame as the very first frame
//! on every connection. The same protocol version and read timeout are
//! available without connecting through [`ServerMetadata`], served as JSON
//! by the transport on a dedicated HTTP method.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol version advertised in the configuration frame and metadata.
pub const PROTOCOL_VERSION: &str = "1.0";

/// HTTP method the transport answers with [`ServerMetadata`].
pub const METADATA_METHOD: &str = "TETHER";

/// Contents of the configuration frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfiguration {
    pub protocol_version: String,
    /// Read deadline the server applies to each frame.
    pub read_timeout: Duration,
    /// Largest frame the server accepts.
    pub message_buffer_size: usize,
}

/// Metadata document returned by the out-of-band query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetadata {
    pub protocol_version: String,
    pub read_timeout_seconds: u64,
}

impl From<&ServerConfiguration> for ServerMetadata {
    fn from(config: &ServerConfiguration) -> Self {
        Self {
            protocol_version: config.protocol_version.clone(),
            read_timeout_seconds: config.read_timeout.as_secs(),
        }
    }
}
