use serde_json::Value;

use crate::error::Result;

/// Outbound capability handed to topic handlers.
///
/// Both delivery mechanisms implement this seam: a [`crate::SocketChannel`]
/// frames the value onto its connection, while test doubles can record it.
pub trait ChannelSender {
    /// Name identifying the delivery mechanism or peer this sender
    /// represents, for diagnostics and handler-side routing.
    fn name(&self) -> &str;

    /// Deliver one value toward the peer this sender represents.
    fn send_value(&self, value: &Value) -> Result<()>;
}
