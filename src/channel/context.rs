//! Per-connection context handed to channel implementations.

/// Identifies the peer a request came from.
///
/// `ChannelContext` is `Clone` and can be moved into the future a command
/// returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelContext {
    client_id: String,
}

impl ChannelContext {
    /// Create a context for the peer `client_id`.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    /// The id the peer announced when it connected.
    #[inline]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}
