//! Connection client: one outgoing connection wrapped in a [`Protocol`].
//!
//! [`connect_with_retry`] covers the common case of connecting to a child
//! process that was just spawned and may not be listening yet.
//!
//! # Example
//!
//! ```ignore
//! use ipcwire::client::{connect_with_retry, RetryConfig};
//! use ipcwire::{generate_pipe_path, Address, ProtocolConfig};
//!
//! let address = Address::Pipe(generate_pipe_path("editor"));
//! let mut child = tokio::process::Command::new("worker").arg(address.to_string()).spawn()?;
//!
//! let client = connect_with_retry(
//!     &address,
//!     "window:1",
//!     ProtocolConfig::default(),
//!     &RetryConfig::default(),
//!     Some(&mut child),
//! )
//! .await?;
//! client.protocol().send_text("hello");
//! ```

use std::io;
use std::time::Duration;

use crate::connection::{Protocol, ProtocolConfig};
use crate::error::{IpcError, Result};
use crate::transport::{connect, Address};

/// Default number of connection attempts.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 50;

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bounded retry policy for [`connect_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total connection attempts, including the first (at least 1).
    pub attempts: u32,
    /// Pause after each failed attempt that will be retried.
    pub delay: Duration,
}

impl RetryConfig {
    /// Set the number of attempts.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the pause between attempts.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Something that can be told to stop, such as a spawned child process.
pub trait Terminate {
    /// Ask it to stop. Must not block.
    fn terminate(&mut self) -> io::Result<()>;
}

impl Terminate for tokio::process::Child {
    fn terminate(&mut self) -> io::Result<()> {
        self.start_kill()
    }
}

/// An established outgoing connection.
#[derive(Debug)]
pub struct Client {
    address: Address,
    protocol: Protocol,
}

impl Client {
    /// Connect to `address` and announce `client_id` as the first message.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Connect`] if the endpoint is unreachable.
    pub async fn connect(address: &Address, client_id: &str, config: ProtocolConfig) -> Result<Self> {
        tracing::trace!("Connecting to {}", address);
        let stream = connect(address).await.map_err(|source| IpcError::Connect {
            address: address.to_string(),
            source,
        })?;

        let protocol = Protocol::with_config(stream, config);
        protocol.send_text(client_id);
        tracing::debug!("Connected to {} as {}", address, client_id);

        Ok(Self {
            address: address.clone(),
            protocol,
        })
    }

    /// The framed channel to the server.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// The address this client connected to.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Stop using the connection.
    ///
    /// Messages already queued (including the client id) are still
    /// written before the stream is shut down; nothing is received or
    /// sent afterwards.
    pub fn dispose(&self) {
        self.protocol.end_and_dispose();
    }
}

/// Connect, retrying on failure with a fixed delay.
///
/// When every attempt fails, `child` (if given) is terminated exactly once
/// and the last connection error is returned inside
/// [`IpcError::RetriesExhausted`].
pub async fn connect_with_retry(
    address: &Address,
    client_id: &str,
    config: ProtocolConfig,
    retry: &RetryConfig,
    child: Option<&mut dyn Terminate>,
) -> Result<Client> {
    let attempts = retry.attempts.max(1);
    let mut attempt = 0;

    let last_error = loop {
        attempt += 1;
        match Client::connect(address, client_id, config.clone()).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt >= attempts => break e,
            Err(e) => {
                tracing::trace!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                tokio::time::sleep(retry.delay).await;
            }
        }
    };

    tracing::warn!(
        "Giving up on {} after {} attempts: {}",
        address,
        attempts,
        last_error
    );
    if let Some(child) = child {
        if let Err(e) = child.terminate() {
            tracing::warn!("Failed to terminate peer process: {}", e);
        }
    }

    Err(IpcError::RetriesExhausted {
        attempts,
        source: Box::new(last_error),
    })
}
