//! Output transport seam
//!
//! Clients are registered with the router by logical id at construction
//! time. A synchronous send returns the transport's reply; an asynchronous
//! send only guarantees the message is accepted for delivery, with `flush`
//! draining anything still in flight.

use async_trait::async_trait;

use crate::error::MediatorResult;
use crate::message::MediatorMessage;

/// A client for one output transport.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Logical id the router refers to this client by.
    fn id(&self) -> &str;

    /// Deliver a message; RPC-style transports return the reply.
    async fn send(&self, message: MediatorMessage) -> MediatorResult<Option<MediatorMessage>>;

    /// Drain in-flight asynchronous sends.
    async fn flush(&self) -> MediatorResult<()> {
        Ok(())
    }
}

/// Builds a messaging client for one configured output transport.
pub trait ClientFactory: Send + Sync {
    /// Logical id the built client will carry.
    fn id(&self) -> &str;

    fn create(&self) -> MediatorResult<std::sync::Arc<dyn MessagingClient>>;
}
