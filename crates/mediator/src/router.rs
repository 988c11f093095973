//! Output message routing
//!
//! A router is a pure function from a decoded output payload to the client
//! and delivery mode that should carry it. A payload with no route is a
//! configuration error the mediator fails loudly on — there is deliberately
//! no way to drop a message silently.

use crate::message::MediatorMessage;

/// How a routed message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// The caller blocks for a reply on the blocking-task pool; used for
    /// RPC-style sends which must complete before the batch is done.
    Synchronous,
    /// Fire-and-forget publish, flushed after offset commit.
    Asynchronous,
}

/// Where and how an output payload is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDestination {
    /// Logical id of a registered messaging client.
    pub client_id: String,
    /// Endpoint on that client (topic, path, …).
    pub endpoint: String,
    pub mode: SendMode,
}

impl RoutingDestination {
    pub fn synchronous(client_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            endpoint: endpoint.into(),
            mode: SendMode::Synchronous,
        }
    }

    pub fn asynchronous(client_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            endpoint: endpoint.into(),
            mode: SendMode::Asynchronous,
        }
    }
}

/// Maps output payloads to destinations.
///
/// Returning `None` means "no route defined" and makes the mediator fail with
/// [`crate::MediatorError::UnroutableOutput`]. Implementations matching on a
/// payload enum should route known variants and let the catch-all arm return
/// `None` so new variants fail loudly instead of vanishing.
pub trait MessageRouter<O>: Send + Sync {
    fn route(&self, payload: &O) -> Option<RoutingDestination>;
}

impl<O, F> MessageRouter<O> for F
where
    F: Fn(&O) -> Option<RoutingDestination> + Send + Sync,
{
    fn route(&self, payload: &O) -> Option<RoutingDestination> {
        self(payload)
    }
}

/// A reply produced by a synchronous send, handed back to the caller.
pub type Reply = Option<MediatorMessage>;

#[cfg(test)]
mod tests {
    use super::*;

    enum Payload {
        Known,
        Unknown,
    }

    #[test]
    fn closure_routers_dispatch_by_payload() {
        let router = |payload: &Payload| match payload {
            Payload::Known => Some(RoutingDestination::asynchronous("bus", "events.out")),
            Payload::Unknown => None,
        };

        let dest = MessageRouter::route(&router, &Payload::Known).unwrap();
        assert_eq!(dest.client_id, "bus");
        assert_eq!(dest.mode, SendMode::Asynchronous);
        assert!(MessageRouter::route(&router, &Payload::Unknown).is_none());
    }
}
