// ABOUTME: Observer traits, one per notification category, with blanket impls for closures
// ABOUTME: Observers run on the dispatcher task; errors they return are logged, never propagated

use crate::gateway::{ConnectionId, GatewayStatus};
use crate::message::{InboundKind, InboundMessage, OutboundMessage};

/// Receives connection status changes
pub trait StatusObserver: Send + Sync {
    fn on_status_change(
        &self,
        gateway: &ConnectionId,
        old: GatewayStatus,
        new: GatewayStatus,
    ) -> crate::Result<()>;
}

/// Receives incoming voice calls
pub trait CallObserver: Send + Sync {
    fn on_call(&self, gateway: &ConnectionId, caller_id: &str) -> crate::Result<()>;
}

/// Receives inbound messages and status reports
pub trait InboundObserver: Send + Sync {
    fn on_message(
        &self,
        gateway: &ConnectionId,
        kind: InboundKind,
        message: &InboundMessage,
    ) -> crate::Result<()>;
}

/// Receives the outcome of every routed send, successful or not
pub trait OutboundObserver: Send + Sync {
    fn on_sent(&self, gateway: &ConnectionId, message: &OutboundMessage) -> crate::Result<()>;
}

impl<F> StatusObserver for F
where
    F: Fn(&ConnectionId, GatewayStatus, GatewayStatus) -> crate::Result<()> + Send + Sync,
{
    fn on_status_change(
        &self,
        gateway: &ConnectionId,
        old: GatewayStatus,
        new: GatewayStatus,
    ) -> crate::Result<()> {
        self(gateway, old, new)
    }
}

impl<F> CallObserver for F
where
    F: Fn(&ConnectionId, &str) -> crate::Result<()> + Send + Sync,
{
    fn on_call(&self, gateway: &ConnectionId, caller_id: &str) -> crate::Result<()> {
        self(gateway, caller_id)
    }
}

impl<F> InboundObserver for F
where
    F: Fn(&ConnectionId, InboundKind, &InboundMessage) -> crate::Result<()> + Send + Sync,
{
    fn on_message(
        &self,
        gateway: &ConnectionId,
        kind: InboundKind,
        message: &InboundMessage,
    ) -> crate::Result<()> {
        self(gateway, kind, message)
    }
}

impl<F> OutboundObserver for F
where
    F: Fn(&ConnectionId, &OutboundMessage) -> crate::Result<()> + Send + Sync,
{
    fn on_sent(&self, gateway: &ConnectionId, message: &OutboundMessage) -> crate::Result<()> {
        self(gateway, message)
    }
}
