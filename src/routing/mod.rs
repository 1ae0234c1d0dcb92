// ABOUTME: Outbound routing: filters registered connections down to the eligible candidates
// ABOUTME: A fixed base filter followed by a pluggable policy that can only narrow the result

mod balancer;

pub use balancer::{LeastLoaded, LoadBalancer, RoundRobin};

use crate::gateway::{Gateway, GatewayStatus};
use crate::message::OutboundMessage;
use std::sync::Arc;
use tracing::trace;

/// Custom routing rule applied after the base filter
///
/// # Example
///
/// ```rust
/// use smsgate::gateway::Gateway;
/// use smsgate::message::OutboundMessage;
/// use smsgate::routing::RoutingPolicy;
/// use std::sync::Arc;
///
/// /// Keep international traffic off the local modems
/// struct NoModemsAbroad;
///
/// impl RoutingPolicy for NoModemsAbroad {
///     fn filter(&self, message: &OutboundMessage, candidates: Vec<Arc<Gateway>>) -> Vec<Arc<Gateway>> {
///         if message.recipient().starts_with("+30") {
///             return candidates;
///         }
///         candidates.into_iter().filter(|g| g.kind() != "modem").collect()
///     }
/// }
/// ```
pub trait RoutingPolicy: Send + Sync {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn filter(&self, message: &OutboundMessage, candidates: Vec<Arc<Gateway>>)
    -> Vec<Arc<Gateway>>;
}

/// Identity policy
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl RoutingPolicy for AllowAll {
    fn name(&self) -> &'static str {
        "allow_all"
    }

    fn filter(
        &self,
        _message: &OutboundMessage,
        candidates: Vec<Arc<Gateway>>,
    ) -> Vec<Arc<Gateway>> {
        candidates
    }
}

/// Selects the connections allowed to carry a message
pub struct Router {
    policy: Box<dyn RoutingPolicy>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            policy: Box::new(AllowAll),
        }
    }

    pub fn with_policy(policy: impl RoutingPolicy + 'static) -> Self {
        Router {
            policy: Box::new(policy),
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Candidates for `message`, in registration order; empty means no route
    ///
    /// Base filter: outbound, `Started`, and matching the target (`"*"` or
    /// the id, ignoring case). The policy sees the base output; anything it
    /// returns that was not in that output is discarded.
    pub fn route(&self, message: &OutboundMessage, all: &[Arc<Gateway>]) -> Vec<Arc<Gateway>> {
        let base = Self::preroute(message, all);
        if base.is_empty() {
            return base;
        }

        let allowed = self.policy.filter(message, base.clone());
        let routed: Vec<_> = allowed
            .into_iter()
            .filter(|g| base.iter().any(|b| Arc::ptr_eq(b, g)))
            .collect();
        trace!(
            message = message.id(),
            base = base.len(),
            routed = routed.len(),
            policy = self.policy.name(),
            "routed"
        );
        routed
    }

    fn preroute(message: &OutboundMessage, all: &[Arc<Gateway>]) -> Vec<Arc<Gateway>> {
        all.iter()
            .filter(|g| g.is_outbound())
            .filter(|g| g.status() == GatewayStatus::Started)
            .filter(|g| message.is_wildcard() || g.id().matches(message.target()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransport;

    async fn started(id: &str) -> Arc<Gateway> {
        let gateway = Arc::new(Gateway::new(id, LoopbackTransport::new()));
        gateway.start().await.unwrap();
        gateway
    }

    #[tokio::test]
    async fn wildcard_routes_to_every_started_outbound_gateway() {
        let gateways = vec![
            started("g1").await,
            started("g2").await,
            Arc::new(Gateway::new("stopped", LoopbackTransport::new())),
            started("g3").await,
        ];
        gateways[1].set_outbound(false).unwrap();

        let routed = Router::new().route(&OutboundMessage::text("1", "x"), &gateways);
        let ids: Vec<_> = routed.iter().map(|g| g.id().to_string()).collect();
        assert_eq!(ids, vec!["g1", "g3"]);
    }

    #[tokio::test]
    async fn targeted_routing_ignores_case() {
        let gateways = vec![started("modem1").await, started("modem2").await];
        let msg = OutboundMessage::text("1", "x").via("MODEM2");

        let routed = Router::new().route(&msg, &gateways);
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].id().as_str(), "modem2");

        let msg = OutboundMessage::text("1", "x").via("nope");
        assert!(Router::new().route(&msg, &gateways).is_empty());
    }

    struct Injecting(Arc<Gateway>);

    impl RoutingPolicy for Injecting {
        fn filter(
            &self,
            _message: &OutboundMessage,
            mut candidates: Vec<Arc<Gateway>>,
        ) -> Vec<Arc<Gateway>> {
            candidates.remove(0);
            candidates.push(Arc::clone(&self.0));
            candidates
        }
    }

    #[tokio::test]
    async fn policy_can_only_narrow() {
        let outsider = started("outsider").await;
        let gateways = vec![started("g1").await, started("g2").await];
        let router = Router::with_policy(Injecting(outsider));

        let routed = router.route(&OutboundMessage::text("1", "x"), &gateways);
        let ids: Vec<_> = routed.iter().map(|g| g.id().to_string()).collect();
        assert_eq!(ids, vec!["g2"]);
        assert_eq!(router.policy_name(), "custom");
    }

    #[test]
    fn no_gateways_no_route() {
        assert!(Router::new()
            .route(&OutboundMessage::text("1", "x"), &[])
            .is_empty());
    }
}
