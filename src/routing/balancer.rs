// ABOUTME: Load balancing strategies that pick one connection out of the routed candidates
// ABOUTME: Round-robin keeps one shared cursor; least-loaded picks the lowest outbound counter

use crate::gateway::Gateway;
use crate::message::OutboundMessage;
use std::sync::{Arc, Mutex, PoisonError};

/// Picks exactly one candidate
///
/// Returns `None` only for an empty candidate list; callers route first and
/// treat an empty route as "no route".
pub trait LoadBalancer: Send + Sync {
    fn name(&self) -> &'static str;

    fn balance(&self, message: &OutboundMessage, candidates: &[Arc<Gateway>])
    -> Option<Arc<Gateway>>;
}

/// Round-robin over the candidate list
///
/// The cursor is shared by all messages. Under one lock it is reset to 0
/// when it is past the end of the current list, used as the index, then
/// incremented. With a stable candidate list this cycles through every
/// candidate in order; when the list shrinks the cursor wraps early.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: Mutex<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn balance(
        &self,
        _message: &OutboundMessage,
        candidates: &[Arc<Gateway>],
    ) -> Option<Arc<Gateway>> {
        if candidates.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if *cursor >= candidates.len() {
            *cursor = 0;
        }
        let picked = Arc::clone(&candidates[*cursor]);
        *cursor += 1;
        Some(picked)
    }
}

/// Picks the candidate that has sent the fewest messages; ties go to the first
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

impl LoadBalancer for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn balance(
        &self,
        _message: &OutboundMessage,
        candidates: &[Arc<Gateway>],
    ) -> Option<Arc<Gateway>> {
        candidates
            .iter()
            .min_by_key(|g| g.stats().outbound)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransport;

    fn gateways(ids: &[&str]) -> Vec<Arc<Gateway>> {
        ids.iter()
            .map(|id| Arc::new(Gateway::new(*id, LoopbackTransport::new())))
            .collect()
    }

    fn picks(balancer: &dyn LoadBalancer, candidates: &[Arc<Gateway>], n: usize) -> Vec<String> {
        let msg = OutboundMessage::text("1", "x");
        (0..n)
            .map(|_| balancer.balance(&msg, candidates).unwrap().id().to_string())
            .collect()
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let candidates = gateways(&["g1", "g2", "g3"]);
        assert_eq!(
            picks(&RoundRobin::new(), &candidates, 7),
            vec!["g1", "g2", "g3", "g1", "g2", "g3", "g1"]
        );
    }

    #[test]
    fn round_robin_clamps_when_list_shrinks() {
        let balancer = RoundRobin::new();
        let three = gateways(&["g1", "g2", "g3"]);
        let two = gateways(&["h1", "h2"]);

        assert_eq!(picks(&balancer, &three, 2), vec!["g1", "g2"]);
        // cursor is 2, past the end of a two element list: wrap to the start
        assert_eq!(picks(&balancer, &two, 3), vec!["h1", "h2", "h1"]);
    }

    #[test]
    fn empty_candidates_yield_none() {
        let msg = OutboundMessage::text("1", "x");
        assert!(RoundRobin::new().balance(&msg, &[]).is_none());
        assert!(LeastLoaded.balance(&msg, &[]).is_none());
    }

    #[tokio::test]
    async fn least_loaded_prefers_idle_gateways() {
        let candidates = gateways(&["busy", "idle"]);
        candidates[0].start().await.unwrap();
        let mut msg = OutboundMessage::text("1", "x");
        candidates[0].send(&mut msg).await.unwrap();

        let picked = LeastLoaded.balance(&msg, &candidates).unwrap();
        assert_eq!(picked.id().as_str(), "idle");
    }
}
