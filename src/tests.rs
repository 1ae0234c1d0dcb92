// ABOUTME: Crate-level dispatch scenarios run against loopback gateways through the Service
// ABOUTME: Covers routing, round-robin order, no-route handling, notification order and the shutdown drain

//! Crate-level scenarios driving the whole engine through virtual gateways

use crate::error::SmsError;
use crate::gateway::{ConnectionId, Gateway, GatewayStatus};
use crate::loopback::LoopbackTransport;
use crate::message::{FailureCause, InboundKind, InboundMessage, MessageStatus, OutboundMessage};
use crate::routing::Router;
use crate::service::Service;
use crate::settings::Settings;
use std::sync::{Arc, Mutex};

#[cfg(test)]
mod dispatch_scenarios {
    use super::*;

    async fn service_with(ids: &[&str]) -> (Service, Vec<LoopbackTransport>) {
        let service = Service::new(Settings::fast());
        let mut transports = Vec::new();
        for id in ids {
            let transport = LoopbackTransport::new();
            service
                .add_gateway(Gateway::new(*id, transport.clone()))
                .unwrap();
            transports.push(transport);
        }
        service.start().await.unwrap();
        (service, transports)
    }

    fn sent_via(message: &OutboundMessage) -> &str {
        message.gateway_id().map(ConnectionId::as_str).unwrap_or("")
    }

    #[tokio::test]
    async fn wildcard_routes_to_every_started_outbound_gateway() {
        let service = Service::new(Settings::fast());
        service
            .add_gateway(Gateway::new("g1", LoopbackTransport::new()))
            .unwrap();
        service
            .add_gateway(Gateway::new("g2", LoopbackTransport::new()))
            .unwrap();
        service
            .add_gateway(Gateway::new("inbox", LoopbackTransport::new().inbound_only()))
            .unwrap();
        let broken = LoopbackTransport::new();
        broken.fail_next_start();
        service
            .add_gateway(Gateway::new("broken", broken).with_auto_restart(false))
            .unwrap();
        service.start().await.unwrap();

        let candidates = Router::new().route(
            &OutboundMessage::text("1", "x"),
            &service.registry().snapshot(),
        );
        let ids: Vec<_> = candidates.iter().map(|g| g.id().as_str()).collect();
        assert_eq!(ids, ["g1", "g2"]);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn targeted_messages_use_only_their_gateway() {
        let (service, transports) = service_with(&["G1", "G2", "G3"]).await;

        for _ in 0..3 {
            let mut msg = OutboundMessage::text("1", "x").via("g2");
            assert!(service.send(&mut msg).await.unwrap());
            assert_eq!(sent_via(&msg), "G2");
        }
        assert_eq!(transports[0].sent().len(), 0);
        assert_eq!(transports[1].sent().len(), 3);
        assert_eq!(transports[2].sent().len(), 0);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn round_robin_cycles_through_three_gateways() {
        let (service, _transports) = service_with(&["G1", "G2", "G3"]).await;

        let mut messages: Vec<_> = (0..4)
            .map(|i| OutboundMessage::text("+306970000000", format!("msg {i}")))
            .collect();
        assert_eq!(service.send_all(&mut messages).await.unwrap(), 4);

        let order: Vec<_> = messages.iter().map(sent_via).collect();
        assert_eq!(order, ["G1", "G2", "G3", "G1"]);
        assert!(messages.iter().all(|m| m.status() == MessageStatus::Sent));
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn no_route_is_idempotent() {
        let (service, transports) = service_with(&["G1", "G2"]).await;
        let sent = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&sent);
        service.notifications().set_outbound_observer(
            move |_: &ConnectionId, _: &OutboundMessage| -> crate::Result<()> {
                *counter.lock().unwrap() += 1;
                Ok(())
            },
        );

        let mut msg = OutboundMessage::text("1", "x").via("nowhere");
        for _ in 0..2 {
            assert!(!service.send(&mut msg).await.unwrap());
            assert_eq!(msg.status(), MessageStatus::Failed);
            assert_eq!(msg.failure_cause(), Some(FailureCause::NoRoute));
        }
        for gateway in service.registry().snapshot() {
            assert_eq!(gateway.stats().outbound, 0);
        }
        assert!(transports.iter().all(|t| t.sent().is_empty()));

        // The round-robin cursor was not consumed
        let mut next = OutboundMessage::text("1", "y");
        assert!(service.send(&mut next).await.unwrap());
        assert_eq!(sent_via(&next), "G1");

        service.stop().await.unwrap();
        assert_eq!(*sent.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn nothing_started_means_no_route() {
        let service = Service::new(Settings::fast());
        for id in ["G1", "G2"] {
            let transport = LoopbackTransport::new();
            transport.fail_next_start();
            service
                .add_gateway(Gateway::new(id, transport).with_auto_restart(false))
                .unwrap();
        }
        let notified = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&notified);
        service.notifications().set_outbound_observer(
            move |_: &ConnectionId, _: &OutboundMessage| -> crate::Result<()> {
                *counter.lock().unwrap() += 1;
                Ok(())
            },
        );
        service.start().await.unwrap();
        for gateway in service.registry().snapshot() {
            assert_eq!(gateway.status(), GatewayStatus::Failed);
        }

        let mut msg = OutboundMessage::text("1", "x");
        assert!(!service.send(&mut msg).await.unwrap());
        assert_eq!(msg.failure_cause(), Some(FailureCause::NoRoute));
        assert!(msg.gateway_id().is_none());
        service.stop().await.unwrap();
        assert_eq!(*notified.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn inbound_order_is_kept_and_drained_on_stop() {
        let (service, transports) = service_with(&["G1"]).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        service.notifications().set_inbound_observer(
            move |_: &ConnectionId, kind: InboundKind, message: &InboundMessage| -> crate::Result<()> {
                assert_eq!(kind, InboundKind::Sms);
                sink.lock().unwrap().push(message.text());
                Ok(())
            },
        );

        for i in 0..50 {
            assert!(transports[0].inject("+306970000000", &format!("{i}")));
        }
        // Stop right away: everything queued before the cancel is still delivered
        service.stop().await.unwrap();

        let expected: Vec<_> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
        assert!(service.notifications().is_empty());
    }

    #[tokio::test]
    async fn failing_observer_does_not_stop_delivery() {
        let (service, transports) = service_with(&["G1"]).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        service.notifications().set_call_observer(
            move |_: &ConnectionId, caller: &str| -> crate::Result<()> {
                sink.lock().unwrap().push(caller.to_string());
                if caller == "bad" {
                    return Err("observer refused".into());
                }
                Ok(())
            },
        );

        transports[0].ring("bad");
        transports[0].ring("+306970000001");
        service.stop().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), ["bad", "+306970000001"]);
    }

    #[tokio::test]
    async fn rejected_message_can_be_resent() {
        let (service, transports) = service_with(&["G1"]).await;
        transports[0].fail_next_send(SmsError::rejected("+CMS ERROR: 500"));

        let mut msg = OutboundMessage::text("1", "x");
        assert!(!service.send(&mut msg).await.unwrap());
        assert_eq!(msg.status(), MessageStatus::Failed);
        assert_eq!(service.gateway("g1").unwrap().status(), GatewayStatus::Started);

        assert!(service.send(&mut msg).await.unwrap());
        assert_eq!(msg.retry_count(), 1);
        assert_eq!(msg.status(), MessageStatus::Sent);
        service.stop().await.unwrap();
    }
}
