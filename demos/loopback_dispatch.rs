// ABOUTME: Dry-run demo: round-robin dispatch across virtual gateways with a custom routing policy
// ABOUTME: Shows observers, targeted sends, a watchdog restart and the shutdown drain without hardware

use argh::FromArgs;
use smsgate::loopback::LoopbackTransport;
use smsgate::routing::{Router, RoutingPolicy};
use smsgate::{ConnectionId, Gateway, OutboundMessage, Service, Settings, SmsError};
use std::error::Error;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Dispatch a batch of messages through virtual gateways
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debugging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// number of virtual gateways (default: 3)
    #[argh(option, short = 'g')]
    gateways: Option<usize>,

    /// number of messages to send (default: 10)
    #[argh(option, short = 'n')]
    count: Option<usize>,
}

/// Premium numbers only go out through the first gateway
struct PremiumOnFirst;

impl RoutingPolicy for PremiumOnFirst {
    fn name(&self) -> &'static str {
        "premium_on_first"
    }

    fn filter(&self, message: &OutboundMessage, candidates: Vec<Arc<Gateway>>) -> Vec<Arc<Gateway>> {
        if message.recipient().starts_with("+30901") {
            candidates.into_iter().take(1).collect()
        } else {
            candidates
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let level = if cli_args.debugging {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let settings = Settings::default().with_watchdog_interval(Duration::from_millis(200));
    let service = Service::new(settings).with_router(Router::with_policy(PremiumOnFirst));

    let mut transports = Vec::new();
    for i in 1..=cli_args.gateways.unwrap_or(3).max(1) {
        let transport = LoopbackTransport::new();
        service.add_gateway(Gateway::new(format!("virtual{i}"), transport.clone()))?;
        transports.push(transport);
    }

    service.notifications().set_outbound_observer(
        |gateway: &ConnectionId, message: &OutboundMessage| -> smsgate::Result<()> {
            println!(
                "[{gateway}] message {} to {} is {:?}",
                message.id(),
                message.recipient(),
                message.status()
            );
            Ok(())
        },
    );

    service.start().await?;

    let mut batch: Vec<_> = (0..cli_args.count.unwrap_or(10))
        .map(|i| OutboundMessage::text(format!("+30697000{i:04}"), format!("message {i}")))
        .collect();
    let sent = service.send_all(&mut batch).await?;
    println!("{sent}/{} messages sent", batch.len());

    let mut premium = OutboundMessage::text("+309010000000", "premium");
    service.send(&mut premium).await?;

    // Break the first gateway and let the watchdog bring it back
    transports[0].break_link(SmsError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "simulated cable pull",
    )));
    tokio::time::sleep(Duration::from_millis(500)).await;

    for gateway in service.registry().snapshot() {
        let stats = gateway.stats();
        println!(
            "{}: {} (outbound {}, restarts {})",
            gateway.id(),
            gateway.status(),
            stats.outbound,
            stats.restarts
        );
    }

    service.stop().await?;
    Ok(())
}
