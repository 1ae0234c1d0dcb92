// ABOUTME: Demo driving a GSM modem behind a serial-to-IP converter through the dispatch service
// ABOUTME: Sends one SMS when asked, then prints inbound messages and calls until the run ends

//! # IP modem gateway
//!
//! ```bash
//! # Send one message, then listen for two minutes
//! cargo run --example ip_modem -- --host 192.168.1.20 --port 4001 \
//!   --to +306970000000 --message "Hello from smsgate" --listen 120
//!
//! # Telit modem with a SIM PIN and settings from a file
//! cargo run --example ip_modem -- --host 192.168.1.20 --dialect telit \
//!   --pin 1234 --settings smsgate.toml
//! ```

use argh::FromArgs;
use smsgate::modem::{Dialect, ModemConfig, ModemTransport};
use smsgate::{
    ConnectionId, Gateway, GatewayStatus, InboundKind, InboundMessage, MessageClass,
    OutboundMessage, Service, Settings,
};
use std::error::Error;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Send and receive SMS through a modem reachable over TCP
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debugging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the hostname or IP address of the serial-to-IP converter (default: localhost)
    #[argh(option)]
    host: Option<String>,

    /// the TCP port of the converter (default: 4001)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// modem dialect: generic, siemens_hc25, siemens_mc35i_fd, ubinetics_gdc201,
    /// huawei, wavecom, wavecom_cdma or telit
    #[argh(option, default = "Dialect::Generic")]
    dialect: Dialect,

    /// the SIM PIN, when the SIM asks for one
    #[argh(option)]
    pin: Option<String>,

    /// a TOML file with engine settings
    #[argh(option)]
    settings: Option<String>,

    /// the recipient telephone number
    #[argh(option, short = 't')]
    to: Option<String>,

    /// the message to send
    #[argh(option, short = 'm')]
    message: Option<String>,

    /// seconds to keep listening for inbound traffic (default: 60)
    #[argh(option)]
    listen: Option<u64>,
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

    let settings = match &cli_args.settings {
        Some(path) => Settings::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => Settings::default(),
    };
    let host = cli_args.host.unwrap_or_else(|| "localhost".to_owned());
    let port = cli_args.port.unwrap_or(4001);

    let mut config = ModemConfig::new()
        .with_dialect(cli_args.dialect)
        .with_settings(settings.clone());
    if let Some(pin) = cli_args.pin {
        config = config.with_sim_pin(pin);
    }

    let service = Service::new(settings);
    service.add_gateway(Gateway::new(
        "modem",
        ModemTransport::tcp(format!("{host}:{port}"), config),
    ))?;

    let notifications = service.notifications();
    notifications.set_inbound_observer(
        |gateway: &ConnectionId, kind: InboundKind, message: &InboundMessage| -> smsgate::Result<()> {
            println!("[{gateway}] {kind:?} from {}: {}", message.originator, message.text());
            Ok(())
        },
    );
    notifications.set_call_observer(|gateway: &ConnectionId, caller: &str| -> smsgate::Result<()> {
        println!("[{gateway}] call from {caller}");
        Ok(())
    });
    notifications.set_status_observer(
        |gateway: &ConnectionId, old: GatewayStatus, new: GatewayStatus| -> smsgate::Result<()> {
            println!("[{gateway}] {old} -> {new}");
            Ok(())
        },
    );

    service.start().await?;

    if let (Some(to), Some(text)) = (cli_args.to, cli_args.message) {
        let mut sms = OutboundMessage::text(to, text);
        if service.send(&mut sms).await? {
            println!("Message sent, reference {:?}", sms.reference());
        } else {
            eprintln!("Message failed: {:?}", sms.failure_cause());
        }
    }

    for stored in service.read_messages(MessageClass::All).await? {
        println!(
            "stored {}:{:?} from {}: {}",
            stored.memory_location.as_deref().unwrap_or("?"),
            stored.memory_index,
            stored.originator,
            stored.text()
        );
    }

    tokio::time::sleep(Duration::from_secs(cli_args.listen.unwrap_or(60))).await;
    service.stop().await?;
    Ok(())
}
