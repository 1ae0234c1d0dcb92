// ABOUTME: smsgate library root: module tree and the public re-exports of the dispatch engine
// ABOUTME: Defines the boxed Error/Result aliases used by observer callbacks

pub mod crypto;
pub mod error;
pub mod gateway;
pub mod http;
pub mod keepalive;
pub mod loopback;
pub mod message;
pub mod modem;
pub mod notify;
pub mod routing;
pub mod service;
pub mod settings;
pub mod smpp;

#[cfg(test)]
mod tests;

pub use error::{SmsError, SmsResult};
pub use gateway::{Capabilities, ConnectionId, Gateway, GatewayStatus, Transport};
pub use message::{
    FailureCause, InboundKind, InboundMessage, MessageClass, MessageEncoding, MessageStatus,
    OutboundMessage, Payload,
};
pub use service::Service;
pub use settings::Settings;

/// Error returned by observer callbacks.
///
/// Observers are user code running on the notification task, so any error
/// type is accepted. The engine itself reports failures through
/// [`SmsError`]; a boxed error only ever reaches the dispatcher, which logs
/// it and moves on to the next notification.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for observer callbacks.
///
/// # Examples
///
/// ## Sending through a virtual gateway
///
/// ```rust,no_run
/// use smsgate::loopback::LoopbackTransport;
/// use smsgate::{Gateway, OutboundMessage, Service, Settings};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = Service::new(Settings::default());
///     service.add_gateway(Gateway::new("virtual", LoopbackTransport::new()))?;
///     service.start().await?;
///
///     let mut sms = OutboundMessage::text("+306970000000", "Hello, World!");
///     service.send(&mut sms).await?;
///     println!("{:?} with reference {:?}", sms.status(), sms.reference());
///
///     service.stop().await?;
///     Ok(())
/// }
/// ```
///
/// ## Observing inbound traffic
///
/// ```rust,no_run
/// use smsgate::modem::{ModemConfig, ModemTransport};
/// use smsgate::{ConnectionId, Gateway, InboundKind, InboundMessage, Service, Settings};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = Service::new(Settings::default());
///     let modem = ModemTransport::tcp("192.168.1.20:4001", ModemConfig::new());
///     service.add_gateway(Gateway::new("modem1", modem))?;
///
///     service.notifications().set_inbound_observer(
///         |gateway: &ConnectionId, kind: InboundKind, message: &InboundMessage| -> smsgate::Result<()> {
///             println!("{gateway}: {kind:?} from {}: {}", message.originator, message.text());
///             Ok(())
///         },
///     );
///
///     service.start().await?;
///     tokio::time::sleep(std::time::Duration::from_secs(600)).await;
///     service.stop().await?;
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
