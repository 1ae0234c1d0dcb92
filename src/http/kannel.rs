// ABOUTME: Kannel sendsms interface: GET request building and plain-text answer parsing
// ABOUTME: Optionally probes the bearerbox status page when the gateway starts

use super::{HttpProvider, HttpRequest, HttpResponse};
use crate::error::{SmsError, SmsResult};
use crate::gateway::Capabilities;
use crate::message::{MessageEncoding, OutboundMessage, Payload};
use url::Url;
use url::form_urlencoded::{Serializer, byte_serialize};

/// Kannel `sendsms` user account
#[derive(Debug, Clone)]
pub struct KannelProvider {
    send_url: Url,
    username: String,
    password: String,
    smsc: Option<String>,
    dlr_url: Option<String>,
    status_url: Option<Url>,
}

impl KannelProvider {
    /// `send_url` is the full sendsms URL, e.g. `http://kannel:13013/cgi-bin/sendsms`
    pub fn new(
        send_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> SmsResult<Self> {
        Ok(KannelProvider {
            send_url: parse_url(send_url)?,
            username: username.into(),
            password: password.into(),
            smsc: None,
            dlr_url: None,
            status_url: None,
        })
    }

    /// Force routing through one Kannel SMSC id
    pub fn with_smsc(mut self, smsc: impl Into<String>) -> Self {
        self.smsc = Some(smsc.into());
        self
    }

    /// Callback Kannel calls with delivery reports
    pub fn with_dlr_url(mut self, dlr_url: impl Into<String>) -> Self {
        self.dlr_url = Some(dlr_url.into());
        self
    }

    /// Status page fetched on start, e.g. `http://kannel:13000/status.txt`
    pub fn with_status_url(mut self, status_url: &str) -> SmsResult<Self> {
        self.status_url = Some(parse_url(status_url)?);
        Ok(self)
    }
}

fn parse_url(url: &str) -> SmsResult<Url> {
    Url::parse(url).map_err(|e| SmsError::Config(format!("bad URL {url}: {e}")))
}

impl HttpProvider for KannelProvider {
    fn name(&self) -> &'static str {
        "kannel"
    }

    fn capabilities(&self) -> Capabilities {
        let mut capabilities = Capabilities::SEND
            | Capabilities::CUSTOM_FROM
            | Capabilities::BIG_MESSAGES
            | Capabilities::FLASH_SMS;
        if self.dlr_url.is_some() {
            capabilities.insert(Capabilities::DELIVERY_REPORTS);
        }
        capabilities
    }

    fn send_requests(&self, message: &OutboundMessage) -> SmsResult<Vec<HttpRequest>> {
        let mut query = Serializer::new(String::new());
        query
            .append_pair("username", &self.username)
            .append_pair("password", &self.password)
            .append_pair("to", message.recipient());
        if let Some(from) = message.originator() {
            query.append_pair("from", from);
        }
        let coding = match message.encoding() {
            MessageEncoding::Gsm7 => "0",
            MessageEncoding::Binary => "1",
            MessageEncoding::Ucs2 => "2",
        };
        query.append_pair("coding", coding);
        if message.is_flash() {
            query.append_pair("mclass", "0");
        }
        if let Some(minutes) = message.validity_minutes() {
            query.append_pair("validity", &minutes.to_string());
        }
        if message.priority() > 0 {
            query.append_pair("priority", &message.priority().min(3).to_string());
        }
        if let Some(smsc) = &self.smsc {
            query.append_pair("smsc", smsc);
        }
        if let (true, Some(dlr_url)) = (message.wants_status_report(), &self.dlr_url) {
            query.append_pair("dlr-mask", "31").append_pair("dlr-url", dlr_url);
        }
        let mut query = query.finish();

        // Binary bodies are not UTF-8; encode the raw octets
        query.push_str("&text=");
        match message.payload() {
            Payload::Text(text) => query.extend(byte_serialize(text.as_bytes())),
            Payload::Binary(data) => query.extend(byte_serialize(data)),
        }

        let mut url = self.send_url.clone();
        url.set_query(Some(&query));
        Ok(vec![HttpRequest::Get(url)])
    }

    /// `0: Accepted for delivery` and `3: Queued for later delivery` are success
    fn parse_send(&self, response: &HttpResponse) -> SmsResult<Option<String>> {
        let body = response.body.trim();
        let accepted = body.starts_with("0:") || body.starts_with("3:");
        if response.is_success() && accepted {
            return Ok(None);
        }
        Err(SmsError::rejected(format!("{} {}", response.status, body)))
    }

    fn probe_request(&self) -> Option<HttpRequest> {
        self.status_url.clone().map(HttpRequest::Get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gateway, GatewayStatus};
    use crate::http::tests::{closed_port, fake_http};
    use crate::http::{HttpConfig, HttpTransport};
    use crate::message::{FailureCause, MessageStatus};
    use std::collections::HashMap;

    fn provider() -> KannelProvider {
        KannelProvider::new("http://kannel:13013/cgi-bin/sendsms", "tester", "foobar").unwrap()
    }

    fn query(request: &HttpRequest) -> HashMap<String, String> {
        request.url().query_pairs().into_owned().collect()
    }

    #[test]
    fn text_request_fields() {
        let msg = OutboundMessage::text("+306970000000", "hello world")
            .from("smsgate")
            .flash();
        let requests = provider().send_requests(&msg).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url().path(), "/cgi-bin/sendsms");

        let fields = query(&requests[0]);
        assert_eq!(fields["username"], "tester");
        assert_eq!(fields["password"], "foobar");
        assert_eq!(fields["to"], "+306970000000");
        assert_eq!(fields["from"], "smsgate");
        assert_eq!(fields["text"], "hello world");
        assert_eq!(fields["coding"], "0");
        assert_eq!(fields["mclass"], "0");
        assert!(!fields.contains_key("dlr-mask"));
    }

    #[test]
    fn unicode_and_delivery_reports() {
        let kannel = provider().with_dlr_url("http://me/dlr?id=%i");
        assert!(kannel.capabilities().contains(Capabilities::DELIVERY_REPORTS));
        assert!(!provider().capabilities().contains(Capabilities::DELIVERY_REPORTS));

        let msg = OutboundMessage::text("1", "καλημέρα").with_status_report();
        let fields = query(&kannel.send_requests(&msg).unwrap()[0]);
        assert_eq!(fields["coding"], "2");
        assert_eq!(fields["text"], "καλημέρα");
        assert_eq!(fields["dlr-mask"], "31");
        assert_eq!(fields["dlr-url"], "http://me/dlr?id=%i");
    }

    #[test]
    fn binary_octets_are_percent_encoded() {
        let msg = OutboundMessage::binary("1", vec![0x00u8, 0xff, b'a']);
        let requests = provider().send_requests(&msg).unwrap();
        let raw = requests[0].url().query().unwrap();
        assert!(raw.ends_with("&text=%00%FFa"), "{raw}");
        assert_eq!(query(&requests[0])["coding"], "1");
    }

    #[test]
    fn answers() {
        let ok = |status, body: &str| HttpResponse {
            status,
            body: body.to_string(),
        };
        assert!(provider().parse_send(&ok(202, "0: Accepted for delivery")).is_ok());
        assert!(provider().parse_send(&ok(202, "3: Queued for later delivery")).is_ok());
        assert!(matches!(
            provider().parse_send(&ok(403, "Authorization failed for sendsms")),
            Err(SmsError::Rejected { .. })
        ));
    }

    #[test]
    fn bad_urls_are_configuration_errors() {
        assert!(matches!(
            KannelProvider::new("not a url", "u", "p"),
            Err(SmsError::Config(_))
        ));
    }

    #[tokio::test]
    async fn send_through_a_kannel_box() {
        let (base, mut requests) = fake_http(202, "0: Accepted for delivery").await;
        let kannel = KannelProvider::new(&format!("{base}/cgi-bin/sendsms"), "tester", "foobar")
            .unwrap()
            .with_status_url(&format!("{base}/status.txt"))
            .unwrap();
        let gateway = Gateway::new(
            "kannel",
            HttpTransport::new(kannel, HttpConfig::default()).unwrap(),
        );
        gateway.start().await.unwrap();
        assert!(requests.recv().await.unwrap().starts_with("GET /status.txt "));

        let mut msg = OutboundMessage::text("+306970000000", "hi");
        gateway.send(&mut msg).await.unwrap();
        assert_eq!(msg.status(), MessageStatus::Sent);
        let head = requests.recv().await.unwrap();
        assert!(head.starts_with("GET /cgi-bin/sendsms?username=tester&password=foobar"));
        gateway.stop().await.unwrap();
    }

    #[tokio::test]
    async fn refused_submit_fails_the_message_only() {
        let (base, _requests) = fake_http(403, "Authorization failed for sendsms").await;
        let kannel =
            KannelProvider::new(&format!("{base}/cgi-bin/sendsms"), "tester", "wrong").unwrap();
        let gateway = Gateway::new(
            "kannel",
            HttpTransport::new(kannel, HttpConfig::default()).unwrap(),
        );
        gateway.start().await.unwrap();

        let mut msg = OutboundMessage::text("1", "x");
        assert!(gateway.send(&mut msg).await.is_err());
        assert_eq!(msg.failure_cause(), Some(FailureCause::GatewayFailure));
        assert_eq!(gateway.status(), GatewayStatus::Started);
    }

    #[tokio::test]
    async fn unreachable_status_page_fails_start() {
        let base = closed_port().await;
        let kannel = KannelProvider::new(&format!("{base}/cgi-bin/sendsms"), "u", "p")
            .unwrap()
            .with_status_url(&format!("{base}/status.txt"))
            .unwrap();
        let gateway = Gateway::new(
            "kannel",
            HttpTransport::new(kannel, HttpConfig::default()).unwrap(),
        );
        assert!(gateway.start().await.is_err());
        assert_eq!(gateway.status(), GatewayStatus::Failed);
    }
}
