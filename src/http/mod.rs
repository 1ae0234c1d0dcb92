// ABOUTME: HTTP bulk-SMS transport: a provider builds operator requests, reqwest executes them
// ABOUTME: Providers stay pure (request in, response out) so each operator API is testable offline

mod kannel;

pub use kannel::KannelProvider;

use crate::error::{SmsError, SmsResult};
use crate::gateway::{Capabilities, GatewayLink, Transport};
use crate::message::OutboundMessage;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// One request against an operator API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpRequest {
    Get(Url),
    PostForm {
        url: Url,
        params: Vec<(String, String)>,
    },
}

impl HttpRequest {
    pub fn url(&self) -> &Url {
        match self {
            HttpRequest::Get(url) | HttpRequest::PostForm { url, .. } => url,
        }
    }
}

/// Status and body of an operator answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Operator specific part of an HTTP gateway
pub trait HttpProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Requests that submit `message`, in order
    fn send_requests(&self, message: &OutboundMessage) -> SmsResult<Vec<HttpRequest>>;

    /// Interpret a submit answer; `Ok(Some(id))` carries the operator's message id
    fn parse_send(&self, response: &HttpResponse) -> SmsResult<Option<String>>;

    /// Request run on start to check the account is reachable
    fn probe_request(&self) -> Option<HttpRequest> {
        None
    }
}

/// Client settings shared by all providers
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

impl HttpConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Gateway backed by an HTTP operator account
pub struct HttpTransport {
    provider: Arc<dyn HttpProvider>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("provider", &self.provider.name())
            .finish()
    }
}

/// Timeouts and refused connections are channel failures; the rest is an HTTP error
fn map_reqwest(err: reqwest::Error) -> SmsError {
    if err.is_timeout() {
        SmsError::Timeout
    } else if err.is_connect() {
        SmsError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, err.to_string()))
    } else {
        SmsError::Http(err)
    }
}

impl HttpTransport {
    pub fn new(provider: impl HttpProvider + 'static, config: HttpConfig) -> SmsResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(HttpTransport {
            provider: Arc::new(provider),
            client: builder.build()?,
        })
    }

    pub fn provider(&self) -> &dyn HttpProvider {
        self.provider.as_ref()
    }

    async fn execute(&self, request: &HttpRequest) -> SmsResult<HttpResponse> {
        debug!(provider = self.provider.name(), url = %request.url().path(), "HTTP request");
        let pending = match request {
            HttpRequest::Get(url) => self.client.get(url.clone()),
            HttpRequest::PostForm { url, params } => self.client.post(url.clone()).form(params),
        };
        let response = pending.send().await.map_err(map_reqwest)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest)?;
        debug!(provider = self.provider.name(), status, "HTTP response: {}", body.trim());
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn capabilities(&self) -> Capabilities {
        self.provider.capabilities()
    }

    async fn start(&self, link: GatewayLink) -> SmsResult<()> {
        if let Some(probe) = self.provider.probe_request() {
            let response = self.execute(&probe).await?;
            if !response.is_success() {
                return Err(SmsError::rejected(format!(
                    "{} answered {}: {}",
                    self.provider.name(),
                    response.status,
                    response.body.trim()
                )));
            }
        }
        info!(gateway = %link.gateway_id(), provider = self.provider.name(), "HTTP gateway ready");
        Ok(())
    }

    async fn stop(&self) -> SmsResult<()> {
        Ok(())
    }

    async fn send(&self, message: &mut OutboundMessage) -> SmsResult<()> {
        let mut reference = None;
        for request in self.provider.send_requests(message)? {
            let response = self.execute(&request).await?;
            if let Some(id) = self.provider.parse_send(&response)? {
                reference = Some(id);
            }
        }
        if let Some(reference) = reference {
            message.set_reference(reference);
        }
        Ok(())
    }
}
