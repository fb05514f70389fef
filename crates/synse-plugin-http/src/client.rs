//! HTTP plugin client
//!
//! Maps the plugin remote calls onto a small JSON API:
//!
//! | Call               | Request                                   |
//! |--------------------|-------------------------------------------|
//! | metadata           | `GET  /v1/metadata`                       |
//! | devices            | `GET  /v1/devices`                        |
//! | read               | `GET  /v1/devices/{id}/reading`           |
//! | write              | `POST /v1/devices/{id}/write`             |
//! | transaction status | `GET  /v1/transactions/{id}` (NDJSON)     |
//! | health             | `GET  /v1/health`                         |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use synse_core::{
    Connector, DeviceInfo, GatewayError, GatewayResult, HealthReport, PluginClient,
    PluginDescriptor, PluginMetadata, Reading, StatusStream, TransactionUpdate, TransportKind,
    WriteAck, WritePayload,
};
use tracing::debug;
use url::Url;

use crate::error::HttpLinkError;
use crate::ndjson::NdjsonParser;

/// Default per-request timeout for unary calls
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
/// Default connection timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Error body plugins send with non-2xx responses
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// A plugin reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpPluginClient {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpPluginClient {
    /// Create a client for the plugin at `base_url` (e.g., "http://10.0.0.5:5001")
    pub fn new(base_url: &str) -> Result<Self, HttpLinkError> {
        Self::with_config(base_url, DEFAULT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Create a client with custom timeouts.
    ///
    /// `timeout` bounds unary calls only; status streams stay open as long
    /// as the plugin keeps sending.
    pub fn with_config(
        base_url: &str,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, HttpLinkError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(HttpLinkError::InvalidAddress(base_url.to_string()));
        }
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build an endpoint URL; segments are percent-encoded
    fn url(&self, segments: &[&str]) -> Result<Url, HttpLinkError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| HttpLinkError::InvalidAddress(self.base_url.to_string()))?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, HttpLinkError> {
        let response = request.timeout(self.timeout).send().await?;
        if !response.status().is_success() {
            return Err(Self::map_response_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, HttpLinkError> {
        let url = self.url(segments)?;
        debug!(url = %url, "GET");
        self.send_json(self.client.get(url)).await
    }

    /// Turn an error response into a typed error, preferring the plugin's message
    async fn map_response_error(response: reqwest::Response) -> HttpLinkError {
        let status = response.status().as_u16();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) if !body.message.is_empty() => body.message,
            Ok(body) if !body.error.is_empty() => body.error,
            _ => format!("HTTP {}", status),
        };
        HttpLinkError::status(status, message)
    }

    async fn open_status_stream(&self, transaction_id: &str) -> Result<StatusStream, HttpLinkError> {
        let url = self.url(&["transactions", transaction_id])?;
        debug!(url = %url, "GET (stream)");
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/x-ndjson")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_response_error(response).await);
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let updates = async_stream::stream! {
            let mut parser = NdjsonParser::<TransactionUpdate>::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        for item in parser.feed(chunk) {
                            yield item.map_err(GatewayError::from);
                        }
                    }
                    Err(e) => {
                        yield Err(GatewayError::from(HttpLinkError::from(e)));
                        return;
                    }
                }
            }
            if let Some(item) = parser.finish() {
                yield item.map_err(GatewayError::from);
            }
        };
        Ok(Box::pin(updates))
    }
}

#[async_trait]
impl PluginClient for HttpPluginClient {
    async fn metadata(&self) -> GatewayResult<PluginMetadata> {
        Ok(self.get(&["metadata"]).await?)
    }

    async fn devices(&self) -> GatewayResult<Vec<DeviceInfo>> {
        Ok(self.get(&["devices"]).await?)
    }

    async fn read(&self, device_id: &str) -> GatewayResult<Vec<Reading>> {
        Ok(self.get(&["devices", device_id, "reading"]).await?)
    }

    async fn write(&self, device_id: &str, payload: &WritePayload) -> GatewayResult<WriteAck> {
        let url = self.url(&["devices", device_id, "write"])?;
        debug!(url = %url, action = %payload.action, "POST");
        Ok(self.send_json(self.client.post(url).json(payload)).await?)
    }

    async fn transaction_status(&self, transaction_id: &str) -> GatewayResult<StatusStream> {
        Ok(self.open_status_stream(transaction_id).await?)
    }

    async fn health(&self) -> GatewayResult<HealthReport> {
        Ok(self.get(&["health"]).await?)
    }
}

/// Connector for plugins with `transport = "http"`
#[derive(Debug, Clone)]
pub struct HttpConnector {
    timeout: Duration,
    connect_timeout: Duration,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
    }
}

impl HttpConnector {
    pub fn new(timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            timeout,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, descriptor: &PluginDescriptor) -> GatewayResult<Arc<dyn PluginClient>> {
        if descriptor.transport != TransportKind::Http {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "Plugin {} uses transport '{}', not http",
                descriptor.id, descriptor.transport
            )));
        }
        let client =
            HttpPluginClient::with_config(&descriptor.address, self.timeout, self.connect_timeout)?;
        Ok(Arc::new(client))
    }
}
