use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;

/// Abstraction over issuing GET requests for manifests and assets.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetch the body at `url`, sending the given headers.
    async fn fetch_bytes(
        &self,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<Vec<u8>, TransportError>;
}

/// Builder for [`HttpClient`].
#[derive(Default)]
pub struct HttpClientBuilder {
    client: Option<Client>,
    timeout: Option<Duration>,
}

impl HttpClientBuilder {
    /// Provide a custom reqwest client instance.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Per-request timeout used when no custom client is supplied.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<HttpClient, TransportError> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .timeout(self.timeout.unwrap_or(Duration::from_secs(60)))
                .build()?,
        };
        Ok(HttpClient { client })
    }
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a new builder.
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }
}

#[async_trait]
impl HttpFetcher for HttpClient {
    async fn fetch_bytes(
        &self,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<Vec<u8>, TransportError> {
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}
