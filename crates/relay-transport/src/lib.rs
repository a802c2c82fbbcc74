use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use relay_protocol::{ClientError, ClientResult, TransportPort, TransportRequest, TransportResponse};
use tracing::{debug, instrument};

const DEFAULT_ENDPOINT: &str = "/actions";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

fn to_client_error(error: anyhow::Error) -> ClientError {
    ClientError::Transport(format!("{error:#}"))
}

/// Posts form-encoded action batches to a single server endpoint.
///
/// Any HTTP status is returned to the caller as-is; only failures to complete
/// the round trip at all surface as errors.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(host: impl AsRef<str>) -> Result<Self> {
        Self::with_endpoint(host, DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(host: impl AsRef<str>, endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .context("failed building http client")?;
        Ok(Self {
            url: format!("{}{endpoint}", host.as_ref().trim_end_matches('/')),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, request: TransportRequest) -> Result<TransportResponse> {
        let marker = request.marker.to_string();
        let mut form = vec![
            ("message", request.message),
            ("context", request.context),
        ];
        if let Some(token) = request.token {
            form.push(("token", token));
        }

        let mut query = vec![("r", marker)];
        if request.background {
            query.push(("background", "true".to_owned()));
        }

        let response = self
            .client
            .post(&self.url)
            .query(&query)
            .form(&form)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.url))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .context("failed reading response body")?;
        Ok(TransportResponse { status, body })
    }
}

#[async_trait]
impl TransportPort for HttpTransport {
    #[instrument(skip(self, request), fields(url = %self.url, marker = request.marker, background = request.background))]
    async fn send(&self, request: TransportRequest) -> ClientResult<TransportResponse> {
        let response = self.post(request).await.map_err(to_client_error)?;
        debug!(status = response.status, bytes = response.body.len(), "response received");
        Ok(response)
    }
}
