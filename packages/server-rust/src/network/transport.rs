//! Client side of the node-to-node HTTP hop.

use std::time::Duration;

use apm_core::{Address, RemoteMessage};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::worker::RemoteTransport;

/// Path peers accept role-addressed records on.
pub const REMOTE_PATH: &str = "/v1/remote";

pub const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

/// [`RemoteTransport`] over HTTP/1.1 with a pooled `reqwest` client.
///
/// Any non-2xx answer is a delivery failure carrying the peer's status and
/// error text.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn deliver(&self, address: &Address, message: RemoteMessage) -> anyhow::Result<()> {
        let body = message.encode()?;
        let response = self
            .client
            .post(format!("http://{address}{REMOTE_PATH}"))
            .header(CONTENT_TYPE, MSGPACK_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            anyhow::bail!("peer answered {status}: {reason}");
        }
        Ok(())
    }
}
