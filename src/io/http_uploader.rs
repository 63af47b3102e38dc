//! HTTP uploader - POSTs outbox batches as JSON
//!
//! Request: `{"records":[{"id":..,"event":..}]}` with an optional bearer token.
//! A 2xx body of `{"acks":[{"id":..,"ok":bool}]}` gives per-entry results;
//! any other 2xx body acknowledges the whole batch.

use crate::infra::config::Config;
use crate::services::outbox::{EntryAck, UploadRecord, UploadResponse, Uploader};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// `geotrack/<version>+<git hash>`
pub const USER_AGENT: &str = concat!("geotrack/", env!("GEOTRACK_BUILD"));

#[derive(Serialize)]
struct UploadBody<'a> {
    records: &'a [UploadRecord],
}

#[derive(Deserialize)]
struct AckBody {
    acks: Vec<EntryAck>,
}

pub struct HttpUploader {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpUploader {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, url: url.into(), token })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(config.http_url(), config.authorization_token().map(str::to_string), config.http_timeout())
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, records: &[UploadRecord]) -> anyhow::Result<UploadResponse> {
        let mut request = self.client.post(&self.url).json(&UploadBody { records });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;
        let status = response.status();
        if !status.is_success() {
            return Ok(UploadResponse { status: status.as_u16(), results: None });
        }

        let body = response.bytes().await.context("Failed to read upload response")?;
        let results = if body.is_empty() {
            None
        } else {
            match serde_json::from_slice::<AckBody>(&body) {
                Ok(ack) => Some(ack.acks),
                Err(e) => {
                    debug!(error = %e, "upload_response_without_acks");
                    None
                }
            }
        };
        Ok(UploadResponse { status: status.as_u16(), results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_carries_build_stamp() {
        let build = USER_AGENT.strip_prefix("geotrack/").unwrap();
        assert!(build.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(HttpUploader::new("http://127.0.0.1:9/ingest", None, Duration::from_secs(1)).is_ok());
    }
}
