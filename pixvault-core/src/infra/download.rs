use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::CONTENT_TYPE};

use crate::{
    domain::{BinaryFetcher, FetchedBinary},
    error::DownloadError,
};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Downloads photo binaries over HTTP(S).
#[derive(Clone, Debug)]
pub struct HttpBinaryFetcher {
    client: Client,
}

impl HttpBinaryFetcher {
    /// Fetcher with its own client and download timeout.
    pub fn new() -> Result<Self, DownloadError> {
        let client = Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| DownloadError::Transport {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    /// Fetcher over a caller-built client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BinaryFetcher for HttpBinaryFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedBinary, DownloadError> {
        let transport = |e: reqwest::Error| DownloadError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned);

        let bytes = response.bytes().await.map_err(transport)?;

        Ok(FetchedBinary {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}
