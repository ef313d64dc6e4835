//! Feed HTTP client + host record store contracts for calpull.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod pg;
mod store;

pub use pg::PgRecordStore;
pub use store::{MemoryRecordStore, RecordStore, RunLease, StoreError};

pub const CRATE_NAME: &str = "calpull-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub sha256: String,
}

impl FetchedFeed {
    pub fn new(status: StatusCode, final_url: impl Into<String>, body: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&body);
        Self {
            status,
            final_url: final_url.into(),
            body,
            sha256,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no feed url configured")]
    MissingUrl,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Anything able to hand back the raw feed body for a URL.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedFeed, FetchError>;
}

/// Single-shot GET client. No retries: a failed pull waits for the next trigger.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
}

impl FeedFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedSource for FeedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        if url.trim().is_empty() {
            return Err(FetchError::MissingUrl);
        }

        let span = info_span!("feed_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            let fetched = FetchedFeed::new(status, final_url, body);
            debug!(bytes = fetched.body.len(), sha256 = %fetched.sha256, "feed fetched");
            Ok(fetched)
        }
        .instrument(span)
        .await
    }
}
