use async_trait::async_trait;
use pincali_core::{Result, SyncConfig, SyncError};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION, LOCATION, REFERER};
use reqwest::redirect::Policy;
use reqwest::Client;
use std::time::Duration;

/// Timeout for removal-verification HEAD probes.
const HEAD_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct HeadResponse {
    pub status: u16,
    pub location: Option<String>,
}

/// HTTP access used by the scanner (GET on listing pages) and the removal
/// verifier (HEAD without following redirects). Faked in tests.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchedPage>;
    async fn head(&self, url: &str) -> Result<HeadResponse>;
}

#[derive(Debug)]
pub struct HttpPageFetcher {
    get_client: Client,
    head_client: Client,
}

impl HttpPageFetcher {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            REFERER,
            HeaderValue::from_str(&config.base_url)
                .map_err(|e| SyncError::Config(format!("invalid base_url referer: {}", e)))?,
        );

        let get_client = Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let head_client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(Policy::none())
            .timeout(Duration::from_secs(HEAD_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            get_client,
            head_client,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn get(&self, url: &str) -> Result<FetchedPage> {
        let response = self.get_client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(FetchedPage { status, body })
    }

    async fn head(&self, url: &str) -> Result<HeadResponse> {
        let response = self.head_client.head(url).send().await?;
        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Ok(HeadResponse { status, location })
    }
}
