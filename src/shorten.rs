//! URL shortening for published manifest pages.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

/// External URL-shortening collaborator.
#[async_trait]
pub trait Shortener: Send + Sync {
    async fn shorten(&self, url: &str) -> Result<String>;
}

const DEFAULT_BASE_URL: &str = "https://api-ssl.bitly.com/";

/// Bitly v4 client.
pub struct Bitly {
    http: reqwest::Client,
    base_url: Url,
    key: String,
}

#[derive(Deserialize)]
struct ShortenResponse {
    link: String,
}

impl Bitly {
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_base_url(key, DEFAULT_BASE_URL.parse().expect("static URL"))
    }

    pub fn with_base_url(key: impl Into<String>, base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            key: key.into(),
        }
    }
}

#[async_trait]
impl Shortener for Bitly {
    async fn shorten(&self, url: &str) -> Result<String> {
        let endpoint = self
            .base_url
            .join("v4/shorten")
            .context("building bitly URL")?;
        let body = serde_json::json!({ "long_url": url });

        let response = self
            .http
            .post(endpoint)
            .bearer_auth(&self.key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("bitly: shortening {url:?}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("bitly: shortening {url:?}: HTTP {status}"));
        }

        let shortened: ShortenResponse = response
            .json()
            .await
            .with_context(|| format!("bitly: shortening {url:?}: parsing response"))?;
        Ok(shortened.link)
    }
}
