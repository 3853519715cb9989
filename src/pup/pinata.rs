//! Pinata adapter.
//!
//! Auth is a key/secret header pair. Listing uses the `pinList` data API,
//! which caps results at 1000 rows; this adapter does not page past the
//! cap (known limitation of the service's listing endpoint).

use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::{apply_filter, BackendError, ContentId, NamedHash, Pup};

const DEFAULT_BASE_URL: &str = "https://api.pinata.cloud/";
const BACKEND: &str = "pinata";

pub struct Pinata {
    http: reqwest::Client,
    base_url: Url,
    key: String,
    secret: String,
}

#[derive(Deserialize)]
struct PinList {
    rows: Vec<PinRow>,
}

#[derive(Deserialize)]
struct PinRow {
    ipfs_pin_hash: String,
    size: Option<i64>,
    metadata: Option<PinMetadata>,
}

#[derive(Deserialize)]
struct PinMetadata {
    name: Option<String>,
}

impl Pinata {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_base_url(key, secret, DEFAULT_BASE_URL.parse().expect("static URL"))
    }

    pub fn with_base_url(key: impl Into<String>, secret: impl Into<String>, base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            key: key.into(),
            secret: secret.into(),
        }
    }

    fn url(&self, path: &str) -> Url {
        self.base_url.join(path).expect("valid endpoint path")
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("pinata_api_key", &self.key)
            .header("pinata_secret_api_key", &self.secret)
    }
}

#[async_trait::async_trait]
impl Pup for Pinata {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn fetch(&self, filter: &[ContentId]) -> Result<Vec<NamedHash>, BackendError> {
        let mut url = self.url("data/pinList");
        url.set_query(Some("status=pinned"));

        let response = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                backend: BACKEND,
                op: "fetch",
                source,
            })?;

        if !response.status().is_success() {
            return Err(BackendError::Status {
                backend: BACKEND,
                op: "fetch",
                status: response.status(),
            });
        }

        let list: PinList = response
            .json()
            .await
            .map_err(|source| BackendError::Decode {
                backend: BACKEND,
                op: "fetch",
                source,
            })?;

        let list = list
            .rows
            .into_iter()
            .map(|row| NamedHash {
                hash: ContentId::new(row.ipfs_pin_hash),
                name: row.metadata.and_then(|m| m.name),
                size: row.size,
            })
            .collect();
        Ok(apply_filter(list, filter))
    }

    async fn pin(&self, hash: &ContentId) -> Result<(), BackendError> {
        let body = serde_json::json!({ "hashToPin": hash });
        let response = self
            .authed(self.http.post(self.url("pinning/pinByHash")).json(&body))
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                backend: BACKEND,
                op: "pin",
                source,
            })?;

        if response.status() != StatusCode::OK {
            return Err(BackendError::Status {
                backend: BACKEND,
                op: "pin",
                status: response.status(),
            });
        }
        Ok(())
    }

    async fn unpin(&self, hash: &ContentId) -> Result<(), BackendError> {
        let url = self.url(&format!("pinning/unpin/{hash}"));
        let response =
            self.authed(self.http.delete(url))
                .send()
                .await
                .map_err(|source| BackendError::Transport {
                    backend: BACKEND,
                    op: "unpin",
                    source,
                })?;

        // Unpinning a hash the service never held is success.
        match response.status() {
            StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            status => Err(BackendError::Status {
                backend: BACKEND,
                op: "unpin",
                status,
            }),
        }
    }
}
