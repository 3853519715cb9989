//! PiPin adapter - the self-hosted pinning service.
//!
//! Bearer token auth. Listing returns a bare JSON array of hashes with no
//! metadata. Unlike the commercial services, PiPin exposes a real point
//! query for pin status, so `is_pinned` does not fall back to `fetch`.

use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::{apply_filter, BackendError, ContentId, NamedHash, Pup};

const BACKEND: &str = "pipin";

pub struct Pipin {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

#[derive(Deserialize)]
struct PinStatus {
    pinned: bool,
}

impl Pipin {
    pub fn new(base_url: Url, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> Url {
        self.base_url.join(path).expect("valid endpoint path")
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.token)
    }
}

#[async_trait::async_trait]
impl Pup for Pipin {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn fetch(&self, filter: &[ContentId]) -> Result<Vec<NamedHash>, BackendError> {
        let response = self
            .authed(self.http.get(self.url("pins")))
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                backend: BACKEND,
                op: "fetch",
                source,
            })?;

        if response.status() != StatusCode::OK {
            return Err(BackendError::Status {
                backend: BACKEND,
                op: "fetch",
                status: response.status(),
            });
        }

        let hashes: Vec<String> =
            response
                .json()
                .await
                .map_err(|source| BackendError::Decode {
                    backend: BACKEND,
                    op: "fetch",
                    source,
                })?;

        let list = hashes.into_iter().map(NamedHash::bare).collect();
        Ok(apply_filter(list, filter))
    }

    async fn pin(&self, hash: &ContentId) -> Result<(), BackendError> {
        let url = self.url(&format!("pin/{hash}"));
        let response =
            self.authed(self.http.post(url))
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
        let url = self.url(&format!("pin/{hash}"));
        let response =
            self.authed(self.http.delete(url))
                .send()
                .await
                .map_err(|source| BackendError::Transport {
                    backend: BACKEND,
                    op: "unpin",
                    source,
                })?;

        match response.status() {
            StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            status => Err(BackendError::Status {
                backend: BACKEND,
                op: "unpin",
                status,
            }),
        }
    }

    async fn is_pinned(&self, hash: &ContentId) -> Result<bool, BackendError> {
        let url = self.url(&format!("pin/{hash}"));
        let response =
            self.authed(self.http.get(url))
                .send()
                .await
                .map_err(|source| BackendError::Transport {
                    backend: BACKEND,
                    op: "is_pinned",
                    source,
                })?;

        if response.status() != StatusCode::OK {
            return Err(BackendError::Status {
                backend: BACKEND,
                op: "is_pinned",
                status: response.status(),
            });
        }

        let status: PinStatus =
            response
                .json()
                .await
                .map_err(|source| BackendError::Decode {
                    backend: BACKEND,
                    op: "is_pinned",
                    source,
                })?;
        Ok(status.pinned)
    }
}
