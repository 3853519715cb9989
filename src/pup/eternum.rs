//! Eternum adapter.
//!
//! Token auth. Pinning a hash that is already pinned comes back as HTTP
//! 400 with a recognizable error body; the adapter folds that case into
//! success so `pin` stays idempotent.

use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::{apply_filter, BackendError, ContentId, NamedHash, Pup};

const DEFAULT_BASE_URL: &str = "https://www.eternum.io/";
const BACKEND: &str = "eternum";

const ALREADY_PINNED: &str = "You have already pinned an object with that hash.";

pub struct Eternum {
    http: reqwest::Client,
    base_url: Url,
    key: String,
}

#[derive(Deserialize)]
struct ListResponse {
    results: Vec<PinEntry>,
}

#[derive(Deserialize)]
struct PinEntry {
    hash: String,
    name: Option<String>,
    size: Option<i64>,
}

#[derive(Deserialize)]
struct PinRejection {
    #[serde(default)]
    non_field_errors: Vec<String>,
}

impl Eternum {
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

    fn url(&self, path: &str) -> Url {
        self.base_url.join(path).expect("valid endpoint path")
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("authorization", format!("Token {}", self.key))
    }
}

#[async_trait::async_trait]
impl Pup for Eternum {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn fetch(&self, filter: &[ContentId]) -> Result<Vec<NamedHash>, BackendError> {
        let response = self
            .authed(self.http.get(self.url("api/pin/")))
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

        let body: ListResponse =
            response
                .json()
                .await
                .map_err(|source| BackendError::Decode {
                    backend: BACKEND,
                    op: "fetch",
                    source,
                })?;

        let list = body
            .results
            .into_iter()
            .map(|entry| NamedHash {
                hash: ContentId::new(entry.hash),
                name: entry.name,
                size: entry.size,
            })
            .collect();
        Ok(apply_filter(list, filter))
    }

    async fn pin(&self, hash: &ContentId) -> Result<(), BackendError> {
        let body = serde_json::json!({ "hash": hash });
        let response = self
            .authed(self.http.post(self.url("api/pin/")).json(&body))
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                backend: BACKEND,
                op: "pin",
                source,
            })?;

        let status = response.status();
        if status == StatusCode::CREATED {
            return Ok(());
        }

        if status == StatusCode::BAD_REQUEST {
            let rejection: PinRejection =
                response
                    .json()
                    .await
                    .map_err(|source| BackendError::Decode {
                        backend: BACKEND,
                        op: "pin",
                        source,
                    })?;
            if rejection
                .non_field_errors
                .first()
                .is_some_and(|msg| msg == ALREADY_PINNED)
            {
                return Ok(());
            }
        }

        Err(BackendError::Status {
            backend: BACKEND,
            op: "pin",
            status,
        })
    }

    async fn unpin(&self, hash: &ContentId) -> Result<(), BackendError> {
        let url = self.url(&format!("api/pin/{hash}/"));
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
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            status => Err(BackendError::Status {
                backend: BACKEND,
                op: "unpin",
                status,
            }),
        }
    }
}
