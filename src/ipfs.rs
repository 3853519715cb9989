//! Storage network node client.
//!
//! Talks to a Kubo daemon over its HTTP RPC API. The node is an external
//! collaborator: it adds and locally pins content, announces provider
//! records to the DHT, and serves content back by id. Everything here is
//! behind the [`NodeClient`] trait so the publish pipeline and the
//! reconciliation loop can be exercised against an in-memory node in
//! tests.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use url::Url;

use crate::pup::ContentId;

/// The subset of node capabilities the pipeline and aggregator rely on.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Add `content` to the network and pin it locally, returning the root
    /// content id.
    async fn add_and_pin(&self, content: Bytes, name: &str) -> Result<ContentId>;

    /// Announce to the network that this node holds `cid`.
    async fn provide(&self, cid: &ContentId) -> Result<()>;

    /// Retrieve the content behind `cid`.
    async fn cat(&self, cid: &ContentId) -> Result<Bytes>;
}

/// HTTP client for the Kubo RPC API (`/api/v0/...`).
#[derive(Clone)]
pub struct KuboClient {
    http: reqwest::Client,
    api_url: Url,
}

#[derive(serde::Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl KuboClient {
    pub fn new(api_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url,
        }
    }

    fn endpoint(&self, path: &str, arg: Option<&str>) -> Result<Url> {
        let mut url = self
            .api_url
            .join(path)
            .with_context(|| format!("building node API URL for {path}"))?;
        if let Some(arg) = arg {
            url.query_pairs_mut().append_pair("arg", arg);
        }
        Ok(url)
    }
}

#[async_trait]
impl NodeClient for KuboClient {
    async fn add_and_pin(&self, content: Bytes, name: &str) -> Result<ContentId> {
        let mut url = self.endpoint("api/v0/add", None)?;
        url.query_pairs_mut().append_pair("pin", "true");

        let part = Part::bytes(content.to_vec()).file_name(name.to_string());
        let form = Form::new().part("file", part);

        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .context("adding to ipfs")?;

        if !response.status().is_success() {
            return Err(anyhow!("adding to ipfs: HTTP {}", response.status()));
        }

        let added: AddResponse = response.json().await.context("decoding add response")?;
        Ok(ContentId::new(added.hash))
    }

    async fn provide(&self, cid: &ContentId) -> Result<()> {
        let url = self.endpoint("api/v0/routing/provide", Some(cid.as_str()))?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .with_context(|| format!("providing {cid} to ipfs"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "providing {cid} to ipfs: HTTP {}",
                response.status()
            ));
        }
        Ok(())
    }

    async fn cat(&self, cid: &ContentId) -> Result<Bytes> {
        let url = self.endpoint("api/v0/cat", Some(cid.as_str()))?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .with_context(|| format!("fetching {cid} from ipfs"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "fetching {cid} from ipfs: HTTP {}",
                response.status()
            ));
        }
        response.bytes().await.context("reading content body")
    }
}
