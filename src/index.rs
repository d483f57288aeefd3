//! Client for the fleet's digest -> infohash index service.
//!
//! The index is a remote key/value endpoint: a lookup that may come back
//! empty, and an idempotent register/update. Both sides tolerate eventual
//! consistency; the orchestrator treats a missing mapping as "no torrent
//! exists yet".

use reqwest::{Client, StatusCode};
use serde_derive::{Deserialize, Serialize};

use crate::error::index::Result;
use crate::error::IndexError;

/// HTTP client for the index service. Cheap to clone; safe for concurrent
/// use.
#[derive(Debug, Clone)]
pub struct IndexClient {
    client: Client,
    base: String,
}

#[derive(Debug, Deserialize)]
struct InfohashResponse {
    #[serde(default)]
    infohash: String,
}

#[derive(Debug, Serialize)]
struct ModifyRequest<'a> {
    digest: &'a str,
    infohash: &'a str,
}

impl IndexClient {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    /// Looks up the infohash registered for `digest`. `None` means the index
    /// holds no mapping yet.
    pub async fn get_infohash(&self, digest: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(format!("{}/infohash", self.base))
            .query(&[("digest", digest)])
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => {
                let body: InfohashResponse = resp.json().await?;
                if body.infohash.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(body.infohash))
                }
            }
            status => Err(IndexError::Status(status)),
        }
    }

    /// Registers (or overwrites) the mapping for `digest`.
    pub async fn modify(&self, digest: &str, infohash: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/infohash", self.base))
            .json(&ModifyRequest { digest, infohash })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(IndexError::Status(resp.status()));
        }
        Ok(())
    }
}
