//! Client for the third-party now-playing feed.
//!
//! The payload is opaque JSON; [`crate::track`] makes sense of it. An
//! optional edge endpoint (a cached copy of the same feed) is preferred for
//! the very first fetch so startup does not wait on the slow origin.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("onair/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait NowPlayingSource: Send + Sync {
    /// One poll of the upstream API.
    async fn fetch(&self) -> Result<Value>;

    /// First fetch after startup. Defaults to a plain [`fetch`](Self::fetch).
    async fn fetch_initial(&self) -> Result<Value> {
        self.fetch().await
    }
}

pub struct HttpUpstream {
    client: Client,
    api_url: String,
    edge_url: Option<String>,
}

impl HttpUpstream {
    pub fn new(api_url: String, edge_url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            api_url,
            edge_url: edge_url.filter(|u| !u.trim().is_empty()),
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::upstream(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::upstream(format!("{} returned {}", url, status)));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| Error::upstream(format!("{}: bad body: {}", url, e)))
    }
}

#[async_trait]
impl NowPlayingSource for HttpUpstream {
    async fn fetch(&self) -> Result<Value> {
        self.get_json(&self.api_url).await
    }

    async fn fetch_initial(&self) -> Result<Value> {
        if let Some(edge) = &self.edge_url {
            match self.get_json(edge).await {
                Ok(v) => {
                    debug!("[upstream] initial fetch served by edge cache");
                    return Ok(v);
                }
                Err(e) => warn!("[upstream] edge fetch failed, using origin: {}", e),
            }
        }
        self.fetch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 server answering every request with `status` + `body`.
    async fn serve(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });
        format!("http://{}/nowplaying", addr)
    }

    async fn closed_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/edge", addr)
    }

    #[tokio::test]
    async fn test_fetch_parses_json() {
        let url = serve("200 OK", r#"{"current":{"TITLE":"Song A"}}"#).await;
        let up = HttpUpstream::new(url, None, Duration::from_secs(2)).unwrap();
        let v = up.fetch().await.unwrap();
        assert_eq!(v["current"]["TITLE"], "Song A");
    }

    #[tokio::test]
    async fn test_non_success_is_upstream_unavailable() {
        let url = serve("503 Service Unavailable", "{}").await;
        let up = HttpUpstream::new(url, None, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            up.fetch().await,
            Err(Error::UpstreamUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_initial_fetch_falls_back_to_origin() {
        let origin = serve("200 OK", r#"{"listeners":3}"#).await;
        let edge = closed_url().await;
        let up = HttpUpstream::new(origin, Some(edge), Duration::from_secs(2)).unwrap();
        let v = up.fetch_initial().await.unwrap();
        assert_eq!(v["listeners"], 3);
    }
}
