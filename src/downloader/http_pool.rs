use reqwest::header::{HeaderValue, ACCEPT, RANGE};
use reqwest::{Client, ClientBuilder, Proxy, RequestBuilder};
use std::time::Duration;
use url::Url;

use crate::config::NetworkConfig;
use crate::errors::Result;

/// Shared HTTP client for media transfers.
///
/// No overall request timeout is set: a large file legitimately takes long.
/// Stalls are detected per chunk by the downloader instead.
#[derive(Clone)]
pub struct HttpPool {
    client: Client,
    stall_timeout: Duration,
}

impl HttpPool {
    pub fn new(network: &NetworkConfig) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .connect_timeout(network.connect_timeout())
            .user_agent(network.user_agent.as_str())
            .gzip(true)
            .brotli(true)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true);

        if let Some(proxy) = &network.proxy {
            log::info!("Routing transfers through proxy {}", proxy);
            builder = builder.proxy(Proxy::all(proxy.as_str())?);
        }

        Ok(Self {
            client: builder.build()?,
            stall_timeout: network.stall_timeout(),
        })
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    /// GET for `url`, asking for the bytes from `offset` on when it is non-zero.
    pub fn media_request(&self, url: &Url, offset: u64) -> RequestBuilder {
        let request = self
            .client
            .get(url.clone())
            .header(ACCEPT, HeaderValue::from_static("video/*,application/octet-stream,*/*;q=0.8"));
        if offset > 0 {
            request.header(RANGE, format!("bytes={}-", offset))
        } else {
            request
        }
    }
}
