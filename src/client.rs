//! CLI side of a running server's `/admin` route
//!
//! Operator commands go through the server when one is listening, so its
//! cache and settings change together with the store.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::Result;
use crate::operator::{Command, Reply};

pub struct AdminClient {
    http: reqwest::Client,
    url: String,
}

impl AdminClient {
    /// An unspecified bind address (`0.0.0.0`, `::`) is reached over loopback.
    pub fn new(mut addr: SocketAddr) -> Result<Self> {
        if addr.ip().is_unspecified() {
            let loopback = if addr.is_ipv4() {
                Ipv4Addr::LOCALHOST.into()
            } else {
                Ipv6Addr::LOCALHOST.into()
            };
            addr.set_ip(loopback);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(500))
            .timeout(Duration::from_secs(10))
            .no_proxy()
            .build()?;

        Ok(Self {
            http,
            url: format!("http://{}/admin", addr),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `Ok(None)` when nothing is listening at the address.
    pub async fn send(&self, command: &Command) -> Result<Option<Reply>> {
        let response = match self.http.post(&self.url).json(command).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                tracing::debug!("No server at {}: {}", self.url, e);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let reply = response.error_for_status()?.json::<Reply>().await?;
        Ok(Some(reply))
    }
}
