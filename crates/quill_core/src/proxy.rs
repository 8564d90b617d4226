/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;
use std::sync::RwLock;
use std::time::Duration;
use url::{Host, Url};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProxyMode {
    Direct,
    Socks5 { url: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid proxy url: {0}")]
    InvalidUrl(String),
    #[error("unsupported proxy scheme {0}")]
    UnsupportedScheme(String),
    #[error("refusing non-loopback proxy {0}")]
    RemoteNotAllowed(String),
    #[error("no running transport for route")]
    NoRunningTransport,
    #[error("apply proxy: {0}")]
    Apply(String),
}

/// Receiver of proxy changes. The app's HTTP/P2P stack implements this.
pub trait ProxySink: Send + Sync {
    fn apply(&self, mode: &ProxyMode) -> Result<(), ProxyError>;
}

pub fn socks5_url_for_port(port: u16) -> String {
    format!("socks5://127.0.0.1:{port}")
}

/// Parses and normalizes a socks proxy URL. Remote proxies require
/// `allow_remote`.
pub fn validate_proxy_url(raw: &str, allow_remote: bool) -> Result<String, ProxyError> {
    let url = Url::parse(raw.trim()).map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "socks5" | "socks5h" => {}
        other => return Err(ProxyError::UnsupportedScheme(other.to_string())),
    }
    let host = url
        .host()
        .ok_or_else(|| ProxyError::InvalidUrl(format!("missing host in {raw}")))?;
    if url.port().is_none() {
        return Err(ProxyError::InvalidUrl(format!("missing port in {raw}")));
    }
    if !allow_remote && !is_loopback(&host) {
        return Err(ProxyError::RemoteNotAllowed(host.to_string()));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn is_loopback(host: &Host<&str>) -> bool {
    match host {
        Host::Ipv4(ip) => ip.is_loopback(),
        Host::Ipv6(ip) => ip.is_loopback(),
        // socks schemes are not "special", so IPv4 literals arrive as opaque hosts.
        Host::Domain(d) => {
            d.eq_ignore_ascii_case("localhost")
                || d.parse::<std::net::IpAddr>().is_ok_and(|ip| ip.is_loopback())
        }
    }
}

/// Sink that keeps a `reqwest::Client` routed through the active proxy.
pub struct HttpClientProxy {
    timeout: Duration,
    state: RwLock<(ProxyMode, reqwest::Client)>,
}

impl HttpClientProxy {
    pub fn new(timeout: Duration) -> Result<Self, ProxyError> {
        let client = build_client(timeout, &ProxyMode::Direct)?;
        Ok(Self {
            timeout,
            state: RwLock::new((ProxyMode::Direct, client)),
        })
    }

    pub fn client(&self) -> reqwest::Client {
        match self.state.read() {
            Ok(g) => g.1.clone(),
            Err(poisoned) => poisoned.into_inner().1.clone(),
        }
    }

    pub fn mode(&self) -> ProxyMode {
        match self.state.read() {
            Ok(g) => g.0.clone(),
            Err(poisoned) => poisoned.into_inner().0.clone(),
        }
    }
}

impl ProxySink for HttpClientProxy {
    fn apply(&self, mode: &ProxyMode) -> Result<(), ProxyError> {
        let client = build_client(self.timeout, mode)?;
        let mut g = self
            .state
            .write()
            .map_err(|_| ProxyError::Apply("proxy state poisoned".to_string()))?;
        *g = (mode.clone(), client);
        Ok(())
    }
}

fn build_client(timeout: Duration, mode: &ProxyMode) -> Result<reqwest::Client, ProxyError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let ProxyMode::Socks5 { url } = mode {
        let proxy = reqwest::Proxy::all(url).map_err(|e| ProxyError::Apply(e.to_string()))?;
        builder = builder.proxy(proxy);
    } else {
        builder = builder.no_proxy();
    }
    builder.build().map_err(|e| ProxyError::Apply(e.to_string()))
}
