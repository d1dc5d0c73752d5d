//! Callback destination policy (SSRF guard).
//!
//! A destination is accepted when:
//! - the scheme is `https`, or `http` with a loopback host,
//! - the host matches the operator allowlist exactly or as a subdomain, or the
//!   allowlist is empty and the host is loopback,
//! - an IP-literal host is not private, link-local, unspecified, broadcast or
//!   multicast, unless the literal is listed verbatim,
//! - with DNS checks on, the host resolves within the resolve timeout and none
//!   of its addresses fall in those ranges.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::{Host, Url};

use crate::{Error, Result};

/// A destination that passed the policy.
#[derive(Debug, Clone)]
pub struct CallbackTarget {
    pub url: Url,
    /// Domain name, if the host is not an IP literal.
    pub domain: Option<String>,
    /// Validated addresses to connect to. Empty when DNS checks are off.
    pub addrs: Vec<SocketAddr>,
}

/// Default bound on a single hostname resolution.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Hostname resolution used by [`CallbackPolicy`].
#[async_trait]
pub trait HostResolver: Send + Sync + std::fmt::Debug {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system resolver.
#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// Operator policy for callback destinations.
#[derive(Debug, Clone)]
pub struct CallbackPolicy {
    allowlist: Vec<String>,
    resolve_dns: bool,
    resolve_timeout: Duration,
    resolver: Arc<dyn HostResolver>,
}

impl CallbackPolicy {
    pub fn new<I, S>(allowlist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowlist = allowlist
            .into_iter()
            .map(|entry| normalize_host(entry.as_ref()))
            .filter(|entry| !entry.is_empty())
            .collect();

        Self {
            allowlist,
            resolve_dns: true,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Enable or disable resolving hostnames during validation.
    pub fn with_dns_check(mut self, enabled: bool) -> Self {
        self.resolve_dns = enabled;
        self
    }

    /// Bound each hostname resolution; expiry rejects the destination.
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn allowlist(&self) -> &[String] {
        &self.allowlist
    }

    fn listed_verbatim(&self, host: &str) -> bool {
        self.allowlist.iter().any(|entry| entry == host)
    }

    fn matches_allowlist(&self, host: &str, is_ip: bool) -> bool {
        self.allowlist.iter().any(|entry| {
            host == entry || (!is_ip && host.ends_with(&format!(".{entry}")))
        })
    }

    /// Checks that need no network access.
    pub fn check_url(&self, url: &Url) -> Result<CallbackTarget> {
        let host = url
            .host()
            .ok_or_else(|| Error::allowlist("callback URL has no host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::allowlist("callback URL has no port"))?;

        let (host_str, ip) = match host {
            Host::Domain(domain) => (normalize_host(domain), None),
            Host::Ipv4(ip) => (ip.to_string(), Some(IpAddr::V4(ip))),
            Host::Ipv6(ip) => (ip.to_string(), Some(IpAddr::V6(ip))),
        };
        let loopback = match ip {
            Some(ip) => ip.is_loopback(),
            None => host_str == "localhost",
        };

        match url.scheme() {
            "https" => {}
            "http" if loopback => {}
            "http" => {
                return Err(Error::allowlist(format!(
                    "plain http is only allowed for loopback hosts, got '{host_str}'"
                )));
            }
            other => {
                return Err(Error::allowlist(format!("unsupported scheme '{other}'")));
            }
        }

        if let Some(ip) = ip
            && is_blocked(ip)
            && !self.listed_verbatim(&host_str)
        {
            return Err(Error::allowlist(format!(
                "address {ip} is in a blocked range"
            )));
        }

        if self.allowlist.is_empty() {
            if !loopback {
                return Err(Error::allowlist(format!(
                    "host '{host_str}' is not allowed: the allowlist is empty, only loopback destinations are permitted"
                )));
            }
        } else if !self.matches_allowlist(&host_str, ip.is_some()) {
            return Err(Error::allowlist(format!(
                "host '{host_str}' is not in the callback allowlist"
            )));
        }

        Ok(CallbackTarget {
            url: url.clone(),
            domain: ip.is_none().then(|| host_str.clone()),
            addrs: ip.map(|ip| vec![SocketAddr::new(ip, port)]).unwrap_or_default(),
        })
    }

    /// Full validation, including DNS resolution when enabled.
    pub async fn validate(&self, url: &Url) -> Result<CallbackTarget> {
        let mut target = self.check_url(url)?;

        let Some(domain) = target.domain.clone() else {
            return Ok(target);
        };
        if !self.resolve_dns {
            return Ok(target);
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let resolved = tokio::time::timeout(
            self.resolve_timeout,
            self.resolver.resolve(&domain, port),
        )
        .await
        .map_err(|_| {
            Error::allowlist(format!(
                "resolving '{domain}' timed out after {} ms",
                self.resolve_timeout.as_millis()
            ))
        })?
        .map_err(|e| Error::allowlist(format!("could not resolve '{domain}': {e}")))?;

        if resolved.is_empty() {
            return Err(Error::allowlist(format!("'{domain}' resolved to no addresses")));
        }

        for addr in &resolved {
            let ip = addr.ip();
            if self.listed_verbatim(&ip.to_string()) {
                continue;
            }
            if is_blocked(ip) || (ip.is_loopback() && domain != "localhost") {
                return Err(Error::allowlist(format!(
                    "'{domain}' resolves to blocked address {ip}"
                )));
            }
        }

        debug!(host = %domain, addrs = ?resolved, "Callback destination resolved");
        target.addrs = resolved;
        Ok(target)
    }
}

fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Private, link-local, unspecified, broadcast and multicast ranges.
fn is_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                // 100.64.0.0/10, carrier-grade NAT
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_blocked(IpAddr::V4(v4)) || v4.is_loopback();
            }
            let first = v6.segments()[0];
            v6.is_unspecified()
                || v6.is_multicast()
                // fc00::/7 unique local
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (first & 0xffc0) == 0xfe80
        }
    }
}
