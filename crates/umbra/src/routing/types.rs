//! Routing data types
//!
//! Stream targets, the process-wide anonymity policy, Tor connectivity
//! snapshots and the routes the resolver produces from them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of proxy a stream (or route) goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    None,
    Tor,
    I2p,
    Custom,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::None => write!(f, "direct"),
            ProxyKind::Tor => write!(f, "Tor"),
            ProxyKind::I2p => write!(f, "I2P"),
            ProxyKind::Custom => write!(f, "custom"),
        }
    }
}

/// Wire protocol of a user-configured proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    /// URL scheme understood by reqwest. SOCKS schemes resolve DNS on the proxy.
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4a",
            ProxyProtocol::Socks5 => "socks5h",
        }
    }
}

/// How credentials are presented to a custom proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyAuthType {
    /// Never send credentials
    None,
    #[default]
    Basic,
    /// Answer the proxy's 407 challenge (HTTP proxies only)
    Digest,
}

/// A user-configured proxy with optional credentials
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomProxy {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth_type: ProxyAuthType,
    /// Overrides the proxied connect timeout when non-zero
    #[serde(default)]
    pub connect_timeout_secs: u64,
}

impl CustomProxy {
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && self.port > 0
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// Credentials are sent only when present and not switched off
    pub fn sends_credentials(&self) -> bool {
        self.auth_type != ProxyAuthType::None && self.has_credentials()
    }
}

// Credentials stay out of logs.
impl fmt::Debug for CustomProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomProxy")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("has_credentials", &self.has_credentials())
            .field("auth_type", &self.auth_type)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// What the user asked to play. Replaced wholesale on station change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamTarget {
    pub url: String,
    #[serde(default)]
    pub proxy_host: String,
    #[serde(default)]
    pub proxy_port: u16,
    #[serde(default)]
    pub proxy_kind: ProxyKind,
    #[serde(default)]
    pub station_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_art: Option<String>,
    /// Protocol and credentials when `proxy_kind` is `Custom`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_proxy: Option<CustomProxy>,
}

impl StreamTarget {
    /// A target with no proxy of its own
    pub fn new(url: impl Into<String>, station_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            station_name: station_name.into(),
            ..Self::default()
        }
    }

    /// Attach a proxy declared by the station itself
    pub fn with_proxy(mut self, kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        self.proxy_kind = kind;
        self.proxy_host = host.into();
        self.proxy_port = port;
        self
    }

    /// Host part of the stream URL, lowercased
    pub fn host(&self) -> Option<String> {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }

    /// True when the station lives on the I2P network
    pub fn is_i2p(&self) -> bool {
        self.proxy_kind == ProxyKind::I2p
            || self.host().is_some_and(|h| h.ends_with(".i2p"))
    }

    /// True when the station is a Tor onion service
    pub fn is_onion(&self) -> bool {
        self.proxy_kind == ProxyKind::Tor
            || self.host().is_some_and(|h| h.ends_with(".onion"))
    }

    /// The station supplies a usable proxy of the given kind
    pub(crate) fn declared_proxy(&self, kind: ProxyKind) -> bool {
        self.proxy_kind == kind && !self.proxy_host.trim().is_empty()
    }
}

/// Process-wide anonymity settings, read fresh on every connection attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnonymityPolicy {
    pub force_all_through_tor: bool,
    pub force_all_except_i2p_through_tor: bool,
    pub force_custom_proxy: bool,
    pub force_custom_proxy_except_tor_i2p: bool,
    pub custom_proxy: Option<CustomProxy>,
}

impl AnonymityPolicy {
    pub(crate) fn configured_custom_proxy(&self) -> Option<&CustomProxy> {
        self.custom_proxy.as_ref().filter(|p| p.is_configured())
    }
}

/// Snapshot of the external Tor daemon's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorConnectivity {
    pub connected: bool,
    pub socks_host: String,
    pub socks_port: u16,
}

impl TorConnectivity {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            socks_host: crate::config::proxy::DEFAULT_TOR_HOST.to_string(),
            socks_port: crate::config::proxy::DEFAULT_TOR_PORT,
        }
    }

    pub fn connected(host: impl Into<String>, port: u16) -> Self {
        Self {
            connected: true,
            socks_host: host.into(),
            socks_port: port,
        }
    }
}

/// Why no route may be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    TorNotConnected,
    CustomProxyNotConfigured,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::TorNotConnected => write!(f, "Tor is required but not connected"),
            BlockReason::CustomProxyNotConfigured => {
                write!(f, "A custom proxy is required but none is configured")
            }
        }
    }
}

/// A concrete proxy endpoint to connect through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub host: String,
    pub port: u16,
    pub kind: ProxyKind,
    /// Protocol and credentials for `ProxyKind::Custom`
    pub custom: Option<CustomProxy>,
}

impl Route {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
            custom: None,
        }
    }

    pub(crate) fn custom(proxy: &CustomProxy) -> Self {
        Self {
            host: proxy.host.clone(),
            port: proxy.port,
            kind: ProxyKind::Custom,
            custom: Some(proxy.clone()),
        }
    }
}

/// Outcome of route resolution for one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectiveRoute {
    Direct,
    Proxied(Route),
    Blocked(BlockReason),
}

impl EffectiveRoute {
    pub fn is_blocked(&self) -> bool {
        matches!(self, EffectiveRoute::Blocked(_))
    }

    /// Kind of proxy in use, `None` for direct and blocked routes
    pub fn kind(&self) -> ProxyKind {
        match self {
            EffectiveRoute::Proxied(route) => route.kind,
            _ => ProxyKind::None,
        }
    }
}

impl fmt::Display for EffectiveRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectiveRoute::Direct => write!(f, "direct"),
            EffectiveRoute::Proxied(r) => write!(f, "{} via {}:{}", r.kind, r.host, r.port),
            EffectiveRoute::Blocked(reason) => write!(f, "blocked ({reason})"),
        }
    }
}

/// Live source of routing inputs.
///
/// Every method is called once per connection attempt, so implementations
/// must return the current value rather than a cached one.
pub trait RoutingContext: Send + Sync {
    fn policy(&self) -> AnonymityPolicy;

    fn tor(&self) -> TorConnectivity;

    /// Whether the local I2P proxy answers. Only used for warnings.
    fn i2p_available(&self) -> bool {
        true
    }
}

/// Fixed routing inputs, for headless use and tests
#[derive(Debug, Clone)]
pub struct StaticRouting {
    pub policy: AnonymityPolicy,
    pub tor: TorConnectivity,
    pub i2p_available: bool,
}

impl Default for StaticRouting {
    fn default() -> Self {
        Self {
            policy: AnonymityPolicy::default(),
            tor: TorConnectivity::disconnected(),
            i2p_available: true,
        }
    }
}

impl RoutingContext for StaticRouting {
    fn policy(&self) -> AnonymityPolicy {
        self.policy.clone()
    }

    fn tor(&self) -> TorConnectivity {
        self.tor.clone()
    }

    fn i2p_available(&self) -> bool {
        self.i2p_available
    }
}
