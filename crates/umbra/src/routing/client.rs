//! Proxy-aware HTTP client construction
//!
//! Every connection attempt gets a freshly built client so that playback and
//! recording never share a pool, and a route change takes effect immediately.

use std::time::Duration;

use reqwest::header::HeaderValue;
use reqwest::{Client, Proxy};

use crate::config::network::{
    CONNECT_TIMEOUT_SECS, POOL_IDLE_TIMEOUT_SECS, POOL_MAX_IDLE_PER_HOST, PROXY_CONNECT_TIMEOUT_SECS,
    RECORDER_USER_AGENT, USER_AGENT,
};
use crate::error::{RadioError, Result};

use super::types::{CustomProxy, EffectiveRoute, ProxyAuthType, ProxyKind, ProxyProtocol, Route};

/// Who the client is for. Determines the user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPurpose {
    Playback,
    Recording,
}

impl ClientPurpose {
    fn user_agent(&self) -> &'static str {
        match self {
            ClientPurpose::Playback => USER_AGENT,
            ClientPurpose::Recording => RECORDER_USER_AGENT,
        }
    }
}

/// Proxy URL for a route. SOCKS routes use the `h` variants so hostnames are
/// resolved by the proxy and never by the local resolver.
pub fn proxy_url(route: &Route) -> String {
    let scheme = match route.kind {
        ProxyKind::Tor => "socks5h",
        ProxyKind::I2p | ProxyKind::None => "http",
        ProxyKind::Custom => route
            .custom
            .as_ref()
            .map(|p| p.protocol.scheme())
            .unwrap_or("http"),
    };
    format!("{scheme}://{}:{}", route.host, route.port)
}

/// Connect timeout for a route
pub fn connect_timeout(route: &EffectiveRoute) -> Duration {
    match route {
        EffectiveRoute::Direct | EffectiveRoute::Blocked(_) => {
            Duration::from_secs(CONNECT_TIMEOUT_SECS)
        }
        EffectiveRoute::Proxied(r) => {
            let custom = r
                .custom
                .as_ref()
                .map(|p| p.connect_timeout_secs)
                .filter(|secs| *secs > 0);
            Duration::from_secs(custom.unwrap_or(PROXY_CONNECT_TIMEOUT_SECS))
        }
    }
}

/// Build a streaming client for one connection attempt.
///
/// There is no overall request timeout: a live stream has no natural end, and
/// stalls are handled by the caller's cancellation instead.
pub fn build_stream_client(route: &EffectiveRoute, purpose: ClientPurpose) -> Result<Client> {
    build_client(route, purpose, None)
}

/// Like `build_stream_client`, presenting `connect_auth` on the proxy CONNECT
/// of HTTPS streams.
pub(crate) fn build_client(
    route: &EffectiveRoute,
    purpose: ClientPurpose,
    connect_auth: Option<HeaderValue>,
) -> Result<Client> {
    let builder = Client::builder()
        .user_agent(purpose.user_agent())
        .connect_timeout(connect_timeout(route))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS));

    let builder = match route {
        EffectiveRoute::Blocked(reason) => return Err(RadioError::RouteBlocked(*reason)),
        // Environment proxies must not silently reroute a direct stream.
        EffectiveRoute::Direct => builder.no_proxy(),
        EffectiveRoute::Proxied(r) => builder.proxy(build_proxy(r, connect_auth)?),
    };

    Ok(builder.build()?)
}

/// The custom proxy of a route when it expects a Digest handshake
pub(crate) fn digest_proxy(route: &EffectiveRoute) -> Option<&CustomProxy> {
    match route {
        EffectiveRoute::Proxied(Route {
            kind: ProxyKind::Custom,
            custom: Some(custom),
            ..
        }) if custom.auth_type == ProxyAuthType::Digest
            && custom.has_credentials()
            && matches!(custom.protocol, ProxyProtocol::Http | ProxyProtocol::Https) =>
        {
            Some(custom)
        }
        _ => None,
    }
}

fn build_proxy(route: &Route, connect_auth: Option<HeaderValue>) -> Result<Proxy> {
    let proxy = Proxy::all(proxy_url(route))?;
    let Some(custom) = route.custom.as_ref().filter(|_| route.kind == ProxyKind::Custom) else {
        return Ok(proxy);
    };
    match custom.auth_type {
        ProxyAuthType::Basic if custom.has_credentials() => {
            Ok(proxy.basic_auth(&custom.username, &custom.password))
        }
        ProxyAuthType::Digest => match connect_auth {
            Some(value) => Ok(proxy.custom_http_auth(value)),
            None => Ok(proxy),
        },
        _ => Ok(proxy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::BlockReason;

    #[test]
    fn tor_route_uses_remote_dns_socks() {
        let route = Route::new(ProxyKind::Tor, "127.0.0.1", 9050);
        assert_eq!(proxy_url(&route), "socks5h://127.0.0.1:9050");
    }

    #[test]
    fn i2p_route_uses_http_proxy() {
        let route = Route::new(ProxyKind::I2p, "127.0.0.1", 4444);
        assert_eq!(proxy_url(&route), "http://127.0.0.1:4444");
    }

    #[test]
    fn custom_route_uses_configured_protocol() {
        let proxy = CustomProxy {
            host: "proxy.lan".into(),
            port: 1080,
            protocol: ProxyProtocol::Socks5,
            ..CustomProxy::default()
        };
        assert_eq!(proxy_url(&Route::custom(&proxy)), "socks5h://proxy.lan:1080");
    }

    #[test]
    fn proxied_connect_timeout_is_longer() {
        let direct = connect_timeout(&EffectiveRoute::Direct);
        let tor = connect_timeout(&EffectiveRoute::Proxied(Route::new(
            ProxyKind::Tor,
            "127.0.0.1",
            9050,
        )));
        assert_eq!(direct, Duration::from_secs(30));
        assert_eq!(tor, Duration::from_secs(60));
    }

    #[test]
    fn custom_timeout_override() {
        let proxy = CustomProxy {
            host: "proxy.lan".into(),
            port: 8080,
            connect_timeout_secs: 15,
            ..CustomProxy::default()
        };
        let route = EffectiveRoute::Proxied(Route::custom(&proxy));
        assert_eq!(connect_timeout(&route), Duration::from_secs(15));
    }

    #[test]
    fn blocked_route_never_builds_a_client() {
        let result = build_stream_client(
            &EffectiveRoute::Blocked(BlockReason::TorNotConnected),
            ClientPurpose::Playback,
        );
        assert!(matches!(
            result,
            Err(RadioError::RouteBlocked(BlockReason::TorNotConnected))
        ));
    }

    #[test]
    fn builds_direct_and_proxied_clients() {
        assert!(build_stream_client(&EffectiveRoute::Direct, ClientPurpose::Recording).is_ok());
        let proxy = CustomProxy {
            host: "proxy.lan".into(),
            port: 3128,
            username: "user".into(),
            password: "secret".into(),
            ..CustomProxy::default()
        };
        let route = EffectiveRoute::Proxied(Route::custom(&proxy));
        assert!(build_stream_client(&route, ClientPurpose::Playback).is_ok());
    }

    #[test]
    fn digest_applies_only_to_http_proxies_with_credentials() {
        let digest = CustomProxy {
            host: "proxy.lan".into(),
            port: 3128,
            username: "user".into(),
            password: "secret".into(),
            auth_type: ProxyAuthType::Digest,
            ..CustomProxy::default()
        };
        let route = EffectiveRoute::Proxied(Route::custom(&digest));
        assert!(digest_proxy(&route).is_some());

        let socks = CustomProxy {
            protocol: ProxyProtocol::Socks5,
            ..digest.clone()
        };
        assert!(digest_proxy(&EffectiveRoute::Proxied(Route::custom(&socks))).is_none());

        let basic = CustomProxy {
            auth_type: ProxyAuthType::Basic,
            ..digest.clone()
        };
        assert!(digest_proxy(&EffectiveRoute::Proxied(Route::custom(&basic))).is_none());
        assert!(digest_proxy(&EffectiveRoute::Direct).is_none());

        let auth = HeaderValue::from_static("Digest username=\"user\"");
        assert!(build_client(&route, ClientPurpose::Recording, Some(auth)).is_ok());
    }
}
