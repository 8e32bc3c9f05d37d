//! Proxy routing resolver
//!
//! Decides, for a single connection attempt, which proxy (if any) a stream
//! must go through. Pure: the caller supplies the target, the current policy
//! and the current Tor state, and gets back an `EffectiveRoute`. Rules are
//! checked in order and the first match wins.

use tracing::debug;

use crate::config::proxy::{DEFAULT_I2P_HOST, DEFAULT_I2P_PORT, DEFAULT_TOR_HOST, DEFAULT_TOR_PORT};

use super::types::{
    AnonymityPolicy, BlockReason, CustomProxy, EffectiveRoute, ProxyKind, Route, StreamTarget,
    TorConnectivity,
};

/// Resolve the route for one connection attempt.
///
/// A `Blocked` result must abort the attempt; callers never fall back to a
/// direct connection.
pub fn resolve(
    target: &StreamTarget,
    policy: &AnonymityPolicy,
    tor: &TorConnectivity,
) -> EffectiveRoute {
    let route = decide(target, policy, tor);
    debug!(url = %target.url, route = %route, "Resolved stream route");
    route
}

fn decide(target: &StreamTarget, policy: &AnonymityPolicy, tor: &TorConnectivity) -> EffectiveRoute {
    if policy.force_all_through_tor {
        return tor_or_blocked(tor);
    }

    if policy.force_all_except_i2p_through_tor {
        if target.is_i2p() {
            return i2p_route(target);
        }
        return tor_or_blocked(tor);
    }

    if policy.force_custom_proxy {
        return custom_or_blocked(policy);
    }

    if policy.force_custom_proxy_except_tor_i2p {
        if target.is_i2p() {
            return i2p_route(target);
        }
        if target.is_onion() {
            return onion_route(target, tor);
        }
        return custom_or_blocked(policy);
    }

    declared_route(target)
}

fn tor_route(tor: &TorConnectivity) -> EffectiveRoute {
    EffectiveRoute::Proxied(Route::new(ProxyKind::Tor, tor.socks_host.clone(), tor.socks_port))
}

fn tor_or_blocked(tor: &TorConnectivity) -> EffectiveRoute {
    if tor.connected {
        tor_route(tor)
    } else {
        EffectiveRoute::Blocked(BlockReason::TorNotConnected)
    }
}

/// The station's own I2P proxy, or the local default
fn i2p_route(target: &StreamTarget) -> EffectiveRoute {
    if target.declared_proxy(ProxyKind::I2p) {
        EffectiveRoute::Proxied(Route::new(
            ProxyKind::I2p,
            target.proxy_host.clone(),
            target.proxy_port,
        ))
    } else {
        EffectiveRoute::Proxied(Route::new(ProxyKind::I2p, DEFAULT_I2P_HOST, DEFAULT_I2P_PORT))
    }
}

/// Onion services always go through Tor, connected or not: the connect will
/// fail loudly rather than leak to the custom proxy.
fn onion_route(target: &StreamTarget, tor: &TorConnectivity) -> EffectiveRoute {
    if tor.connected {
        tor_route(tor)
    } else if target.declared_proxy(ProxyKind::Tor) {
        EffectiveRoute::Proxied(Route::new(
            ProxyKind::Tor,
            target.proxy_host.clone(),
            target.proxy_port,
        ))
    } else {
        EffectiveRoute::Proxied(Route::new(ProxyKind::Tor, DEFAULT_TOR_HOST, DEFAULT_TOR_PORT))
    }
}

fn custom_or_blocked(policy: &AnonymityPolicy) -> EffectiveRoute {
    match policy.configured_custom_proxy() {
        Some(proxy) => EffectiveRoute::Proxied(Route::custom(proxy)),
        None => EffectiveRoute::Blocked(BlockReason::CustomProxyNotConfigured),
    }
}

/// No policy applies: honor whatever the station declares.
fn declared_route(target: &StreamTarget) -> EffectiveRoute {
    if target.proxy_kind == ProxyKind::None || target.proxy_host.trim().is_empty() {
        return EffectiveRoute::Direct;
    }

    if target.proxy_kind == ProxyKind::Custom {
        let proxy = match &target.custom_proxy {
            Some(p) => CustomProxy {
                host: target.proxy_host.clone(),
                port: target.proxy_port,
                ..p.clone()
            },
            None => CustomProxy {
                host: target.proxy_host.clone(),
                port: target.proxy_port,
                ..CustomProxy::default()
            },
        };
        return EffectiveRoute::Proxied(Route::custom(&proxy));
    }

    EffectiveRoute::Proxied(Route::new(
        target.proxy_kind,
        target.proxy_host.clone(),
        target.proxy_port,
    ))
}
