//! Proxy routing
//!
//! Decides which proxy each connection attempt must use and builds the HTTP
//! client for it. Playback and recording resolve independently.

pub mod client;
pub mod digest;
pub mod resolver;
pub mod types;

pub use client::{build_stream_client, ClientPurpose};
pub use digest::DigestChallenge;
pub use resolver::resolve;
pub use types::{
    AnonymityPolicy, BlockReason, CustomProxy, EffectiveRoute, ProxyAuthType, ProxyKind,
    ProxyProtocol, Route, RoutingContext, StaticRouting, StreamTarget, TorConnectivity,
};
