//! Device identity derived from request transport metadata.
//!
//! The key is best effort: the first hop recorded in `X-Forwarded-For` is
//! taken verbatim and no IP syntax validation is performed. Callers must not
//! assume the key is an RFC-compliant address.

use std::net::SocketAddr;

use axum::http::HeaderMap;
use thiserror::Error;

pub const HEADER_X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity unavailable: {0}")]
    Unavailable(&'static str),
}

/// What a caller does when no forwarded client address is present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityFallback {
    Reject,
    PeerAddress,
}

impl IdentityFallback {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::PeerAddress => "peer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "peer" | "peer_address" => Some(Self::PeerAddress),
            _ => None,
        }
    }
}

/// Extracts the originating client address from `X-Forwarded-For`.
///
/// The header is split on `,` and the first entry is trimmed, so `a, b` and
/// `a,b` both yield `a`. This accepts every header the `", "` separator form
/// accepts, plus proxies that omit the space.
pub fn device_key_from_headers(headers: &HeaderMap) -> Result<String, IdentityError> {
    let Some(value) = headers.get(HEADER_X_FORWARDED_FOR) else {
        return Err(IdentityError::Unavailable("X-Forwarded-For header is missing"));
    };
    let value = value
        .to_str()
        .map_err(|_| IdentityError::Unavailable("X-Forwarded-For header is not visible ASCII"))?;
    if value.trim().is_empty() {
        return Err(IdentityError::Unavailable("X-Forwarded-For header is empty"));
    }

    let client = value.split(',').next().unwrap_or_default().trim();
    if client.is_empty() {
        return Err(IdentityError::Unavailable("client ip is empty"));
    }
    Ok(client.to_string())
}

/// Resolves a device key, applying `fallback` when the forwarded address is
/// unusable. The peer fallback yields a degraded identity (the proxy's view
/// of the connection), never a fabricated constant.
pub fn resolve_device_key(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    fallback: IdentityFallback,
) -> Result<String, IdentityError> {
    match device_key_from_headers(headers) {
        Ok(key) => Ok(key),
        Err(error) => match (fallback, peer) {
            (IdentityFallback::PeerAddress, Some(peer)) => Ok(peer.ip().to_string()),
            _ => Err(error),
        },
    }
}
