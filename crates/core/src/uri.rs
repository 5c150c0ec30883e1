//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! Connection strings and relay URLs.
//!
//! A connection string is `obsidion:<hex-public-key>?d=<origin>`: the path
//! is the Creator's compressed public key (which doubles as the bridge id)
//! and `d` is the origin the Joiner will later demand on every encrypted
//! frame.

use url::Url;

use crate::error::ConfigurationError;

/// Default relay endpoint.
pub const DEFAULT_BRIDGE_URL: &str = "wss://bridge.zkpassport.id";

/// URI scheme of connection strings.
pub const CONNECTION_SCHEME: &str = "obsidion";

/// Origin value used by non-browser peers that have no web origin.
pub const NODEJS_ORIGIN: &str = "nodejs";

/// The two rendezvous facts a Joiner needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// Hex of the Creator's 33-byte compressed public key.
    pub bridge_id: String,
    /// The Creator's declared origin, scheme-prefixed unless `"nodejs"`.
    pub origin: String,
}

/// Parse and validate a connection string.
pub fn parse_connection_string(uri: &str) -> Result<ConnectionString, ConfigurationError> {
    let parsed = Url::parse(uri)
        .map_err(|e| ConfigurationError::InvalidConnectionString(format!("{}: {}", uri, e)))?;

    if parsed.scheme() != CONNECTION_SCHEME {
        return Err(ConfigurationError::InvalidConnectionString(format!(
            "unexpected scheme '{}'",
            parsed.scheme()
        )));
    }

    let bridge_id = parsed.path().to_string();
    if bridge_id.is_empty() || !bridge_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigurationError::InvalidConnectionString(
            "missing or non-hex public key".to_string(),
        ));
    }

    let origin = parsed
        .query_pairs()
        .find(|(key, _)| key == "d")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ConfigurationError::InvalidConnectionString("missing 'd' origin parameter".to_string())
        })?;

    Ok(ConnectionString {
        bridge_id,
        origin: normalize_origin(&origin),
    })
}

/// Build the connection string a Creator publishes.
pub fn format_connection_string(bridge_id: &str, origin: &str) -> String {
    format!("{}:{}?d={}", CONNECTION_SCHEME, bridge_id, origin)
}

/// Apply the `https://` default to schemeless origins; `"nodejs"` stays bare.
pub fn normalize_origin(origin: &str) -> String {
    if origin == NODEJS_ORIGIN || origin.contains("://") {
        origin.to_string()
    } else {
        format!("https://{}", origin)
    }
}

/// Reduce an origin to `scheme://host`, dropping port, path, and the rest.
/// Values that do not parse as a URL with a host (e.g. `"nodejs"`) are
/// returned unchanged and compared literally.
pub fn reduce_origin(origin: &str) -> String {
    match Url::parse(origin) {
        Ok(url) => match url.host_str() {
            Some(host) => format!("{}://{}", url.scheme(), host),
            None => origin.to_string(),
        },
        Err(_) => origin.to_string(),
    }
}

/// Build the relay WebSocket URL for one connect attempt.
///
/// `moc` ("message on connect") carries the Joiner's base64 handshake
/// envelope for the relay to broadcast on open; it is percent-encoded here.
pub fn build_ws_url(
    bridge_url: &str,
    bridge_id: &str,
    moc: Option<&str>,
) -> Result<String, ConfigurationError> {
    let mut url = Url::parse(bridge_url)
        .map_err(|e| ConfigurationError::InvalidBridgeUrl(format!("{}: {}", bridge_url, e)))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("id", bridge_id);
        if let Some(moc) = moc {
            query.append_pair("moc", moc);
        }
    }
    Ok(url.into())
}
