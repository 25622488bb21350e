//! Relay URI construction.

use url::Url;

use crate::constants::{
    ACTION_LISTEN, DEFAULT_PORT, HYBRID_CONNECTION_PATH, LISTENER_SCHEME, QUERY_ACTION, QUERY_ID,
    QUERY_STATUS_CODE, QUERY_STATUS_DESCRIPTION, WEBSOCKET_SCHEME,
};
use crate::error::ProtocolError;

/// Parses and validates a listener address such as `sb://contoso.example.net/endpoint`.
pub fn parse_listener_address(address: &str) -> Result<Url, ProtocolError> {
    let url = Url::parse(address).map_err(|e| ProtocolError::InvalidAddress(e.to_string()))?;
    if url.scheme() != LISTENER_SCHEME {
        return Err(ProtocolError::InvalidAddress(format!(
            "scheme '{}' is not supported, expected '{LISTENER_SCHEME}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ProtocolError::InvalidAddress(format!(
            "'{address}' has no host"
        )));
    }
    Ok(url)
}

/// Builds the control-channel URI for a listener address:
/// `wss://{host}:{port}/$hc/{path}?{query}&sb-hc-action=listen&sb-hc-id={tracking_id}`.
pub fn listen_uri(address: &Url, tracking_id: &str) -> Result<Url, ProtocolError> {
    let host = address
        .host_str()
        .ok_or_else(|| ProtocolError::InvalidAddress(format!("'{address}' has no host")))?;
    let port = address.port().unwrap_or(DEFAULT_PORT);
    let path = address.path().trim_start_matches('/');

    let mut uri = Url::parse(&format!(
        "{WEBSOCKET_SCHEME}://{host}:{port}/{HYBRID_CONNECTION_PATH}/{path}"
    ))
    .map_err(|e| ProtocolError::InvalidAddress(e.to_string()))?;
    uri.set_query(address.query());
    uri.query_pairs_mut()
        .append_pair(QUERY_ACTION, ACTION_LISTEN)
        .append_pair(QUERY_ID, tracking_id);
    Ok(uri)
}

/// Builds the URI used to reject a rendezvous with a status code and description.
pub fn rejection_uri(
    rendezvous_address: &str,
    status_code: u16,
    status_description: &str,
) -> Result<Url, ProtocolError> {
    let mut uri = Url::parse(rendezvous_address)
        .map_err(|e| ProtocolError::InvalidAddress(e.to_string()))?;
    uri.query_pairs_mut()
        .append_pair(QUERY_STATUS_CODE, &status_code.to_string())
        .append_pair(QUERY_STATUS_DESCRIPTION, status_description);
    Ok(uri)
}
