//! Endpoint string handling.
//!
//! The RPC transport reports its local endpoint as `udp://A.B.C.D:P` or
//! `udp://[v6]:P`. The client derives its receive address from that string,
//! so parsing is deliberately tolerant: scheme optional, brackets optional,
//! port found at the last colon.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("cannot extract host from endpoint '{0}'")]
    Malformed(String),
}

/// Extract the host part of a transport endpoint string.
pub fn host_of(endpoint: &str) -> Result<String, EndpointError> {
    let rest = endpoint.strip_prefix("udp://").unwrap_or(endpoint);

    let host = if let Some(stripped) = rest.strip_prefix('[') {
        match stripped.find(']') {
            Some(end) => &stripped[..end],
            None => return Err(EndpointError::Malformed(endpoint.to_owned())),
        }
    } else {
        match rest.rfind(':') {
            Some(colon) => &rest[..colon],
            None => rest,
        }
    };

    if host.is_empty() {
        return Err(EndpointError::Malformed(endpoint.to_owned()));
    }
    Ok(host.to_owned())
}
