use crate::TransferError;
use crate::types::Payload;

/// Checks that a payload can be offered to a device.
///
/// Rejects:
/// - Empty payloads
/// - Payloads larger than `max_size`
/// - Sources that cannot be opened
pub fn validate_payload(payload: &Payload, max_size: u64) -> Result<(), TransferError> {
    if payload.is_empty() {
        return Err(TransferError::EmptyPayload);
    }
    if payload.len() > max_size {
        return Err(TransferError::TooLarge {
            size: payload.len(),
            max: max_size,
        });
    }
    payload.open()?;
    Ok(())
}

/// Validates an HTTP endpoint path on the device.
///
/// Rejects:
/// - Empty paths or paths not starting with `/`
/// - Whitespace or control characters
/// - Parent directory segments (`..`)
/// - Query strings and fragments (the engine adds its own fields)
pub fn validate_endpoint_path(path: &str) -> Result<(), TransferError> {
    if path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }
    if !path.starts_with('/') {
        return Err(TransferError::InvalidPath(format!(
            "path must start with '/': {path}"
        )));
    }
    if path.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(TransferError::InvalidPath(format!(
            "whitespace not allowed: {path:?}"
        )));
    }
    if path.contains(['?', '#']) {
        return Err(TransferError::InvalidPath(format!(
            "query or fragment not allowed: {path}"
        )));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(TransferError::InvalidPath(format!(
            "parent segment not allowed: {path}"
        )));
    }
    Ok(())
}
