//! End-to-end tracking ids.

use std::fmt;

/// Marker the relay appends to a tracking id to tag the serving role
/// instance, e.g. `0f3c..._G12`.
const ROLE_SUFFIX_MARKER: &str = "_G";

/// Correlates log output of one listener (or one rendezvous) with the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingContext {
    tracking_id: String,
    address: String,
}

impl TrackingContext {
    /// Creates a context with a fresh tracking id for `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), address)
    }

    /// Creates a context with a known tracking id.
    pub fn with_id(tracking_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            tracking_id: tracking_id.into(),
            address: address.into(),
        }
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Tracking id without the relay's role-instance suffix.
    ///
    /// Reconnects reuse this form so the id does not grow on every attempt.
    pub fn base_tracking_id(&self) -> &str {
        remove_suffix(&self.tracking_id)
    }
}

impl fmt::Display for TrackingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackingId:{}, Address:{}", self.tracking_id, self.address)
    }
}

/// Strips a trailing `_G<n>` role suffix, if present.
pub fn remove_suffix(tracking_id: &str) -> &str {
    match tracking_id.rfind(ROLE_SUFFIX_MARKER) {
        Some(pos)
            if tracking_id[pos + ROLE_SUFFIX_MARKER.len()..]
                .chars()
                .all(|c| c.is_ascii_digit()) =>
        {
            &tracking_id[..pos]
        }
        _ => tracking_id,
    }
}
