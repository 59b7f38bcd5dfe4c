//! HAP status codes
//!
//! Domain-level outcomes travel as negative integers inside JSON bodies
//! (`{"status": n}`) or TLV error entries — the HTTP status line only
//! communicates framing/authorization-level success.

use serde::{Serialize, Serializer};

/// Domain-level HAP status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum HapStatus {
    /// Request completed
    Success = 0,
    /// Request denied due to insufficient privileges
    InsufficientPrivileges = -70401,
    /// Unable to communicate with the requested service
    ServiceCommunicationFailure = -70402,
    /// Resource is busy
    ResourceBusy = -70403,
    /// Cannot write to a read-only characteristic
    ReadOnlyCharacteristic = -70404,
    /// Cannot read from a write-only characteristic
    WriteOnlyCharacteristic = -70405,
    /// Notification is not supported for this characteristic
    NotificationNotSupported = -70406,
    /// Out of resources
    OutOfResource = -70407,
    /// Operation timed out
    OperationTimedOut = -70408,
    /// Resource does not exist
    ResourceDoesNotExist = -70409,
    /// Invalid value in request
    InvalidValueInRequest = -70410,
    /// Insufficient authorization
    InsufficientAuthorization = -70411,
    /// Not allowed in the current state
    NotAllowedInCurrentState = -70412,
}

impl HapStatus {
    /// Numeric wire value
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Whether this is the success status
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl Serialize for HapStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

/// Body for bare-status responses like the 470 rejection
#[must_use]
pub fn status_body(status: HapStatus) -> Vec<u8> {
    serde_json::json!({ "status": status.as_i32() })
        .to_string()
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        assert_eq!(HapStatus::Success.as_i32(), 0);
        assert_eq!(HapStatus::InsufficientPrivileges.as_i32(), -70401);
        assert_eq!(HapStatus::NotAllowedInCurrentState.as_i32(), -70412);
    }

    #[test]
    fn status_body_shape() {
        assert_eq!(
            status_body(HapStatus::InsufficientAuthorization),
            br#"{"status":-70411}"#
        );
    }
}
