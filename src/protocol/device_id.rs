//! Device identifier encoding rules
//!
//! A device identifier is the unpadded URL-safe base64 encoding of a 128-bit
//! value, which always yields 22 characters from `[A-Za-z0-9_-]`.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use uuid::Uuid;

/// Number of raw bytes behind a device identifier
pub const DEVICE_ID_BYTES: usize = 16;

/// Length of a device identifier once encoded
pub const DEVICE_ID_LENGTH: usize = 22;

// Trailing bits of the last character are ignored on decode, matching the
// lenient decoding the broker side performs.
const DEVICE_ID_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::RequireNone)
        .with_decode_allow_trailing_bits(true),
);

/// Check whether `device_id` satisfies the device identifier encoding rule
pub fn is_valid_device_id(device_id: &str) -> bool {
    if device_id.len() != DEVICE_ID_LENGTH {
        return false;
    }

    match DEVICE_ID_ENGINE.decode(device_id) {
        Ok(decoded) => decoded.len() == DEVICE_ID_BYTES,
        Err(_) => false,
    }
}

/// Generate a random device identifier
pub fn random_device_id() -> String {
    encode_device_id(Uuid::new_v4())
}

/// Derive a deterministic device identifier from a namespace and a payload
///
/// The same namespace and payload (for example a MAC address or a serial
/// number) always yield the same identifier.
pub fn namespaced_device_id(namespace: &Uuid, payload: &[u8]) -> String {
    encode_device_id(Uuid::new_v5(namespace, payload))
}

fn encode_device_id(uuid: Uuid) -> String {
    DEVICE_ID_ENGINE.encode(uuid.as_bytes())
}
