//! Envelope versioning.
//!
//! The envelope version selects the field layout of a payload. Version 2 is
//! written by this build; version 1 is still accepted on decode.

/// Version written by [`encode`](crate::encode).
pub const CURRENT_VERSION: u64 = 2;

/// Versions accepted by [`decode`](crate::decode).
pub const SUPPORTED_VERSIONS: &[u64] = &[1, 2];

/// Returns true if envelopes of `version` can be decoded.
#[must_use]
pub fn is_supported(version: u64) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_versions() {
        assert!(is_supported(CURRENT_VERSION));
        assert!(is_supported(1));
        assert!(!is_supported(0));
        assert!(!is_supported(3));
    }
}
