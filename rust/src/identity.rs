// Identity reference validation.

use uuid::{Uuid, Variant};

/// Length of a canonical hyphenated UUID.
const CANONICAL_LEN: usize = 36;

/// True when `input` is a canonical, hyphenated UUID v4 (case-insensitive).
///
/// This is a format check only; it says nothing about whether the identity exists.
pub fn is_valid_identity(input: &str) -> bool {
    if input.len() != CANONICAL_LEN {
        return false;
    }
    match Uuid::try_parse(input) {
        Ok(id) => id.get_version_num() == 4 && id.get_variant() == Variant::RFC4122,
        Err(_) => false,
    }
}

/// Short, display-safe form of an identity (first segment of the UUID).
pub fn short_identity(input: &str) -> String {
    input.split('-').next().unwrap_or(input).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_v4() {
        assert!(is_valid_identity("3f2b8c1e-9d4a-4b7e-8c2f-1a2b3c4d5e6f"));
        assert!(is_valid_identity("3F2B8C1E-9D4A-4B7E-AC2F-1A2B3C4D5E6F"));
        assert!(is_valid_identity(&Uuid::new_v4().to_string()));
    }

    #[test]
    fn rejects_other_shapes() {
        assert!(!is_valid_identity("not-a-uuid"));
        assert!(!is_valid_identity(""));
        // v1 version nibble
        assert!(!is_valid_identity("3f2b8c1e-9d4a-1b7e-8c2f-1a2b3c4d5e6f"));
        // NCS variant
        assert!(!is_valid_identity("3f2b8c1e-9d4a-4b7e-0c2f-1a2b3c4d5e6f"));
        // simple (unhyphenated) form is not canonical
        assert!(!is_valid_identity("3f2b8c1e9d4a4b7e8c2f1a2b3c4d5e6f"));
        // braced form
        assert!(!is_valid_identity("{3f2b8c1e-9d4a-4b7e-8c2f-1a2b3c4d5e6f}"));
    }

    #[test]
    fn short_identity_takes_first_segment() {
        assert_eq!(
            short_identity("3f2b8c1e-9d4a-4b7e-8c2f-1a2b3c4d5e6f"),
            "3f2b8c1e"
        );
        assert_eq!(short_identity("plain"), "plain");
    }
}
