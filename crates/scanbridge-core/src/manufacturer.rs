//! Bluetooth SIG company identifiers recognised by the bridge.

use std::collections::HashMap;

use once_cell::sync::Lazy;

static MANUFACTURERS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("0001", "Nokia Mobile Phones"),
        ("0008", "Motorola"),
        ("004C", "Apple, Inc."),
        ("0056", "Sony Ericsson Mobile Communications"),
        ("0075", "Samsung Electronics Co. Ltd."),
        ("00C4", "LG Electronics"),
        ("00E0", "Google"),
    ])
});

/// Looks up a 4-hex-digit company code (big-endian, any case).
#[must_use]
pub fn lookup(code: &str) -> Option<&'static str> {
    MANUFACTURERS
        .get(code.to_ascii_uppercase().as_str())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes() {
        assert_eq!(lookup("004C"), Some("Apple, Inc."));
        assert_eq!(lookup("004c"), Some("Apple, Inc."));
        assert_eq!(lookup("00E0"), Some("Google"));
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(lookup("FFFF"), None);
        assert_eq!(lookup(""), None);
    }
}
