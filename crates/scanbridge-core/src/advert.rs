//! Parsing of observer advertisement lines.
//!
//! A report looks like `+OBSERVER:<mac>,<rssi>,<key>:<hex payload>`. The
//! manufacturer-specific data field starts with the AD type `FF`, followed by
//! the little-endian company id.

use crate::manufacturer;

/// AD type marking manufacturer-specific data.
const MANUFACTURER_MARKER: &str = "FF";

/// A manufacturer recognised in an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    /// Big-endian 4-hex-digit company code, uppercase.
    pub code: String,
    /// Company name from the static table.
    pub name: &'static str,
}

/// Extracts the 4-hex-digit company code from a raw line.
///
/// Returns `None` for lines without at least three comma-separated fields,
/// without a `key:payload` third field, without the marker, or with fewer
/// than two octets after it.
#[must_use]
pub fn manufacturer_code(line: &str) -> Option<String> {
    let field = line.split(',').nth(2)?;
    let (_, payload) = field.split_once(':')?;
    let at = payload.find(MANUFACTURER_MARKER)?;
    let low = payload.get(at + 2..at + 4)?;
    let high = payload.get(at + 4..at + 6)?;
    let code = format!("{high}{low}");
    code.bytes()
        .all(|b| b.is_ascii_hexdigit())
        .then(|| code.to_ascii_uppercase())
}

/// Parses a line and resolves its manufacturer against the static table.
#[must_use]
pub fn parse(line: &str) -> Option<Sighting> {
    let code = manufacturer_code(line)?;
    let name = manufacturer::lookup(&code)?;
    Some(Sighting { code, name })
}
