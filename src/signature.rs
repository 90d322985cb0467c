//! Four-character type codes used by records, subrecords and groups.

use std::fmt;

/// A 4-byte type tag such as `WEAP`, `EDID` or `GRUP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(pub [u8; 4]);

impl Signature {
    pub const fn new(bytes: &[u8; 4]) -> Self {
        Signature(*bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Reads a signature from the first four bytes of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.get(..4).map(|b| Signature([b[0], b[1], b[2], b[3]]))
    }
}

impl From<&[u8; 4]> for Signature {
    fn from(b: &[u8; 4]) -> Self {
        Signature(*b)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

// ── Well-known signatures ────────────────────────────────────────────────────

pub const GRUP: Signature = Signature(*b"GRUP");
pub const TES4: Signature = Signature(*b"TES4");
pub const HEDR: Signature = Signature(*b"HEDR");
pub const MAST: Signature = Signature(*b"MAST");
pub const DATA: Signature = Signature(*b"DATA");
pub const CNAM: Signature = Signature(*b"CNAM");
pub const SNAM: Signature = Signature(*b"SNAM");
pub const EDID: Signature = Signature(*b"EDID");
pub const XXXX: Signature = Signature(*b"XXXX");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_escapes_non_printable() {
        assert_eq!(Signature(*b"NPC_").to_string(), "NPC_");
        assert_eq!(Signature([b'A', 0, b'B', b'C']).to_string(), "A\\x00BC");
    }

    #[test]
    fn from_slice_needs_four_bytes() {
        assert_eq!(Signature::from_slice(b"WEAPxyz"), Some(Signature(*b"WEAP")));
        assert_eq!(Signature::from_slice(b"WEA"), None);
    }
}
