//! Subrecord layout registry.
//!
//! Maps `(record type, subrecord type)` to a [`Layout`] telling the record
//! codec whether a payload embeds FormIds and where.  Entries registered for
//! any record type act as a fallback for record-specific ones.
//!
//! A combination that was never registered is *unmapped*.  Lookups treat it
//! as opaque, but [`UnmappedPolicy::Reject`] makes the record codec refuse to
//! render a record holding unmapped subrecords whenever its identifiers need
//! rewriting: an unmapped payload may hide references nobody can fix up.

use std::borrow::Cow;
use std::collections::HashMap;

use super::SubrecordError;
use crate::bytes::{read_u32, u32_bytes};
use crate::signature::Signature;

/// Where FormIds sit inside a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormIdSlots {
    /// At each listed byte offset.
    Fixed(Cow<'static, [usize]>),
    /// Every `stride` bytes from `start` to the end of the payload.
    Strided { start: usize, stride: usize },
    /// One FormId whose offset depends on the payload length `(len, offset)`.
    ByLength(Cow<'static, [(usize, usize)]>),
    /// Alternate-texture lists: `count`, then `(name_len, name, FormId, index)`.
    AlternateTextures,
}

impl FormIdSlots {
    pub fn offsets(&self, signature: Signature, payload: &[u8]) -> Result<Vec<usize>, SubrecordError> {
        let len = payload.len();
        let short = |needed: usize| SubrecordError::PayloadTooShort { signature, needed, got: len };
        match self {
            FormIdSlots::Fixed(offsets) => {
                if let Some(max) = offsets.iter().max() {
                    if max + 4 > len {
                        return Err(short(max + 4));
                    }
                }
                Ok(offsets.to_vec())
            }
            FormIdSlots::Strided { start, stride } => {
                let stride = (*stride).max(4);
                Ok((*start..).step_by(stride).take_while(|o| o + 4 <= len).collect())
            }
            FormIdSlots::ByLength(table) => table.iter()
                .find(|(l, _)| *l == len)
                .map(|(_, off)| vec![*off])
                .ok_or(SubrecordError::UnexpectedLength { signature, got: len }),
            FormIdSlots::AlternateTextures => {
                let count = read_u32(payload).map_err(|_| short(4))? as usize;
                // Each entry takes at least 12 bytes.
                let needed = count.saturating_mul(12).saturating_add(4);
                if needed > len {
                    return Err(short(needed));
                }
                let mut out = Vec::with_capacity(count);
                let mut pos = 4;
                for _ in 0..count {
                    let name_len = read_u32(&payload[pos.min(len)..]).map_err(|_| short(pos + 4))? as usize;
                    let slot = pos + 4 + name_len;
                    if slot + 8 > len {
                        return Err(short(slot + 8));
                    }
                    out.push(slot);
                    pos = slot + 8;
                }
                Ok(out)
            }
        }
    }
}

/// How a payload is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// No embedded identifiers.
    Opaque,
    /// Null-terminated text, no embedded identifiers.
    Text,
    /// Carries FormIds at known positions.
    FormIds(FormIdSlots),
}

impl Layout {
    pub fn carries_form_ids(&self) -> bool {
        matches!(self, Layout::FormIds(_))
    }

    /// Raw FormId values in payload order.
    pub fn form_ids(&self, signature: Signature, payload: &[u8]) -> Result<Vec<u32>, SubrecordError> {
        let Layout::FormIds(slots) = self else { return Ok(Vec::new()) };
        slots.offsets(signature, payload)?
            .into_iter()
            .map(|o| read_u32(&payload[o..]).map_err(|_| SubrecordError::PayloadTooShort {
                signature, needed: o + 4, got: payload.len(),
            }))
            .collect()
    }

    /// Payload with `ids` written over the slots [`Layout::form_ids`] reads.
    pub fn with_form_ids(&self, signature: Signature, payload: &[u8], ids: &[u32]) -> Result<Vec<u8>, SubrecordError> {
        let Layout::FormIds(slots) = self else {
            if ids.is_empty() {
                return Ok(payload.to_vec());
            }
            return Err(SubrecordError::CountMismatch { signature, expected: 0, got: ids.len() });
        };
        let offsets = slots.offsets(signature, payload)?;
        if offsets.len() != ids.len() {
            return Err(SubrecordError::CountMismatch { signature, expected: offsets.len(), got: ids.len() });
        }
        let mut out = payload.to_vec();
        for (o, id) in offsets.into_iter().zip(ids) {
            out[o..o + 4].copy_from_slice(&u32_bytes(*id));
        }
        Ok(out)
    }
}

/// What the record codec does with subrecords nobody registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmappedPolicy {
    /// Fail the render when identifiers would need rewriting.
    #[default]
    Reject,
    /// Assume unmapped payloads hold no identifiers.
    AssumeOpaque,
}

static OPAQUE: Layout = Layout::Opaque;

#[derive(Debug, Clone, Default)]
pub struct SubrecordRegistry {
    layouts: HashMap<(Option<Signature>, Signature), Layout>,
    policy:  UnmappedPolicy,
}

impl SubrecordRegistry {
    /// An empty registry: everything unmapped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Layouts for the record types this crate knows about.
    pub fn skyrim() -> Self {
        let mut reg = Self::new();
        for (sub, layout) in ANY_RECORD {
            reg.register_any(Signature(**sub), layout.clone());
        }
        for (record, sub, layout) in PER_RECORD {
            reg.register(Signature(**record), Signature(**sub), layout.clone());
        }
        reg
    }

    pub fn policy(&self) -> UnmappedPolicy { self.policy }

    pub fn with_policy(mut self, policy: UnmappedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn register(&mut self, record: Signature, sub: Signature, layout: Layout) -> &mut Self {
        self.layouts.insert((Some(record), sub), layout);
        self
    }

    pub fn register_any(&mut self, sub: Signature, layout: Layout) -> &mut Self {
        self.layouts.insert((None, sub), layout);
        self
    }

    fn find(&self, record: Signature, sub: Signature) -> Option<&Layout> {
        self.layouts.get(&(Some(record), sub))
            .or_else(|| self.layouts.get(&(None, sub)))
    }

    /// Layout for the combination, opaque when unmapped.
    pub fn lookup(&self, record: Signature, sub: Signature) -> &Layout {
        self.find(record, sub).unwrap_or(&OPAQUE)
    }

    pub fn is_mapped(&self, record: Signature, sub: Signature) -> bool {
        self.find(record, sub).is_some()
    }
}

// ── Built-in tables ──────────────────────────────────────────────────────────

const AT_0: Layout = Layout::FormIds(FormIdSlots::Fixed(Cow::Borrowed(&[0])));
const AT_4: Layout = Layout::FormIds(FormIdSlots::Fixed(Cow::Borrowed(&[4])));
const ARRAY: Layout = Layout::FormIds(FormIdSlots::Strided { start: 0, stride: 4 });
const ALT_TEX: Layout = Layout::FormIds(FormIdSlots::AlternateTextures);
// Critical data: the spell effect moved from offset 12 (16-byte form) to 16 (24-byte form).
const CRDT: Layout = Layout::FormIds(FormIdSlots::ByLength(Cow::Borrowed(&[(16, 12), (24, 16)])));

const ANY_RECORD: &[(&[u8; 4], Layout)] = &[
    (b"EDID", Layout::Text),
    (b"OBND", Layout::Opaque),
    (b"FULL", Layout::Opaque),
    (b"DESC", Layout::Opaque),
    (b"MODL", Layout::Text),
    (b"MODT", Layout::Opaque),
    (b"MOD2", Layout::Text),
    (b"MO2T", Layout::Opaque),
    (b"MOD3", Layout::Text),
    (b"MO3T", Layout::Opaque),
    (b"MOD4", Layout::Text),
    (b"MO4T", Layout::Opaque),
    (b"MOD5", Layout::Text),
    (b"MO5T", Layout::Opaque),
    (b"MODS", ALT_TEX),
    (b"MO2S", ALT_TEX),
    (b"MO3S", ALT_TEX),
    (b"MO4S", ALT_TEX),
    (b"MO5S", ALT_TEX),
    (b"ICON", Layout::Text),
    (b"MICO", Layout::Text),
    (b"ICO2", Layout::Text),
    (b"MIC2", Layout::Text),
    (b"KSIZ", Layout::Opaque),
    (b"KWDA", ARRAY),
];

const PER_RECORD: &[(&[u8; 4], &[u8; 4], Layout)] = &[
    (b"WEAP", b"ETYP", AT_0),
    (b"WEAP", b"BIDS", AT_0),
    (b"WEAP", b"BAMT", AT_0),
    (b"WEAP", b"EITM", AT_0),
    (b"WEAP", b"INAM", AT_0),
    (b"WEAP", b"WNAM", AT_0),
    (b"WEAP", b"SNAM", AT_0),
    (b"WEAP", b"XNAM", AT_0),
    (b"WEAP", b"NAM7", AT_0),
    (b"WEAP", b"NAM8", AT_0),
    (b"WEAP", b"NAM9", AT_0),
    (b"WEAP", b"TNAM", AT_0),
    (b"WEAP", b"UNAM", AT_0),
    (b"WEAP", b"CNAM", AT_0),
    (b"WEAP", b"YNAM", AT_0),
    (b"WEAP", b"ZNAM", AT_0),
    (b"WEAP", b"CRDT", CRDT),
    (b"WEAP", b"EAMT", Layout::Opaque),
    (b"WEAP", b"DATA", Layout::Opaque),
    (b"WEAP", b"DNAM", Layout::Opaque),
    (b"WEAP", b"VNAM", Layout::Opaque),
    (b"WEAP", b"NNAM", Layout::Text),
    (b"ARMO", b"MODL", AT_0),
    (b"ARMO", b"ETYP", AT_0),
    (b"ARMO", b"BIDS", AT_0),
    (b"ARMO", b"BAMT", AT_0),
    (b"ARMO", b"EITM", AT_0),
    (b"ARMO", b"RNAM", AT_0),
    (b"ARMO", b"TNAM", AT_0),
    (b"ARMO", b"YNAM", AT_0),
    (b"ARMO", b"ZNAM", AT_0),
    (b"ARMO", b"EAMT", Layout::Opaque),
    (b"ARMO", b"BODT", Layout::Opaque),
    (b"ARMO", b"BOD2", Layout::Opaque),
    (b"ARMO", b"DATA", Layout::Opaque),
    (b"ARMO", b"DNAM", Layout::Opaque),
    (b"KYWD", b"CNAM", Layout::Opaque),
    (b"GLOB", b"FNAM", Layout::Opaque),
    (b"GLOB", b"FLTV", Layout::Opaque),
    (b"LVLI", b"LVLD", Layout::Opaque),
    (b"LVLI", b"LVLF", Layout::Opaque),
    (b"LVLI", b"LLCT", Layout::Opaque),
    (b"LVLI", b"LVLG", AT_0),
    (b"LVLI", b"LVLO", AT_4),
    (b"LVLI", b"COED", AT_0),
    (b"LVLN", b"LVLD", Layout::Opaque),
    (b"LVLN", b"LVLF", Layout::Opaque),
    (b"LVLN", b"LLCT", Layout::Opaque),
    (b"LVLN", b"LVLG", AT_0),
    (b"LVLN", b"LVLO", AT_4),
    (b"LVLN", b"COED", AT_0),
    (b"COBJ", b"COCT", Layout::Opaque),
    (b"COBJ", b"CNTO", AT_0),
    (b"COBJ", b"COED", AT_0),
    (b"COBJ", b"CNAM", AT_0),
    (b"COBJ", b"BNAM", AT_0),
    (b"COBJ", b"NAM1", Layout::Opaque),
    (b"NPC_", b"ACBS", Layout::Opaque),
    (b"NPC_", b"SNAM", AT_0),
    (b"NPC_", b"INAM", AT_0),
    (b"NPC_", b"VTCK", AT_0),
    (b"NPC_", b"TPLT", AT_0),
    (b"NPC_", b"RNAM", AT_0),
    (b"NPC_", b"SPCT", Layout::Opaque),
    (b"NPC_", b"SPLO", AT_0),
    (b"NPC_", b"WNAM", AT_0),
    (b"NPC_", b"ANAM", AT_0),
    (b"NPC_", b"ATKR", AT_0),
    (b"NPC_", b"SPOR", AT_0),
    (b"NPC_", b"OCOR", AT_0),
    (b"NPC_", b"GWOR", AT_0),
    (b"NPC_", b"ECOR", AT_0),
    (b"NPC_", b"PRKZ", Layout::Opaque),
    (b"NPC_", b"PRKR", AT_0),
    (b"NPC_", b"COCT", Layout::Opaque),
    (b"NPC_", b"CNTO", AT_0),
    (b"NPC_", b"AIDT", Layout::Opaque),
    (b"NPC_", b"PKID", AT_0),
    (b"NPC_", b"CNAM", AT_0),
    (b"NPC_", b"SHRT", Layout::Opaque),
    (b"NPC_", b"DATA", Layout::Opaque),
    (b"NPC_", b"DNAM", Layout::Opaque),
    (b"NPC_", b"PNAM", AT_0),
    (b"NPC_", b"HCLF", AT_0),
    (b"NPC_", b"ZNAM", AT_0),
    (b"NPC_", b"GNAM", AT_0),
    (b"NPC_", b"DOFT", AT_0),
    (b"NPC_", b"SOFT", AT_0),
    (b"NPC_", b"DPLT", AT_0),
    (b"NPC_", b"CRIF", AT_0),
    (b"NPC_", b"FTST", AT_0),
    (b"NPC_", b"QNAM", Layout::Opaque),
    (b"NPC_", b"NAM6", Layout::Opaque),
    (b"NPC_", b"NAM7", Layout::Opaque),
    (b"NPC_", b"NAM8", Layout::Opaque),
    (b"NPC_", b"NAM9", Layout::Opaque),
    (b"NPC_", b"NAMA", Layout::Opaque),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(s: &[u8; 4]) -> Signature { Signature(*s) }

    #[test]
    fn record_specific_entry_wins_over_fallback() {
        let reg = SubrecordRegistry::skyrim();
        assert_eq!(reg.lookup(sig(b"WEAP"), sig(b"MODL")), &Layout::Text);
        assert!(reg.lookup(sig(b"ARMO"), sig(b"MODL")).carries_form_ids());
    }

    #[test]
    fn unmapped_lookup_is_opaque() {
        let reg = SubrecordRegistry::skyrim();
        assert!(!reg.is_mapped(sig(b"WEAP"), sig(b"VMAD")));
        assert_eq!(reg.lookup(sig(b"WEAP"), sig(b"VMAD")), &Layout::Opaque);
        assert_eq!(reg.policy(), UnmappedPolicy::Reject);
    }

    #[test]
    fn keyword_array_extract_and_replace() {
        let payload: Vec<u8> = [0x0001_E718u32, 0x0100_0801].iter().flat_map(|v| v.to_le_bytes()).collect();
        let s = sig(b"KWDA");
        let ids = ARRAY.form_ids(s, &payload).unwrap();
        assert_eq!(ids, vec![0x0001_E718, 0x0100_0801]);

        let out = ARRAY.with_form_ids(s, &payload, &[0x0201_E718, 0x0000_0801]).unwrap();
        assert_eq!(ARRAY.form_ids(s, &out).unwrap(), vec![0x0201_E718, 0x0000_0801]);
        assert!(matches!(
            ARRAY.with_form_ids(s, &payload, &[1]),
            Err(SubrecordError::CountMismatch { expected: 2, got: 1, .. })
        ));
    }

    #[test]
    fn fixed_offset_past_end_is_reported() {
        let s = sig(b"LVLO");
        assert!(matches!(AT_4.form_ids(s, &[0; 6]), Err(SubrecordError::PayloadTooShort { needed: 8, .. })));
        let mut payload = vec![1, 0, 0, 0];
        payload.extend_from_slice(&0x0000_1234u32.to_le_bytes());
        payload.extend_from_slice(&[1, 0, 0, 0]);
        assert_eq!(AT_4.form_ids(s, &payload).unwrap(), vec![0x1234]);
    }

    #[test]
    fn critical_data_offset_follows_length() {
        let s = sig(b"CRDT");
        let mut le = vec![0u8; 16];
        le[12..16].copy_from_slice(&7u32.to_le_bytes());
        let mut se = vec![0u8; 24];
        se[16..20].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(CRDT.form_ids(s, &le).unwrap(), vec![7]);
        assert_eq!(CRDT.form_ids(s, &se).unwrap(), vec![9]);
        assert!(matches!(CRDT.form_ids(s, &[0; 20]), Err(SubrecordError::UnexpectedLength { got: 20, .. })));
    }

    #[test]
    fn alternate_textures_walk_variable_names() {
        let mut payload = 2u32.to_le_bytes().to_vec();
        for (name, id) in [("Blade", 0x0000_0ABCu32), ("HiltDetail", 0x0100_0DEF)] {
            payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
            payload.extend_from_slice(name.as_bytes());
            payload.extend_from_slice(&id.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
        }
        assert_eq!(ALT_TEX.form_ids(sig(b"MODS"), &payload).unwrap(), vec![0x0ABC, 0x0100_0DEF]);
        assert!(ALT_TEX.form_ids(sig(b"MODS"), &payload[..payload.len() - 2]).is_err());
    }

    #[test]
    fn alternate_texture_count_beyond_payload_is_an_error() {
        let payload = [0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0];
        let err = ALT_TEX.form_ids(sig(b"MODS"), &payload).unwrap_err();
        assert!(matches!(err, SubrecordError::PayloadTooShort { got: 8, .. }));
        assert_eq!(ALT_TEX.form_ids(sig(b"MODS"), &0u32.to_le_bytes()).unwrap(), Vec::<u32>::new());
    }
}
