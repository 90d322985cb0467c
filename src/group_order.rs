//! Canonical order of top-level groups.
//!
//! The engine writes top-level groups in a fixed order; new groups are slotted
//! into it so rebuilt plugins look like ones saved by the official tools.

use crate::signature::Signature;

pub const CANONICAL_GROUP_ORDER: &[&[u8; 4]] = &[
    b"GMST", b"KYWD", b"LCRT", b"AACT", b"TXST", b"GLOB", b"CLAS", b"FACT",
    b"HDPT", b"HAIR", b"EYES", b"RACE", b"SOUN", b"ASPC", b"MGEF", b"SCPT",
    b"LTEX", b"ENCH", b"SPEL", b"SCRL", b"ACTI", b"TACT", b"ARMO", b"BOOK",
    b"CONT", b"DOOR", b"INGR", b"LIGH", b"MISC", b"APPA", b"STAT", b"SCOL",
    b"MSTT", b"PWAT", b"GRAS", b"TREE", b"CLDC", b"FLOR", b"FURN", b"WEAP",
    b"AMMO", b"NPC_", b"LVLN", b"KEYM", b"ALCH", b"IDLM", b"COBJ", b"PROJ",
    b"HAZD", b"SLGM", b"LVLI", b"WTHR", b"CLMT", b"SPGD", b"RFCT", b"REGN",
    b"NAVI", b"CELL", b"WRLD", b"DIAL", b"QUST", b"IDLE", b"PACK", b"CSTY",
    b"LSCR", b"LVSP", b"ANIO", b"WATR", b"EFSH", b"EXPL", b"DEBR", b"IMGS",
    b"IMAD", b"FLST", b"PERK", b"BPTD", b"ADDN", b"AVIF", b"CAMS", b"CPTH",
    b"VTYP", b"MATT", b"IPCT", b"IPDS", b"ARMA", b"ECZN", b"LCTN", b"MESG",
    b"RGDL", b"DOBJ", b"LGTM", b"MUSC", b"FSTP", b"FSTS", b"SMBN", b"SMQN",
    b"SMEN", b"DLBR", b"MUST", b"DLVW", b"WOOP", b"SHOU", b"EQUP", b"RELA",
    b"SCEN", b"ASTP", b"OTFT", b"ARTO", b"MATO", b"MOVT", b"SNDR", b"DUAL",
    b"SNCT", b"SOPM", b"COLL", b"CLFM", b"REVB",
];

/// Position of `label` in the canonical order, `None` for unknown types.
pub fn canonical_rank(label: Signature) -> Option<usize> {
    CANONICAL_GROUP_ORDER.iter().position(|l| **l == label.0)
}

/// Where a group of type `label` goes among `existing` labels: right after
/// the last existing group that canonically precedes it, or at the end
/// when none does.
pub fn insertion_index(existing: &[Signature], label: Signature) -> usize {
    let Some(rank) = canonical_rank(label) else {
        return existing.len();
    };
    existing.iter()
        .rposition(|l| canonical_rank(*l).is_some_and(|r| r < rank))
        .map_or(existing.len(), |i| i + 1)
}
