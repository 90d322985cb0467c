//! Typed views over records of a known kind.
//!
//! `Typed<Weapon>` is a [`Record`] whose signature has been checked to be
//! `WEAP`; the identifier contract (`form_id`, `copy_as_new`, `reindex`) is
//! the same for every kind.

use std::fmt;
use std::marker::PhantomData;

use crate::error::PluginError;
use crate::formid::{FormId, MasterList};
use crate::record::Record;
use crate::signature::Signature;
use crate::subrecord::SubrecordRegistry;

pub trait RecordKind {
    const SIGNATURE: Signature;
    const NAME: &'static str;
}

macro_rules! record_kind {
    ($kind:ident, $sig:literal, $name:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $kind;

        impl RecordKind for $kind {
            const SIGNATURE: Signature = Signature::new($sig);
            const NAME: &'static str = $name;
        }
    };
}

record_kind!(Weapon, b"WEAP", "weapon");
record_kind!(Armor, b"ARMO", "armor");
record_kind!(Npc, b"NPC_", "npc");
record_kind!(Keyword, b"KYWD", "keyword");

pub struct Typed<K: RecordKind> {
    record: Record,
    kind:   PhantomData<K>,
}

impl<K: RecordKind> Typed<K> {
    /// Wraps `record` if it is of kind `K`, handing it back otherwise.
    pub fn new(record: Record) -> Result<Self, Record> {
        if record.signature() == K::SIGNATURE {
            Ok(Self { record, kind: PhantomData })
        } else {
            Err(record)
        }
    }

    pub fn record(&self) -> &Record { &self.record }
    pub fn into_record(self) -> Record { self.record }
    pub fn form_id(&self) -> &FormId { self.record.form_id() }

    pub fn editor_id(&self) -> Option<String> {
        self.record.editor_id()
    }

    pub fn copy_as_new(&self, editor_id: &str) -> Self {
        Self { record: self.record.copy_as_new(editor_id), kind: PhantomData }
    }

    pub fn reindex(&self, target: &MasterList, registry: &SubrecordRegistry) -> Result<Self, PluginError> {
        Ok(Self { record: self.record.reindex(target, registry)?, kind: PhantomData })
    }

    /// Every record of kind `K` in `records`.
    pub fn all<'r>(records: impl IntoIterator<Item = &'r Record>) -> Vec<Self> {
        records.into_iter().filter_map(|r| Self::new(r.clone()).ok()).collect()
    }
}

impl<K: RecordKind> Clone for Typed<K> {
    fn clone(&self) -> Self {
        Self { record: self.record.clone(), kind: PhantomData }
    }
}

impl<K: RecordKind> fmt::Debug for Typed<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(K::NAME)
            .field("form_id", &format_args!("{}", self.record.form_id()))
            .field("editor_id", &self.record.editor_id())
            .finish()
    }
}

impl<K: RecordKind> From<Typed<K>> for Record {
    fn from(typed: Typed<K>) -> Record {
        typed.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::EDID;
    use crate::subrecord::Subrecord;

    fn record(sig: &[u8; 4], raw: u32, editor_id: &str) -> Record {
        let scope = MasterList::new("Mod.esp", vec!["Skyrim.esm".into()]);
        Record::new(Signature(*sig), scope.clone(), vec![
            Subrecord::zstring(EDID, editor_id),
            Subrecord::new(Signature(*b"KWDA"), 0x0000_0042u32.to_le_bytes().to_vec()),
        ]).with_form_id(FormId::new(raw, scope).unwrap())
    }

    #[test]
    fn wraps_only_matching_kind() {
        assert!(Typed::<Weapon>::new(record(b"WEAP", 0x0001_2EB7, "IronSword")).is_ok());
        let back = Typed::<Armor>::new(record(b"WEAP", 0x0001_2EB7, "IronSword")).unwrap_err();
        assert_eq!(back.signature(), Weapon::SIGNATURE);
    }

    #[test]
    fn copy_as_new_clears_identifier() {
        let sword = Typed::<Weapon>::new(record(b"WEAP", 0x0001_2EB7, "IronSword")).unwrap();
        let copy = sword.copy_as_new("MySword");
        assert!(copy.form_id().is_new());
        assert_eq!(copy.editor_id().as_deref(), Some("MySword"));
        assert_eq!(sword.editor_id().as_deref(), Some("IronSword"));
    }

    #[test]
    fn reindex_moves_references() {
        let sword = Typed::<Weapon>::new(record(b"WEAP", 0x0001_2EB7, "IronSword")).unwrap();
        let target = MasterList::new("Other.esp", vec!["Update.esm".into(), "Skyrim.esm".into()]);
        let moved = sword.reindex(&target, &SubrecordRegistry::skyrim()).unwrap();
        assert_eq!(moved.form_id().raw(), 0x0101_2EB7);
        assert_eq!(moved.record().subrecord(Signature(*b"KWDA")).unwrap().data, 0x0100_0042u32.to_le_bytes());
    }

    #[test]
    fn all_filters_by_kind() {
        let records = [record(b"WEAP", 1, "A"), record(b"KYWD", 2, "B"), record(b"WEAP", 3, "C")];
        assert_eq!(Typed::<Weapon>::all(&records).len(), 2);
        assert_eq!(Typed::<Keyword>::all(&records).len(), 1);
        assert!(Typed::<Npc>::all(&records).is_empty());
    }
}
