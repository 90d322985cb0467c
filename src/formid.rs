//! FormId addressing: master-relative identifiers and reindexing.
//!
//! A raw FormId is `index << 24 | unindexed`.  The index byte only has
//! meaning against a [`MasterList`]: `index < masters.len()` names that
//! master, `index == masters.len()` names the owning plugin itself.  Index
//! `0xFF` marks a new record whose identifier has not been allocated yet.
//!
//! Reindexing keeps the 24-bit unindexed value and rewrites the index so it
//! names the same master in another list.  [`FormId::reindex`] appends the
//! master when it is missing; [`FormId::reindex_within`] treats the target
//! list as fixed and fails instead.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Index byte reserved for unallocated identifiers.
pub const NEW_INDEX: u8 = 0xFF;
/// Raw value of a FormId that belongs to no plugin yet.
pub const UNASSIGNED: u32 = 0xFFFF_FFFF;
/// Mask of the 24-bit unindexed part.
pub const UNINDEXED_MASK: u32 = 0x00FF_FFFF;
/// Largest master count that still leaves an index for the owner below `NEW_INDEX`.
pub const MAX_MASTERS: usize = NEW_INDEX as usize - 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormIdError {
    #[error("FormId {raw:08X} has index {index:02X} but only {} masters are in scope {masters:?} (owner {owner:?})", masters.len())]
    IndexOutOfRange { raw: u32, index: u8, masters: Vec<String>, owner: String },
    #[error("FormId {raw:08X} resolves to {master:?} (masters {masters:?}), which is not in target masters {target:?}")]
    NotInTarget { raw: u32, master: String, masters: Vec<String>, target: Vec<String> },
    #[error("Cannot append master {master:?}: master list already holds {MAX_MASTERS} entries")]
    TooManyMasters { master: String },
    #[error("Master {master:?} is not in the load order")]
    NotInLoadOrder { master: String },
    #[error("FormId {raw:08X} is unassigned and has no master")]
    Unassigned { raw: u32 },
}

// ── MasterList ───────────────────────────────────────────────────────────────

/// Ordered masters plus the plugin that owns the identifiers resolved
/// against them.  Cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MasterList {
    owner:   Arc<str>,
    masters: Arc<[String]>,
}

impl MasterList {
    pub fn new(owner: &str, masters: Vec<String>) -> Self {
        Self { owner: Arc::from(owner), masters: Arc::from(masters) }
    }

    /// The frame of records not attached to any plugin.
    pub fn detached() -> Self {
        Self::new("", Vec::new())
    }

    pub fn owner(&self) -> &str { &self.owner }
    pub fn masters(&self) -> &[String] { &self.masters }
    pub fn len(&self) -> usize { self.masters.len() }
    pub fn is_empty(&self) -> bool { self.masters.is_empty() }

    /// Name the index byte refers to, if any.
    pub fn resolve(&self, index: u8) -> Option<&str> {
        let i = index as usize;
        match i.cmp(&self.masters.len()) {
            Ordering::Less => Some(self.masters[i].as_str()),
            Ordering::Equal if !self.owner.is_empty() => Some(&self.owner),
            _ => None,
        }
    }

    /// Index byte that names `master` in this list.  Plugin names compare
    /// ASCII case-insensitively, as the engine does.
    pub fn index_of(&self, master: &str) -> Option<u8> {
        if let Some(i) = self.masters.iter().position(|m| m.eq_ignore_ascii_case(master)) {
            return Some(i as u8);
        }
        if !self.owner.is_empty() && self.owner.eq_ignore_ascii_case(master) {
            return Some(self.masters.len() as u8);
        }
        None
    }

    pub fn contains(&self, master: &str) -> bool {
        self.index_of(master).is_some()
    }

    /// A copy with `master` added at the end.
    pub fn appended(&self, master: &str) -> Result<Self, FormIdError> {
        if self.masters.len() >= MAX_MASTERS {
            return Err(FormIdError::TooManyMasters { master: master.to_owned() });
        }
        let mut masters = self.masters.to_vec();
        masters.push(master.to_owned());
        Ok(Self { owner: self.owner.clone(), masters: Arc::from(masters) })
    }

    /// A copy where every plugin named in `from` (owner included) is
    /// replaced by `to`.
    pub fn rehomed(&self, from: &[String], to: &str) -> Self {
        let hit = |name: &str| from.iter().any(|f| f.eq_ignore_ascii_case(name));
        let owner = if hit(&self.owner) { to } else { &self.owner };
        let masters = self.masters.iter()
            .map(|m| if hit(m) { to.to_owned() } else { m.clone() })
            .collect();
        Self::new(owner, masters)
    }

    /// True when every index of this list names the same plugin at the
    /// same index of `target`, so no identifier needs rewriting.
    pub fn maps_identically_to(&self, target: &MasterList) -> bool {
        (0..=self.masters.len()).all(|i| {
            match self.resolve(i as u8) {
                Some(name) => target.index_of(name) == Some(i as u8),
                None => true,
            }
        })
    }
}

impl fmt::Debug for MasterList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}+{:?}", self.masters, self.owner)
    }
}

// ── FormId ───────────────────────────────────────────────────────────────────

/// A raw identifier together with the frame it was read in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FormId {
    raw:   u32,
    scope: MasterList,
}

impl FormId {
    /// Validates `raw` against `scope`.  An index that names neither a master
    /// nor the owner is rejected here, not at first use.
    pub fn new(raw: u32, scope: MasterList) -> Result<Self, FormIdError> {
        let index = (raw >> 24) as u8;
        if index != NEW_INDEX && scope.resolve(index).is_none() {
            return Err(FormIdError::IndexOutOfRange {
                raw,
                index,
                masters: scope.masters().to_vec(),
                owner:   scope.owner().to_owned(),
            });
        }
        Ok(Self { raw, scope })
    }

    pub fn from_parts(index: u8, unindexed: u32, scope: MasterList) -> Result<Self, FormIdError> {
        Self::new(((index as u32) << 24) | (unindexed & UNINDEXED_MASK), scope)
    }

    /// Keeps `raw` as read even when `scope` cannot resolve it.  Only for
    /// values that are written back verbatim.
    pub(crate) fn unchecked(raw: u32, scope: MasterList) -> Self {
        Self { raw, scope }
    }

    pub fn unassigned() -> Self {
        Self { raw: UNASSIGNED, scope: MasterList::detached() }
    }

    #[inline] pub fn raw(&self) -> u32 { self.raw }
    #[inline] pub fn index(&self) -> u8 { (self.raw >> 24) as u8 }
    #[inline] pub fn unindexed(&self) -> u32 { self.raw & UNINDEXED_MASK }
    #[inline] pub fn is_new(&self) -> bool { self.index() == NEW_INDEX }
    pub fn scope(&self) -> &MasterList { &self.scope }

    /// Plugin this identifier points into; `None` for new identifiers.
    pub fn master(&self) -> Option<&str> {
        if self.is_new() { None } else { self.scope.resolve(self.index()) }
    }

    /// `(master, unindexed)`: the frame-independent identity.
    pub fn resolved(&self) -> Option<(&str, u32)> {
        self.master().map(|m| (m, self.unindexed()))
    }

    /// Re-expresses this identifier against `target`, appending the master
    /// when `target` lacks it.  The returned FormId carries the (possibly
    /// extended) list, available through [`FormId::scope`].
    pub fn reindex(&self, target: &MasterList) -> Result<FormId, FormIdError> {
        let Some(master) = self.master() else {
            return Ok(self.clone());
        };
        match target.index_of(master) {
            Some(i) => FormId::from_parts(i, self.unindexed(), target.clone()),
            None => {
                let extended = target.appended(master)?;
                let i = (extended.len() - 1) as u8;
                FormId::from_parts(i, self.unindexed(), extended)
            }
        }
    }

    /// Like [`FormId::reindex`], but `target` is fixed: a master it does not
    /// list is an error.
    pub fn reindex_within(&self, target: &MasterList) -> Result<FormId, FormIdError> {
        let Some(master) = self.master() else {
            return Ok(self.clone());
        };
        match target.index_of(master) {
            Some(i) => FormId::from_parts(i, self.unindexed(), target.clone()),
            None => Err(FormIdError::NotInTarget {
                raw:     self.raw,
                master:  master.to_owned(),
                masters: self.scope.masters().to_vec(),
                target:  target.masters().to_vec(),
            }),
        }
    }

    /// Load-order comparison: master position first, then unindexed value.
    pub fn cmp_in_load_order(&self, other: &FormId, load_order: &[String]) -> Result<Ordering, FormIdError> {
        let a = load_position(self, load_order)?;
        let b = load_position(other, load_order)?;
        Ok(a.cmp(&b).then(self.unindexed().cmp(&other.unindexed())))
    }
}

impl fmt::Display for FormId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.master() {
            Some(m) => write!(f, "{:08X}@{}", self.raw, m),
            None    => write!(f, "{:08X}", self.raw),
        }
    }
}

fn load_position(id: &FormId, load_order: &[String]) -> Result<usize, FormIdError> {
    let master = id.master().ok_or(FormIdError::Unassigned { raw: id.raw })?;
    load_order.iter()
        .position(|p| p.eq_ignore_ascii_case(master))
        .ok_or_else(|| FormIdError::NotInLoadOrder { master: master.to_owned() })
}

/// Sorts by [`FormId::cmp_in_load_order`].  Fails before touching `ids` if
/// any identifier cannot be placed in `load_order`.
pub fn sort_by_load_order(ids: &mut [FormId], load_order: &[String]) -> Result<(), FormIdError> {
    let mut keyed = Vec::with_capacity(ids.len());
    for id in ids.iter() {
        keyed.push((load_position(id, load_order)?, id.unindexed()));
    }
    let mut order: Vec<usize> = (0..ids.len()).collect();
    order.sort_by_key(|&i| keyed[i]);
    let sorted: Vec<FormId> = order.into_iter().map(|i| ids[i].clone()).collect();
    ids.clone_from_slice(&sorted);
    Ok(())
}
