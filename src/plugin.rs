//! [`Plugin`]: the descriptor record plus its top-level groups.
//!
//! ```no_run
//! use tesforge::consistency::ConsistencyAllocator;
//! use tesforge::plugin::{Plugin, PluginOptions};
//! use tesforge::subrecord::SubrecordRegistry;
//!
//! let bytes = std::fs::read("Mod.esp")?;
//! let plugin = Plugin::parse("Mod.esp", &bytes)?;
//! let load_order = vec!["Skyrim.esm".to_string(), "Mod.esp".to_string()];
//! let allocator = ConsistencyAllocator::new("consistency");
//! let mut out = Vec::new();
//! plugin.render(&load_order, &SubrecordRegistry::skyrim(), &allocator, &PluginOptions::default(), &mut out)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashMap;
use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bytes::to_hex;
use crate::compression::DEFAULT_ZLIB_LEVEL;
use crate::consistency::{FormIdAllocator, CONSISTENCY_FLOOR};
use crate::error::PluginError;
use crate::formid::{FormId, FormIdError, MasterList, MAX_MASTERS};
use crate::group::Group;
use crate::group_order::insertion_index;
use crate::record::{flags, Record, RenderContext};
use crate::signature::{Signature, CNAM, HEDR, SNAM, TES4};
use crate::subrecord::{Subrecord, SubrecordRegistry, UnmappedPolicy};

/// HEDR version written into fresh descriptors.
pub const HEDR_VERSION: f32 = 1.7;

// ── PluginOptions ────────────────────────────────────────────────────────────

/// Configuration for [`Plugin::render`].
#[derive(Debug, Clone)]
pub struct PluginOptions {
    /// zlib level for records whose body has to be recompressed.
    pub compression_level:    u32,
    /// Rewrite HEDR's record count from the groups actually rendered.
    pub refresh_record_count: bool,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            compression_level:    DEFAULT_ZLIB_LEVEL,
            refresh_record_count: true,
        }
    }
}

// ── PluginSummary ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub label:   String,
    pub records: usize,
    pub new:     usize,
    pub deleted: usize,
}

/// Machine-readable overview of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    pub name:    String,
    pub master:  bool,
    pub masters: Vec<String>,
    pub records: usize,
    pub groups:  Vec<GroupSummary>,
}

// ── Plugin ───────────────────────────────────────────────────────────────────

/// One plugin file.  Immutable: every edit returns a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct Plugin {
    name:    String,
    header:  Record,
    masters: MasterList,
    groups:  Vec<Group>,
}

impl Plugin {
    /// An empty plugin with a fresh descriptor.
    pub fn new(name: &str, author: &str, description: &str) -> Result<Self, PluginError> {
        let masters = MasterList::new(name, Vec::new());
        let mut hedr = Vec::with_capacity(12);
        hedr.extend_from_slice(&HEDR_VERSION.to_le_bytes());
        hedr.extend_from_slice(&0u32.to_le_bytes());
        hedr.extend_from_slice(&CONSISTENCY_FLOOR.to_le_bytes());
        let subrecords = vec![
            Subrecord::new(HEDR, hedr),
            Subrecord::zstring(CNAM, author),
            Subrecord::zstring(SNAM, description),
        ];
        let form_id = FormId::new(0, masters.clone())
            .map_err(|source| PluginError::Masters { plugin: name.to_owned(), source })?;
        let header = Record::new(TES4, masters.clone(), subrecords).with_form_id(form_id);
        Ok(Self { name: name.to_owned(), header, masters, groups: Vec::new() })
    }

    /// Parses a whole plugin file.  Bytes after the last group are an error.
    pub fn parse(name: &str, bytes: &[u8]) -> Result<Self, PluginError> {
        let (header, masters, rest) = Record::parse_descriptor(name, bytes)?;
        let (groups, rest) = Group::parse_all(name, &masters, rest)?;
        if !rest.is_empty() {
            return Err(PluginError::Malformed {
                plugin:      name.to_owned(),
                record_type: Signature::from_slice(rest).unwrap_or(Signature(*b"????")),
                form_id:     String::from("--------"),
                reason:      format!(
                    "{} bytes at offset {} are not a group: {}",
                    rest.len(),
                    bytes.len() - rest.len(),
                    to_hex(&rest[..rest.len().min(8)])
                ),
            });
        }
        let plugin = Self { name: name.to_owned(), header, masters, groups };
        info!(plugin = name, masters = plugin.masters.len(), groups = plugin.groups.len(), records = plugin.records().count(), "parsed plugin");
        Ok(plugin)
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn header(&self) -> &Record { &self.header }
    /// Masters as declared by the descriptor.
    pub fn masters(&self) -> &MasterList { &self.masters }
    pub fn groups(&self) -> &[Group] { &self.groups }

    pub fn is_master(&self) -> bool {
        self.header.flags() & flags::MASTER != 0
    }

    pub fn group(&self, label: Signature) -> Option<&Group> {
        self.groups.iter().find(|g| g.label() == label)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.groups.iter().flat_map(|g| g.iter())
    }

    pub fn author(&self) -> Option<String> {
        self.header.subrecord(CNAM).map(|s| s.as_zstring().into_owned())
    }

    pub fn description(&self) -> Option<String> {
        self.header.subrecord(SNAM).map(|s| s.as_zstring().into_owned())
    }

    /// Record count stored in HEDR.
    pub fn declared_record_count(&self) -> Option<u32> {
        self.header.subrecord(HEDR)
            .filter(|s| s.data.len() >= 8)
            .map(|s| LittleEndian::read_u32(&s.data[4..8]))
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            name:    self.name.clone(),
            master:  self.is_master(),
            masters: self.masters.masters().to_vec(),
            records: self.records().count(),
            groups:  self.groups.iter().map(|g| GroupSummary {
                label:   g.label().to_string(),
                records: g.len(),
                new:     g.iter().filter(|r| r.is_new()).count(),
                deleted: g.iter().filter(|r| r.is_deleted()).count(),
            }).collect(),
        }
    }

    // ── Editing ──────────────────────────────────────────────────────────────

    /// Replaces the records of the `label` group, keeping its position, or
    /// inserts a new group where the canonical group order puts it.
    pub fn create_or_replace_group(&self, label: Signature, records: Vec<Record>) -> Plugin {
        let mut groups = self.groups.clone();
        match groups.iter().position(|g| g.label() == label) {
            Some(i) => groups[i] = groups[i].with_records(records),
            None => {
                let labels: Vec<Signature> = groups.iter().map(|g| g.label()).collect();
                let at = insertion_index(&labels, label);
                groups.insert(at, Group::new(label, records));
            }
        }
        Plugin { groups, ..self.clone() }
    }

    /// Every plugin this one references, in first-seen order.
    ///
    /// A record resolving to this plugin itself (or a new record, which
    /// will) contributes the plugin's own name.  Content whose identifiers
    /// cannot be located (unregistered subrecords under the reject policy,
    /// nested group data) pins every master of its frame.
    pub fn required_masters(&self, registry: &SubrecordRegistry) -> Result<IndexSet<String>, PluginError> {
        let mut required: IndexSet<String> = IndexSet::new();
        let mut add = |name: &str| {
            if !required.iter().any(|r| r.eq_ignore_ascii_case(name)) {
                required.insert(name.to_owned());
            }
        };
        let opaque_pins = registry.policy() == UnmappedPolicy::Reject;

        for group in &self.groups {
            if !group.nested().is_empty() {
                group.scope().masters().iter().for_each(|m| add(m));
            }
            for record in group.iter() {
                match record.form_id().master() {
                    Some(master) => add(master),
                    None => add(&self.name),
                }
                if opaque_pins && record.subrecords().iter().any(|s| !registry.is_mapped(record.signature(), s.signature)) {
                    record.scope().masters().iter().for_each(|m| add(m));
                }
                for id in record.embedded_form_ids(registry)? {
                    if let Some(master) = id.master() {
                        add(master);
                    }
                }
            }
        }
        Ok(required)
    }

    // ── Rendering ────────────────────────────────────────────────────────────

    /// Renders against the masters this plugin needs, ordered by their
    /// position in `load_order`.
    pub fn render<W: Write>(
        &self,
        load_order: &[String],
        registry:   &SubrecordRegistry,
        allocator:  &dyn FormIdAllocator,
        options:    &PluginOptions,
        sink:       W,
    ) -> Result<(), PluginError> {
        let masters = self.masters_in_load_order(load_order, registry)?;
        self.render_with_masters(&masters, registry, allocator, options, sink)
    }

    /// Required masters minus this plugin, sorted by load order.
    pub fn masters_in_load_order(&self, load_order: &[String], registry: &SubrecordRegistry) -> Result<Vec<String>, PluginError> {
        let mut positioned = Vec::new();
        for master in self.required_masters(registry)? {
            if master.eq_ignore_ascii_case(&self.name) {
                continue;
            }
            let at = load_order.iter().position(|p| p.eq_ignore_ascii_case(&master)).ok_or_else(|| {
                PluginError::Masters {
                    plugin: self.name.clone(),
                    source: FormIdError::NotInLoadOrder { master: master.clone() },
                }
            })?;
            positioned.push((at, master));
        }
        positioned.sort_by_key(|(at, _)| *at);
        Ok(positioned.into_iter().map(|(_, m)| m).collect())
    }

    /// Renders with `masters` as the header's master list.  The whole file
    /// is assembled before anything reaches `sink`.
    pub fn render_with_masters<W: Write>(
        &self,
        masters:   &[String],
        registry:  &SubrecordRegistry,
        allocator: &dyn FormIdAllocator,
        options:   &PluginOptions,
        mut sink:  W,
    ) -> Result<(), PluginError> {
        let bytes = self.to_bytes(masters, registry, allocator, options)?;
        sink.write_all(&bytes)?;
        Ok(())
    }

    pub fn to_bytes(
        &self,
        masters:   &[String],
        registry:  &SubrecordRegistry,
        allocator: &dyn FormIdAllocator,
        options:   &PluginOptions,
    ) -> Result<Vec<u8>, PluginError> {
        if masters.len() > MAX_MASTERS {
            return Err(PluginError::Masters {
                plugin: self.name.clone(),
                source: FormIdError::TooManyMasters { master: masters[MAX_MASTERS].clone() },
            });
        }
        let target = MasterList::new(&self.name, masters.to_vec());
        let ctx = RenderContext {
            compression_level: options.compression_level,
            ..RenderContext::new(&target, registry, allocator)
        };

        let held: Vec<u32> = self.records()
            .filter_map(|r| r.form_id().resolved())
            .filter(|(owner, _)| owner.eq_ignore_ascii_case(&self.name))
            .map(|(_, unindexed)| unindexed)
            .collect();
        allocator.reserve(&self.name, &held)?;

        let mut body = Vec::new();
        for group in &self.groups {
            body.extend(group.to_bytes(&ctx)?);
        }

        let mut header = self.header.with_master_subrecords(masters);
        if options.refresh_record_count {
            let count = self.groups.iter().map(Group::entry_count).sum::<usize>() as u32;
            header = with_record_count(&header, count);
        }
        let mut out = header.to_bytes(&ctx)?;
        out.extend(body);
        info!(plugin = %self.name, masters = masters.len(), groups = self.groups.len(), bytes = out.len(), "rendered plugin");
        Ok(out)
    }

    // ── Merge ────────────────────────────────────────────────────────────────

    /// Merges `plugins` into a new plugin called `name`.
    ///
    /// Records naming the same entity keep the version from the last plugin
    /// that has one, at the position where the entity first appeared.
    /// Entities owned by any input plugin become owned by `name`.
    pub fn merge(name: &str, plugins: &[Plugin], registry: &SubrecordRegistry) -> Result<Plugin, PluginError> {
        let inputs: Vec<String> = plugins.iter().map(|p| p.name.clone()).collect();
        let mut state = MergeState::default();

        for plugin in plugins {
            for group in &plugin.groups {
                if !group.nested().is_empty() && registry.policy() == UnmappedPolicy::Reject {
                    return Err(PluginError::UnmappedGroupData {
                        plugin: plugin.name.clone(),
                        group:  group.label(),
                        len:    group.nested().len(),
                    });
                }
                let bucket = state.buckets.entry(group.label()).or_default();
                bucket.meta.get_or_insert(*group.meta());
                bucket.scope.get_or_insert_with(|| group.scope().rehomed(&inputs, name));
                if !group.nested().is_empty() {
                    warn!(plugin = %plugin.name, group = %group.label(), "nested group data appended to merge verbatim");
                    bucket.nested.extend_from_slice(group.nested());
                }
                for record in group.iter() {
                    state.insert(name, &plugin.name, record, &inputs)?;
                }
            }
        }

        let description = format!("Merge of {}", inputs.join(", "));
        let mut merged = Plugin::new(name, "tesforge", &description)?;
        for (label, bucket) in state.buckets {
            let records: Vec<Record> = bucket.records.into_values().map(|(record, _)| record).collect();
            debug!(plugin = name, group = %label, records = records.len(), "merged group");
            let labels: Vec<Signature> = merged.groups.iter().map(Group::label).collect();
            let at = insertion_index(&labels, label);
            let scope = bucket.scope.unwrap_or_else(MasterList::detached);
            merged.groups.insert(at, Group::from_parts(label, bucket.meta.unwrap_or_default(), records, bucket.nested, scope));
        }

        let masters: Vec<String> = merged.required_masters(registry)?
            .into_iter()
            .filter(|m| !m.eq_ignore_ascii_case(name))
            .collect();
        merged.header = merged.header.with_master_subrecords(&masters);
        merged.masters = MasterList::new(name, masters);
        info!(plugin = name, inputs = plugins.len(), records = merged.records().count(), "merged plugins");
        Ok(merged)
    }
}

/// Merge identity of a record: `(plugin, unindexed)` in lower case, or the
/// editor id of a record that has no identifier yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntityKey {
    Resolved(String, u32),
    New(String),
}

#[derive(Default)]
struct MergeBucket {
    meta:    Option<[u8; 12]>,
    scope:   Option<MasterList>,
    nested:  Vec<u8>,
    /// Winning record and the plugin it came from, by key after re-homing.
    records: IndexMap<EntityKey, (Record, String)>,
}

#[derive(Default)]
struct MergeState {
    buckets:    IndexMap<Signature, MergeBucket>,
    /// Key after re-homing -> (key before re-homing, first plugin seen).
    identities: HashMap<EntityKey, (EntityKey, String)>,
}

impl MergeState {
    /// Files `record` under its identity after re-homing.  A record whose
    /// re-homed identity already belongs to a different entity becomes a
    /// new record keyed by its editor id.
    fn insert(&mut self, merged: &str, source: &str, record: &Record, inputs: &[String]) -> Result<(), PluginError> {
        let original = entity_key(source, record)?;
        let mut rehomed = record.rehomed(inputs, merged);
        let mut key = entity_key(source, &rehomed)?;
        match self.identities.get(&key) {
            Some((seen, first)) if *seen != original => {
                let editor_id = record.editor_id().ok_or_else(|| PluginError::MergeCollision {
                    plugin:      merged.to_owned(),
                    record_type: record.signature(),
                    form_id:     format!("{:08X}", record.form_id().raw()),
                    first:       first.clone(),
                    second:      source.to_owned(),
                })?;
                debug!(plugin = merged, source, editor_id = %editor_id, first = %first, "identifier taken, merging as new record");
                rehomed = rehomed.copy_as_new(&editor_id);
                key = EntityKey::New(editor_id);
            }
            Some(_) => {}
            None => {
                self.identities.insert(key.clone(), (original, source.to_owned()));
            }
        }
        let bucket = self.buckets.entry(record.signature()).or_default();
        match bucket.records.get_mut(&key) {
            Some(slot) => *slot = (rehomed, source.to_owned()),
            None => {
                bucket.records.insert(key, (rehomed, source.to_owned()));
            }
        }
        Ok(())
    }
}

fn entity_key(plugin: &str, record: &Record) -> Result<EntityKey, PluginError> {
    match record.form_id().resolved() {
        Some((master, unindexed)) => Ok(EntityKey::Resolved(master.to_ascii_lowercase(), unindexed)),
        None => record.editor_id().map(EntityKey::New).ok_or_else(|| PluginError::MissingEditorId {
            plugin:      plugin.to_owned(),
            record_type: record.signature(),
        }),
    }
}

/// Descriptor copy with HEDR's record count set to `count`.
fn with_record_count(header: &Record, count: u32) -> Record {
    let subrecords = header.subrecords().iter().map(|s| {
        if s.signature == HEDR && s.data.len() >= 8 {
            let mut data = s.data.clone();
            LittleEndian::write_u32(&mut data[4..8], count);
            Subrecord::new(HEDR, data)
        } else {
            s.clone()
        }
    }).collect();
    header.with_subrecords(subrecords)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::ConsistencyAllocator;
    use crate::signature::EDID;

    fn sig(s: &[u8; 4]) -> Signature { Signature(*s) }

    fn list(owner: &str, masters: &[&str]) -> MasterList {
        MasterList::new(owner, masters.iter().map(|s| s.to_string()).collect())
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn keyword(scope: &MasterList, raw: u32, editor_id: &str) -> Record {
        Record::new(sig(b"KYWD"), scope.clone(), vec![Subrecord::zstring(EDID, editor_id)])
            .with_form_id(FormId::new(raw, scope.clone()).unwrap())
    }

    fn weapon(scope: &MasterList, raw: u32, editor_id: &str, keyword: u32) -> Record {
        Record::new(sig(b"WEAP"), scope.clone(), vec![
            Subrecord::zstring(EDID, editor_id),
            Subrecord::new(sig(b"KSIZ"), 1u32.to_le_bytes().to_vec()),
            Subrecord::new(sig(b"KWDA"), keyword.to_le_bytes().to_vec()),
        ]).with_form_id(FormId::new(raw, scope.clone()).unwrap())
    }

    fn render(plugin: &Plugin, masters: &[&str]) -> Vec<u8> {
        let alloc = ConsistencyAllocator::in_memory();
        plugin.to_bytes(&names(masters), &SubrecordRegistry::skyrim(), &alloc, &PluginOptions::default()).unwrap()
    }

    fn with_masters(plugin: Plugin, masters: &[&str]) -> Plugin {
        let header = plugin.header.with_master_subrecords(&names(masters));
        Plugin { masters: list(&plugin.name, masters), header, ..plugin }
    }

    #[test]
    fn fresh_plugin_round_trips() {
        let plugin = Plugin::new("Mod.esp", "me", "test").unwrap();
        let bytes = render(&plugin, &[]);
        let again = Plugin::parse("Mod.esp", &bytes).unwrap();
        assert_eq!(again.author().as_deref(), Some("me"));
        assert_eq!(again.description().as_deref(), Some("test"));
        assert_eq!(again.declared_record_count(), Some(0));
        assert!(again.groups().is_empty());
        assert_eq!(render(&again, &[]), bytes);
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut bytes = render(&Plugin::new("Mod.esp", "me", "").unwrap(), &[]);
        bytes.extend_from_slice(b"WEAPxx");
        let err = Plugin::parse("Mod.esp", &bytes).unwrap_err();
        assert!(matches!(err, PluginError::Malformed { record_type, .. } if record_type == sig(b"WEAP")));
    }

    #[test]
    fn groups_follow_canonical_order() {
        let scope = list("Mod.esp", &["Skyrim.esm"]);
        let plugin = Plugin::new("Mod.esp", "", "").unwrap()
            .create_or_replace_group(sig(b"NPC_"), vec![])
            .create_or_replace_group(sig(b"KYWD"), vec![])
            .create_or_replace_group(sig(b"WEAP"), vec![])
            .create_or_replace_group(sig(b"KYWD"), vec![keyword(&scope, 0x0000_0123, "K")]);
        let labels: Vec<String> = plugin.groups().iter().map(|g| g.label().to_string()).collect();
        assert_eq!(labels, ["KYWD", "WEAP", "NPC_"]);
        assert_eq!(plugin.group(sig(b"KYWD")).unwrap().len(), 1);
    }

    #[test]
    fn required_masters_include_own_name_and_references() {
        let scope = list("Mod.esp", &["Skyrim.esm", "Dawnguard.esm", "Unused.esm"]);
        let plugin = with_masters(Plugin::new("Mod.esp", "", "").unwrap(), &["Skyrim.esm", "Dawnguard.esm", "Unused.esm"])
            .create_or_replace_group(sig(b"WEAP"), vec![weapon(&scope, 0x0300_0900, "W", 0x0100_0042)])
            .create_or_replace_group(sig(b"KYWD"), vec![keyword(&scope, 0x0000_0123, "K")]);
        let required = plugin.required_masters(&SubrecordRegistry::skyrim()).unwrap();
        let required: Vec<&str> = required.iter().map(String::as_str).collect();
        assert_eq!(required, ["Skyrim.esm", "Mod.esp", "Dawnguard.esm"]);
    }

    #[test]
    fn render_orders_masters_by_load_order_and_rewrites_ids() {
        let scope = list("Mod.esp", &["Dawnguard.esm", "Skyrim.esm"]);
        let plugin = with_masters(Plugin::new("Mod.esp", "", "").unwrap(), &["Dawnguard.esm", "Skyrim.esm"])
            .create_or_replace_group(sig(b"WEAP"), vec![weapon(&scope, 0x0100_0100, "W", 0x0000_0042)]);
        let load_order = names(&["Skyrim.esm", "Update.esm", "Dawnguard.esm", "Mod.esp"]);
        let reg = SubrecordRegistry::skyrim();
        let alloc = ConsistencyAllocator::in_memory();
        let mut out = Vec::new();
        plugin.render(&load_order, &reg, &alloc, &PluginOptions::default(), &mut out).unwrap();

        let again = Plugin::parse("Mod.esp", &out).unwrap();
        assert_eq!(again.masters().masters(), &names(&["Skyrim.esm", "Dawnguard.esm"])[..]);
        let w = again.records().next().unwrap();
        assert_eq!(w.form_id().raw(), 0x0000_0100);
        assert_eq!(w.subrecord(sig(b"KWDA")).unwrap().data, 0x0100_0042u32.to_le_bytes());
        assert_eq!(again.declared_record_count(), Some(2));
    }

    #[test]
    fn master_missing_from_load_order_is_refused() {
        let scope = list("Mod.esp", &["Skyrim.esm"]);
        let plugin = with_masters(Plugin::new("Mod.esp", "", "").unwrap(), &["Skyrim.esm"])
            .create_or_replace_group(sig(b"KYWD"), vec![keyword(&scope, 0x0000_0123, "K")]);
        let alloc = ConsistencyAllocator::in_memory();
        let err = plugin.render(&names(&["Mod.esp"]), &SubrecordRegistry::skyrim(), &alloc, &PluginOptions::default(), Vec::new()).unwrap_err();
        assert!(matches!(err, PluginError::Masters { source: FormIdError::NotInLoadOrder { .. }, .. }));
    }

    #[test]
    fn new_records_render_as_own_records() {
        let scope = list("Mod.esp", &["Skyrim.esm"]);
        let fresh = Record::new(sig(b"KYWD"), scope.clone(), vec![Subrecord::zstring(EDID, "MyKeyword")]);
        let plugin = Plugin::new("Mod.esp", "", "").unwrap()
            .create_or_replace_group(sig(b"KYWD"), vec![keyword(&scope, 0x0000_0123, "Vanilla"), fresh]);
        let bytes = render(&plugin, &["Skyrim.esm"]);
        let again = Plugin::parse("Mod.esp", &bytes).unwrap();
        let ids: Vec<u32> = again.records().map(|r| r.form_id().raw()).collect();
        assert_eq!(ids, [0x0000_0123, 0x0100_0800]);
    }

    #[test]
    fn merge_keeps_last_version_at_first_position() {
        let a_scope = list("A.esp", &["Skyrim.esm"]);
        let b_scope = list("B.esp", &["Skyrim.esm"]);
        let a = with_masters(Plugin::new("A.esp", "", "").unwrap(), &["Skyrim.esm"])
            .create_or_replace_group(sig(b"KYWD"), vec![
                keyword(&a_scope, 0x0000_0123, "Original"),
                keyword(&a_scope, 0x0000_0124, "OnlyInA"),
            ]);
        let b = with_masters(Plugin::new("B.esp", "", "").unwrap(), &["Skyrim.esm"])
            .create_or_replace_group(sig(b"KYWD"), vec![keyword(&b_scope, 0x0000_0123, "Override")]);

        let merged = Plugin::merge("Merged.esp", &[a, b], &SubrecordRegistry::skyrim()).unwrap();
        let edids: Vec<String> = merged.records().filter_map(Record::editor_id).collect();
        assert_eq!(edids, ["Override", "OnlyInA"]);
        assert_eq!(merged.masters().masters(), &names(&["Skyrim.esm"])[..]);
    }

    #[test]
    fn merge_rehomes_records_owned_by_inputs() {
        let a_scope = list("A.esp", &["Skyrim.esm"]);
        let b_scope = list("B.esp", &["Skyrim.esm", "A.esp"]);
        let a = with_masters(Plugin::new("A.esp", "", "").unwrap(), &["Skyrim.esm"])
            .create_or_replace_group(sig(b"KYWD"), vec![keyword(&a_scope, 0x0100_0800, "AKeyword")]);
        let b = with_masters(Plugin::new("B.esp", "", "").unwrap(), &["Skyrim.esm", "A.esp"])
            .create_or_replace_group(sig(b"WEAP"), vec![weapon(&b_scope, 0x0200_0801, "BSword", 0x0100_0800)]);

        let merged = Plugin::merge("Merged.esp", &[a, b], &SubrecordRegistry::skyrim()).unwrap();
        assert!(merged.masters().is_empty());
        let bytes = render(&merged, &[]);
        let again = Plugin::parse("Merged.esp", &bytes).unwrap();
        let sword = again.group(sig(b"WEAP")).unwrap().records()[0].clone();
        assert_eq!(sword.form_id().resolved(), Some(("Merged.esp", 0x801)));
        assert_eq!(sword.subrecord(sig(b"KWDA")).unwrap().data, 0x0000_0800u32.to_le_bytes());
    }

    #[test]
    fn merge_keeps_both_records_when_own_ids_collide() {
        let a = Plugin::new("A.esp", "", "").unwrap()
            .create_or_replace_group(sig(b"KYWD"), vec![keyword(&list("A.esp", &[]), 0x0000_0800, "AK")]);
        let b = Plugin::new("B.esp", "", "").unwrap()
            .create_or_replace_group(sig(b"KYWD"), vec![keyword(&list("B.esp", &[]), 0x0000_0800, "BK")]);
        let merged = Plugin::merge("Merged.esp", &[a, b], &SubrecordRegistry::skyrim()).unwrap();

        let kept: Vec<&Record> = merged.records().collect();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].editor_id().as_deref(), Some("AK"));
        assert_eq!(kept[0].form_id().resolved(), Some(("Merged.esp", 0x800)));
        assert_eq!(kept[1].editor_id().as_deref(), Some("BK"));
        assert!(kept[1].is_new());

        let again = Plugin::parse("Merged.esp", &render(&merged, &[])).unwrap();
        let ids: Vec<u32> = again.records().map(|r| r.form_id().raw()).collect();
        assert_eq!(ids, [0x0000_0800, 0x0000_0801]);
    }

    #[test]
    fn colliding_record_without_editor_id_is_refused() {
        let bare = |owner: &str| {
            let scope = list(owner, &[]);
            Record::new(sig(b"KYWD"), scope.clone(), vec![]).with_form_id(FormId::new(0x0000_0800, scope).unwrap())
        };
        let a = Plugin::new("A.esp", "", "").unwrap().create_or_replace_group(sig(b"KYWD"), vec![bare("A.esp")]);
        let b = Plugin::new("B.esp", "", "").unwrap().create_or_replace_group(sig(b"KYWD"), vec![bare("B.esp")]);
        let err = Plugin::merge("Merged.esp", &[a, b], &SubrecordRegistry::skyrim()).unwrap_err();
        assert!(matches!(err, PluginError::MergeCollision { ref first, ref second, .. } if first == "A.esp" && second == "B.esp"));
    }

    #[test]
    fn merged_masters_drop_declared_but_unused_ones() {
        let a_scope = list("A.esp", &["Skyrim.esm", "Unused.esm"]);
        let a = with_masters(Plugin::new("A.esp", "", "").unwrap(), &["Skyrim.esm", "Unused.esm"])
            .create_or_replace_group(sig(b"KYWD"), vec![keyword(&a_scope, 0x0000_0123, "Vanilla")]);
        let b_scope = list("B.esp", &["Dawnguard.esm"]);
        let b = with_masters(Plugin::new("B.esp", "", "").unwrap(), &["Dawnguard.esm"])
            .create_or_replace_group(sig(b"WEAP"), vec![weapon(&b_scope, 0x0100_0900, "BSword", 0x0000_0042)]);

        let merged = Plugin::merge("Merged.esp", &[a, b], &SubrecordRegistry::skyrim()).unwrap();
        assert_eq!(merged.masters().masters(), &names(&["Skyrim.esm", "Dawnguard.esm"])[..]);
        let declared: Vec<String> = merged.header().subrecords().iter()
            .filter(|s| s.signature == sig(b"MAST"))
            .map(|s| s.as_zstring().into_owned())
            .collect();
        assert_eq!(declared, names(&["Skyrim.esm", "Dawnguard.esm"]));
    }

    #[test]
    fn entity_key_resolves_masters_case_insensitively() {
        let upper = list("Mod.esp", &["SKYRIM.ESM"]);
        let lower = list("Other.esp", &["skyrim.esm"]);
        let a = entity_key("Mod.esp", &keyword(&upper, 0x0000_0123, "K")).unwrap();
        let b = entity_key("Other.esp", &keyword(&lower, 0x0000_0123, "K")).unwrap();
        assert_eq!(a, EntityKey::Resolved("skyrim.esm".into(), 0x123));
        assert_eq!(a, b);

        let own = entity_key("Mod.esp", &keyword(&upper, 0x0100_0800, "K")).unwrap();
        assert_eq!(own, EntityKey::Resolved("mod.esp".into(), 0x800));

        let fresh = Record::new(sig(b"KYWD"), upper.clone(), vec![Subrecord::zstring(EDID, "Fresh")]);
        assert_eq!(entity_key("Mod.esp", &fresh).unwrap(), EntityKey::New("Fresh".into()));

        let nameless = Record::new(sig(b"KYWD"), upper, vec![]);
        let err = entity_key("Mod.esp", &nameless).unwrap_err();
        assert!(matches!(err, PluginError::MissingEditorId { ref plugin, .. } if plugin == "Mod.esp"));
    }

    #[test]
    fn nested_only_group_blocks_render_with_reordered_masters() {
        let scope = list("Mod.esp", &["Update.esm", "Skyrim.esm"]);
        let reg = SubrecordRegistry::skyrim();
        let alloc = ConsistencyAllocator::in_memory();
        let cell = Record::new(sig(b"CELL"), scope.clone(), vec![Subrecord::zstring(EDID, "Cell")])
            .with_form_id(FormId::new(0x0100_0d74, scope.clone()).unwrap());
        let block = Group::new(sig(b"CELL"), vec![cell]).to_bytes(&RenderContext::new(&scope, &reg, &alloc)).unwrap();

        let mut plugin = with_masters(Plugin::new("Mod.esp", "", "").unwrap(), &["Update.esm", "Skyrim.esm"]);
        plugin.groups.push(Group::from_parts(sig(b"CELL"), [0; 12], vec![], block, scope));
        let load_order = names(&["Skyrim.esm", "Update.esm", "Mod.esp"]);
        let err = plugin.render(&load_order, &reg, &alloc, &PluginOptions::default(), Vec::new()).unwrap_err();
        assert!(matches!(err, PluginError::UnmappedGroupData { group, .. } if group == sig(b"CELL")));

        let kept = names(&["Update.esm", "Skyrim.esm"]);
        assert!(plugin.to_bytes(&kept, &reg, &alloc, &PluginOptions::default()).is_ok());
    }

    #[test]
    fn summary_counts_records() {
        let scope = list("Mod.esp", &["Skyrim.esm"]);
        let plugin = Plugin::new("Mod.esp", "", "").unwrap()
            .create_or_replace_group(sig(b"KYWD"), vec![
                keyword(&scope, 0x0000_0123, "K"),
                Record::new(sig(b"KYWD"), scope.clone(), vec![Subrecord::zstring(EDID, "New")]),
            ]);
        let summary = plugin.summary();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.groups[0].new, 1);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["groups"][0]["label"], "KYWD");
    }
}
