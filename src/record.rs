//! Record codec.
//!
//! # Header layout (24 bytes, all little-endian)
//! ```text
//! signature   [u8; 4]
//! data_size   u32      bytes following the header
//! flags       u32
//! form_id     u32
//! vc_info     u32      version-control stamp
//! version     u16      form version
//! unknown     u16
//! ```
//! When [`flags::COMPRESSED`] is set the body is a zlib payload (see
//! [`crate::compression`]); otherwise it is the subrecords back to back.
//!
//! The descriptor record (`TES4`) opens every plugin and lists its masters
//! in repeated `MAST` subrecords, each followed by an 8-byte `DATA`.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::compression::{self, DEFAULT_ZLIB_LEVEL};
use crate::consistency::FormIdAllocator;
use crate::error::PluginError;
use crate::formid::{FormId, FormIdError, MasterList};
use crate::signature::{Signature, DATA, EDID, MAST, TES4};
use crate::subrecord::{self, Subrecord, SubrecordRegistry, UnmappedPolicy};

pub const RECORD_HEADER_SIZE: usize = 24;
/// Form version written on records created from scratch.
pub const DEFAULT_FORM_VERSION: u16 = 44;

pub mod flags {
    pub const MASTER:     u32 = 0x0000_0001;
    pub const DELETED:    u32 = 0x0000_0020;
    pub const LOCALIZED:  u32 = 0x0000_0080;
    pub const LIGHT:      u32 = 0x0000_0200;
    pub const COMPRESSED: u32 = 0x0004_0000;
}

// ── RecordHeader ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub signature: Signature,
    pub data_size: u32,
    pub flags:     u32,
    pub form_id:   u32,
    pub vc_info:   u32,
    pub version:   u16,
    pub unknown:   u16,
}

impl RecordHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(self.signature.as_bytes())?;
        writer.write_u32::<LittleEndian>(self.data_size)?;
        writer.write_u32::<LittleEndian>(self.flags)?;
        writer.write_u32::<LittleEndian>(self.form_id)?;
        writer.write_u32::<LittleEndian>(self.vc_info)?;
        writer.write_u16::<LittleEndian>(self.version)?;
        writer.write_u16::<LittleEndian>(self.unknown)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut signature = [0u8; 4];
        reader.read_exact(&mut signature)?;
        Ok(Self {
            signature: Signature(signature),
            data_size: reader.read_u32::<LittleEndian>()?,
            flags:     reader.read_u32::<LittleEndian>()?,
            form_id:   reader.read_u32::<LittleEndian>()?,
            vc_info:   reader.read_u32::<LittleEndian>()?,
            version:   reader.read_u16::<LittleEndian>()?,
            unknown:   reader.read_u16::<LittleEndian>()?,
        })
    }
}

// ── RenderContext ────────────────────────────────────────────────────────────

/// Everything a render needs besides the record itself.
pub struct RenderContext<'a> {
    /// Frame every written FormId must be expressed in.  Fixed: a reference
    /// to a plugin it does not list fails the render.
    pub masters:           &'a MasterList,
    pub registry:          &'a SubrecordRegistry,
    pub allocator:         &'a dyn FormIdAllocator,
    pub compression_level: u32,
}

impl<'a> RenderContext<'a> {
    pub fn new(masters: &'a MasterList, registry: &'a SubrecordRegistry, allocator: &'a dyn FormIdAllocator) -> Self {
        Self { masters, registry, allocator, compression_level: DEFAULT_ZLIB_LEVEL }
    }
}

// ── Record ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    signature:  Signature,
    flags:      u32,
    form_id:    FormId,
    vc_info:    u32,
    version:    u16,
    unknown:    u16,
    /// Frame of the FormIds embedded in `subrecords`.
    scope:      MasterList,
    subrecords: Vec<Subrecord>,
    /// Compressed body exactly as read, reused while nothing changes.
    stored:     Option<Vec<u8>>,
}

impl Record {
    /// A new record with no identifier yet.  Embedded FormIds in
    /// `subrecords` are read against `scope`.
    pub fn new(signature: Signature, scope: MasterList, subrecords: Vec<Subrecord>) -> Self {
        Self {
            signature,
            flags: 0,
            form_id: FormId::unassigned(),
            vc_info: 0,
            version: DEFAULT_FORM_VERSION,
            unknown: 0,
            scope,
            subrecords,
            stored: None,
        }
    }

    /// Parses one record from the front of `bytes`.
    pub fn parse<'b>(plugin: &str, bytes: &'b [u8], masters: &MasterList) -> Result<(Record, &'b [u8]), PluginError> {
        let (header, body, rest) = split_record(plugin, bytes)?;
        let form_id = FormId::new(header.form_id, masters.clone()).map_err(|source| PluginError::Reference {
            plugin:      plugin.to_owned(),
            record_type: header.signature,
            form_id:     format!("{:08X}", header.form_id),
            source,
        })?;
        let record = Self::from_parts(plugin, header, form_id, masters.clone(), body)?;
        Ok((record, rest))
    }

    /// Parses the descriptor record and returns the master list it declares.
    pub fn parse_descriptor<'b>(plugin: &str, bytes: &'b [u8]) -> Result<(Record, MasterList, &'b [u8]), PluginError> {
        let (header, body, rest) = split_record(plugin, bytes)?;
        if header.signature != TES4 {
            return Err(PluginError::Malformed {
                plugin:      plugin.to_owned(),
                record_type: header.signature,
                form_id:     format!("{:08X}", header.form_id),
                reason:      format!("expected {TES4} descriptor record first"),
            });
        }
        let provisional = Self::from_parts(plugin, header, FormId::unassigned(), MasterList::detached(), body)?;
        let masters: Vec<String> = provisional.subrecords.iter()
            .filter(|s| s.signature == MAST)
            .map(|s| s.as_zstring().into_owned())
            .collect();
        let scope = MasterList::new(plugin, masters);
        let form_id = FormId::new(header.form_id, scope.clone())
            .unwrap_or_else(|_| FormId::unchecked(header.form_id, MasterList::detached()));
        let record = Record { form_id, scope: scope.clone(), ..provisional };
        Ok((record, scope, rest))
    }

    fn from_parts(plugin: &str, header: RecordHeader, form_id: FormId, scope: MasterList, body: &[u8]) -> Result<Record, PluginError> {
        let malformed = |reason: String| PluginError::Malformed {
            plugin:      plugin.to_owned(),
            record_type: header.signature,
            form_id:     format!("{:08X}", header.form_id),
            reason,
        };

        let mut record = Record {
            signature:  header.signature,
            flags:      header.flags,
            form_id,
            vc_info:    header.vc_info,
            version:    header.version,
            unknown:    header.unknown,
            scope,
            subrecords: Vec::new(),
            stored:     None,
        };
        if record.is_deleted() {
            return Ok(record);
        }

        let plain;
        let fields: &[u8] = if record.is_compressed() {
            plain = compression::inflate(body).map_err(|e| malformed(e.to_string()))?;
            record.stored = Some(body.to_vec());
            &plain
        } else {
            body
        };
        let (subrecords, tail) = subrecord::parse_all(fields).map_err(|e| malformed(e.to_string()))?;
        if !tail.is_empty() {
            return Err(malformed(format!("{} stray bytes after the last subrecord", tail.len())));
        }
        record.subrecords = subrecords;
        Ok(record)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn signature(&self) -> Signature { self.signature }
    pub fn flags(&self) -> u32 { self.flags }
    pub fn form_id(&self) -> &FormId { &self.form_id }
    pub fn scope(&self) -> &MasterList { &self.scope }
    pub fn version(&self) -> u16 { self.version }
    pub fn is_new(&self) -> bool { self.form_id.is_new() }
    pub fn is_deleted(&self) -> bool { self.flags & flags::DELETED != 0 }
    pub fn is_compressed(&self) -> bool { self.flags & flags::COMPRESSED != 0 }
    pub fn is_descriptor(&self) -> bool { self.signature == TES4 }

    /// Subrecords in file order; empty for deleted records.
    pub fn subrecords(&self) -> &[Subrecord] {
        if self.is_deleted() { &[] } else { &self.subrecords }
    }

    pub fn subrecord(&self, signature: Signature) -> Option<&Subrecord> {
        self.subrecords().iter().find(|s| s.signature == signature)
    }

    pub fn editor_id(&self) -> Option<String> {
        self.subrecord(EDID).map(|s| s.as_zstring().into_owned())
    }

    // ── Derived records ──────────────────────────────────────────────────────

    pub fn with_subrecords(&self, subrecords: Vec<Subrecord>) -> Record {
        Record { subrecords, stored: None, ..self.clone() }
    }

    pub fn with_flags(&self, flags: u32) -> Record {
        let stored = if (flags ^ self.flags) & flags::COMPRESSED == 0 { self.stored.clone() } else { None };
        Record { flags, stored, ..self.clone() }
    }

    pub fn with_form_id(&self, form_id: FormId) -> Record {
        Record { form_id, ..self.clone() }
    }

    /// A new-record copy carrying `editor_id`, ready for allocation.
    pub fn copy_as_new(&self, editor_id: &str) -> Record {
        let edid = Subrecord::zstring(EDID, editor_id);
        let mut subrecords = self.subrecords().to_vec();
        match subrecords.iter_mut().find(|s| s.signature == EDID) {
            Some(existing) => *existing = edid,
            None => subrecords.insert(0, edid),
        }
        Record {
            form_id: FormId::unassigned(),
            flags: self.flags & !flags::DELETED,
            subrecords,
            stored: None,
            ..self.clone()
        }
    }

    /// Same record with every plugin in `from` renamed to `to`.  Raw bytes
    /// are untouched; only what the index bytes resolve to changes.
    pub fn rehomed(&self, from: &[String], to: &str) -> Record {
        let scope = self.scope.rehomed(from, to);
        let form_id = if self.form_id.is_new() {
            self.form_id.clone()
        } else {
            FormId::new(self.form_id.raw(), self.form_id.scope().rehomed(from, to))
                .unwrap_or_else(|_| self.form_id.clone())
        };
        Record { form_id, scope, ..self.clone() }
    }

    /// Every non-null embedded FormId the registry knows how to find.
    pub fn embedded_form_ids(&self, registry: &SubrecordRegistry) -> Result<Vec<FormId>, PluginError> {
        let mut out = Vec::new();
        for sub in self.subrecords() {
            let layout = registry.lookup(self.signature, sub.signature);
            for raw in layout.form_ids(sub.signature, &sub.data).map_err(|e| self.malformed(e))? {
                if raw != 0 {
                    out.push(FormId::new(raw, self.scope.clone()).map_err(|e| self.reference(e))?);
                }
            }
        }
        Ok(out)
    }

    /// Re-expresses the record against `target`, appending masters it
    /// lacks.  The returned record's scope is the extended list.
    pub fn reindex(&self, target: &MasterList, registry: &SubrecordRegistry) -> Result<Record, PluginError> {
        if self.is_descriptor() {
            return Ok(self.clone());
        }
        if self.scope.maps_identically_to(target) && self.form_id_maps(target) {
            let form_id = self.form_id.reindex(target).map_err(|e| self.reference(e))?;
            return Ok(Record { scope: target.clone(), form_id, ..self.clone() });
        }
        // Extend the frame first: appending shifts the owner's index, so
        // nothing may be rewritten until the list is final.
        let mut current = target.clone();
        for id in std::iter::once(self.form_id.clone()).chain(self.embedded_form_ids(registry)?) {
            current = id.reindex(&current).map_err(|e| self.reference(e))?.scope().clone();
        }
        let frame = current.clone();
        let subrecords = self.rewrite_ids(registry, &mut |id: &FormId| Ok(id.reindex_within(&frame)?.raw()))?;
        let form_id = self.form_id.reindex_within(&current).map_err(|e| self.reference(e))?;
        Ok(Record { form_id, scope: current, subrecords, stored: None, ..self.clone() })
    }

    fn form_id_maps(&self, target: &MasterList) -> bool {
        self.form_id.is_new() || self.form_id.scope().maps_identically_to(target)
    }

    fn rewrite_ids(
        &self,
        registry: &SubrecordRegistry,
        map: &mut dyn FnMut(&FormId) -> Result<u32, FormIdError>,
    ) -> Result<Vec<Subrecord>, PluginError> {
        let mut out = Vec::with_capacity(self.subrecords.len());
        for sub in self.subrecords() {
            if registry.policy() == UnmappedPolicy::Reject && !registry.is_mapped(self.signature, sub.signature) {
                return Err(PluginError::UnmappedSubrecord {
                    plugin:      self.scope.owner().to_owned(),
                    record_type: self.signature,
                    form_id:     format!("{:08X}", self.form_id.raw()),
                    subrecord:   sub.signature,
                });
            }
            let layout = registry.lookup(self.signature, sub.signature);
            if !layout.carries_form_ids() {
                out.push(sub.clone());
                continue;
            }
            let raws = layout.form_ids(sub.signature, &sub.data).map_err(|e| self.malformed(e))?;
            let mut mapped = Vec::with_capacity(raws.len());
            for raw in raws {
                if raw == 0 {
                    mapped.push(0);
                    continue;
                }
                let id = FormId::new(raw, self.scope.clone()).map_err(|e| self.reference(e))?;
                mapped.push(map(&id).map_err(|e| self.reference(e))?);
            }
            let data = layout.with_form_ids(sub.signature, &sub.data, &mapped).map_err(|e| self.malformed(e))?;
            out.push(Subrecord::new(sub.signature, data));
        }
        Ok(out)
    }

    // ── Rendering ────────────────────────────────────────────────────────────

    /// Serialises the record against `ctx.masters`.
    ///
    /// New records first receive an identifier from the allocator, keyed by
    /// their editor id.  Nothing reaches `sink` unless the whole record
    /// rendered.
    pub fn render<W: Write>(&self, ctx: &RenderContext<'_>, mut sink: W) -> Result<(), PluginError> {
        let bytes = self.to_bytes(ctx)?;
        sink.write_all(&bytes)?;
        Ok(())
    }

    pub fn to_bytes(&self, ctx: &RenderContext<'_>) -> Result<Vec<u8>, PluginError> {
        if self.is_descriptor() {
            let body = subrecord::render_all(&self.subrecords);
            return Ok(self.assemble(self.form_id.raw(), &body));
        }

        let target = ctx.masters;
        let form_id = if self.is_new() {
            let editor_id = self.editor_id().ok_or_else(|| PluginError::MissingEditorId {
                plugin:      target.owner().to_owned(),
                record_type: self.signature,
            })?;
            let value = ctx.allocator.allocate(target.owner(), &editor_id)?;
            FormId::from_parts(target.len() as u8, value, target.clone()).map_err(|e| self.reference(e))?
        } else {
            self.form_id.reindex_within(target).map_err(|e| self.reference(e))?
        };

        if self.is_deleted() {
            return Ok(self.assemble(form_id.raw(), &[]));
        }

        let body = if self.scope.maps_identically_to(target) {
            match &self.stored {
                Some(stored) if self.is_compressed() => stored.clone(),
                _ => self.encode_body(&subrecord::render_all(&self.subrecords), ctx)?,
            }
        } else {
            let subrecords = self.rewrite_ids(ctx.registry, &mut |id: &FormId| Ok(id.reindex_within(target)?.raw()))?;
            self.encode_body(&subrecord::render_all(&subrecords), ctx)?
        };
        Ok(self.assemble(form_id.raw(), &body))
    }

    fn encode_body(&self, plain: &[u8], ctx: &RenderContext<'_>) -> Result<Vec<u8>, PluginError> {
        if !self.is_compressed() {
            return Ok(plain.to_vec());
        }
        compression::deflate(plain, ctx.compression_level).map_err(|e| self.malformed(e))
    }

    fn assemble(&self, raw_form_id: u32, body: &[u8]) -> Vec<u8> {
        let header = RecordHeader {
            signature: self.signature,
            data_size: body.len() as u32,
            flags:     self.flags,
            form_id:   raw_form_id,
            vc_info:   self.vc_info,
            version:   self.version,
            unknown:   self.unknown,
        };
        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());
        let _ = header.write(&mut out);
        out.extend_from_slice(body);
        out
    }

    // ── Descriptor helpers ───────────────────────────────────────────────────

    /// Descriptor copy whose `MAST`/`DATA` pairs list exactly `masters`.
    /// The pairs stay where the first one was, or follow the leading
    /// header fields when there were none.
    pub fn with_master_subrecords(&self, masters: &[String]) -> Record {
        let mut out = Vec::with_capacity(self.subrecords.len() + masters.len() * 2);
        let mut insert_at = None;
        // DATA payload following each existing MAST, by lowercased name.
        let mut kept_data: HashMap<String, Vec<u8>> = HashMap::new();
        let mut last_master: Option<String> = None;
        for sub in &self.subrecords {
            if sub.signature == MAST {
                insert_at.get_or_insert(out.len());
                last_master = Some(sub.as_zstring().to_ascii_lowercase());
                continue;
            }
            if sub.signature == DATA {
                if let Some(name) = last_master.take() {
                    kept_data.insert(name, sub.data.clone());
                    continue;
                }
            }
            last_master = None;
            out.push(sub.clone());
        }
        let at = insert_at.unwrap_or_else(|| {
            out.iter()
                .position(|s| !matches!(&s.signature.0, b"HEDR" | b"OFST" | b"DELE" | b"CNAM" | b"SNAM"))
                .unwrap_or(out.len())
        });
        let pairs = masters.iter().flat_map(|m| {
            let data = kept_data.get(&m.to_ascii_lowercase()).cloned().unwrap_or_else(|| vec![0; 8]);
            [Subrecord::zstring(MAST, m), Subrecord::new(DATA, data)]
        });
        out.splice(at..at, pairs);
        Record { subrecords: out, stored: None, ..self.clone() }
    }

    fn malformed(&self, err: impl std::fmt::Display) -> PluginError {
        PluginError::Malformed {
            plugin:      self.scope.owner().to_owned(),
            record_type: self.signature,
            form_id:     format!("{:08X}", self.form_id.raw()),
            reason:      err.to_string(),
        }
    }

    fn reference(&self, source: FormIdError) -> PluginError {
        PluginError::Reference {
            plugin:      self.scope.owner().to_owned(),
            record_type: self.signature,
            form_id:     format!("{:08X}", self.form_id.raw()),
            source,
        }
    }
}

/// Splits one record off the front of `bytes`: header, body, rest.
fn split_record<'b>(plugin: &str, bytes: &'b [u8]) -> Result<(RecordHeader, &'b [u8], &'b [u8]), PluginError> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return Err(PluginError::Malformed {
            plugin:      plugin.to_owned(),
            record_type: Signature::from_slice(bytes).unwrap_or(Signature(*b"????")),
            form_id:     String::from("--------"),
            reason:      format!("{} bytes left, record header needs {RECORD_HEADER_SIZE}", bytes.len()),
        });
    }
    let header = RecordHeader::read(&bytes[..RECORD_HEADER_SIZE])?;
    let size = header.data_size as usize;
    let available = bytes.len() - RECORD_HEADER_SIZE;
    if size > available {
        return Err(PluginError::Malformed {
            plugin:      plugin.to_owned(),
            record_type: header.signature,
            form_id:     format!("{:08X}", header.form_id),
            reason:      format!("declares {size} data bytes but only {available} remain"),
        });
    }
    let (body, rest) = bytes[RECORD_HEADER_SIZE..].split_at(size);
    Ok((header, body, rest))
}
