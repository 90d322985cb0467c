//! Group codec.
//!
//! # Header layout (24 bytes, all little-endian)
//! ```text
//! marker      b"GRUP"
//! group_size  u32       total size, this header included
//! label       [u8; 4]   record type held by a top-level group
//! meta        [u8; 12]  group type, stamps, version: kept verbatim
//! ```
//! `group_size` is recomputed on every render; the stored value is never
//! trusted for output.

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::formid::MasterList;
use crate::record::{Record, RenderContext};
use crate::signature::{Signature, GRUP};
use crate::subrecord::UnmappedPolicy;

pub const GROUP_HEADER_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupHeader {
    pub group_size: u32,
    pub label:      Signature,
    pub meta:       [u8; 12],
}

impl GroupHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(GRUP.as_bytes())?;
        writer.write_u32::<LittleEndian>(self.group_size)?;
        writer.write_all(self.label.as_bytes())?;
        writer.write_all(&self.meta)?;
        Ok(())
    }

    /// Reads a header; the marker must already have been checked.
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut marker = [0u8; 4];
        reader.read_exact(&mut marker)?;
        let group_size = reader.read_u32::<LittleEndian>()?;
        let mut label = [0u8; 4];
        reader.read_exact(&mut label)?;
        let mut meta = [0u8; 12];
        reader.read_exact(&mut meta)?;
        Ok(Self { group_size, label: Signature(label), meta })
    }
}

/// A top-level group: sibling records sharing one type.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    label:   Signature,
    meta:    [u8; 12],
    records: Vec<Record>,
    /// Bytes after the last record of `label` type (nested groups),
    /// carried through unchanged.
    nested:  Vec<u8>,
    /// Master frame `nested` was written against.
    scope:   MasterList,
}

impl Group {
    pub fn new(label: Signature, records: Vec<Record>) -> Self {
        Self { label, meta: [0; 12], records, nested: Vec::new(), scope: MasterList::detached() }
    }

    /// A group with explicit metadata and nested content written against
    /// `scope`.
    pub fn from_parts(label: Signature, meta: [u8; 12], records: Vec<Record>, nested: Vec<u8>, scope: MasterList) -> Self {
        Self { label, meta, records, nested, scope }
    }

    pub fn label(&self) -> Signature { self.label }
    pub fn meta(&self) -> &[u8; 12] { &self.meta }
    pub fn records(&self) -> &[Record] { &self.records }
    pub fn nested(&self) -> &[u8] { &self.nested }
    pub fn scope(&self) -> &MasterList { &self.scope }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Same group metadata around a different record list.
    pub fn with_records(&self, records: Vec<Record>) -> Group {
        Group { records, ..self.clone() }
    }

    pub fn rehomed(&self, from: &[String], to: &str) -> Group {
        let records = self.records.iter().map(|r| r.rehomed(from, to)).collect();
        Group { records, scope: self.scope.rehomed(from, to), ..self.clone() }
    }

    /// Records and groups this group contributes to the descriptor's
    /// record count, itself and everything nested included.
    pub fn entry_count(&self) -> usize {
        1 + self.records.len() + count_entries(&self.nested)
    }

    /// Parses consecutive groups from the front of `bytes`, stopping at the
    /// first position that does not start with the group marker.
    pub fn parse_all<'b>(plugin: &str, masters: &MasterList, mut bytes: &'b [u8]) -> Result<(Vec<Group>, &'b [u8]), PluginError> {
        let mut groups = Vec::new();
        while bytes.len() >= 4 && bytes[..4] == GRUP.0 {
            let malformed = |label: Signature, reason: String| PluginError::Malformed {
                plugin:      plugin.to_owned(),
                record_type: label,
                form_id:     String::from("--------"),
                reason,
            };
            if bytes.len() < GROUP_HEADER_SIZE {
                return Err(malformed(GRUP, format!("{} bytes left, group header needs {GROUP_HEADER_SIZE}", bytes.len())));
            }
            let header = GroupHeader::read(&bytes[..GROUP_HEADER_SIZE])?;
            let size = header.group_size as usize;
            if size < GROUP_HEADER_SIZE || size > bytes.len() {
                return Err(malformed(header.label, format!(
                    "group declares {size} bytes but {} remain", bytes.len()
                )));
            }

            let mut content = &bytes[GROUP_HEADER_SIZE..size];
            let mut records = Vec::new();
            while content.len() >= 4 && content[..4] == header.label.0 {
                let (record, rest) = Record::parse(plugin, content, masters)?;
                records.push(record);
                content = rest;
            }
            if !content.is_empty() {
                warn!(plugin, group = %header.label, bytes = content.len(), "group carries nested data, kept verbatim");
            }
            debug!(plugin, group = %header.label, records = records.len(), "parsed group");

            groups.push(Group {
                label:   header.label,
                meta:    header.meta,
                records,
                nested:  content.to_vec(),
                scope:   masters.clone(),
            });
            bytes = &bytes[size..];
        }
        Ok((groups, bytes))
    }

    /// Serialises the group with a freshly computed size.
    pub fn render<W: Write>(&self, ctx: &RenderContext<'_>, mut sink: W) -> Result<(), PluginError> {
        let bytes = self.to_bytes(ctx)?;
        sink.write_all(&bytes)?;
        Ok(())
    }

    pub fn to_bytes(&self, ctx: &RenderContext<'_>) -> Result<Vec<u8>, PluginError> {
        if !self.nested.is_empty()
            && ctx.registry.policy() == UnmappedPolicy::Reject
            && !self.scope.maps_identically_to(ctx.masters)
        {
            return Err(PluginError::UnmappedGroupData {
                plugin: ctx.masters.owner().to_owned(),
                group:  self.label,
                len:    self.nested.len(),
            });
        }

        let mut body = Vec::new();
        for record in &self.records {
            body.extend(record.to_bytes(ctx)?);
        }
        body.extend_from_slice(&self.nested);

        let header = GroupHeader {
            group_size: (GROUP_HEADER_SIZE + body.len()) as u32,
            label:      self.label,
            meta:       self.meta,
        };
        let mut out = Vec::with_capacity(GROUP_HEADER_SIZE + body.len());
        header.write(&mut out)?;
        out.extend(body);
        debug!(group = %self.label, records = self.records.len(), bytes = out.len(), "rendered group");
        Ok(out)
    }
}

/// Walks raw group content, counting every record and group header.  Stops
/// quietly at the first header that does not fit.
fn count_entries(mut bytes: &[u8]) -> usize {
    let mut count = 0;
    while bytes.len() >= GROUP_HEADER_SIZE {
        let declared = LittleEndian::read_u32(&bytes[4..8]) as usize;
        if bytes[..4] == GRUP.0 {
            if declared < GROUP_HEADER_SIZE || declared > bytes.len() {
                break;
            }
            count += 1 + count_entries(&bytes[GROUP_HEADER_SIZE..declared]);
            bytes = &bytes[declared..];
        } else {
            let end = GROUP_HEADER_SIZE + declared;
            if end > bytes.len() {
                break;
            }
            count += 1;
            bytes = &bytes[end..];
        }
    }
    count
}
