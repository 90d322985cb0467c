//! Stable FormId allocation across rebuilds.
//!
//! Each plugin has a consistency map from editor id to the unindexed FormId
//! handed out for it.  Asking again for a known editor id returns the same
//! value, so regenerating a plugin reproduces identifiers that saves and
//! other plugins may already reference.
//!
//! # File format
//! One UTF-8 file per plugin, `<folder>/<plugin>.consistency`, one mapping
//! per line:
//! ```text
//! MyMod_IronSword:000801
//! ```
//! The six hex digits are the three low bytes of the value in file (little-
//! endian) order.  Lines are kept in allocation order; the value on the last
//! line is the counter the next allocation continues from.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

use crate::bytes::u32_bytes;
use crate::formid::UNINDEXED_MASK;

/// First unindexed value ever auto-allocated; everything below is reserved.
pub const CONSISTENCY_FLOOR: u32 = 0x800;
/// File extension of persisted maps.
pub const CONSISTENCY_EXTENSION: &str = "consistency";

#[derive(Error, Debug)]
pub enum ConsistencyError {
    #[error("{source_name}:{line}: expected `editorId:hex6`, got {text:?}")]
    Malformed { source_name: String, line: usize, text: String },
    #[error("{plugin}: FormId space exhausted after {last:06X}")]
    Exhausted { plugin: String, last: u32 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Supplies unindexed FormIds for new records.
pub trait FormIdAllocator {
    /// Returns the value bound to `editor_id` in `plugin`, allocating one on
    /// first use.
    fn allocate(&self, plugin: &str, editor_id: &str) -> Result<u32, ConsistencyError>;

    /// Marks `values` as held by records `plugin` already contains, so new
    /// allocations step over them.
    fn reserve(&self, _plugin: &str, _values: &[u32]) -> Result<(), ConsistencyError> {
        Ok(())
    }
}

// ── ConsistencyMap ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyMap {
    entries:      IndexMap<String, u32>,
    last:         Option<u32>,
    unterminated: bool,
    /// Values in use by existing records; never persisted.
    held:         HashSet<u32>,
}

impl ConsistencyMap {
    /// Parses persisted text.  `source_name` only labels errors.
    pub fn parse(text: &str, source_name: &str) -> Result<Self, ConsistencyError> {
        let mut map = Self::default();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let malformed = || ConsistencyError::Malformed {
                source_name: source_name.to_owned(),
                line:        n + 1,
                text:        line.to_owned(),
            };
            let (name, value) = line.rsplit_once(':').ok_or_else(malformed)?;
            let value = decode_value(value).ok_or_else(malformed)?;
            if name.is_empty() {
                return Err(malformed());
            }
            map.entries.insert(name.to_owned(), value);
            map.last = Some(value);
        }
        map.unterminated = !text.is_empty() && !text.ends_with('\n');
        Ok(map)
    }

    pub fn to_text(&self) -> String {
        self.entries.iter()
            .map(|(name, value)| format!("{name}:{}\n", encode_value(*value)))
            .collect()
    }

    pub fn get(&self, editor_id: &str) -> Option<u32> {
        self.entries.get(editor_id).copied()
    }

    /// Value on the last persisted line.
    pub fn last(&self) -> Option<u32> { self.last }

    /// Value the next allocation will receive.
    pub fn next_value(&self) -> u32 {
        self.last.map_or(CONSISTENCY_FLOOR, |v| v + 1)
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    fn insert(&mut self, editor_id: &str, value: u32) {
        self.entries.insert(editor_id.to_owned(), value);
        self.last = Some(value);
    }
}

fn encode_value(value: u32) -> String {
    hex::encode_upper(&u32_bytes(value)[..3])
}

fn decode_value(text: &str) -> Option<u32> {
    let bytes = hex::decode(text.trim()).ok()?;
    match bytes.as_slice() {
        [a, b, c] => Some(u32::from_le_bytes([*a, *b, *c, 0])),
        _ => None,
    }
}

// ── ConsistencyAllocator ─────────────────────────────────────────────────────

/// Owns the consistency maps of every plugin it has been asked about.
///
/// Maps load lazily on first use.  One lock covers the whole
/// read-or-insert-then-persist step, so two callers never receive the same
/// value for different editor ids.
#[derive(Debug)]
pub struct ConsistencyAllocator {
    folder: Option<PathBuf>,
    maps:   Mutex<HashMap<String, ConsistencyMap>>,
}

impl ConsistencyAllocator {
    /// Persists maps under `folder`, created on first write.
    pub fn new<P: Into<PathBuf>>(folder: P) -> Self {
        Self { folder: Some(folder.into()), maps: Mutex::new(HashMap::new()) }
    }

    /// Keeps maps in memory only.
    pub fn in_memory() -> Self {
        Self { folder: None, maps: Mutex::new(HashMap::new()) }
    }

    pub fn folder(&self) -> Option<&Path> {
        self.folder.as_deref()
    }

    /// Where the map of `plugin` lives.
    pub fn path_for(&self, plugin: &str) -> Option<PathBuf> {
        self.folder.as_ref().map(|f| f.join(format!("{plugin}.{CONSISTENCY_EXTENSION}")))
    }

    fn load(&self, plugin: &str) -> Result<ConsistencyMap, ConsistencyError> {
        let Some(path) = self.path_for(plugin) else {
            return Ok(ConsistencyMap::default());
        };
        match fs::read_to_string(&path) {
            Ok(text) => {
                let map = ConsistencyMap::parse(&text, &path.display().to_string())?;
                debug!(plugin, entries = map.len(), next = map.next_value(), "loaded consistency map");
                Ok(map)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ConsistencyMap::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn with_map<T>(
        &self,
        plugin: &str,
        f: impl FnOnce(&mut ConsistencyMap) -> Result<T, ConsistencyError>,
    ) -> Result<T, ConsistencyError> {
        let mut maps = self.maps.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let map = match maps.entry(plugin.to_owned()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(self.load(plugin)?),
        };
        f(map)
    }

    /// Value already bound to `editor_id`, without allocating.
    pub fn lookup(&self, plugin: &str, editor_id: &str) -> Result<Option<u32>, ConsistencyError> {
        self.with_map(plugin, |map| Ok(map.get(editor_id)))
    }

    /// Copy of the current map of `plugin`.
    pub fn snapshot(&self, plugin: &str) -> Result<ConsistencyMap, ConsistencyError> {
        self.with_map(plugin, |map| Ok(map.clone()))
    }

    fn persist(&self, plugin: &str, map: &ConsistencyMap, editor_id: &str, value: u32) -> io::Result<()> {
        let Some(path) = self.path_for(plugin) else { return Ok(()) };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let lead = if map.unterminated { "\n" } else { "" };
        writeln!(file, "{lead}{editor_id}:{}", encode_value(value))?;
        file.flush()
    }
}

impl FormIdAllocator for ConsistencyAllocator {
    fn allocate(&self, plugin: &str, editor_id: &str) -> Result<u32, ConsistencyError> {
        self.with_map(plugin, |map| {
            if let Some(existing) = map.get(editor_id) {
                return Ok(existing);
            }
            let mut value = map.next_value();
            while map.held.contains(&value) {
                value += 1;
            }
            if value > UNINDEXED_MASK {
                return Err(ConsistencyError::Exhausted { plugin: plugin.to_owned(), last: value - 1 });
            }
            self.persist(plugin, map, editor_id, value)?;
            map.unterminated = false;
            map.insert(editor_id, value);
            debug!(plugin, editor_id, value = %format!("{value:06X}"), "allocated FormId");
            Ok(value)
        })
    }

    fn reserve(&self, plugin: &str, values: &[u32]) -> Result<(), ConsistencyError> {
        self.with_map(plugin, |map| {
            map.held.extend(values.iter().copied());
            Ok(())
        })
    }
}
