pub mod signature;
pub mod bytes;
pub mod formid;
pub mod subrecord;
pub mod compression;
pub mod consistency;
pub mod error;
pub mod record;
pub mod group;
pub mod group_order;
pub mod plugin;
pub mod load_order;
pub mod typed;

pub use signature::Signature;
pub use formid::{FormId, FormIdError, MasterList, sort_by_load_order};
pub use subrecord::{Subrecord, SubrecordRegistry, UnmappedPolicy};
pub use consistency::{ConsistencyAllocator, FormIdAllocator};
pub use error::PluginError;
pub use record::{Record, RenderContext};
pub use group::Group;
pub use plugin::{Plugin, PluginOptions, PluginSummary};
pub use load_order::{LoadOrder, LoadOrderError, load_plugins};
pub use typed::{Typed, RecordKind, Weapon, Armor, Npc, Keyword};
