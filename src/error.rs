use std::io;

use thiserror::Error;

use crate::consistency::ConsistencyError;
use crate::formid::FormIdError;
use crate::signature::Signature;

/// Errors from parsing, rendering and merging plugins.
///
/// Every variant names the plugin and, where one exists, the record type and
/// the literal FormId hex so the offending bytes can be found in the file.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("{plugin}: malformed {record_type} record {form_id}: {reason}")]
    Malformed {
        plugin:      String,
        record_type: Signature,
        form_id:     String,
        reason:      String,
    },
    #[error("{plugin}: {record_type} record {form_id}: {source}")]
    Reference {
        plugin:      String,
        record_type: Signature,
        form_id:     String,
        source:      FormIdError,
    },
    #[error("{plugin}: {record_type} record {form_id} holds unmapped subrecord {subrecord}; its FormIds cannot be rewritten")]
    UnmappedSubrecord {
        plugin:      String,
        record_type: Signature,
        form_id:     String,
        subrecord:   Signature,
    },
    #[error("{plugin}: group {group} carries {len} bytes of nested data whose FormIds cannot be rewritten")]
    UnmappedGroupData { plugin: String, group: Signature, len: usize },
    #[error("{plugin}: new {record_type} record has no editor id to allocate a FormId for")]
    MissingEditorId { plugin: String, record_type: Signature },
    #[error("Merging into {plugin}: {record_type} {form_id} from {first} collides with the same id from {second}")]
    MergeCollision {
        plugin:      String,
        record_type: Signature,
        form_id:     String,
        first:       String,
        second:      String,
    },
    #[error("{plugin}: master list: {source}")]
    Masters { plugin: String, source: FormIdError },
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
