/// Error types for LiveGrid
///
/// `Error` is the crate-wide failure taxonomy. Collaborator failures that the
/// core does not classify are carried through unchanged as `Surface` or
/// `Source` variants.

use crate::source::SourceError;
use crate::surface::{SurfaceError, TableId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The display's column layout no longer matches the expected schema,
    /// or a schema was declared without its key field.
    #[error("Schema violation on table '{table}': {reason}")]
    SchemaViolation { table: String, reason: String },

    /// Key resolution still failed after the row index was rebuilt.
    #[error("Index violation on table '{table}', expected keys {keys:?} following index rebuild")]
    IndexViolation { table: TableId, keys: Vec<String> },

    /// A discovery page came back empty while the source claimed more results.
    #[error("Inadequate space in which to fetch topics for selector '{selector}'")]
    ExhaustedSampling { selector: String },

    #[error("Table '{table}' is absent")]
    TableAbsent { table: TableId },

    #[error("Event batcher has no pending work")]
    NoPendingWork,

    #[error("Event batcher must be created inside a Tokio runtime")]
    NoRuntime,

    #[error("Cannot parse range address: {0}")]
    InvalidAddress(String),

    #[error("Replay error: {0}")]
    Replay(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Surface(#[from] SurfaceError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

pub type Result<T> = std::result::Result<T, Error>;
