mod error;
mod identity;
mod metadata;
mod parse;
mod recurrence;

pub use error::ParserError;
pub use identity::{task_id, to_remote_payload, DescriptionSettings, RemotePayload};
pub use metadata::ExtractedMetadata;
pub use parse::parse_line;
pub use recurrence::{normalize as normalize_recurrence, rrule_lines};
