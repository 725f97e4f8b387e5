pub mod record;
pub mod session;

pub use record::{AttrMap, AttrValue, Batch, ObservationRecord, QueueEntry, RecordKind};
pub use session::{generate_user_id, SessionIdentity};
