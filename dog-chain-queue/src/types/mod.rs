pub mod ids;
pub mod record;
pub mod events;
pub mod stats;

pub use ids::JobId;
pub use record::{JobRecord, JobStatus};
pub use events::{JobEvent, JobEventKind};
pub use stats::QueueStats;
