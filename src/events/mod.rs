pub mod manager;
pub mod record;

pub use manager::{EventManager, EventSpec};
pub use record::{EventApi, EventChange, EventRecord, ObjectRef};
