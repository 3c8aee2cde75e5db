pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod k8s;
pub mod logging;
pub mod logs;
pub mod watch;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventManager, EventSpec};
pub use graph::{GraphManager, GraphSpec};
pub use logs::{LogSpec, PodLogManager};
pub use watch::{DeltaStream, Envelope, StreamItem};
