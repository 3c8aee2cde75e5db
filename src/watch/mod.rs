pub mod backoff;
pub mod circuit;
pub mod manager;
pub mod session;
pub mod subscription;
pub mod supervisor;

pub use backoff::Backoff;
pub use circuit::{BreakerRegistry, BreakerScope, CircuitBreaker, CircuitState};
pub use manager::{ManagerCore, Registry};
pub use session::{SessionDriver, SessionCounters, SessionState, SessionStats, WatchSession};
pub use subscription::{
    new_subscription_id, Delivery, DeltaSink, DeltaStream, Envelope, StreamItem,
};
pub use supervisor::Supervisor;
