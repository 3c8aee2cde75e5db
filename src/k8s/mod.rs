pub mod client;
pub mod remote;

pub use remote::{KubeRemote, LogRequest, ObjectList, RawEvent, RemoteApi, ResourceKind};

/// Default user agent for `kubedelta` - automatically uses the package version
///
/// User-agent can be overridden via `KUBEDELTA_USER_AGENT` environment variable.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
