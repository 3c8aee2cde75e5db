// Client creation with custom user-agent support for kube 2.x
use crate::error::Result;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};
use tracing::warn;

/// Create a new k8s client to interact with k8s cluster api
///
/// `KUBEDELTA_USER_AGENT` takes precedence over `custom_user_agent`.
///
/// # Errors
///
/// Will return `Err` if the kube configuration cannot be inferred or the client cannot be built
pub async fn new(custom_user_agent: Option<&str>) -> Result<Client> {
    let mut config = Config::infer().await?;

    let from_env = std::env::var("KUBEDELTA_USER_AGENT").ok();
    add_user_agent_header(&mut config, from_env.as_deref().or(custom_user_agent));

    let client = Client::try_from(config)?;

    Ok(client)
}

/// Attach a user-agent header so management-plane traffic is identifiable in audit logs
pub fn add_user_agent_header(config: &mut Config, user_agent: Option<&str>) {
    let Some(user_agent) = user_agent else {
        return;
    };
    match HeaderValue::from_str(user_agent) {
        Ok(header_value) => config
            .headers
            .push((HeaderName::from_static("user-agent"), header_value)),
        Err(e) => warn!("Ignoring invalid user agent {user_agent:?}: {e}"),
    }
}
