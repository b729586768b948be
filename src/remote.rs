//! Talking to a running hub from another process.

use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::broad::{normalize_namespace, DEFAULT_NAMESPACE};
use crate::error::AfrError;
use crate::msg::Msg;

pub const DEFAULT_HOSTNAME: &str = "localhost";

/// Where a hub lives. Either `url` (only its origin is used) or
/// `hostname` + `port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loc {
    pub url: Option<String>,
    pub port: Option<u16>,
    pub hostname: String,
    pub namespace: String,
}

impl Default for Loc {
    fn default() -> Self {
        Loc {
            url: None,
            port: None,
            hostname: DEFAULT_HOSTNAME.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl Loc {
    pub fn with_port(port: u16) -> Self {
        Loc {
            port: Some(port),
            ..Default::default()
        }
    }

    /// `http://<hostname>:<port>/<namespace>/`
    pub fn base(&self) -> Result<Url, AfrError> {
        let origin = match &self.url {
            Some(url) => url.clone(),
            None => {
                let port = self.port.ok_or(AfrError::MissingPort)?;
                format!("http://{}:{}", self.hostname, port)
            }
        };
        Url::parse(&origin)
            .and_then(|origin| origin.join(&normalize_namespace(&self.namespace)))
            .map_err(|err| AfrError::InvalidUrl(format!("{origin}: {err}")))
    }

    pub fn endpoint(&self, name: &str) -> Result<Url, AfrError> {
        self.base()?
            .join(name)
            .map_err(|err| AfrError::InvalidUrl(err.to_string()))
    }

    /// URL of the browser client script, for `<script type="module" src=...>`.
    pub fn client_path(&self) -> Result<Url, AfrError> {
        self.endpoint("client.mjs")
    }
}

/// Posts a message to the hub's `send` route. Returns the decoded JSON reply,
/// or the reply text when it is not JSON.
pub async fn send(loc: &Loc, msg: &Msg) -> Result<Value, AfrError> {
    let url = loc.endpoint("send")?;
    let res = reqwest::Client::new().post(url).json(msg).send().await?;

    let status = res.status();
    let is_json = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|val| val.to_str().ok())
        .is_some_and(|val| val.contains("application/json"));
    let body = res.text().await?;

    if !status.is_success() {
        return Err(AfrError::Status {
            status: status.as_u16(),
            body,
        });
    }
    if is_json {
        Ok(serde_json::from_str(&body)?)
    } else {
        Ok(Value::String(body))
    }
}

/// [`send`] that logs failures instead of returning them.
pub async fn maybe_send(loc: &Loc, msg: &Msg) -> Option<Value> {
    match send(loc, msg).await {
        Ok(reply) => Some(reply),
        Err(err) => {
            if !err.is_cancel() {
                warn!("Failed to send message to hub: {}", err);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_from_port() {
        let loc = Loc::with_port(23456);
        assert_eq!(loc.base().unwrap().as_str(), "http://localhost:23456/afr/");
        assert_eq!(
            loc.client_path().unwrap().as_str(),
            "http://localhost:23456/afr/client.mjs"
        );
    }

    #[test]
    fn base_from_url_keeps_only_origin() {
        let loc = Loc {
            url: Some("http://example.test:9000/some/page".into()),
            namespace: "hub".into(),
            ..Default::default()
        };
        assert_eq!(loc.endpoint("send").unwrap().as_str(), "http://example.test:9000/hub/send");
    }

    #[test]
    fn port_is_required_without_url() {
        assert!(matches!(Loc::default().base(), Err(AfrError::MissingPort)));
    }
}
