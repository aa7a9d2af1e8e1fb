use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use crate::config::{DeployConfig, ExoscaleConfig};
use crate::error::ProviderError;
use crate::fleet::provider::{CloudProvider, Instance};

type HmacSha256 = Hmac<Sha256>;

/// How long a signed request stays valid.
const SIGNATURE_TTL_SECS: i64 = 600;

/// Instance states that no longer count as alive.
const GONE_STATES: &[&str] = &["destroying", "destroyed", "expunging"];

#[derive(Debug, Deserialize)]
struct ListInstancesResponse {
    #[serde(default)]
    instances: Vec<ApiInstance>,
}

#[derive(Debug, Deserialize)]
struct ApiInstance {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "public-ip", default)]
    public_ip: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl ApiInstance {
    fn is_alive(&self) -> bool {
        self.state
            .as_deref()
            .map_or(true, |state| !GONE_STATES.contains(&state))
    }
}

impl From<ApiInstance> for Instance {
    fn from(api: ApiInstance) -> Self {
        Instance {
            id: api.id,
            address: api.public_ip.filter(|ip| !ip.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Operation {
    id: String,
    state: String,
    #[serde(default)]
    reference: Option<Reference>,
}

#[derive(Debug, Deserialize)]
struct Reference {
    id: String,
}

/// Exoscale compute API v2 client scoped to the fleet's instances.
#[derive(Debug, Clone)]
pub struct ExoscaleProvider {
    client: reqwest::Client,
    config: ExoscaleConfig,
    name_prefix: String,
}

impl ExoscaleProvider {
    pub fn new(config: ExoscaleConfig, name_prefix: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            name_prefix: name_prefix.into(),
        }
    }

    /// Build the `Authorization` header value for a request.
    fn authorization(&self, method: &Method, path: &str, body: &[u8], expires: i64) -> String {
        // Request line, body, signed query values, signed header values, expiry.
        let message = format!(
            "{} {}\n{}\n\n\n{}",
            method.as_str(),
            path,
            String::from_utf8_lossy(body),
            expires
        );

        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .expect("HMAC key of any length is valid");
        mac.update(message.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        format!(
            "EXO2-HMAC-SHA256 credential={},expires={},signature={}",
            self.config.api_key, expires, signature
        )
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.config.base_url(), path);
        let payload = match &body {
            Some(value) => serde_json::to_vec(value)?,
            None => Vec::new(),
        };
        let expires = chrono::Utc::now().timestamp() + SIGNATURE_TTL_SECS;
        let auth = self.authorization(&method, url_path(&url), &payload, expires);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(AUTHORIZATION, auth);
        if body.is_some() {
            request = request.header(CONTENT_TYPE, "application/json").body(payload);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }
        tracing::trace!(method = %method, path, status = status.as_u16(), "Exoscale request");
        Ok(serde_json::from_str(&text)?)
    }

    /// Poll an asynchronous operation until it settles.
    async fn wait_operation(&self, mut op: Operation) -> Result<Operation, ProviderError> {
        let deadline = tokio::time::Instant::now() + self.config.operation_timeout;
        loop {
            let state = op.state.clone();
            match state.as_str() {
                "success" => return Ok(op),
                "pending" if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(self.config.operation_poll_interval).await;
                    op = self
                        .request(Method::GET, &format!("/operation/{}", op.id), None)
                        .await?;
                }
                "pending" => {
                    return Err(ProviderError::Operation {
                        id: op.id,
                        state: "timeout".to_string(),
                    })
                }
                _ => return Err(ProviderError::Operation { id: op.id, state }),
            }
        }
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, ProviderError> {
        let api: ApiInstance = self
            .request(Method::GET, &format!("/instance/{}", id), None)
            .await?;
        Ok(api.into())
    }
}

/// Path component of an absolute URL, used in the signed message.
fn url_path(url: &str) -> &str {
    let after_scheme = url.find("://").map_or(url, |i| &url[i + 3..]);
    after_scheme.find('/').map_or("/", |i| &after_scheme[i..])
}

#[async_trait]
impl CloudProvider for ExoscaleProvider {
    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let response: ListInstancesResponse = self.request(Method::GET, "/instance", None).await?;
        Ok(response
            .instances
            .into_iter()
            .filter(|i| i.name.starts_with(&self.name_prefix) && i.is_alive())
            .map(Instance::from)
            .collect())
    }

    async fn deploy_instance(&self, config: &DeployConfig) -> Result<Instance, ProviderError> {
        let name = format!("{}{}", config.name_prefix, Uuid::new_v4());
        let body = json!({
            "name": name,
            "instance-type": { "id": config.instance_type },
            "template": { "id": config.template },
            "disk-size": config.disk_size_gb,
            "ssh-key": { "name": config.key_pair },
            "user-data": BASE64.encode(config.bootstrap_script.as_bytes()),
        });

        let op: Operation = self.request(Method::POST, "/instance", Some(body)).await?;
        let op = self.wait_operation(op).await?;
        let id = op.reference.map(|r| r.id).ok_or(ProviderError::Operation {
            id: op.id,
            state: "success without instance reference".to_string(),
        })?;

        tracing::debug!(instance_id = %id, name = %name, "Instance created");
        self.get_instance(&id).await
    }

    async fn destroy_instance(&self, id: &str) -> Result<(), ProviderError> {
        let op: Operation = match self
            .request(Method::DELETE, &format!("/instance/{}", id), None)
            .await
        {
            Ok(op) => op,
            Err(ProviderError::NotFound(_)) => return Err(ProviderError::NotFound(id.to_string())),
            Err(e) => return Err(e),
        };
        self.wait_operation(op).await?;
        Ok(())
    }
}
