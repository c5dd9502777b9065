//! Control-plane client.
//!
//! The listener needs three socket operations from the REST surface; they
//! are exposed through the [`ControlPlane`] trait so tests and embedders can
//! substitute their own implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use border0_core::Socket;

use crate::backoff::BackoffFn;
use crate::config::ApiConfig;
use crate::error::Result;
use crate::http::{HttpExecutor, Request};

/// Result of asking the control plane to sign an ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSocketKey {
    /// Certificate in authorized-keys text form.
    #[serde(rename = "signed_ssh_cert")]
    pub signed_cert: String,
    /// Base64 of the dispatcher's host public key in wire format.
    pub host_key: String,
}

/// Request payload for `POST /socket/{name}/signkey`.
#[derive(Debug, Clone, Serialize)]
pub struct SignSocketKeyRequest<'a> {
    /// Authorized-keys line of the public key to sign.
    pub ssh_public_key: &'a str,
}

/// The control-plane operations the listener depends on.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Look up a socket by name or ID.
    ///
    /// Returns `Ok(None)` if the control plane reports the socket as absent.
    ///
    /// # Errors
    ///
    /// Returns an error for any failure other than a 404.
    async fn get_socket(&self, cancel: &CancellationToken, name_or_id: &str)
        -> Result<Option<Socket>>;

    /// Create a socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane rejects the request.
    async fn create_socket(&self, cancel: &CancellationToken, socket: &Socket) -> Result<Socket>;

    /// Sign an ephemeral public key for the named socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane rejects the request.
    async fn sign_socket_key(
        &self,
        cancel: &CancellationToken,
        name_or_id: &str,
        public_key: &str,
    ) -> Result<SignedSocketKey>;
}

/// REST client for the control plane.
#[derive(Debug)]
pub struct ApiClient {
    config: ApiConfig,
    http: HttpExecutor,
}

impl ApiClient {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: ApiConfig) -> Result<Self> {
        let http = HttpExecutor::new(&config)?;
        Ok(Self { config, http })
    }

    /// Create a client from `BORDER0_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn from_env() -> Result<Self> {
        Self::new(ApiConfig::from_env())
    }

    /// Replace the executor's backoff function.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.http = self.http.with_backoff(backoff);
        self
    }

    /// The configuration this client was built from.
    #[must_use]
    pub const fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// The underlying retrying executor.
    #[must_use]
    pub const fn executor(&self) -> &HttpExecutor {
        &self.http
    }

    /// The current bearer token.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.http.token()
    }

    /// Replace the bearer token.
    pub fn set_token(&self, token: impl Into<String>) {
        self.http.set_token(token);
    }
}

fn socket_path(name_or_id: &str) -> String {
    let escaped: String = url::form_urlencoded::byte_serialize(name_or_id.as_bytes()).collect();
    format!("socket/{escaped}")
}

#[async_trait]
impl ControlPlane for ApiClient {
    async fn get_socket(
        &self,
        cancel: &CancellationToken,
        name_or_id: &str,
    ) -> Result<Option<Socket>> {
        let request = Request::get(socket_path(name_or_id));
        match self.http.execute(cancel, &request).await {
            Ok(response) => response.json().map(Some),
            Err(e) if e.is_not_found() => {
                debug!(socket = %name_or_id, "Socket does not exist");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_socket(&self, cancel: &CancellationToken, socket: &Socket) -> Result<Socket> {
        let request = Request::post("socket").json(socket)?;
        let created: Socket = self.http.execute(cancel, &request).await?.json()?;
        debug!(socket = %created.name, socket_type = %created.socket_type, "Created socket");
        Ok(created)
    }

    async fn sign_socket_key(
        &self,
        cancel: &CancellationToken,
        name_or_id: &str,
        public_key: &str,
    ) -> Result<SignedSocketKey> {
        let body = SignSocketKeyRequest {
            ssh_public_key: public_key,
        };
        let request = Request::post(format!("{}/signkey", socket_path(name_or_id))).json(&body)?;
        self.http.execute(cancel, &request).await?.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_key_uses_wire_names() {
        let json = r#"{"signed_ssh_cert":"ecdsa-sha2-nistp256-cert-v01@openssh.com AAAA","host_key":"AAAA"}"#;
        let signed: SignedSocketKey = serde_json::from_str(json).unwrap();
        assert!(signed.signed_cert.starts_with("ecdsa-sha2-nistp256-cert"));
        assert_eq!(signed.host_key, "AAAA");
    }

    #[test]
    fn sign_request_serializes() {
        let body = SignSocketKeyRequest {
            ssh_public_key: "ecdsa-sha2-nistp256 AAAA",
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"ssh_public_key":"ecdsa-sha2-nistp256 AAAA"}"#
        );
    }

    #[test]
    fn socket_path_escapes_name() {
        assert_eq!(socket_path("sdk-socket-http"), "socket/sdk-socket-http");
        assert_eq!(socket_path("a/b"), "socket/a%2Fb");
    }

    #[test]
    fn client_creation() {
        let client = ApiClient::new(ApiConfig::default().with_auth_token("t")).unwrap();
        assert_eq!(client.token().as_deref(), Some("t"));
        client.set_token("u");
        assert_eq!(client.token().as_deref(), Some("u"));
    }
}
