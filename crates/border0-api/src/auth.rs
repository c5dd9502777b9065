//! Bearer token acquisition.
//!
//! Two flows are supported:
//!
//! - **Device authorization** (default): the control plane issues a
//!   short-lived device-auth token, the user approves it in the portal, and
//!   the SDK polls until the approval yields a bearer token.
//! - **Legacy login**: email and password are exchanged for a token;
//!   missing fields are prompted from the terminal.
//!
//! Whichever flow runs, the resulting token is installed on the client.

use std::fmt;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::claims::TokenClaims;
use crate::client::ApiClient;
use crate::error::{ApiError, Result};
use crate::http::Request;
use crate::prompt;

/// Header carrying the device-auth token while polling.
pub const DEVICE_AUTH_HEADER: &str = "x-device-auth";

/// How the SDK obtains a bearer token when none is configured.
#[derive(Clone)]
pub enum AuthMethod {
    /// Browser-assisted device authorization.
    DeviceAuthorization(DeviceAuthOptions),
    /// Email and password; `None` fields are prompted for.
    Legacy {
        /// Account email.
        email: Option<String>,
        /// Account password.
        password: Option<String>,
    },
}

impl Default for AuthMethod {
    fn default() -> Self {
        Self::DeviceAuthorization(DeviceAuthOptions::default())
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceAuthorization(options) => {
                f.debug_tuple("DeviceAuthorization").field(options).finish()
            }
            Self::Legacy { email, password } => f
                .debug_struct("Legacy")
                .field("email", email)
                .field("password", &password.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Options for the device-authorization flow.
#[derive(Debug, Clone)]
pub struct DeviceAuthOptions {
    /// Try to open the approval URL in the system browser.
    pub open_browser: bool,
    /// Polling schedule; the elapsed budget is the flow's deadline.
    pub poll: BackoffConfig,
}

impl Default for DeviceAuthOptions {
    fn default() -> Self {
        Self {
            open_browser: true,
            poll: BackoffConfig::device_poll(),
        }
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceAuthStatus {
    #[serde(default)]
    token: String,
    #[serde(default)]
    state: String,
}

/// Obtain a bearer token with `method` and install it on `client`.
///
/// # Errors
///
/// Returns the first error of the selected flow.
pub async fn authenticate(
    client: &ApiClient,
    cancel: &CancellationToken,
    method: &AuthMethod,
) -> Result<String> {
    let token = match method {
        AuthMethod::DeviceAuthorization(options) => {
            device_authorize(client, cancel, options).await?
        }
        AuthMethod::Legacy { email, password } => {
            let email = match email.as_deref().filter(|e| !e.is_empty()) {
                Some(email) => email.to_string(),
                None => prompt::read_line_async("Email: ", true).await?,
            };
            let password = match password.as_deref().filter(|p| !p.is_empty()) {
                Some(password) => password.to_string(),
                None => prompt::read_line_async("Password: ", false).await?,
            };
            login(client, cancel, &email, &password).await?
        }
    };
    client.set_token(token.clone());
    Ok(token)
}

/// Exchange email and password for a bearer token.
///
/// # Errors
///
/// Returns an error if the control plane rejects the credentials or returns
/// an empty token.
pub async fn login(
    client: &ApiClient,
    cancel: &CancellationToken,
    email: &str,
    password: &str,
) -> Result<String> {
    let request = Request::post("login").json(&LoginRequest { email, password })?;
    let response: TokenResponse = client.executor().execute(cancel, &request).await?.json()?;
    if response.token.is_empty() {
        return Err(ApiError::InvalidToken("login returned an empty token".to_string()));
    }
    info!("Logged in");
    Ok(response.token)
}

/// The portal URL a user visits to approve a device authorization.
#[must_use]
pub fn device_login_url(portal_url: &str, identifier: &str) -> String {
    let escaped: String = url::form_urlencoded::byte_serialize(identifier.as_bytes()).collect();
    format!(
        "{}/login?device_identifier={escaped}",
        portal_url.trim_end_matches('/')
    )
}

/// Run the device-authorization flow and return the approved bearer token.
///
/// Polling continues until the status response carries a non-empty token
/// or the poll schedule's elapsed budget runs out. The `state` field of the
/// status response is logged but does not end polling.
///
/// # Errors
///
/// Returns `ApiError::DeviceAuthTimeout` once the budget is spent,
/// `ApiError::Cancelled` if `cancel` fires, or the control-plane error if
/// the device-auth token is rejected.
pub async fn device_authorize(
    client: &ApiClient,
    cancel: &CancellationToken,
    options: &DeviceAuthOptions,
) -> Result<String> {
    let executor = client.executor();

    let issued: TokenResponse = executor
        .execute(cancel, &Request::post("device_authorizations"))
        .await?
        .json()?;
    let device_token = issued.token;
    let claims = TokenClaims::decode_unverified(&device_token)?;
    let identifier = claims.device_identifier()?;

    let url = device_login_url(&client.config().portal_url, identifier);
    eprintln!("Please navigate to the URL below in order to complete the login process:\n{url}");
    if options.open_browser {
        open_browser(&url);
    }

    let poll = Request::get("device_authorizations").header(DEVICE_AUTH_HEADER, device_token);
    let mut backoff = ExponentialBackoff::new(options.poll.clone());

    loop {
        // A stalled poll must not outlive the flow's deadline.
        let polled = match backoff.remaining() {
            Some(budget) => tokio::time::timeout(budget, executor.execute(cancel, &poll))
                .await
                .map_err(|_| ApiError::DeviceAuthTimeout)?,
            None => executor.execute(cancel, &poll).await,
        };
        match polled {
            Ok(response) => {
                let status: DeviceAuthStatus = response.json()?;
                if !status.token.is_empty() {
                    info!(state = %status.state, "Device authorization approved");
                    return Ok(status.token);
                }
                debug!(state = %status.state, "Device authorization pending");
            }
            Err(e) if e.is_cancelled() || e.is_unauthorized() => return Err(e),
            Err(e) => warn!(error = %e, "Device authorization poll failed"),
        }

        let Some(delay) = backoff.next_delay() else {
            return Err(ApiError::DeviceAuthTimeout);
        };
        let delay = backoff.remaining().map_or(delay, |left| delay.min(left));
        tokio::select! {
            () = cancel.cancelled() => return Err(ApiError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

fn browser_command(url: &str) -> Command {
    if cfg!(target_os = "macos") {
        let mut cmd = Command::new("open");
        cmd.arg(url);
        cmd
    } else if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "start", "", url]);
        cmd
    } else {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(url);
        cmd
    }
}

fn open_browser(url: &str) {
    let spawned = browser_command(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        debug!(error = %e, "Could not open browser");
    }
}
