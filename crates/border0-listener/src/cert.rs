//! Ephemeral keypair and certificate flow.
//!
//! Every dial starts from a fresh P-256 keypair. The public half is sent to
//! the control plane for signing; the response carries the user certificate
//! and the dispatcher host key that the next dial must pin.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use border0_api::{ControlPlane, SignedSocketKey};
use russh::keys::ssh_key::private::PrivateKey;
use russh::keys::ssh_key::public::PublicKey;
use russh::keys::ssh_key::{Algorithm, Certificate, EcdsaCurve, LineEnding};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{ListenerError, Result};

/// A freshly generated keypair that has not been signed yet.
pub struct EphemeralKey {
    private: PrivateKey,
}

impl EphemeralKey {
    /// Generate a NIST P-256 keypair.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Key` if key generation fails.
    pub fn generate() -> Result<Self> {
        let private = PrivateKey::random(
            &mut rand::rngs::OsRng,
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
        )?;
        Ok(Self { private })
    }

    /// The public half as an authorized-keys line.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Key` if encoding fails.
    pub fn public_openssh(&self) -> Result<String> {
        Ok(self.private.public_key().to_openssh()?)
    }

    /// The private half in OpenSSH PEM form.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Key` if encoding fails.
    pub fn private_pem(&self) -> Result<Zeroizing<String>> {
        Ok(self.private.to_openssh(LineEnding::LF)?)
    }

    /// The public half.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        self.private.public_key()
    }
}

impl fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("algorithm", &self.private.algorithm())
            .finish_non_exhaustive()
    }
}

/// A signed credential for one dial.
#[derive(Clone)]
pub struct SignedIdentity {
    /// The ephemeral private key.
    pub private_key: Arc<PrivateKey>,
    /// User certificate over the ephemeral public key.
    pub certificate: Certificate,
    /// Dispatcher host key to pin.
    pub host_key: PublicKey,
}

impl SignedIdentity {
    /// Combine a key with the control plane's signing response.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Key` if the certificate or host key cannot be
    /// parsed, or `ListenerError::CertificateMismatch` if the certificate
    /// certifies some other key.
    pub fn from_signed(key: EphemeralKey, signed: &SignedSocketKey) -> Result<Self> {
        let certificate = Certificate::from_openssh(signed.signed_cert.trim())?;
        if certificate.public_key() != key.public_key().key_data() {
            return Err(ListenerError::CertificateMismatch);
        }

        let host_key = decode_host_key(&signed.host_key)?;

        Ok(Self {
            private_key: Arc::new(key.private),
            certificate,
            host_key,
        })
    }
}

impl fmt::Debug for SignedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedIdentity")
            .field("key_id", &self.certificate.key_id())
            .field("principals", &self.certificate.valid_principals())
            .field("host_key", &self.host_key.algorithm())
            .finish_non_exhaustive()
    }
}

/// Parse the base64 of a public key in SSH wire format.
///
/// # Errors
///
/// Returns `ListenerError::Key` if the text is not base64 or not a key.
pub fn decode_host_key(encoded: &str) -> Result<PublicKey> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ListenerError::Key(format!("host key is not base64: {e}")))?;
    Ok(PublicKey::from_bytes(&bytes)?)
}

/// Generate a keypair, have the control plane sign it for `socket`, and
/// return the resulting credential.
///
/// # Errors
///
/// Returns the control-plane error, or a key error if the response cannot
/// be used.
pub async fn sign_identity(
    api: &dyn ControlPlane,
    cancel: &CancellationToken,
    socket: &str,
) -> Result<SignedIdentity> {
    let key = EphemeralKey::generate()?;
    let public = key.public_openssh()?;
    let signed = api.sign_socket_key(cancel, socket, &public).await?;
    let identity = SignedIdentity::from_signed(key, &signed)?;
    debug!(
        socket = %socket,
        serial = identity.certificate.serial(),
        "Signed ephemeral key"
    );
    Ok(identity)
}
