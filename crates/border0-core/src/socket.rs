//! Socket descriptors.
//!
//! A socket is a named endpoint on the access platform. The listener only
//! ever creates `http` sockets; every other type is carried through opaquely.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::SocketId;
use crate::time::FlexibleTime;

/// The kind of upstream a socket fronts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SocketType {
    /// HTTP(S) services.
    Http,
    /// SSH servers.
    Ssh,
    /// Raw TLS services.
    Tls,
    /// Database servers.
    Database,
    /// VNC servers.
    Vnc,
    /// RDP servers.
    Rdp,
    /// Plain TCP services.
    Tcp,
    /// Kubernetes API servers.
    Kubernetes,
    /// Snowflake warehouses.
    Snowflake,
    /// VPN endpoints.
    Vpn,
    /// Subnet routers.
    SubnetRouter,
    /// Exit nodes.
    ExitNode,
    /// AWS console/API access.
    AwsAccess,
    /// AWS S3 buckets.
    AwsS3,
    /// Elasticsearch clusters.
    Elasticsearch,
    /// Docker daemons.
    Docker,
    /// Any type this SDK does not model explicitly.
    Other(String),
}

impl SocketType {
    /// The wire representation of the type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Http => "http",
            Self::Ssh => "ssh",
            Self::Tls => "tls",
            Self::Database => "database",
            Self::Vnc => "vnc",
            Self::Rdp => "rdp",
            Self::Tcp => "tcp",
            Self::Kubernetes => "kubernetes",
            Self::Snowflake => "snowflake",
            Self::Vpn => "vpn",
            Self::SubnetRouter => "subnet-router",
            Self::ExitNode => "exit-node",
            Self::AwsAccess => "aws-access",
            Self::AwsS3 => "aws-s3",
            Self::Elasticsearch => "elasticsearch",
            Self::Docker => "docker",
            Self::Other(other) => other,
        }
    }
}

impl From<String> for SocketType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "http" => Self::Http,
            "ssh" => Self::Ssh,
            "tls" => Self::Tls,
            "database" => Self::Database,
            "vnc" => Self::Vnc,
            "rdp" => Self::Rdp,
            "tcp" => Self::Tcp,
            "kubernetes" => Self::Kubernetes,
            "snowflake" => Self::Snowflake,
            "vpn" => Self::Vpn,
            "subnet-router" => Self::SubnetRouter,
            "exit-node" => Self::ExitNode,
            "aws-access" => Self::AwsAccess,
            "aws-s3" => Self::AwsS3,
            "elasticsearch" => Self::Elasticsearch,
            "docker" => Self::Docker,
            _ => Self::Other(value),
        }
    }
}

impl From<SocketType> for String {
    fn from(value: SocketType) -> Self {
        match value {
            SocketType::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A socket as returned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socket {
    /// Server-assigned identifier; absent until the socket is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<SocketId>,
    /// Name, unique within the organization.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Upstream kind.
    pub socket_type: SocketType,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    /// Creation time.
    #[serde(default, skip_serializing_if = "FlexibleTime::is_zero")]
    pub created_at: FlexibleTime,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "FlexibleTime::is_zero")]
    pub updated_at: FlexibleTime,
}

impl Socket {
    /// A descriptor for a socket that does not exist yet.
    #[must_use]
    pub fn new(name: impl Into<String>, socket_type: SocketType) -> Self {
        Self {
            socket_id: None,
            name: name.into(),
            description: String::new(),
            socket_type,
            tags: HashMap::new(),
            created_at: FlexibleTime::ZERO,
            updated_at: FlexibleTime::ZERO,
        }
    }

    /// Check that a socket name is usable as a URL path segment.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidSocketName` if the name is empty or contains
    /// anything other than ASCII alphanumerics, `-`, `_` and `.`.
    pub fn validate_name(name: &str) -> Result<(), CoreError> {
        let ok = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if ok {
            Ok(())
        } else {
            Err(CoreError::InvalidSocketName(name.to_string()))
        }
    }
}
