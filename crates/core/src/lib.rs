//! karchive core types: resource views decoded from change events, their
//! identities, and the transport envelope that carries them.

#![forbid(unsafe_code)]

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Group/Version/Kind triple identifying a Kubernetes resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Build a GVK from an `apiVersion` string (`v1` or `group/v1`) and a kind.
    /// A malformed apiVersion yields empty group and version, keeping the kind.
    pub fn from_api_version_kind(api_version: &str, kind: &str) -> Self {
        let parts: Vec<&str> = api_version.split('/').collect();
        match parts.as_slice() {
            [version] => Self::new("", *version, kind),
            [group, version] => Self::new(*group, *version, kind),
            _ => Self::new("", "", kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Identity fields extracted from a decoded resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdentity {
    /// Empty for cluster-scoped kinds.
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub gvk: Gvk,
    pub resource_version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid yaml payload: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("payload is not an object")]
    NotAnObject,
    #[error("payload is missing required field {0}")]
    MissingField(&'static str),
}

/// Structured view over one Kubernetes object.
#[derive(Debug, Clone)]
pub struct ResourceView {
    object: Value,
    identity: ResourceIdentity,
}

impl ResourceView {
    /// Wrap an already-parsed object. `apiVersion`, `kind` and `metadata.name`
    /// must be present as strings.
    pub fn from_value(object: Value) -> Result<Self, DecodeError> {
        if !object.is_object() {
            return Err(DecodeError::NotAnObject);
        }
        let api_version = str_field(&object, &["apiVersion"]).ok_or(DecodeError::MissingField("apiVersion"))?;
        let kind = str_field(&object, &["kind"]).ok_or(DecodeError::MissingField("kind"))?;
        let name = str_field(&object, &["metadata", "name"]).ok_or(DecodeError::MissingField("metadata.name"))?;
        let identity = ResourceIdentity {
            namespace: str_field(&object, &["metadata", "namespace"]).unwrap_or_default().to_string(),
            name: name.to_string(),
            uid: str_field(&object, &["metadata", "uid"]).unwrap_or_default().to_string(),
            gvk: Gvk::from_api_version_kind(api_version, kind),
            resource_version: str_field(&object, &["metadata", "resourceVersion"]).unwrap_or_default().to_string(),
        };
        Ok(Self { object, identity })
    }

    pub fn from_json_slice(payload: &[u8]) -> Result<Self, DecodeError> {
        Self::from_value(serde_json::from_slice(payload)?)
    }

    pub fn from_yaml_slice(payload: &[u8]) -> Result<Self, DecodeError> {
        Self::from_value(serde_yaml::from_slice(payload)?)
    }

    /// Decode a payload according to its content type. JSON unless the
    /// content type names yaml.
    pub fn decode(content_type: Option<&str>, payload: &[u8]) -> Result<Self, DecodeError> {
        match content_type {
            Some(ct) if ct.to_ascii_lowercase().contains("yaml") => Self::from_yaml_slice(payload),
            _ => Self::from_json_slice(payload),
        }
    }

    pub fn identity(&self) -> &ResourceIdentity { &self.identity }
    pub fn gvk(&self) -> &Gvk { &self.identity.gvk }
    pub fn namespace(&self) -> &str { &self.identity.namespace }
    pub fn name(&self) -> &str { &self.identity.name }
    pub fn uid(&self) -> &str { &self.identity.uid }
    pub fn object(&self) -> &Value { &self.object }

    /// Top-level section such as `metadata`, `spec` or `status`.
    pub fn section(&self, name: &str) -> Option<&Value> {
        self.object.get(name)
    }
}

fn str_field<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for p in path {
        cur = cur.get(*p)?;
    }
    cur.as_str()
}

/// Transport wrapper carrying one resource-change notification.
#[derive(Debug, Clone)]
pub struct IngestionEnvelope {
    pub event_id: String,
    pub content_type: Option<String>,
    pub payload: Bytes,
}

impl IngestionEnvelope {
    pub fn new(event_id: impl Into<String>, content_type: Option<String>, payload: impl Into<Bytes>) -> Self {
        Self { event_id: event_id.into(), content_type, payload: payload.into() }
    }
}

pub mod prelude {
    pub use super::{DecodeError, Gvk, IngestionEnvelope, ResourceIdentity, ResourceView};
}
