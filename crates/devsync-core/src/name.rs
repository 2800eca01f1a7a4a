// ── Model names ──
//
// Attribute names are URI-flavoured: `scheme://device/path/attribute`.
// The scheme selects the backend; the device path (everything up to the
// last segment) identifies the owner device; the last segment is the
// attribute itself. Validation happens here, synchronously, so malformed
// names fail at creation time and never surface as events.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A parsed, canonicalized attribute name.
///
/// The canonical full name (`scheme://device/attribute`, scheme
/// lowercased) is the identity key in the factory cache: two spellings
/// that canonicalize identically refer to the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelName {
    full: String,
    scheme: String,
    device: String,
    attribute: String,
}

impl ModelName {
    /// Parse `name`, applying `default_scheme` when no `scheme://` prefix
    /// is present.
    pub fn parse(name: &str, default_scheme: &str) -> Result<Self, CoreError> {
        let (scheme, rest) = match name.split_once("://") {
            Some((s, rest)) => (s.to_ascii_lowercase(), rest),
            None => (default_scheme.to_ascii_lowercase(), name),
        };

        if scheme.is_empty() {
            return Err(CoreError::config(name, "empty scheme"));
        }
        if !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+')
        {
            return Err(CoreError::config(name, "scheme contains invalid characters"));
        }

        let Some((device, attribute)) = rest.rsplit_once('/') else {
            return Err(CoreError::config(
                name,
                "expected at least 'device/attribute'",
            ));
        };

        if device.is_empty() || device.split('/').any(str::is_empty) {
            return Err(CoreError::config(name, "empty device path segment"));
        }
        if attribute.is_empty() {
            return Err(CoreError::config(name, "empty attribute name"));
        }

        let full = format!("{scheme}://{device}/{attribute}");
        Ok(Self {
            full,
            scheme,
            device: device.to_owned(),
            attribute: attribute.to_owned(),
        })
    }

    /// Canonical full name: `scheme://device/attribute`.
    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Device path without scheme or attribute segment.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Canonical owner-device key: `scheme://device`.
    pub fn device_key(&self) -> String {
        format!("{}://{}", self.scheme, self.device)
    }

    /// The bare attribute segment, as the backend proxy expects it.
    pub fn attribute(&self) -> &str {
        &self.attribute
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}
