//! Credentials used for relay authentication and private model downloads.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub user_id: String,
    /// Signed-URL query parameters for private model files.
    #[serde(default)]
    pub cdn: BTreeMap<String, Value>,
}

impl Credentials {
    /// CDN parameters rendered as query pairs. Strings are used verbatim,
    /// other values in their JSON form.
    pub fn cdn_query(&self) -> Vec<(String, String)> {
        self.cdn
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect()
    }

    pub fn from_file(path: &Path) -> Result<Self, CredentialsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CredentialsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("failed to read credentials from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid credentials file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Source of the credentials attached to outgoing requests.
///
/// Injected once into the node; nothing on the dispatch path looks
/// credentials up on its own.
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self) -> Option<Credentials>;
}

/// Fixed credentials, or none.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(Option<Credentials>);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(Some(credentials))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl CredentialsProvider for StaticCredentials {
    fn credentials(&self) -> Option<Credentials> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cdn_query_stringifies_values() {
        let creds: Credentials = serde_json::from_value(json!({
            "token": "t0k",
            "user_id": "u1",
            "cdn": {"Signature": "abc", "Expires": 1700000000}
        }))
        .unwrap();

        assert_eq!(
            creds.cdn_query(),
            vec![
                ("Expires".to_string(), "1700000000".to_string()),
                ("Signature".to_string(), "abc".to_string()),
            ]
        );
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"token":"t","user_id":"u"}"#).unwrap();

        let creds = Credentials::from_file(&path).unwrap();
        assert_eq!(creds.token, "t");
        assert!(creds.cdn.is_empty());
    }

    #[test]
    fn anonymous_provider_has_no_credentials() {
        assert!(StaticCredentials::anonymous().credentials().is_none());
    }
}
