//! Credential resolution: keystore, environment, then configuration
//!
//! Keys and endpoints are never logged in full; diagnostics always go
//! through [`mask_secret`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::RemoteApiConfig;
use crate::error::{Error, Result};

const KEYRING_SERVICE: &str = "hybridrag";

const FIELD_NAMES: [&str; 4] = ["api_key", "api_endpoint", "api_deployment", "api_version"];

const ENV_NAMES: [&str; 4] = [
    "HYBRIDRAG_API_KEY",
    "HYBRIDRAG_API_ENDPOINT",
    "HYBRIDRAG_API_DEPLOYMENT",
    "HYBRIDRAG_API_VERSION",
];

/// Where a credential field came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    Keystore,
    Environment,
    Config,
}

/// Resolved API credential bundle
#[derive(Debug, Clone, Default)]
pub struct CredentialBundle {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
    pub api_version: Option<String>,
}

impl CredentialBundle {
    /// True when the bundle can authenticate a remote call
    pub fn is_complete(&self) -> bool {
        self.api_key.is_some() && self.endpoint.is_some()
    }

    fn set_field(&mut self, field: &str, value: String) {
        match field {
            "api_key" => self.api_key = Some(value),
            "api_endpoint" => self.endpoint = Some(value),
            "api_deployment" => self.deployment = Some(value),
            "api_version" => self.api_version = Some(value),
            _ => {}
        }
    }

    fn has_field(&self, field: &str) -> bool {
        match field {
            "api_key" => self.api_key.is_some(),
            "api_endpoint" => self.endpoint.is_some(),
            "api_deployment" => self.deployment.is_some(),
            "api_version" => self.api_version.is_some(),
            _ => false,
        }
    }
}

/// Mask a secret for diagnostics: first 4 + ellipsis + last 4
pub fn mask_secret(value: &str) -> String {
    if value.len() <= 8 {
        return "****".to_string();
    }
    let head: String = value.chars().take(4).collect();
    let tail: String = value.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("{}…{}", head, tail)
}

/// Resolves the credential bundle from the available sources in priority
/// order: OS keystore, process environment, configuration file.
pub struct CredentialResolver {
    config: RemoteApiConfig,
    /// When false, the OS keystore is skipped (headless CI, tests)
    use_keystore: bool,
}

impl CredentialResolver {
    pub fn new(config: RemoteApiConfig) -> Self {
        Self {
            config,
            use_keystore: true,
        }
    }

    /// Resolver that never touches the OS keystore
    pub fn without_keystore(config: RemoteApiConfig) -> Self {
        Self {
            config,
            use_keystore: false,
        }
    }

    /// Resolve the bundle and a provenance map recording where each present
    /// field came from. Missing fields are not an error here; the boot
    /// pipeline decides which modes they disable.
    pub fn resolve(&self) -> (CredentialBundle, BTreeMap<String, CredentialSource>) {
        let mut bundle = CredentialBundle::default();
        let mut provenance = BTreeMap::new();

        if self.use_keystore {
            for field in FIELD_NAMES {
                if let Some(value) = read_keystore(field) {
                    bundle.set_field(field, value);
                    provenance.insert(field.to_string(), CredentialSource::Keystore);
                }
            }
        }

        for (field, env_name) in FIELD_NAMES.iter().zip(ENV_NAMES.iter()) {
            if bundle.has_field(field) {
                continue;
            }
            if let Ok(value) = std::env::var(env_name) {
                if !value.is_empty() {
                    bundle.set_field(field, value);
                    provenance.insert(field.to_string(), CredentialSource::Environment);
                }
            }
        }

        let config_fields = [
            ("api_key", self.config.api_key.as_str()),
            ("api_endpoint", self.config.endpoint.as_str()),
            ("api_deployment", self.config.deployment.as_str()),
            ("api_version", self.config.api_version.as_str()),
        ];
        for (field, value) in config_fields {
            if bundle.has_field(field) || value.is_empty() {
                continue;
            }
            if field == "api_key" {
                tracing::warn!(
                    "API key read from the configuration file ({}); prefer the keystore or environment",
                    mask_secret(value)
                );
            }
            bundle.set_field(field, value.to_string());
            provenance.insert(field.to_string(), CredentialSource::Config);
        }

        (bundle, provenance)
    }

    /// Store a field in the OS keystore (administrative operation)
    pub fn store(&self, field: &str, value: &str) -> Result<()> {
        validate_field(field)?;
        let entry = keyring::Entry::new(KEYRING_SERVICE, field)
            .map_err(|e| Error::credential(format!("Keystore unavailable: {}", e)))?;
        entry
            .set_password(value)
            .map_err(|e| Error::credential(format!("Failed to store '{}': {}", field, e)))?;
        tracing::info!("stored credential field '{}' ({})", field, mask_secret(value));
        Ok(())
    }

    /// List stored fields with masked values (administrative operation)
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for field in FIELD_NAMES {
            if let Some(value) = read_keystore(field) {
                out.push((field.to_string(), mask_secret(&value)));
            }
        }
        out
    }

    /// Remove every stored field (administrative operation)
    pub fn clear(&self) -> Result<usize> {
        let mut cleared = 0;
        for field in FIELD_NAMES {
            if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, field) {
                if entry.delete_credential().is_ok() {
                    cleared += 1;
                }
            }
        }
        tracing::info!("cleared {} credential field(s)", cleared);
        Ok(cleared)
    }
}

fn validate_field(field: &str) -> Result<()> {
    if FIELD_NAMES.contains(&field) {
        Ok(())
    } else {
        Err(Error::credential(format!(
            "Unknown credential field '{}'; expected one of {:?}",
            field, FIELD_NAMES
        )))
    }
}

fn read_keystore(field: &str) -> Option<String> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, field).ok()?;
    match entry.get_password() {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}
