//! Resolves provider credentials from config and builds the auth header
//! a request needs to carry. No key rotation: one provider mount = one
//! credential, resolved once at mount time and reused for the life of
//! the process.

use ad_domain::config::{AuthConfig, AuthMode};
use ad_domain::error::{Error, Result};

/// Resolve the API key for a provider from its [`AuthConfig`].
///
/// Resolution order: a direct `key` (discouraged, logged at warn), then
/// the `env` variable name.
pub fn resolve_api_key(auth: &AuthConfig) -> Result<String> {
    if let Some(ref key) = auth.key {
        tracing::warn!("API key loaded from plaintext config field 'key' — prefer 'env'");
        return Ok(key.clone());
    }
    if let Some(ref env_name) = auth.env {
        return std::env::var(env_name)
            .map_err(|_| Error::Config(format!("environment variable '{env_name}' not set")));
    }
    Err(Error::Config("auth requires either 'key' or 'env' to be set".into()))
}

/// The header name/value pair to attach to an outbound request, or
/// `None` when `mode` is `AuthMode::None`.
pub fn build_header(auth: &AuthConfig) -> Result<Option<(String, String)>> {
    match auth.mode {
        AuthMode::None => Ok(None),
        AuthMode::ApiKey => {
            let key = resolve_api_key(auth)?;
            let header = auth.header.clone().unwrap_or_else(|| "Authorization".to_string());
            let prefix = auth.prefix.clone().unwrap_or_else(|| "Bearer ".to_string());
            Ok(Some((header, format!("{prefix}{key}"))))
        }
        AuthMode::QueryParam => {
            let key = resolve_api_key(auth)?;
            let param = auth.header.clone().unwrap_or_else(|| "key".to_string());
            Ok(Some((param, key)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_direct_key() {
        let auth = AuthConfig { key: Some("sk-direct".into()), ..AuthConfig::default() };
        assert_eq!(resolve_api_key(&auth).unwrap(), "sk-direct");
    }

    #[test]
    fn resolve_falls_back_to_env() {
        std::env::set_var("AD_TEST_PROVIDER_KEY", "sk-from-env");
        let auth = AuthConfig { env: Some("AD_TEST_PROVIDER_KEY".into()), ..AuthConfig::default() };
        assert_eq!(resolve_api_key(&auth).unwrap(), "sk-from-env");
        std::env::remove_var("AD_TEST_PROVIDER_KEY");
    }

    #[test]
    fn resolve_errors_when_nothing_configured() {
        let auth = AuthConfig::default();
        assert!(resolve_api_key(&auth).is_err());
    }

    #[test]
    fn none_mode_produces_no_header() {
        let auth = AuthConfig { mode: AuthMode::None, ..AuthConfig::default() };
        assert!(build_header(&auth).unwrap().is_none());
    }

    #[test]
    fn api_key_mode_default_header_is_bearer_authorization() {
        let auth = AuthConfig { mode: AuthMode::ApiKey, key: Some("sk-1".into()), ..AuthConfig::default() };
        let (name, value) = build_header(&auth).unwrap().unwrap();
        assert_eq!(name, "Authorization");
        assert_eq!(value, "Bearer sk-1");
    }

    #[test]
    fn api_key_mode_custom_header_and_prefix() {
        let auth = AuthConfig {
            mode: AuthMode::ApiKey,
            key: Some("sk-1".into()),
            header: Some("x-api-key".into()),
            prefix: Some(String::new()),
            ..AuthConfig::default()
        };
        let (name, value) = build_header(&auth).unwrap().unwrap();
        assert_eq!(name, "x-api-key");
        assert_eq!(value, "sk-1");
    }

    #[test]
    fn query_param_mode_returns_param_name_and_key() {
        let auth = AuthConfig {
            mode: AuthMode::QueryParam,
            key: Some("sk-1".into()),
            header: Some("api_key".into()),
            ..AuthConfig::default()
        };
        let (name, value) = build_header(&auth).unwrap().unwrap();
        assert_eq!(name, "api_key");
        assert_eq!(value, "sk-1");
    }
}
