use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::models::Identity;
use crate::config::IdentitySection;

/// Resolves a bearer token to the caller's identity. `None` means rejected.
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Option<Identity>;
}

/// Fixed token → user id table from config.
pub struct StaticTokenValidator {
    tokens: HashMap<String, String>,
}

impl StaticTokenValidator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl IdentityValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).map(|id| Identity {
            id: id.clone(),
            email: None,
        })
    }
}

/// Asks an introspection endpoint about the token. Any non-2xx answer or
/// transport error rejects it.
pub struct HttpIdentityValidator {
    client: reqwest::Client,
    url: String,
}

impl HttpIdentityValidator {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl IdentityValidator for HttpIdentityValidator {
    async fn validate(&self, token: &str) -> Option<Identity> {
        let resp = match self
            .client
            .get(&self.url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(error = %e, "Identity introspection request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            tracing::debug!(status = %resp.status(), "Token rejected by introspection endpoint");
            return None;
        }
        match resp.json::<Identity>().await {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::warn!(error = %e, "Malformed introspection response");
                None
            }
        }
    }
}

/// Build the validator the config asks for.
pub fn from_config(config: &IdentitySection) -> Arc<dyn IdentityValidator> {
    match &config.introspection_url {
        Some(url) => Arc::new(HttpIdentityValidator::new(url.clone())),
        None => Arc::new(StaticTokenValidator::new(config.tokens.clone())),
    }
}

/// Extract the token from an `Authorization: Bearer ...` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_tokens() {
        let validator =
            StaticTokenValidator::new(HashMap::from([("tok".to_string(), "user-1".to_string())]));
        assert_eq!(validator.validate("tok").await.unwrap().id, "user-1");
        assert!(validator.validate("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_http_validator_unreachable_rejects() {
        let validator = HttpIdentityValidator::new("http://127.0.0.1:1/introspect".into());
        assert!(validator.validate("tok").await.is_none());
    }

    #[tokio::test]
    async fn test_from_config_defaults_to_static() {
        let mut section = IdentitySection::default();
        section.tokens.insert("a".into(), "b".into());
        let validator = from_config(&section);
        assert_eq!(validator.validate("a").await.unwrap().id, "b");
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer  "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }
}
