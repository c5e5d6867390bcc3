//! Bearer token acquisition scoped to the target host

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use netfence_common::{FenceError, Result};

use crate::transport::{Body, HttpRequest, Method, Transport};

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Access token for `scope` (e.g. `https://management.azure.com/.default`)
    async fn token(&self, scope: &str) -> Result<String>;
}

/// `.default` scope for the host a URL points at
pub fn scope_for_url(url: &str) -> Result<String> {
    let parsed =
        reqwest::Url::parse(url).map_err(|e| FenceError::Config(format!("invalid url {url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| FenceError::Config(format!("url without host: {url}")))?;
    Ok(format!("{}://{}/.default", parsed.scheme(), host))
}

/// Fixed token, e.g. one injected through the environment
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self, _scope: &str) -> Result<String> {
        Ok(self.token.clone())
    }
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// OAuth2 client-credentials flow with a per-scope cache
pub struct ClientCredentialsProvider {
    transport: Arc<dyn Transport>,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    cache: DashMap<String, CachedToken>,
    refresh_margin: ChronoDuration,
}

impl ClientCredentialsProvider {
    pub fn new(
        transport: Arc<dyn Transport>,
        authority: &str,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        Self {
            transport,
            authority: authority.trim_end_matches('/').to_string(),
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            cache: DashMap::new(),
            refresh_margin: ChronoDuration::minutes(5),
        }
    }

    fn cached(&self, scope: &str) -> Option<String> {
        let now = Utc::now();
        self.cache
            .get(scope)
            .filter(|t| t.expires_at - self.refresh_margin > now)
            .map(|t| t.value.clone())
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsProvider {
    async fn token(&self, scope: &str) -> Result<String> {
        if let Some(token) = self.cached(scope) {
            return Ok(token);
        }

        let url = format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id);
        let request = HttpRequest {
            method: Method::Post,
            url: url.clone(),
            headers: Vec::new(),
            body: Some(Body::Form(vec![
                ("grant_type".into(), "client_credentials".into()),
                ("client_id".into(), self.client_id.clone()),
                ("client_secret".into(), self.client_secret.clone()),
                ("scope".into(), scope.to_string()),
            ])),
        };

        let response = self.transport.send(&request).await?;
        if !response.is_success() {
            return Err(FenceError::Http {
                url,
                status: response.status,
                body: response.body,
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&response.body)?;
        debug!("Acquired token for {scope}, expires in {}s", parsed.expires_in);
        self.cache.insert(
            scope.to_string(),
            CachedToken {
                value: parsed.access_token.clone(),
                expires_at: Utc::now() + ChronoDuration::seconds(parsed.expires_in),
            },
        );
        Ok(parsed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TokenEndpoint {
        calls: AtomicUsize,
        status: u16,
    }

    #[async_trait]
    impl Transport for TokenEndpoint {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.method, Method::Post);
            assert!(request.url.ends_with("/tenant-1/oauth2/v2.0/token"));
            Ok(HttpResponse {
                status: self.status,
                headers: Default::default(),
                body: r#"{"access_token":"tok","expires_in":3600}"#.into(),
            })
        }
    }

    #[test]
    fn test_scope_for_url() {
        assert_eq!(
            scope_for_url("https://management.azure.com/subscriptions/x?api-version=1").unwrap(),
            "https://management.azure.com/.default"
        );
        assert!(scope_for_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_client_credentials_cached_per_scope() {
        let endpoint = Arc::new(TokenEndpoint {
            calls: AtomicUsize::new(0),
            status: 200,
        });
        let provider = ClientCredentialsProvider::new(
            endpoint.clone(),
            "https://login.microsoftonline.com/",
            "tenant-1",
            "client",
            "secret",
        );

        let scope = "https://management.azure.com/.default";
        assert_eq!(provider.token(scope).await.unwrap(), "tok");
        assert_eq!(provider.token(scope).await.unwrap(), "tok");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);

        provider.token("https://vault.azure.net/.default").await.unwrap();
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_token_failure_is_http_error() {
        let endpoint = Arc::new(TokenEndpoint {
            calls: AtomicUsize::new(0),
            status: 401,
        });
        let provider =
            ClientCredentialsProvider::new(endpoint, "https://login", "tenant-1", "c", "s");
        let err = provider.token("scope").await.unwrap_err();
        assert!(matches!(err, FenceError::Http { status: 401, .. }));
    }
}
