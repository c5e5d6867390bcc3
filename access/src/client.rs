//! Retrying REST client
//!
//! Every verb funnels through [`RestClient::send`]: fresh bearer token per
//! attempt, retry on 429/504 only, terminal errors carry the failing URL.

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use netfence_common::{FenceError, Result};

use crate::backoff::RetryPolicy;
use crate::token::{scope_for_url, TokenProvider};
use crate::transport::{Body, HttpRequest, HttpResponse, Method, Transport};

/// JSON REST surface the engine talks to
#[async_trait]
pub trait RestApi: Send + Sync {
    async fn send(&self, method: Method, url: &str, body: Option<Value>) -> Result<Value>;

    async fn get(&self, url: &str) -> Result<Value> {
        self.send(Method::Get, url, None).await
    }

    async fn put(&self, url: &str, body: Value) -> Result<Value> {
        self.send(Method::Put, url, Some(body)).await
    }

    async fn post(&self, url: &str, body: Value) -> Result<Value> {
        self.send(Method::Post, url, Some(body)).await
    }

    async fn patch(&self, url: &str, body: Value) -> Result<Value> {
        self.send(Method::Patch, url, Some(body)).await
    }

    async fn delete(&self, url: &str) -> Result<Value> {
        self.send(Method::Delete, url, None).await
    }
}

pub struct RestClient {
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenProvider>,
    policy: RetryPolicy,
}

impl RestClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            tokens,
            policy,
        }
    }

    fn terminal_error(url: &str, response: HttpResponse) -> FenceError {
        if response.status == 404 {
            FenceError::not_found(url)
        } else {
            FenceError::Http {
                url: url.to_string(),
                status: response.status,
                body: response.body,
            }
        }
    }
}

fn parse_body(body: &str) -> Result<Value> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(body)?)
}

#[async_trait]
impl RestApi for RestClient {
    async fn send(&self, method: Method, url: &str, body: Option<Value>) -> Result<Value> {
        let scope = scope_for_url(url)?;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let token = self.tokens.token(&scope).await?;
            let request = HttpRequest {
                method,
                url: url.to_string(),
                headers: vec![
                    ("authorization".into(), format!("Bearer {token}")),
                    ("content-type".into(), "application/json".into()),
                ],
                body: body.clone().map(Body::Json),
            };

            let response = self.transport.send(&request).await?;
            if response.is_success() {
                debug!("{} {url} -> {}", method.as_str(), response.status);
                return parse_body(&response.body);
            }

            if !RetryPolicy::is_retryable(response.status) {
                return Err(Self::terminal_error(url, response));
            }

            if attempt >= self.policy.max_attempts {
                warn!(
                    "{} {url} still returning {} after {attempt} attempts, giving up",
                    method.as_str(),
                    response.status
                );
                return Err(FenceError::Transient {
                    url: url.to_string(),
                    status: response.status,
                    attempts: attempt,
                });
            }

            let jitter = rand::thread_rng().gen_range(1..=self.policy.max_jitter.max(1));
            let wait = self
                .policy
                .delay(attempt, &response.headers, chrono::Utc::now(), jitter);
            warn!(
                "{} {url} returned {}, retrying in {:?} (attempt {attempt}/{})",
                method.as_str(),
                response.status,
                wait,
                self.policy.max_attempts
            );
            tokio::time::sleep(wait).await;
        }
    }
}
