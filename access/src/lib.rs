//! netfence Access Layer — authenticated REST calls against the management plane
//!
//! - Transport: single request/response, reqwest in production
//! - Tokens: static or client-credentials, cached per scope
//! - Backoff: 429/504 only, `max(2^attempt, server hint)`, nine attempts

pub mod backoff;
pub mod client;
pub mod token;
pub mod transport;

pub use backoff::RetryPolicy;
pub use client::{RestApi, RestClient};
pub use token::{ClientCredentialsProvider, StaticTokenProvider, TokenProvider};
pub use transport::{Body, HttpRequest, HttpResponse, Method, ReqwestTransport, Transport};
