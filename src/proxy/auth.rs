//! Basic proxy authentication gate

use crate::config::Credentials;
use crate::error::Result;
use crate::proxy::exchange::Exchange;
use crate::proxy::handler::Handler;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::StatusCode;
use tracing::debug;

/// Realm announced in the 407 challenge
pub const DEFAULT_REALM: &str = "httproxy";

/// Checks a username/password pair. Called concurrently from many sessions.
pub trait Verifier: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

impl<F> Verifier for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn verify(&self, username: &str, password: &str) -> bool {
        self(username, password)
    }
}

impl Verifier for Credentials {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    /// No usable `Basic <token>` header: challenge with 407.
    Challenge,
    /// Credentials present but wrong or undecodable: 403.
    Forbidden,
    Accepted,
}

/// Wraps a handler and only lets requests with valid Basic credentials through.
pub struct BasicAuth<H, V> {
    inner: H,
    verifier: V,
    challenge: HeaderValue,
}

impl<H, V> BasicAuth<H, V>
where
    H: Handler,
    V: Verifier,
{
    pub fn new(inner: H, verifier: V) -> Self {
        Self {
            inner,
            verifier,
            challenge: challenge_header(DEFAULT_REALM),
        }
    }

    pub fn with_realm(mut self, realm: &str) -> Self {
        self.challenge = challenge_header(realm);
        self
    }

    fn check(&self, headers: &HeaderMap) -> Verdict {
        let value = match headers.get(PROXY_AUTHORIZATION).map(HeaderValue::to_str) {
            Some(Ok(value)) => value,
            _ => return Verdict::Challenge,
        };

        let mut parts = value.split_whitespace();
        let token = match (parts.next(), parts.next(), parts.next()) {
            (Some("Basic"), Some(token), None) => token,
            _ => return Verdict::Challenge,
        };

        let decoded = match general_purpose::STANDARD.decode(token) {
            Ok(decoded) => decoded,
            Err(_) => return Verdict::Forbidden,
        };
        let decoded = match String::from_utf8(decoded) {
            Ok(decoded) => decoded,
            Err(_) => return Verdict::Forbidden,
        };

        match decoded.split_once(':') {
            Some((username, password)) if self.verifier.verify(username, password) => Verdict::Accepted,
            _ => Verdict::Forbidden,
        }
    }
}

fn challenge_header(realm: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("Basic realm=\"{}\"", realm))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic realm=\"httproxy\""))
}

#[async_trait]
impl<H, V> Handler for BasicAuth<H, V>
where
    H: Handler,
    V: Verifier,
{
    async fn handle(&self, exchange: &mut Exchange<'_>) -> Result<()> {
        match self.check(exchange.headers()) {
            Verdict::Accepted => {
                exchange.headers_mut().remove(PROXY_AUTHORIZATION);
                self.inner.handle(exchange).await
            }
            Verdict::Challenge => {
                debug!("Challenging {} for proxy credentials", exchange.remote_addr());
                let mut headers = HeaderMap::new();
                headers.insert(PROXY_AUTHENTICATE, self.challenge.clone());
                exchange
                    .respond(
                        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                        with_text_type(headers),
                        Bytes::from_static(b"require basic proxy auth\n"),
                    )
                    .await
            }
            Verdict::Forbidden => {
                debug!("Rejected proxy credentials from {}", exchange.remote_addr());
                exchange.close_after_response();
                exchange
                    .respond_text(StatusCode::FORBIDDEN, "authorization failed")
                    .await
            }
        }
    }
}

fn with_text_type(mut headers: HeaderMap) -> HeaderMap {
    headers.insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers
}
