//! # Subscriber Identity
//!
//! Turns an incoming upgrade request into the [`Uuid`] a connection is
//! registered under. Resolution runs before the upgrade, so a rejected
//! request never reaches the connection manager.
//!
//! [`SubscriberIdResolver`] reads the id from the `subscriber_id` query
//! parameter or the `x-subscriber-id` header. When built with an API key it
//! also requires that key as `Authorization: Bearer <key>` or `x-api-key`.
//! Any `Fn(&ConnectionContext) -> Result<Uuid>` closure is a resolver too.

use std::collections::HashMap;

use axum::http::HeaderMap;
use uuid::Uuid;

use crate::core::error::{PipelineError, Result};

/// Header carrying the subscriber id.
pub const SUBSCRIBER_HEADER: &str = "x-subscriber-id";
/// Query parameter carrying the subscriber id.
pub const SUBSCRIBER_QUERY: &str = "subscriber_id";
/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// What a resolver gets to see of the request.
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    /// Request headers.
    pub headers: HeaderMap,
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
}

impl ConnectionContext {
    /// Bundles request parts.
    pub fn new(headers: HeaderMap, query: HashMap<String, String>) -> Self {
        Self { headers, query }
    }

    /// A header value as text, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Resolves the identity of a connection.
pub trait IdentityResolver: Send + Sync + 'static {
    /// The identity, or [`PipelineError::Unauthorized`].
    fn resolve(&self, ctx: &ConnectionContext) -> Result<Uuid>;
}

impl<F> IdentityResolver for F
where
    F: Fn(&ConnectionContext) -> Result<Uuid> + Send + Sync + 'static,
{
    fn resolve(&self, ctx: &ConnectionContext) -> Result<Uuid> {
        self(ctx)
    }
}

/// Reads the subscriber id from the request, optionally gated by an API key.
#[derive(Debug, Clone, Default)]
pub struct SubscriberIdResolver {
    api_key: Option<String>,
}

impl SubscriberIdResolver {
    /// Accepts any request carrying a subscriber id.
    pub fn open() -> Self {
        Self { api_key: None }
    }

    /// Additionally requires `api_key`. An empty key means no gate.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        Self {
            api_key: (!api_key.is_empty()).then_some(api_key),
        }
    }

    fn presented_key<'a>(&self, ctx: &'a ConnectionContext) -> Option<&'a str> {
        ctx.header(API_KEY_HEADER).or_else(|| {
            ctx.header(axum::http::header::AUTHORIZATION.as_str())?
                .strip_prefix("Bearer ")
        })
    }
}

impl IdentityResolver for SubscriberIdResolver {
    fn resolve(&self, ctx: &ConnectionContext) -> Result<Uuid> {
        if let Some(expected) = &self.api_key {
            if self.presented_key(ctx) != Some(expected.as_str()) {
                return Err(PipelineError::Unauthorized);
            }
        }

        let raw = ctx
            .query
            .get(SUBSCRIBER_QUERY)
            .map(String::as_str)
            .or_else(|| ctx.header(SUBSCRIBER_HEADER))
            .ok_or(PipelineError::Unauthorized)?;
        Uuid::parse_str(raw.trim()).map_err(|_| PipelineError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn ctx(headers: &[(&'static str, &str)], query: &[(&str, &str)]) -> ConnectionContext {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        let query = query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConnectionContext::new(map, query)
    }

    #[test]
    fn query_then_header() {
        let (q, h) = (Uuid::new_v4(), Uuid::new_v4());
        let resolver = SubscriberIdResolver::open();
        let both = ctx(&[(SUBSCRIBER_HEADER, &h.to_string())], &[(SUBSCRIBER_QUERY, &q.to_string())]);
        assert_eq!(resolver.resolve(&both), Ok(q));
        let header_only = ctx(&[(SUBSCRIBER_HEADER, &h.to_string())], &[]);
        assert_eq!(resolver.resolve(&header_only), Ok(h));
    }

    #[test]
    fn missing_or_malformed_id_is_unauthorized() {
        let resolver = SubscriberIdResolver::open();
        assert_eq!(resolver.resolve(&ctx(&[], &[])), Err(PipelineError::Unauthorized));
        assert_eq!(
            resolver.resolve(&ctx(&[], &[(SUBSCRIBER_QUERY, "driver-7")])),
            Err(PipelineError::Unauthorized)
        );
    }

    #[test]
    fn api_key_gate() {
        let id = Uuid::new_v4().to_string();
        let resolver = SubscriberIdResolver::with_api_key("s3cret");

        let none = ctx(&[], &[(SUBSCRIBER_QUERY, &id)]);
        assert_eq!(resolver.resolve(&none), Err(PipelineError::Unauthorized));

        let wrong = ctx(&[(API_KEY_HEADER, "nope")], &[(SUBSCRIBER_QUERY, &id)]);
        assert_eq!(resolver.resolve(&wrong), Err(PipelineError::Unauthorized));

        let bearer = ctx(&[("authorization", "Bearer s3cret")], &[(SUBSCRIBER_QUERY, &id)]);
        assert!(resolver.resolve(&bearer).is_ok());

        let header = ctx(&[(API_KEY_HEADER, "s3cret")], &[(SUBSCRIBER_QUERY, &id)]);
        assert!(resolver.resolve(&header).is_ok());

        assert!(SubscriberIdResolver::with_api_key("").resolve(&none).is_ok());
    }

    #[test]
    fn closures_resolve() {
        let fixed = Uuid::new_v4();
        let resolver = move |_: &ConnectionContext| -> Result<Uuid> { Ok(fixed) };
        assert_eq!(resolver.resolve(&ConnectionContext::default()), Ok(fixed));
    }
}
