//! Caller-supplied collaborators
//!
//! The link never owns token storage and never interprets the refresh
//! endpoint's response. Those decisions belong to the application and are
//! plugged in through the traits in this module.

use std::{error, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::HeaderMap, StatusCode};
use tokenlink_tokens::CredentialPair;
use tokio::sync::RwLock;

/// The error type returned by caller-supplied hooks
pub type HookError = Box<dyn error::Error + Send + Sync + 'static>;

/// The source of the current credential pair
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Gets the tokens currently held by the application
    ///
    /// Return [`CredentialPair::empty()`] rather than an error when there
    /// simply are no tokens yet.
    async fn get_tokens(&self) -> Result<CredentialPair, HookError>;
}

/// Produces the body of a refresh request
#[async_trait]
pub trait RefreshBodySource: Send + Sync {
    /// Builds the JSON body sent to the refresh endpoint
    ///
    /// `current` is the pair that was found to be expired, which will
    /// usually provide the refresh token to send.
    async fn fetch_body(&self, current: &CredentialPair) -> Result<serde_json::Value, HookError>;
}

/// Interprets the response from the refresh endpoint
#[async_trait]
pub trait RefreshCompletion: Send + Sync {
    /// Extracts the new credential pair from the refresh response
    ///
    /// Returning `Ok(None)`, or a pair missing either token, marks the
    /// refresh as failed. This is the place to persist new tokens, and to
    /// sign the user out when the refresh is rejected.
    async fn on_refresh_complete(
        &self,
        response: RefreshResponse,
    ) -> Result<Option<CredentialPair>, HookError>;
}

/// A fully read response from the refresh endpoint
#[derive(Clone, Debug)]
pub struct RefreshResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl RefreshResponse {
    /// Constructs a response from its parts
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// The response status
    ///
    /// The link forwards every status to the completion hook untouched.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response headers
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The raw response body
    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The response body as text, replacing invalid UTF-8
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Deserializes the response body as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }
}

/// Builds a GraphQL request body from a document and its variables
pub fn graphql_body(query: impl Into<String>, variables: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "query": query.into(),
        "variables": variables,
    })
}

/// A token store that keeps the current pair in memory
///
/// Clones share the same pair, so a clone can be given to the link while
/// the completion hook keeps another to persist refreshed tokens.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTokenStore {
    pair: Arc<RwLock<CredentialPair>>,
}

impl InMemoryTokenStore {
    /// Constructs a store holding `pair`
    pub fn new(pair: CredentialPair) -> Self {
        Self {
            pair: Arc::new(RwLock::new(pair)),
        }
    }

    /// Replaces the stored pair
    pub async fn replace(&self, pair: CredentialPair) {
        *self.pair.write().await = pair;
    }

    /// Gets a copy of the stored pair
    pub async fn current(&self) -> CredentialPair {
        self.pair.read().await.clone()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get_tokens(&self) -> Result<CredentialPair, HookError> {
        Ok(self.current().await)
    }
}
