//! Middleware to keep outgoing requests authorized with a fresh access token
//!
//! A [`TokenLink`] sits in a [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware)
//! stack ahead of the transport. For each outbound request it:
//!
//! 1. asks the application's [`TokenStore`] for the current [`CredentialPair`];
//! 2. checks whether the access token has expired (or is about to), and if so
//!    refreshes the pair through the refresh endpoint;
//! 3. attaches `Authorization: Bearer <access token>` and forwards the request.
//!
//! Refreshes are single-flight: any number of requests that find the token
//! expired at the same time share one refresh request and its outcome. If
//! the refresh fails, the request is aborted with an [`AuthorizationError`]
//! instead of being sent without valid credentials.
//!
//! The link never stores tokens and never parses the refresh response
//! itself. Those concerns belong to the application's hooks:
//! [`TokenStore`], [`RefreshBodySource`], and [`RefreshCompletion`].
//!
//! ```
//! use async_trait::async_trait;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use tokenlink::{
//!     hooks::{graphql_body, HookError, InMemoryTokenStore, RefreshResponse},
//!     RefreshBodySource, RefreshCompletion, TokenLink,
//! };
//! use tokenlink_tokens::{AccessToken, CredentialPair, RefreshToken};
//!
//! struct SessionHooks {
//!     store: InMemoryTokenStore,
//! }
//!
//! #[async_trait]
//! impl RefreshBodySource for SessionHooks {
//!     async fn fetch_body(&self, current: &CredentialPair) -> Result<serde_json::Value, HookError> {
//!         Ok(graphql_body(
//!             "mutation Refresh($token: String!) { refresh(token: $token) { access refresh } }",
//!             serde_json::json!({ "token": current.refresh_token().map(|t| t.as_str()) }),
//!         ))
//!     }
//! }
//!
//! #[async_trait]
//! impl RefreshCompletion for SessionHooks {
//!     async fn on_refresh_complete(
//!         &self,
//!         response: RefreshResponse,
//!     ) -> Result<Option<CredentialPair>, HookError> {
//!         let body: serde_json::Value = response.json()?;
//!         let refreshed = &body["data"]["refresh"];
//!         let pair = match (refreshed["access"].as_str(), refreshed["refresh"].as_str()) {
//!             (Some(access), Some(refresh)) => CredentialPair::new(
//!                 AccessToken::new(access.to_owned()),
//!                 RefreshToken::new(refresh.to_owned()),
//!             ),
//!             // Signed out; the link aborts the request
//!             _ => return Ok(None),
//!         };
//!         self.store.replace(pair.clone()).await;
//!         Ok(Some(pair))
//!     }
//! }
//!
//! # fn main() -> Result<(), tokenlink::ConfigurationError> {
//! let store = InMemoryTokenStore::default();
//!
//! let link = TokenLink::builder()
//!     .api_url("https://auth.example.com/graphql")
//!     .token_store(store.clone())
//!     .body_source(SessionHooks { store: store.clone() })
//!     .on_refresh_complete(SessionHooks { store })
//!     .build()?;
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(link)
//!     .build();
//! # Ok(()) }
//! ```
//!
//! The link can also be restricted to particular requests, with any
//! [`Predicate`] over a [`reqwest::Request`]. Requests that fail the
//! predicate are forwarded untouched, as are requests that already carry
//! an `Authorization` header.
//!
//! ```
//! # use tokenlink::{SameOrigin, TokenLink};
//! use predicates::prelude::PredicateBooleanExt;
//! # fn restrict(link: TokenLink) -> Result<(), url::ParseError> {
//! let api = SameOrigin::parse("https://api.example.com")?;
//! let uploads = SameOrigin::parse("https://uploads.example.com")?;
//! let link = link.with_predicate(api.or(uploads));
//! # Ok(()) }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, sync::Arc};

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response};
use reqwest_middleware::{Middleware, Next, Result};
use tokenlink_tokens::{
    clock::{Clock, System},
    AccessToken, AccessTokenRef, CredentialPair, ExpiryEvaluator,
};

mod config;
pub mod coordinator;
pub mod diagnostics;
mod error;
pub mod hooks;

pub use config::{LinkOptions, TokenLinkBuilder};
pub use coordinator::{RefreshCoordinator, RefreshOutcome};
pub use diagnostics::Diagnostics;
pub use error::{AuthorizationError, ConfigurationError, Hook, RefreshError};
pub use hooks::{RefreshBodySource, RefreshCompletion, TokenStore};

/// A middleware that authorizes outgoing requests, refreshing the access token as needed
#[derive(Clone)]
pub struct TokenLink<C = System, P = AnyRequest> {
    store: Arc<dyn TokenStore>,
    evaluator: ExpiryEvaluator<C>,
    coordinator: RefreshCoordinator,
    diagnostics: Diagnostics,
    predicate: P,
}

impl<C: fmt::Debug, P: fmt::Debug> fmt::Debug for TokenLink<C, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenLink")
            .field("evaluator", &self.evaluator)
            .field("coordinator", &self.coordinator)
            .field("diagnostics", &self.diagnostics)
            .field("predicate", &self.predicate)
            .finish_non_exhaustive()
    }
}

impl TokenLink {
    /// Starts configuring a new link
    pub fn builder() -> TokenLinkBuilder {
        TokenLinkBuilder::new()
    }
}

impl<C, P> TokenLink<C, P> {
    pub(crate) fn from_parts(
        store: Arc<dyn TokenStore>,
        evaluator: ExpiryEvaluator<C>,
        coordinator: RefreshCoordinator,
        diagnostics: Diagnostics,
        predicate: P,
    ) -> Self {
        Self {
            store,
            evaluator,
            coordinator,
            diagnostics,
            predicate,
        }
    }

    /// Replaces the predicate deciding which requests are authorized
    pub fn with_predicate<Q>(self, predicate: Q) -> TokenLink<C, Q> {
        TokenLink {
            store: self.store,
            evaluator: self.evaluator,
            coordinator: self.coordinator,
            diagnostics: self.diagnostics,
            predicate,
        }
    }

    /// The diagnostics sink used by this link
    #[inline]
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    /// The refresh coordinator shared by all clones of this link
    #[inline]
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }
}

impl<C, P> TokenLink<C, P>
where
    C: Clock + Send + Sync + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    /// The middleware stages to place, in order, ahead of the transport
    pub fn stages(self) -> Vec<Arc<dyn Middleware>> {
        vec![Arc::new(self)]
    }
}

impl<C: Clock, P> TokenLink<C, P> {
    /// Gets an access token that is not known to be expired
    ///
    /// Refreshes the credential pair first if the current access token is
    /// missing, unreadable, or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the token store fails, or if a required refresh
    /// fails.
    pub async fn authorize(&self) -> std::result::Result<AccessToken, AuthorizationError> {
        let settled = self.coordinator.settled_count();
        let mut current = self.current_tokens().await?;
        if let Some(token) = self.unexpired_token(&current) {
            return Ok(token);
        }

        // A refresh settled while the store was being read; that pair may be stale.
        if self.coordinator.settled_count() != settled {
            current = self.current_tokens().await?;
            if let Some(token) = self.unexpired_token(&current) {
                return Ok(token);
            }
        }

        let refreshed: CredentialPair = self
            .coordinator
            .refresh(current)
            .await
            .into_result()?;

        refreshed
            .access_token()
            .map(ToOwned::to_owned)
            .ok_or(AuthorizationError::Refresh(RefreshError::NoUsableTokens))
    }

    async fn current_tokens(&self) -> std::result::Result<CredentialPair, AuthorizationError> {
        self.store
            .get_tokens()
            .await
            .map_err(AuthorizationError::TokenStore)
    }

    fn unexpired_token(&self, pair: &CredentialPair) -> Option<AccessToken> {
        let Some(token) = pair.access_token() else {
            self.diagnostics.missing_access_token();
            return None;
        };

        let status = self.evaluator.status(token);
        self.diagnostics.expiry_checked(token, status);
        (!status.needs_refresh()).then(|| token.to_owned())
    }

    async fn authorization_header(
        &self,
    ) -> std::result::Result<header::HeaderValue, AuthorizationError> {
        let token = self.authorize().await?;
        Ok(bearer(&token)?)
    }
}

fn bearer(
    token: &AccessTokenRef,
) -> std::result::Result<header::HeaderValue, header::InvalidHeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<C, P> Middleware for TokenLink<C, P>
where
    C: Clock + Send + Sync + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if self.predicate.eval(&req) && !req.headers().contains_key(header::AUTHORIZATION) {
            let value = self.authorization_header().await.map_err(|err| {
                self.diagnostics.request_aborted(&err);
                reqwest_middleware::Error::middleware(err)
            })?;

            req.headers_mut().insert(header::AUTHORIZATION, value);
            self.diagnostics.token_attached();
        }

        next.run(req, extensions).await
    }
}

/// Authorize every request
#[derive(Clone, Copy, Debug, Default)]
pub struct AnyRequest;

impl Predicate<Request> for AnyRequest {
    #[inline]
    fn eval(&self, _: &Request) -> bool {
        true
    }
}

impl reflection::PredicateReflection for AnyRequest {}
impl fmt::Display for AnyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any request")
    }
}

/// Authorize only requests bound for a single origin
///
/// The origin is the scheme, host, and port of a URL. A link scoped to
/// `https://api.example.com` leaves plain-HTTP requests, other ports, and
/// other hosts alone, so the access token is only ever sent to its API.
#[derive(Clone, Debug)]
pub struct SameOrigin {
    origin: url::Origin,
}

impl SameOrigin {
    /// Scopes the link to the origin of `url`
    pub fn new(url: &reqwest::Url) -> Self {
        Self {
            origin: url.origin(),
        }
    }

    /// Parses `url` and scopes the link to its origin
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is not an absolute URL.
    pub fn parse(url: &str) -> std::result::Result<Self, url::ParseError> {
        reqwest::Url::parse(url).map(|url| Self::new(&url))
    }
}

impl Predicate<Request> for SameOrigin {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().origin() == self.origin
    }
}

impl reflection::PredicateReflection for SameOrigin {}
impl fmt::Display for SameOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "origin is {}", self.origin.ascii_serialization())
    }
}
