//! Errors raised while configuring a link or authorizing a request

use std::{error::Error as StdError, fmt, sync::Arc};

use thiserror::Error;

use crate::hooks::HookError;

/// A link could not be constructed from the supplied configuration
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A required option was not provided
    #[error("required option `{0}` was not provided")]
    Missing(&'static str),
    /// The refresh endpoint is not a valid URL
    #[error("`apiUrl` is not a valid URL")]
    InvalidApiUrl(#[from] url::ParseError),
    /// A refresh header name or value cannot be sent
    #[error("refresh header `{name}` is not a valid header")]
    InvalidHeader {
        /// The offending header name
        name: String,
    },
}

/// One of the caller-supplied refresh hooks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook {
    /// The hook producing the refresh request body
    FetchBody,
    /// The hook interpreting the refresh response
    OnRefreshComplete,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Hook::FetchBody => "fetch_body",
            Hook::OnRefreshComplete => "on_refresh_complete",
        })
    }
}

/// A refresh attempt did not produce a usable credential pair
///
/// Every request waiting on the same refresh receives a clone of the
/// same error.
#[derive(Clone, Debug, Error)]
pub enum RefreshError {
    /// The completion hook returned nothing, or a pair missing a token
    #[error("refresh completed without a usable access and refresh token")]
    NoUsableTokens,
    /// The refresh request could not be sent or its response read
    #[error("error sending refresh request")]
    Request(#[source] Arc<reqwest::Error>),
    /// A caller-supplied hook failed
    #[error("refresh hook `{hook}` failed")]
    Hook {
        /// The hook that failed
        hook: Hook,
        /// The error returned by the hook
        #[source]
        source: Arc<dyn StdError + Send + Sync + 'static>,
    },
    /// The refresh task ended without reporting an outcome
    #[error("refresh was interrupted before it completed")]
    Interrupted,
}

impl RefreshError {
    pub(crate) fn hook(hook: Hook, source: HookError) -> Self {
        Self::Hook {
            hook,
            source: Arc::from(source),
        }
    }
}

impl From<reqwest::Error> for RefreshError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(Arc::new(err))
    }
}

/// An outgoing request was aborted because no valid access token was available
#[derive(Debug, Error)]
pub enum AuthorizationError {
    /// The token store failed to provide the current tokens
    #[error("token store failed to provide the current tokens")]
    TokenStore(#[source] HookError),
    /// The access token needed a refresh, and the refresh failed
    #[error("access token could not be refreshed")]
    Refresh(#[from] RefreshError),
    /// The access token contains bytes that cannot be sent in a header
    #[error("access token cannot be used as a header value")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
}

impl AuthorizationError {
    /// Finds the authorization error behind a failed middleware request, if any
    pub fn find(err: &reqwest_middleware::Error) -> Option<&AuthorizationError> {
        if let reqwest_middleware::Error::Middleware(err) = err {
            err.downcast_ref()
        } else {
            None
        }
    }
}
