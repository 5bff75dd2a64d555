//! Decision tracing enabled by `debug_mode`

use tokenlink_tokens::{AccessTokenRef, ExpiryStatus};

use crate::{coordinator::RefreshOutcome, error::AuthorizationError};

/// Emits a `DEBUG` event at each decision point of the link when enabled
///
/// Purely observational: nothing here can fail or alter the flow of a
/// request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    enabled: bool,
}

impl Diagnostics {
    /// Constructs a sink which emits events only if `enabled`
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Whether events are emitted
    #[inline]
    pub const fn is_enabled(self) -> bool {
        self.enabled
    }

    pub(crate) fn missing_access_token(self) {
        if self.enabled {
            tracing::debug!("no access token available, refresh required");
        }
    }

    pub(crate) fn expiry_checked(self, token: &AccessTokenRef, status: ExpiryStatus) {
        if !self.enabled {
            return;
        }

        match status {
            ExpiryStatus::Valid { remaining } => tracing::debug!(
                token = ?token,
                remaining = remaining.0,
                "access token is valid"
            ),
            ExpiryStatus::Expired => {
                tracing::debug!(token = ?token, "access token has expired, refresh required")
            }
            ExpiryStatus::Undecodable => tracing::debug!(
                token = ?token,
                "access token has no readable expiry, refresh required"
            ),
        }
    }

    pub(crate) fn refresh_started(self, api_url: &reqwest::Url) {
        if self.enabled {
            tracing::debug!(%api_url, "starting token refresh");
        }
    }

    pub(crate) fn refresh_joined(self) {
        if self.enabled {
            tracing::debug!("joining refresh already in flight");
        }
    }

    pub(crate) fn refresh_response(self, status: reqwest::StatusCode) {
        if self.enabled {
            tracing::debug!(
                response.status = status.as_u16(),
                "received refresh response"
            );
        }
    }

    pub(crate) fn refresh_settled(self, outcome: &RefreshOutcome) {
        if !self.enabled {
            return;
        }

        match outcome {
            RefreshOutcome::Success(pair) => tracing::debug!(
                access_token = ?pair.access_token(),
                "token refresh succeeded"
            ),
            RefreshOutcome::Failure(error) => tracing::debug!(
                error = (error as &dyn std::error::Error),
                "token refresh failed"
            ),
        }
    }

    pub(crate) fn request_aborted(self, error: &AuthorizationError) {
        if self.enabled {
            tracing::debug!(
                error = (error as &dyn std::error::Error),
                "aborting request without a valid access token"
            );
        }
    }

    pub(crate) fn token_attached(self) {
        if self.enabled {
            tracing::debug!("attached access token to request");
        }
    }
}
