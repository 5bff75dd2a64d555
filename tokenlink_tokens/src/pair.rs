use serde::{Deserialize, Serialize};

use crate::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef};

/// The access and refresh tokens as currently known to the caller
///
/// A pair is never updated in place. A completed refresh produces a new
/// pair which replaces the old one wherever the caller keeps it.
///
/// Either token may be missing, such as before a user has signed in.
/// Empty strings are treated the same as missing tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<AccessToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
}

impl CredentialPair {
    /// Constructs a pair from an access token and a refresh token
    pub fn new(access_token: impl Into<AccessToken>, refresh_token: impl Into<RefreshToken>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }

    /// Constructs a pair from tokens that may or may not be present
    pub fn from_parts(access_token: Option<AccessToken>, refresh_token: Option<RefreshToken>) -> Self {
        Self {
            access_token,
            refresh_token,
        }
    }

    /// A pair holding no tokens at all
    pub const fn empty() -> Self {
        Self {
            access_token: None,
            refresh_token: None,
        }
    }

    /// The access token, if present and non-empty
    pub fn access_token(&self) -> Option<&AccessTokenRef> {
        self.access_token
            .as_deref()
            .filter(|t| !t.as_str().is_empty())
    }

    /// The refresh token, if present and non-empty
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token
            .as_deref()
            .filter(|t| !t.as_str().is_empty())
    }

    /// Whether both tokens are present and non-empty
    ///
    /// Only usable pairs are accepted as the result of a refresh.
    pub fn is_usable(&self) -> bool {
        self.access_token().is_some() && self.refresh_token().is_some()
    }
}
