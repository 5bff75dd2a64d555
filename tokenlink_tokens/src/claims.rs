//! Unverified access token claims
//!
//! **WARNING:** *Nothing in this module validates a token's signature.*
//! The claims are read only to guess whether a token is worth sending or
//! should be refreshed first. An adversary who can forge these claims can
//! cause an early refresh and nothing more; the refresh endpoint and the
//! API itself remain responsible for validating every credential.

use base64::{
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::{clock::UnixTime, AccessTokenRef};

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The access token does not carry a readable claims payload
#[derive(Debug, Error)]
pub enum MalformedToken {
    /// The token is not made up of exactly three `.`-separated segments
    #[error("token does not have a header, payload, and signature segment")]
    Segments,
    /// The payload segment is not valid base64url
    #[error("token payload is not valid base64url")]
    Base64(#[from] base64::DecodeError),
    /// The payload segment is not a JSON claims object
    #[error("token payload is not a JSON claims object")]
    Json(#[from] serde_json::Error),
}

/// Registered claims read from an access token without verification
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[must_use]
pub struct DecodedClaims {
    /// Time at which the token expires
    #[serde(default, deserialize_with = "numeric_date")]
    pub exp: Option<UnixTime>,
    /// Time at which the token was issued
    #[serde(default, deserialize_with = "numeric_date")]
    pub iat: Option<UnixTime>,
    /// Time before which the token must not be accepted
    #[serde(default, deserialize_with = "numeric_date")]
    pub nbf: Option<UnixTime>,
    /// The subject of the token
    #[serde(default)]
    pub sub: Option<String>,
}

/// Reads the claims of an access token without verifying it
///
/// # Errors
///
/// Returns an error if the token is not a three-part compact JWT or if
/// its payload cannot be decoded into a claims object.
pub fn decode_unverified(token: &AccessTokenRef) -> Result<DecodedClaims, MalformedToken> {
    Ok(serde_json::from_slice(&payload(token)?)?)
}

#[derive(Deserialize)]
struct ExpiryClaim {
    #[serde(default, deserialize_with = "numeric_date")]
    exp: Option<UnixTime>,
}

/// Reads only the `exp` claim of an access token without verifying it
///
/// Other claims are ignored, however they are typed, so a token with an
/// unusual `sub` or `iat` still has a readable expiry.
///
/// # Errors
///
/// Returns an error if the token is not a three-part compact JWT, if its
/// payload is not a JSON object, or if `exp` is not a non-negative number.
pub fn decode_expiry(token: &AccessTokenRef) -> Result<Option<UnixTime>, MalformedToken> {
    let claim: ExpiryClaim = serde_json::from_slice(&payload(token)?)?;
    Ok(claim.exp)
}

fn payload(token: &AccessTokenRef) -> Result<Vec<u8>, MalformedToken> {
    let mut segments = token.as_str().split('.');
    let payload = match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(MalformedToken::Segments),
    };

    Ok(URL_SAFE_LENIENT.decode(payload)?)
}

// NumericDate allows fractional seconds; those are truncated.
fn numeric_date<'de, D>(deserializer: D) -> Result<Option<UnixTime>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = Option::<serde_json::Number>::deserialize(deserializer)?;
    value
        .map(|n| {
            if let Some(secs) = n.as_u64() {
                Ok(UnixTime(secs))
            } else {
                match n.as_f64() {
                    Some(secs) if secs >= 0.0 && secs.is_finite() => Ok(UnixTime(secs as u64)),
                    _ => Err(D::Error::custom("NumericDate must be a non-negative number")),
                }
            }
        })
        .transpose()
}
