//! Credential primitives for keeping an access token fresh
//!
//! This crate holds the transport-independent half of `tokenlink`:
//!
//! * [`CredentialPair`], the access and refresh tokens as known to the
//!   caller, with redacting [`AccessToken`] and [`RefreshToken`] newtypes.
//! * [`claims`], which reads the registered claims of a compact JWT
//!   *without* verifying it.
//! * [`expiry`], which decides whether an access token should be refreshed
//!   before it is used.
//! * [`clock`], a re-export of [`aliri_clock`], so that expiry decisions
//!   can be tested against a fixed time.
//!
//! ```
//! use tokenlink_tokens::{
//!     clock::{DurationSecs, TestClock, UnixTime},
//!     expiry::ExpiryEvaluator,
//!     AccessToken,
//! };
//!
//! let evaluator = ExpiryEvaluator::new()
//!     .with_skew(DurationSecs(30))
//!     .with_clock(TestClock::new(UnixTime(1_700_000_000)));
//!
//! // Tokens that cannot be read are always due for a refresh
//! assert!(evaluator.is_expired(&AccessToken::from_static("opaque")));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod claims;
pub mod expiry;
mod pair;

pub use aliri_clock as clock;
pub use braids::*;
pub use expiry::{is_expired, ExpiryEvaluator, ExpiryStatus};
pub use pair::CredentialPair;
