//! Deciding whether an access token needs to be refreshed before use
//!
//! The decision is advisory. It saves a round trip with a token that the
//! API would reject anyway, so any doubt resolves toward refreshing.

use crate::{
    claims,
    clock::{Clock, DurationSecs, System},
    AccessTokenRef,
};

/// The usability of an access token at a point in time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryStatus {
    /// The token is usable for at least this long past the configured skew
    Valid {
        /// Time left before the token enters the skew window
        remaining: DurationSecs,
    },
    /// The token has expired or is within the skew window
    Expired,
    /// The token's claims could not be read or carry no expiry
    Undecodable,
}

impl ExpiryStatus {
    /// Whether the token should be refreshed before it is sent
    #[inline]
    pub fn needs_refresh(self) -> bool {
        !matches!(self, ExpiryStatus::Valid { .. })
    }
}

/// Evaluates access token expiry against a clock, with an optional early margin
#[derive(Clone, Debug)]
pub struct ExpiryEvaluator<C = System> {
    skew: DurationSecs,
    clock: C,
}

impl Default for ExpiryEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiryEvaluator {
    /// Constructs an evaluator with no skew, using the system clock
    pub const fn new() -> Self {
        Self {
            skew: DurationSecs(0),
            clock: System,
        }
    }
}

impl<C> ExpiryEvaluator<C> {
    /// Treats tokens as expired `skew` before their actual expiry
    pub fn with_skew(mut self, skew: DurationSecs) -> Self {
        self.skew = skew;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> ExpiryEvaluator<D> {
        ExpiryEvaluator {
            skew: self.skew,
            clock,
        }
    }

    /// The configured skew
    #[inline]
    pub fn skew(&self) -> DurationSecs {
        self.skew
    }
}

impl<C: Clock> ExpiryEvaluator<C> {
    /// Gets the token's status as of the evaluator's clock
    pub fn status(&self, token: &AccessTokenRef) -> ExpiryStatus {
        let Ok(Some(exp)) = claims::decode_expiry(token) else {
            return ExpiryStatus::Undecodable;
        };

        let threshold = self.clock.now().0.saturating_add(self.skew.0);
        if exp.0 <= threshold {
            ExpiryStatus::Expired
        } else {
            ExpiryStatus::Valid {
                remaining: DurationSecs(exp.0 - threshold),
            }
        }
    }

    /// Whether the token should be refreshed before it is sent
    ///
    /// True when the token cannot be decoded, carries no `exp` claim, or
    /// `exp <= now + skew`.
    #[inline]
    pub fn is_expired(&self, token: &AccessTokenRef) -> bool {
        self.status(token).needs_refresh()
    }
}

/// Whether `token` is expired, or will be within `skew_seconds`, by the system clock
pub fn is_expired(token: &AccessTokenRef, skew_seconds: u64) -> bool {
    ExpiryEvaluator::new()
        .with_skew(DurationSecs(skew_seconds))
        .is_expired(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        claims::tests::unsigned_token,
        clock::{DurationSecs, TestClock, UnixTime},
        AccessToken,
    };

    const NOW: u64 = 1_700_000_000;

    fn token_expiring_at(exp: u64) -> AccessToken {
        unsigned_token(&format!(r#"{{"exp":{}}}"#, exp))
    }

    fn evaluator(skew: u64) -> ExpiryEvaluator<TestClock> {
        ExpiryEvaluator::new()
            .with_skew(DurationSecs(skew))
            .with_clock(TestClock::new(UnixTime(NOW)))
    }

    mod without_skew {
        use super::*;

        #[test]
        fn token_expired_in_the_past_is_expired() {
            let token = token_expiring_at(NOW - 10);
            assert_eq!(evaluator(0).status(&token), ExpiryStatus::Expired);
            assert!(evaluator(0).is_expired(&token));
        }

        #[test]
        fn token_expiring_right_now_is_expired() {
            assert!(evaluator(0).is_expired(&token_expiring_at(NOW)));
        }

        #[test]
        fn token_expiring_in_an_hour_is_valid() {
            let token = token_expiring_at(NOW + 3600);
            assert_eq!(
                evaluator(0).status(&token),
                ExpiryStatus::Valid {
                    remaining: DurationSecs(3600)
                }
            );
            assert!(!evaluator(0).is_expired(&token));
        }

        #[test]
        fn every_past_expiry_is_expired() {
            for back in [1, 59, 3600, NOW - 1] {
                assert!(evaluator(0).is_expired(&token_expiring_at(NOW - back)));
            }
        }
    }

    mod with_skew {
        use super::*;

        #[test]
        fn token_inside_the_skew_window_is_expired() {
            let token = token_expiring_at(NOW + 30);
            assert!(evaluator(60).is_expired(&token));
        }

        #[test]
        fn token_at_the_skew_boundary_is_expired() {
            assert!(evaluator(60).is_expired(&token_expiring_at(NOW + 60)));
        }

        #[test]
        fn token_beyond_the_skew_window_is_valid() {
            let token = token_expiring_at(NOW + 61);
            assert_eq!(
                evaluator(60).status(&token),
                ExpiryStatus::Valid {
                    remaining: DurationSecs(1)
                }
            );
        }
    }

    mod unrelated_claims {
        use super::*;

        fn token_with(extra: &str) -> AccessToken {
            unsigned_token(&format!(r#"{{"exp":{},{}}}"#, NOW + 3600, extra))
        }

        #[test]
        fn numeric_subject_does_not_hide_the_expiry() {
            assert!(!evaluator(0).is_expired(&token_with(r#""sub":42"#)));
        }

        #[test]
        fn textual_issue_time_does_not_hide_the_expiry() {
            assert!(!evaluator(0).is_expired(&token_with(r#""iat":"2023-11-14""#)));
        }

        #[test]
        fn negative_not_before_does_not_hide_the_expiry() {
            assert_eq!(
                evaluator(0).status(&token_with(r#""nbf":-1"#)),
                ExpiryStatus::Valid {
                    remaining: DurationSecs(3600)
                }
            );
        }
    }

    mod undecodable_tokens {
        use super::*;

        #[test]
        fn opaque_token_is_expired() {
            let token = AccessToken::from_static("opaque-token");
            assert_eq!(evaluator(0).status(&token), ExpiryStatus::Undecodable);
            assert!(evaluator(0).is_expired(&token));
        }

        #[test]
        fn token_without_exp_is_expired() {
            let token = unsigned_token(r#"{"sub":"someone"}"#);
            assert_eq!(evaluator(0).status(&token), ExpiryStatus::Undecodable);
        }

        #[test]
        fn empty_token_is_expired() {
            assert!(is_expired(AccessTokenRef::from_str(""), 0));
        }
    }

    #[test]
    fn advancing_the_clock_expires_a_token() {
        let clock = TestClock::new(UnixTime(NOW));
        let token = token_expiring_at(NOW + 5);

        assert!(!ExpiryEvaluator::new().with_clock(clock.clone()).is_expired(&token));
        clock.advance(DurationSecs(5));
        assert!(ExpiryEvaluator::new().with_clock(clock).is_expired(&token));
    }

    #[test]
    fn huge_skew_does_not_overflow() {
        let token = token_expiring_at(NOW + 3600);
        assert!(evaluator(u64::MAX).is_expired(&token));
    }

    #[test]
    fn system_clock_helper_handles_far_future_tokens() {
        assert!(!is_expired(&token_expiring_at(u64::MAX / 2), 0));
        assert!(is_expired(&token_expiring_at(1), 0));
    }
}
