use aliri_braid::braid;
use std::fmt;

/// Formats a credential without exposing it
///
/// At most `shown` leading characters are written, and only when the
/// credential is long enough that they are a small fraction of it.
struct Redacted<'a> {
    secret: &'a str,
    shown: usize,
}

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.shown == 0 || self.secret.len() < self.shown * 4 {
            return f.write_str("<redacted>");
        }

        match self.secret.char_indices().nth(self.shown) {
            Some((end, _)) => write!(f, "{}…", &self.secret[..end]),
            None => f.write_str("<redacted>"),
        }
    }
}

macro_rules! redacted {
    ($ty:ty: $name:literal, shown = $shown:literal) => {
        impl $ty {
            fn redacted(&self) -> Redacted<'_> {
                Redacted {
                    secret: self.as_str(),
                    shown: $shown,
                }
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_tuple($name).field(&self.redacted()).finish()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self.redacted(), f)
            }
        }
    };
}

/// A short-lived access token, attached to outgoing requests
///
/// Formatting shows at most the first few characters, which for a JWT
/// is part of the unsigned header.
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef: "AccessToken", shown = 6);

/// A long-lived refresh token, only ever sent to the refresh endpoint
///
/// Formatting never shows any part of it.
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

redacted!(RefreshTokenRef: "RefreshToken", shown = 0);

#[cfg(test)]
mod tests {
    use super::*;

    const JWT: &str = "eyJhbGciOiJIUzI1NiJ9.eyJleHAiOjF9.c2lnbmF0dXJl";

    #[test]
    fn access_token_shows_only_a_short_prefix() {
        let token = AccessToken::from_static(JWT);
        assert_eq!(format!("{:?}", token), "AccessToken(eyJhbG…)");
        assert_eq!(format!("{}", token), "eyJhbG…");
    }

    #[test]
    fn short_access_tokens_are_fully_hidden() {
        let token = AccessToken::from_static("A2");
        assert_eq!(format!("{:?}", token), "AccessToken(<redacted>)");
        assert_eq!(format!("{}", token), "<redacted>");
    }

    #[test]
    fn refresh_token_is_never_shown() {
        let token = RefreshToken::from_static("r-0123456789abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{:?}", token), "RefreshToken(<redacted>)");
        assert_eq!(format!("{:#}", token), "<redacted>");
    }

    #[test]
    fn borrowed_and_owned_tokens_format_alike() {
        let token = AccessToken::from_static(JWT);
        let borrowed: &AccessTokenRef = &token;
        assert_eq!(format!("{:?}", borrowed), format!("{:?}", token));
    }
}
