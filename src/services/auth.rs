//! Bearer-token verification.

use chrono::Utc;
use std::collections::HashMap;

/// Result of checking a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Passed,
    Expired,
    Invalid,
}

pub trait Authenticator: Send + Sync {
    fn verify(&self, token: &str) -> AuthVerdict;
}

/// Fixed set of tokens, each with an optional expiry in Unix seconds.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Option<i64>>,
}

impl StaticTokens {
    pub fn new<I>(grants: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<i64>)>,
    {
        Self {
            tokens: grants.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn verify_at(&self, token: &str, now: i64) -> AuthVerdict {
        match self.tokens.get(token) {
            None => AuthVerdict::Invalid,
            Some(Some(expires)) if now >= *expires => AuthVerdict::Expired,
            Some(_) => AuthVerdict::Passed,
        }
    }
}

impl Authenticator for StaticTokens {
    fn verify(&self, token: &str) -> AuthVerdict {
        self.verify_at(token, Utc::now().timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> StaticTokens {
        StaticTokens::new([
            ("forever".to_string(), None),
            ("until-100".to_string(), Some(100)),
        ])
    }

    #[test]
    fn test_unknown_token_is_invalid() {
        assert_eq!(tokens().verify_at("nope", 0), AuthVerdict::Invalid);
        assert_eq!(tokens().verify_at("", 0), AuthVerdict::Invalid);
    }

    #[test]
    fn test_expiry() {
        let tokens = tokens();
        assert_eq!(tokens.verify_at("until-100", 99), AuthVerdict::Passed);
        assert_eq!(tokens.verify_at("until-100", 100), AuthVerdict::Expired);
        assert_eq!(tokens.verify_at("forever", i64::MAX), AuthVerdict::Passed);
    }

    #[test]
    fn test_verify_uses_wall_clock() {
        let tokens = StaticTokens::new([("old".to_string(), Some(1))]);
        assert_eq!(tokens.verify("old"), AuthVerdict::Expired);
        assert_eq!(tokens.len(), 1);
    }
}
