//! Authentication and topic authorization
//!
//! Credentials are checked once at connect; the matched user's ACL is
//! snapshotted onto the session and evaluated per publish/subscribe. Rules
//! are ordered and the first whose filter matches decides; a topic with no
//! matching rule is allowed.

use std::fmt;

use ahash::AHashMap;
use bytes::Bytes;

use crate::config::{AuthConfig, UserConfig};
use crate::topic::topic_matches_filter;

/// One ACL rule: an action applied to every topic matching a filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclRule {
    Allow(String),
    Deny(String),
}

impl AclRule {
    fn filter(&self) -> &str {
        match self {
            AclRule::Allow(f) | AclRule::Deny(f) => f,
        }
    }

    /// Parse `"allow sensors/#"` / `"deny #"` config syntax
    pub fn parse(raw: &str) -> Result<Self, AclParseError> {
        let mut parts = raw.splitn(2, char::is_whitespace);
        let action = parts.next().unwrap_or("");
        let filter = parts.next().map(str::trim).unwrap_or("");
        if filter.is_empty() {
            return Err(AclParseError::MissingFilter(raw.to_string()));
        }
        match action {
            "allow" => Ok(AclRule::Allow(filter.to_string())),
            "deny" => Ok(AclRule::Deny(filter.to_string())),
            other => Err(AclParseError::UnknownAction(other.to_string())),
        }
    }
}

/// Malformed ACL rule in the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclParseError {
    UnknownAction(String),
    MissingFilter(String),
}

impl fmt::Display for AclParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAction(a) => write!(f, "unknown ACL action '{}', expected allow|deny", a),
            Self::MissingFilter(r) => write!(f, "ACL rule '{}' is missing a topic filter", r),
        }
    }
}

impl std::error::Error for AclParseError {}

/// Why a connect was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// Unknown user or wrong password
    BadCredentials,
    /// Anonymous connect while `allow_anonymous` is off
    AnonymousDisabled,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadCredentials => write!(f, "bad user name or password"),
            Self::AnonymousDisabled => write!(f, "anonymous connections are not allowed"),
        }
    }
}

impl std::error::Error for AuthError {}

struct User {
    password: String,
    acls: Vec<AclRule>,
}

/// Credential store plus per-user ACLs
pub struct Authorizer {
    allow_anonymous: bool,
    users: AHashMap<String, User>,
}

impl Authorizer {
    pub fn from_config(config: &AuthConfig) -> Result<Self, AclParseError> {
        let mut users = AHashMap::with_capacity(config.users.len());
        for user in &config.users {
            users.insert(user.name.clone(), User::from_config(user)?);
        }
        Ok(Self {
            allow_anonymous: config.allow_anonymous,
            users,
        })
    }

    /// An authorizer admitting everyone with an empty ACL
    pub fn allow_all() -> Self {
        Self {
            allow_anonymous: true,
            users: AHashMap::new(),
        }
    }

    /// Check credentials at connect time. Success yields the ACL to snapshot
    /// onto the session; anonymous clients get an empty one.
    pub fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&Bytes>,
    ) -> Result<Vec<AclRule>, AuthError> {
        let Some(username) = username else {
            return if self.allow_anonymous {
                Ok(Vec::new())
            } else {
                Err(AuthError::AnonymousDisabled)
            };
        };

        let user = self.users.get(username).ok_or(AuthError::BadCredentials)?;
        let supplied = password.map(|p| p.as_ref()).unwrap_or(&[]);
        if supplied == user.password.as_bytes() {
            Ok(user.acls.clone())
        } else {
            Err(AuthError::BadCredentials)
        }
    }

    /// First-match-wins evaluation; no match allows. The empty topic always
    /// fails (it is what an unresolved inbound alias leaves behind).
    pub fn authorize(topic: &str, acls: &[AclRule]) -> bool {
        if topic.is_empty() {
            return false;
        }
        for rule in acls {
            if topic_matches_filter(topic, rule.filter()) {
                return matches!(rule, AclRule::Allow(_));
            }
        }
        true
    }
}

impl User {
    fn from_config(config: &UserConfig) -> Result<Self, AclParseError> {
        let acls = config
            .acl
            .iter()
            .map(|raw| AclRule::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            password: config.password.clone(),
            acls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn rules() -> Vec<AclRule> {
        vec![
            AclRule::Deny("secret/#".to_string()),
            AclRule::Allow("secret/shared".to_string()),
            AclRule::Allow("sensors/+/temp".to_string()),
            AclRule::Deny("sensors/#".to_string()),
        ]
    }

    #[test_case("secret/a", false; "deny wins")]
    #[test_case("secret/shared", false; "first match wins over later allow")]
    #[test_case("sensors/1/temp", true; "allow before deny")]
    #[test_case("sensors/1/humidity", false; "fallthrough deny")]
    #[test_case("other/topic", true; "no match allows")]
    #[test_case("", false; "empty topic always fails")]
    fn first_match_wins(topic: &str, expected: bool) {
        assert_eq!(Authorizer::authorize(topic, &rules()), expected);
    }

    #[test]
    fn empty_acl_allows_everything_but_empty_topic() {
        assert!(Authorizer::authorize("any/topic", &[]));
        assert!(!Authorizer::authorize("", &[]));
    }

    #[test]
    fn rule_parsing() {
        assert_eq!(
            AclRule::parse("allow sensors/#"),
            Ok(AclRule::Allow("sensors/#".to_string()))
        );
        assert_eq!(AclRule::parse("deny #"), Ok(AclRule::Deny("#".to_string())));
        assert!(matches!(
            AclRule::parse("permit x"),
            Err(AclParseError::UnknownAction(_))
        ));
        assert!(matches!(
            AclRule::parse("allow"),
            Err(AclParseError::MissingFilter(_))
        ));
    }

    #[test]
    fn authentication() {
        let config = AuthConfig {
            allow_anonymous: false,
            users: vec![UserConfig {
                name: "alice".to_string(),
                password: "wonderland".to_string(),
                acl: vec!["allow sensors/#".to_string()],
            }],
        };
        let auth = Authorizer::from_config(&config).unwrap();

        let acl = auth
            .authenticate(Some("alice"), Some(&Bytes::from_static(b"wonderland")))
            .unwrap();
        assert_eq!(acl, vec![AclRule::Allow("sensors/#".to_string())]);

        assert_eq!(
            auth.authenticate(Some("alice"), Some(&Bytes::from_static(b"nope"))),
            Err(AuthError::BadCredentials)
        );
        assert_eq!(
            auth.authenticate(Some("mallory"), None),
            Err(AuthError::BadCredentials)
        );
        assert_eq!(auth.authenticate(None, None), Err(AuthError::AnonymousDisabled));
    }

    #[test]
    fn anonymous_allowed_gets_empty_acl() {
        let auth = Authorizer::allow_all();
        assert_eq!(auth.authenticate(None, None), Ok(Vec::new()));
    }
}
