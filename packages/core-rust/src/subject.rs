//! Subject grammar: endpoint derivation, well-known control subjects, and
//! wildcard matching.
//!
//! Subjects are case-sensitive, dot-delimited token sequences. `*` matches
//! exactly one token and `>` matches one or more trailing tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Well-known subjects
// ---------------------------------------------------------------------------

/// Prefix shared by every introspection subject.
pub const SRV_PREFIX: &str = "$SRV";

/// Subject every instance publishes its announcement to on start.
pub const REGISTRATION_SUBJECT: &str = "$SRV.REG";

/// Wildcard subject matching the disconnect advisory of every account.
pub const DISCONNECT_WILDCARD: &str = "$SYS.ACCOUNT.*.DISCONNECT";

/// Returns the disconnect advisory subject for a single account.
#[must_use]
pub fn disconnect_subject(account: &str) -> String {
    format!("$SYS.ACCOUNT.{account}.DISCONNECT")
}

/// Introspection verbs understood by every running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryVerb {
    Ping,
    Info,
    Stats,
}

impl DiscoveryVerb {
    pub const ALL: [DiscoveryVerb; 3] = [Self::Ping, Self::Info, Self::Stats];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Info => "INFO",
            Self::Stats => "STATS",
        }
    }

    /// Builds the introspection subject, optionally scoped to a service
    /// name and further to a single instance id.
    ///
    /// An instance id without a name is ignored: the convention has no
    /// id-only scope.
    #[must_use]
    pub fn subject(self, name: Option<&str>, id: Option<&str>) -> String {
        match (name, id) {
            (Some(name), Some(id)) => format!("{SRV_PREFIX}.{}.{name}.{id}", self.as_str()),
            (Some(name), None) => format!("{SRV_PREFIX}.{}.{name}", self.as_str()),
            _ => format!("{SRV_PREFIX}.{}", self.as_str()),
        }
    }

    /// All three scopes an instance must answer for this verb.
    #[must_use]
    pub fn subjects_for(self, name: &str, id: &str) -> [String; 3] {
        [
            self.subject(None, None),
            self.subject(Some(name), None),
            self.subject(Some(name), Some(id)),
        ]
    }
}

impl fmt::Display for DiscoveryVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Balancing and endpoints
// ---------------------------------------------------------------------------

/// How calls to a method are distributed across running instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalancingMode {
    /// Exactly one instance in the service's queue group receives each call.
    #[default]
    Balanced,
    /// Every instance receives every call.
    Unbalanced,
    /// Only the instance named in the subject receives the call.
    Local,
}

/// A derived, immutable wire binding for one method of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Subject (or subject pattern, for overrides) the instance subscribes to.
    pub subject: String,
    /// Registered method name.
    pub method: String,
    pub balancing: BalancingMode,
    /// Queue group used for the subscription; `None` means fan-out.
    pub queue_group: Option<String>,
}

/// Derives the wire endpoint for a method.
///
/// An explicit `subject_override` is used verbatim. Balanced methods share a
/// queue group named after the service whether or not the subject is
/// overridden; unbalanced and local methods never use one.
#[must_use]
pub fn derive_endpoint(
    service: &str,
    instance_id: &str,
    method: &str,
    subject_override: Option<&str>,
    balancing: BalancingMode,
) -> Endpoint {
    let subject = match (subject_override, balancing) {
        (Some(explicit), _) => explicit.to_string(),
        (None, BalancingMode::Local) => format!("{service}.{instance_id}.{method}"),
        (None, BalancingMode::Balanced | BalancingMode::Unbalanced) => {
            format!("{service}.{method}")
        }
    };
    let queue_group = match balancing {
        BalancingMode::Balanced => Some(service.to_string()),
        BalancingMode::Unbalanced | BalancingMode::Local => None,
    };
    Endpoint {
        subject,
        method: method.to_string(),
        balancing,
        queue_group,
    }
}

/// Default wire name for a method declared under `identifier`.
///
/// Strips a raw-identifier prefix and surrounding whitespace; the rest of
/// the identifier is kept as written. An explicit name always wins over this.
#[must_use]
pub fn default_method_name(identifier: &str) -> String {
    let trimmed = identifier.trim();
    trimmed.strip_prefix("r#").unwrap_or(trimmed).to_string()
}

// ---------------------------------------------------------------------------
// Validation and matching
// ---------------------------------------------------------------------------

/// Returns `true` if `token` can appear as a single literal subject token.
#[must_use]
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && !token
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

/// Returns `true` if `name` is usable as a service name: ASCII
/// alphanumerics, `-` and `_` only.
#[must_use]
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Returns `true` if `subject` is a well-formed subject or subscription
/// pattern. `>` is only allowed as the final token.
#[must_use]
pub fn is_valid_subject(subject: &str) -> bool {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return false;
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    tokens.iter().enumerate().all(|(i, token)| match *token {
        "" => false,
        ">" => i == last,
        "*" => true,
        t => !t.contains('*') && !t.contains('>'),
    })
}

/// Returns `true` if a concrete `subject` is matched by subscription `pattern`.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Returns `true` if some concrete subject is matched by both patterns.
#[must_use]
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split('.');
    let mut b_tokens = b.split('.');
    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (Some(">"), Some(_)) | (Some(_), Some(">")) | (None, None) => return true,
            (Some(x), Some(y)) if x == "*" || y == "*" || x == y => {}
            _ => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn balanced_uses_service_queue_group() {
        let ep = derive_endpoint("echo", "abc", "say", None, BalancingMode::Balanced);
        assert_eq!(ep.subject, "echo.say");
        assert_eq!(ep.queue_group.as_deref(), Some("echo"));
    }

    #[test]
    fn unbalanced_has_no_queue_group() {
        let ep = derive_endpoint("echo", "abc", "say", None, BalancingMode::Unbalanced);
        assert_eq!(ep.subject, "echo.say");
        assert!(ep.queue_group.is_none());
    }

    #[test]
    fn local_embeds_instance_id() {
        let ep = derive_endpoint("echo", "abc", "say", None, BalancingMode::Local);
        assert_eq!(ep.subject, "echo.abc.say");
        assert!(ep.queue_group.is_none());
    }

    #[test]
    fn override_is_verbatim_and_keeps_queue_semantics() {
        let ep = derive_endpoint(
            "echo",
            "abc",
            "say",
            Some("events.user.created"),
            BalancingMode::Balanced,
        );
        assert_eq!(ep.subject, "events.user.created");
        assert_eq!(ep.queue_group.as_deref(), Some("echo"));

        let ep = derive_endpoint("echo", "abc", "say", Some("events.>"), BalancingMode::Unbalanced);
        assert_eq!(ep.subject, "events.>");
        assert!(ep.queue_group.is_none());
    }

    #[test]
    fn default_method_name_strips_raw_prefix() {
        assert_eq!(default_method_name("r#type"), "type");
        assert_eq!(default_method_name("  getUser "), "getUser");
        assert_eq!(default_method_name("get_user"), "get_user");
    }

    #[test]
    fn discovery_subjects_by_scope() {
        assert_eq!(DiscoveryVerb::Ping.subject(None, None), "$SRV.PING");
        assert_eq!(DiscoveryVerb::Info.subject(Some("echo"), None), "$SRV.INFO.echo");
        assert_eq!(
            DiscoveryVerb::Stats.subject(Some("echo"), Some("id1")),
            "$SRV.STATS.echo.id1"
        );
        assert_eq!(DiscoveryVerb::Info.subject(None, Some("id1")), "$SRV.INFO");
        assert_eq!(disconnect_subject("ACME"), "$SYS.ACCOUNT.ACME.DISCONNECT");
    }

    #[test]
    fn token_and_subject_validation() {
        assert!(is_valid_token("say"));
        assert!(!is_valid_token("a.b"));
        assert!(!is_valid_token(""));
        assert!(!is_valid_token("a b"));
        assert!(is_valid_service_name("echo-svc_2"));
        assert!(!is_valid_service_name("echo.svc"));
        assert!(is_valid_subject("a.*.c"));
        assert!(is_valid_subject("a.>"));
        assert!(!is_valid_subject("a.>.c"));
        assert!(!is_valid_subject("a..c"));
        assert!(!is_valid_subject("a.b*"));
    }

    #[test]
    fn overlapping_patterns() {
        assert!(patterns_overlap("echo.say", "echo.say"));
        assert!(patterns_overlap("echo.say", "echo.*"));
        assert!(patterns_overlap("echo.*.x", "*.abc.*"));
        assert!(patterns_overlap("echo.>", "echo.abc.say"));
        assert!(patterns_overlap(">", "echo.say"));
        assert!(!patterns_overlap("echo.say", "echo.shout"));
        assert!(!patterns_overlap("echo.*", "echo.abc.say"));
        assert!(!patterns_overlap("echo.>", "echo"));
        assert!(!patterns_overlap("other.*", "echo.say"));
    }

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches("echo.say", "echo.say"));
        assert!(!subject_matches("echo.say", "echo.says"));
        assert!(subject_matches("echo.*", "echo.say"));
        assert!(!subject_matches("echo.*", "echo.say.more"));
        assert!(subject_matches("echo.>", "echo.say.more"));
        assert!(!subject_matches("echo.>", "echo"));
        assert!(subject_matches(DISCONNECT_WILDCARD, "$SYS.ACCOUNT.A.DISCONNECT"));
    }

    proptest! {
        #[test]
        fn derived_subjects_are_valid_and_distinct_per_mode(
            service in "[a-z][a-z0-9_-]{0,12}",
            id in "[a-f0-9]{32}",
            method in "[a-zA-Z][a-zA-Z0-9_]{0,12}",
        ) {
            let balanced = derive_endpoint(&service, &id, &method, None, BalancingMode::Balanced);
            let local = derive_endpoint(&service, &id, &method, None, BalancingMode::Local);
            prop_assert!(is_valid_subject(&balanced.subject));
            prop_assert!(is_valid_subject(&local.subject));
            prop_assert_ne!(&balanced.subject, &local.subject);
            prop_assert!(subject_matches(&balanced.subject, &balanced.subject));
        }
    }
}
