//! Namespace visibility per identity.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Who is asking: a resolved bearer session or the anonymous identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    pub fn new(username: impl Into<String>, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { username: username.into(), roles: roles.into_iter().map(Into::into).collect() }
    }
}

/// Restricts which namespaces an identity may see.
///
/// Implementations must fail closed: an identity without a matching rule gets
/// an empty set.
pub trait AccessFilter: Send + Sync {
    fn allowed_namespaces(&self, identity: &Identity, candidates: &[String]) -> Vec<String>;

    fn is_allowed(&self, identity: &Identity, namespace: &str) -> bool {
        !self.allowed_namespaces(identity, &[namespace.to_string()]).is_empty()
    }
}

#[derive(Debug, Error)]
#[error("invalid namespace pattern {pattern:?} for role {role}: {source}")]
pub struct PatternError {
    pub role: String,
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// Role → namespace regex patterns. A pattern matches from the start of the
/// namespace name; `.*` grants everything.
#[derive(Debug, Clone, Default)]
pub struct PatternAccessFilter {
    roles: HashMap<String, Vec<Regex>>,
}

impl PatternAccessFilter {
    pub fn new(permissions: &BTreeMap<String, Vec<String>>) -> Result<Self, PatternError> {
        let mut roles = HashMap::new();
        for (role, patterns) in permissions {
            let compiled = patterns
                .iter()
                .map(|p| {
                    Regex::new(&format!("^(?:{p})")).map_err(|source| PatternError {
                        role: role.clone(),
                        pattern: p.clone(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            roles.insert(role.clone(), compiled);
        }
        Ok(Self { roles })
    }

    fn matches(&self, identity: &Identity, namespace: &str) -> bool {
        identity
            .roles
            .iter()
            .filter_map(|r| self.roles.get(r))
            .flatten()
            .any(|re| re.is_match(namespace))
    }
}

impl AccessFilter for PatternAccessFilter {
    fn allowed_namespaces(&self, identity: &Identity, candidates: &[String]) -> Vec<String> {
        candidates.iter().filter(|ns| self.matches(identity, ns)).cloned().collect()
    }

    fn is_allowed(&self, identity: &Identity, namespace: &str) -> bool {
        self.matches(identity, namespace)
    }
}

/// Grants everything; for tests and single-user setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessFilter for AllowAll {
    fn allowed_namespaces(&self, _identity: &Identity, candidates: &[String]) -> Vec<String> {
        candidates.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> PatternAccessFilter {
        let mut p = BTreeMap::new();
        p.insert("staging".to_string(), vec![r"project-.*-staging$".to_string()]);
        p.insert("admin".to_string(), vec![".*".to_string()]);
        p.insert("team".to_string(), vec!["team-a".to_string()]);
        PatternAccessFilter::new(&p).expect("valid patterns")
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn staging_role_never_sees_prod() {
        let f = filter();
        let id = Identity::new("dev", ["staging"]);
        let got = f.allowed_namespaces(&id, &names(&["project-x-prod", "project-x-staging", "default"]));
        assert_eq!(got, names(&["project-x-staging"]));
        assert!(!f.is_allowed(&id, "project-x-prod"));
    }

    #[test]
    fn patterns_match_from_the_start() {
        let f = filter();
        let id = Identity::new("t", ["team"]);
        assert!(f.is_allowed(&id, "team-a"));
        assert!(f.is_allowed(&id, "team-a-extra"));
        assert!(!f.is_allowed(&id, "x-team-a"));
    }

    #[test]
    fn fails_closed() {
        let f = filter();
        assert!(f.allowed_namespaces(&Identity::new("nobody", Vec::<String>::new()), &names(&["default"])).is_empty());
        assert!(f.allowed_namespaces(&Identity::new("ghost", ["unknown-role"]), &names(&["default"])).is_empty());
        assert!(f.is_allowed(&Identity::new("root", ["admin"]), "kube-system"));
    }

    #[test]
    fn rejects_bad_patterns() {
        let mut p = BTreeMap::new();
        p.insert("r".to_string(), vec!["(".to_string()]);
        let err = PatternAccessFilter::new(&p).unwrap_err();
        assert_eq!(err.role, "r");
    }
}
