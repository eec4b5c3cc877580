//! Rule and snapshot types shared by the cache, the store and the backends.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether traffic matching a rule's hosts is collected or suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Accept,
    Ignore,
}

impl RuleKind {
    /// Map the `ignore` column of the targets table to a kind.
    pub fn from_ignore(ignore: bool) -> Self {
        if ignore { Self::Ignore } else { Self::Accept }
    }

    pub fn is_ignore(self) -> bool {
        matches!(self, Self::Ignore)
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => f.write_str("accept"),
            Self::Ignore => f.write_str("ignore"),
        }
    }
}

/// One accept/ignore target rule.
///
/// Host matching (exact, prefix, suffix) is up to the traffic-interception
/// side; hosts are kept exactly as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub kind: RuleKind,
    pub hosts: Vec<String>,
}

impl Rule {
    pub fn new(kind: RuleKind, hosts: Vec<String>) -> Self {
        Self { kind, hosts }
    }
}

/// Point-in-time copy of every rule, keyed by rule id.
///
/// Owns its data: later cache mutations never show up in a snapshot that
/// was already handed out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    rules: HashMap<String, Rule>,
}

impl Snapshot {
    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rule)> {
        self.rules.iter().map(|(id, rule)| (id.as_str(), rule))
    }

    /// Rules whose matching traffic is collected.
    pub fn accepted(&self) -> impl Iterator<Item = (&str, &Rule)> {
        self.iter().filter(|(_, r)| r.kind == RuleKind::Accept)
    }

    /// Rules whose matching traffic is suppressed.
    pub fn ignored(&self) -> impl Iterator<Item = (&str, &Rule)> {
        self.iter().filter(|(_, r)| r.kind == RuleKind::Ignore)
    }

    pub fn into_inner(self) -> HashMap<String, Rule> {
        self.rules
    }
}

impl From<HashMap<String, Rule>> for Snapshot {
    fn from(rules: HashMap<String, Rule>) -> Self {
        Self { rules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let mut rules = HashMap::new();
        rules.insert(
            "a".to_string(),
            Rule::new(RuleKind::Accept, vec!["app.example.com".into()]),
        );
        rules.insert(
            "b".to_string(),
            Rule::new(RuleKind::Ignore, vec!["cdn.example.com".into(), "ads.example.com".into()]),
        );
        Snapshot::from(rules)
    }

    #[test]
    fn kind_maps_from_ignore_column() {
        assert_eq!(RuleKind::Ignore.to_string(), "ignore");
        assert_eq!(RuleKind::from_ignore(true), RuleKind::Ignore);
        assert!(!RuleKind::from_ignore(false).is_ignore());
    }

    #[test]
    fn snapshot_views_split_by_kind() {
        let snap = sample();
        assert_eq!(snap.len(), 2);
        let accepted: Vec<_> = snap.accepted().map(|(id, _)| id).collect();
        let ignored: Vec<_> = snap.ignored().map(|(id, _)| id).collect();
        assert_eq!(accepted, vec!["a"]);
        assert_eq!(ignored, vec!["b"]);
    }

    #[test]
    fn snapshot_serializes_as_plain_map() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["b"]["kind"], "ignore");
        assert_eq!(json["b"]["hosts"][0], "cdn.example.com");
        assert_eq!(json["a"]["kind"], "accept");

        let back: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample());
    }
}
