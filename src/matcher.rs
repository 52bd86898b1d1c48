// Process-to-rule matching

use crate::config::Rule;
use crate::process::{
    LocalPort, ProcessAttribute, ProcessIdentifier, ProcessRecord, ProcessSnapshot,
};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// One `attribute: pattern` condition of a rule
#[derive(Debug, Clone)]
pub struct MatchPredicate {
    attribute: ProcessAttribute,
    pattern: Regex,
}

impl MatchPredicate {
    pub fn new(attribute: ProcessAttribute, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            attribute,
            pattern: Regex::new(pattern)?,
        })
    }

    /// Unanchored search; a process lacking the attribute never matches
    pub fn matches(&self, record: &ProcessRecord) -> bool {
        record
            .attribute(self.attribute)
            .is_some_and(|value| self.pattern.is_match(&value.normalized()))
    }
}

/// True when every predicate of `rule` matches. A rule without predicates
/// matches nothing.
pub fn rule_matches(rule: &Rule, record: &ProcessRecord) -> bool {
    !rule.predicates.is_empty() && rule.predicates.iter().all(|p| p.matches(record))
}

/// Processes matched by a single rule, including descendants for recursive
/// rules
pub fn match_rule(rule: &Rule, snapshot: &ProcessSnapshot) -> BTreeSet<ProcessIdentifier> {
    let direct: Vec<&ProcessRecord> = snapshot
        .iter()
        .filter(|record| rule_matches(rule, record))
        .collect();

    let mut matched: BTreeSet<ProcessIdentifier> = direct.iter().map(|r| r.id).collect();

    if rule.recursive && !direct.is_empty() {
        let descendants = snapshot.descendants_of(direct.iter().map(|r| r.pid()));
        matched.extend(
            descendants
                .into_iter()
                .filter_map(|pid| snapshot.get(pid))
                .map(|record| record.id),
        );
    }

    matched
}

/// Processes currently owned by one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleBinding {
    pub label: String,
    pub processes: BTreeSet<ProcessIdentifier>,
    /// Local socket ports of the owned processes
    pub ports: BTreeSet<LocalPort>,
}

/// Result of matching all rules against a snapshot
///
/// A process matched by several rules is owned by the first rule in
/// declaration order; the others are recorded as overlaps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveBinding {
    rules: Vec<RuleBinding>,
    overlaps: BTreeMap<ProcessIdentifier, Vec<String>>,
}

impl LiveBinding {
    /// Rules owning at least one process, in declaration order
    pub fn bound_rules(&self) -> impl Iterator<Item = &RuleBinding> {
        self.rules.iter().filter(|binding| !binding.processes.is_empty())
    }

    /// Processes matched by more than one rule. The first label listed is the
    /// owner.
    pub fn overlaps(&self) -> &BTreeMap<ProcessIdentifier, Vec<String>> {
        &self.overlaps
    }

    pub fn total_bound(&self) -> usize {
        self.rules.iter().map(|binding| binding.processes.len()).sum()
    }
}

/// Match every rule against `snapshot`, resolving overlaps
pub fn bind(rules: &[Rule], snapshot: &ProcessSnapshot) -> LiveBinding {
    let mut owners: BTreeMap<ProcessIdentifier, &str> = BTreeMap::new();
    let mut binding = LiveBinding::default();

    for rule in rules {
        let mut processes = BTreeSet::new();
        for id in match_rule(rule, snapshot) {
            match owners.get(&id) {
                Some(owner) => {
                    binding
                        .overlaps
                        .entry(id)
                        .or_insert_with(|| vec![owner.to_string()])
                        .push(rule.label.clone());
                }
                None => {
                    owners.insert(id, &rule.label);
                    processes.insert(id);
                }
            }
        }

        let ports = processes
            .iter()
            .filter_map(|id| snapshot.get(id.pid))
            .flat_map(|record| record.ports().iter().copied())
            .collect();

        binding.rules.push(RuleBinding {
            label: rule.label.clone(),
            processes,
            ports,
        });
    }

    binding
}

#[cfg(test)]
impl MatchPredicate {
    pub fn attribute(&self) -> ProcessAttribute {
        self.attribute
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

#[cfg(test)]
impl LiveBinding {
    pub fn processes_for(&self, label: &str) -> Option<&BTreeSet<ProcessIdentifier>> {
        self.rule(label).map(|binding| &binding.processes)
    }

    pub fn rule(&self, label: &str) -> Option<&RuleBinding> {
        self.rules.iter().find(|binding| binding.label == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectionLimits;
    use crate::rate::Rate;

    fn rule(label: &str, conditions: &[(ProcessAttribute, &str)], recursive: bool) -> Rule {
        let limits = DirectionLimits {
            rate: None,
            minimum: Rate::ZERO,
            priority: None,
        };
        Rule {
            label: label.to_string(),
            predicates: conditions
                .iter()
                .map(|(attribute, pattern)| MatchPredicate::new(*attribute, pattern).unwrap())
                .collect(),
            download: limits,
            upload: limits,
            recursive,
        }
    }

    fn named(pid: i32, ppid: i32, name: &str) -> ProcessRecord {
        ProcessRecord::new(pid, ppid, pid as u64 * 100).with(ProcessAttribute::Name, name)
    }

    #[test]
    fn test_single_predicate_matches_by_name() {
        let snapshot = ProcessSnapshot::new([named(1, 0, "Foo"), named(2, 0, "Bar")]);
        let foo = rule("foo", &[(ProcessAttribute::Name, "Foo")], false);

        let matched = match_rule(&foo, &snapshot);
        assert_eq!(matched, BTreeSet::from([ProcessIdentifier::new(1, 100)]));
    }

    #[test]
    fn test_search_is_unanchored() {
        let snapshot = ProcessSnapshot::new([named(7, 1, "firefox-bin")]);
        let browser = rule("browser", &[(ProcessAttribute::Name, "fox")], false);
        assert_eq!(match_rule(&browser, &snapshot).len(), 1);
    }

    #[test]
    fn test_all_predicates_must_match() {
        let snapshot = ProcessSnapshot::new([
            named(1, 0, "python").with(ProcessAttribute::Cmdline, vec![
                "python".to_string(),
                "server.py".to_string(),
            ]),
            named(2, 0, "python").with(ProcessAttribute::Cmdline, vec![
                "python".to_string(),
                "worker.py".to_string(),
            ]),
        ]);
        let server = rule(
            "server",
            &[
                (ProcessAttribute::Name, "^python$"),
                (ProcessAttribute::Cmdline, r"python server\.py"),
            ],
            false,
        );

        let matched = match_rule(&server, &snapshot);
        assert_eq!(matched.len(), 1);
        assert!(matched.contains(&ProcessIdentifier::new(1, 100)));
    }

    #[test]
    fn test_missing_attribute_is_not_a_match() {
        let snapshot = ProcessSnapshot::new([named(3, 1, "kworker")]);
        let anything = rule("exe", &[(ProcessAttribute::Exe, ".*")], false);
        assert!(match_rule(&anything, &snapshot).is_empty());
    }

    #[test]
    fn test_rule_without_predicates_matches_nothing() {
        let snapshot = ProcessSnapshot::new([named(1, 0, "init")]);
        let empty = rule("empty", &[], false);
        assert!(match_rule(&empty, &snapshot).is_empty());
    }

    #[test]
    fn test_recursive_rule_includes_descendants() {
        let snapshot = ProcessSnapshot::new([
            named(10, 1, "browser"),
            named(11, 10, "renderer"),
            named(12, 11, "gpu"),
            named(20, 1, "editor"),
        ]);

        let flat = rule("flat", &[(ProcessAttribute::Name, "^browser$")], false);
        assert_eq!(match_rule(&flat, &snapshot).len(), 1);

        let tree = rule("tree", &[(ProcessAttribute::Name, "^browser$")], true);
        let pids: BTreeSet<i32> = match_rule(&tree, &snapshot).iter().map(|id| id.pid).collect();
        assert_eq!(pids, BTreeSet::from([10, 11, 12]));
    }

    #[test]
    fn test_first_declared_rule_wins_overlaps() {
        let snapshot = ProcessSnapshot::new([named(5, 1, "game"), named(6, 1, "gamepad")]);
        let rules = [
            rule("Game", &[(ProcessAttribute::Name, "^game$")], false),
            rule("Everything", &[(ProcessAttribute::Name, "game")], false),
        ];

        let binding = bind(&rules, &snapshot);
        let game = ProcessIdentifier::new(5, 500);
        let pad = ProcessIdentifier::new(6, 600);

        assert_eq!(binding.processes_for("Game"), Some(&BTreeSet::from([game])));
        assert_eq!(binding.processes_for("Everything"), Some(&BTreeSet::from([pad])));
        assert_eq!(
            binding.overlaps().get(&game),
            Some(&vec!["Game".to_string(), "Everything".to_string()])
        );
        assert_eq!(binding.total_bound(), 2);
    }

    #[test]
    fn test_bound_rules_skips_idle_rules() {
        let snapshot = ProcessSnapshot::new([named(1, 0, "Foo")]);
        let rules = [
            rule("foo", &[(ProcessAttribute::Name, "Foo")], false),
            rule("bar", &[(ProcessAttribute::Name, "Bar")], false),
        ];

        let binding = bind(&rules, &snapshot);
        let bound: Vec<&str> = binding.bound_rules().map(|b| b.label.as_str()).collect();
        assert_eq!(bound, ["foo"]);
        assert_eq!(binding.processes_for("bar"), Some(&BTreeSet::new()));
        assert!(binding.overlaps().is_empty());
    }

    #[test]
    fn test_rule_binding_collects_owned_ports() {
        let snapshot = ProcessSnapshot::new([
            named(5, 1, "game").with_port(LocalPort::udp(27015)),
            named(6, 1, "gamepad").with_port(LocalPort::tcp(8080)),
        ]);
        let rules = [
            rule("Game", &[(ProcessAttribute::Name, "^game$")], false),
            rule("Everything", &[(ProcessAttribute::Name, "game")], false),
        ];

        let binding = bind(&rules, &snapshot);
        assert_eq!(
            binding.rule("Game").unwrap().ports,
            BTreeSet::from([LocalPort::udp(27015)])
        );
        // The overlapping process's port stays with its owner
        assert_eq!(
            binding.rule("Everything").unwrap().ports,
            BTreeSet::from([LocalPort::tcp(8080)])
        );
    }
}
