//! Permutation synthesis: a bounded set of forced-value maps that together
//! drive both directions of every conditional.

use std::collections::HashSet;

use tracing::debug;

use crate::branches::push_unique;
use crate::config::Config;
use crate::model::{ForcedValue, Permutation, StructuralFacts, NO_MATCH};

/// Splits conditional variables into the plain boolean set and the ones a
/// structural fact covers more precisely, then builds permutations from
/// both.
#[derive(Debug, Clone)]
pub struct Synthesizer<'a> {
    config: &'a Config,
    facts: &'a StructuralFacts,
    plain: Vec<String>,
}

impl<'a> Synthesizer<'a> {
    pub fn new(conditional_variables: &[String], facts: &'a StructuralFacts, config: &'a Config) -> Self {
        let is_string_subject = |name: &str| facts.string_comparisons.iter().any(|f| f.subject == name);
        let is_computed = |name: &str| facts.computed_variables.iter().any(|f| f.name == name);

        let mut excluded: HashSet<String> = HashSet::new();
        excluded.extend(facts.case_facts.iter().map(|f| f.subject.clone()));
        for block in &facts.block_facts {
            excluded.extend(block.paths());
            excluded.extend(
                block
                    .conditions
                    .iter()
                    .map(|c| format!("{}.{c}", block.variable)),
            );
        }
        excluded.extend(facts.computed_variables.iter().map(|f| f.name.clone()));
        for comparison in &facts.string_comparisons {
            excluded.insert(comparison.subject.clone());
            excluded.insert(format!("{}.==", comparison.subject));
            excluded.insert(format!("{}.!=", comparison.subject));
        }

        let mut plain: Vec<String> = conditional_variables
            .iter()
            .filter(|v| !excluded.contains(v.as_str()))
            .cloned()
            .collect();
        for fact in &facts.computed_variables {
            for dep in &fact.dependencies {
                if !is_string_subject(dep.as_str()) && !is_computed(dep.as_str()) {
                    push_unique(&mut plain, dep.clone());
                }
            }
        }

        Self {
            config,
            facts,
            plain,
        }
    }

    /// Variables forced as plain booleans.
    pub fn plain_variables(&self) -> &[String] {
        &self.plain
    }

    pub fn facts(&self) -> &StructuralFacts {
        self.facts
    }

    fn seed_value(&self, name: &str) -> bool {
        !self.config.is_negative_guard(name)
    }

    /// Every plain variable true (guards false), every case and comparison
    /// subject on its first value, every block path true.
    pub fn all_true(&self) -> Permutation {
        let mut perm = Permutation::new();
        for var in &self.plain {
            perm.insert(var.as_str(), ForcedValue::Bool(self.seed_value(var)));
        }
        for fact in &self.facts.case_facts {
            if let Some(first) = fact.values.first() {
                perm.insert(fact.subject.as_str(), ForcedValue::from_literal(first));
            }
        }
        for fact in &self.facts.string_comparisons {
            if let Some(first) = fact.values.first() {
                perm.insert(fact.subject.as_str(), ForcedValue::Str(first.clone()));
            }
        }
        for block in &self.facts.block_facts {
            for path in block.paths() {
                perm.insert(path, ForcedValue::Bool(true));
            }
        }
        perm
    }

    /// The mirror of [`Self::all_true`]: everything false or unmatched.
    pub fn all_false(&self) -> Permutation {
        let mut perm = Permutation::new();
        for var in &self.plain {
            perm.insert(var.as_str(), ForcedValue::Bool(false));
        }
        for fact in &self.facts.case_facts {
            perm.insert(fact.subject.as_str(), ForcedValue::Unmatched);
        }
        for fact in &self.facts.string_comparisons {
            perm.insert(fact.subject.as_str(), ForcedValue::Str(NO_MATCH.to_string()));
        }
        for block in &self.facts.block_facts {
            for path in block.paths() {
                perm.insert(path, ForcedValue::Bool(false));
            }
        }
        perm
    }

    /// The all-true seed with each of `vars` inverted.
    fn flipped(&self, base: &Permutation, vars: &[&String]) -> Permutation {
        let mut perm = base.clone();
        for var in vars {
            perm.insert(var.as_str(), ForcedValue::Bool(!self.seed_value(var)));
        }
        perm
    }

    /// The full de-duplicated permutation list.
    pub fn permutations(&self) -> Vec<Permutation> {
        let base = self.all_true();
        let mut out = Distinct::default();
        out.push(base.clone());
        out.push(self.all_false());

        for var in &self.plain {
            out.push(self.flipped(&base, &[var]));
        }
        for fact in &self.facts.case_facts {
            for value in fact.values.iter().skip(1) {
                out.push(base.with(&fact.subject, ForcedValue::from_literal(value)));
            }
        }
        for fact in &self.facts.string_comparisons {
            for value in &fact.values {
                out.push(base.with(&fact.subject, ForcedValue::Str(value.clone())));
            }
        }
        for block in &self.facts.block_facts {
            for path in block.paths() {
                out.push(base.with(&path, ForcedValue::Bool(false)));
            }
        }

        let pairable: Vec<&String> = self.plain.iter().take(self.config.pairwise_limit).collect();
        for (i, a) in pairable.iter().enumerate() {
            for b in &pairable[i + 1..] {
                if self.config.is_negative_guard(a) && self.config.is_negative_guard(b) {
                    continue;
                }
                out.push(self.flipped(&base, &[*a, *b]));
            }
        }

        let triplable: Vec<&String> = self.plain.iter().take(self.config.triple_limit).collect();
        for (i, a) in triplable.iter().enumerate() {
            for (j, b) in triplable.iter().enumerate().skip(i + 1) {
                for c in &triplable[j + 1..] {
                    out.push(self.flipped(&base, &[*a, *b, *c]));
                }
            }
        }

        debug!(
            plain = self.plain.len(),
            permutations = out.items.len(),
            "synthesized permutations"
        );
        out.items
    }
}

/// Insertion-ordered set of permutations.
#[derive(Default)]
struct Distinct {
    seen: HashSet<Permutation>,
    items: Vec<Permutation>,
}

impl Distinct {
    fn push(&mut self, perm: Permutation) {
        if self.seen.insert(perm.clone()) {
            self.items.push(perm);
        }
    }
}

/// Synthesize permutations for `conditional_variables` and `facts`.
pub fn synthesize(
    conditional_variables: &[String],
    facts: &StructuralFacts,
    config: &Config,
) -> Vec<Permutation> {
    Synthesizer::new(conditional_variables, facts, config).permutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockConditionalFact, CaseFact, ComputedVariableFact, StringComparisonFact};

    fn vars(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_variable_gets_both_directions() {
        let perms = synthesize(&vars(&["admin?"]), &StructuralFacts::default(), &Config::default());
        assert_eq!(perms.len(), 2);
        let values: HashSet<_> = perms.iter().map(|p| p.get("admin?").cloned()).collect();
        assert!(values.contains(&Some(ForcedValue::Bool(true))));
        assert!(values.contains(&Some(ForcedValue::Bool(false))));
    }

    #[test]
    fn test_two_variables_cover_all_four_combinations() {
        let perms = synthesize(
            &vars(&["user.active?", "user.premium?"]),
            &StructuralFacts::default(),
            &Config::default(),
        );
        for (a, b) in [(true, true), (false, false), (true, false), (false, true)] {
            assert!(perms.iter().any(|p| {
                p.get("user.active?") == Some(&ForcedValue::Bool(a))
                    && p.get("user.premium?") == Some(&ForcedValue::Bool(b))
            }));
        }
        assert_eq!(perms.len(), 4);
    }

    #[test]
    fn test_case_subject_values_and_unmatched() {
        let facts = StructuralFacts {
            case_facts: vec![CaseFact {
                subject: "status".into(),
                values: vec!["a".into(), "b".into(), ":c".into()],
            }],
            ..Default::default()
        };
        let perms = synthesize(&vars(&["status"]), &facts, &Config::default());
        let values: Vec<_> = perms.iter().filter_map(|p| p.get("status").cloned()).collect();
        assert_eq!(
            values,
            vec![
                ForcedValue::Str("a".into()),
                ForcedValue::Unmatched,
                ForcedValue::Str("b".into()),
                ForcedValue::Symbol("c".into()),
            ]
        );
    }

    #[test]
    fn test_negative_guards_default_closed() {
        let config = Config::default();
        let facts = StructuralFacts::default();
        let synth = Synthesizer::new(
            &vars(&["hide_actions", "user_blocked", "visible?"]),
            &facts,
            &config,
        );
        let seed = synth.all_true();
        assert_eq!(seed.get("hide_actions"), Some(&ForcedValue::Bool(false)));
        assert_eq!(seed.get("user_blocked"), Some(&ForcedValue::Bool(false)));
        assert_eq!(seed.get("visible?"), Some(&ForcedValue::Bool(true)));

        // The two guards are never flipped together.
        let perms = synth.permutations();
        assert!(!perms.iter().any(|p| {
            p.get("hide_actions") == Some(&ForcedValue::Bool(true))
                && p.get("user_blocked") == Some(&ForcedValue::Bool(true))
                && p.get("visible?") == Some(&ForcedValue::Bool(true))
        }));
    }

    #[test]
    fn test_block_paths_replace_loop_variable_calls() {
        let facts = StructuralFacts {
            block_facts: vec![BlockConditionalFact {
                iterator: "@products".into(),
                variable: "product".into(),
                conditions: vec!["in_stock?".into()],
            }],
            ..Default::default()
        };
        let config = Config::default();
        let synth = Synthesizer::new(&vars(&["product.in_stock?"]), &facts, &config);
        assert!(synth.plain_variables().is_empty());
        let perms = synth.permutations();
        let key = "@products.__block_item__.in_stock?";
        assert_eq!(perms.len(), 2);
        assert_eq!(perms[0].get(key), Some(&ForcedValue::Bool(true)));
        assert_eq!(perms[1].get(key), Some(&ForcedValue::Bool(false)));
    }

    #[test]
    fn test_computed_variables_force_dependencies() {
        let facts = StructuralFacts {
            computed_variables: vec![ComputedVariableFact {
                name: "show_admin".into(),
                dependencies: vec!["user.admin?".into()],
            }],
            ..Default::default()
        };
        let perms = synthesize(&vars(&["show_admin", "other"]), &facts, &Config::default());
        assert!(perms.iter().all(|p| !p.contains_key("show_admin")));
        assert!(perms
            .iter()
            .any(|p| p.get("user.admin?") == Some(&ForcedValue::Bool(false))));
    }

    #[test]
    fn test_string_comparisons() {
        let facts = StructuralFacts {
            string_comparisons: vec![StringComparisonFact {
                subject: "action_name".into(),
                values: vec!["files".into(), "commits".into()],
            }],
            ..Default::default()
        };
        let config = Config::default();
        let synth = Synthesizer::new(&vars(&["action_name.=="]), &facts, &config);
        assert!(synth.plain_variables().is_empty());
        let values: Vec<_> = synth
            .permutations()
            .iter()
            .filter_map(|p| p.get("action_name").cloned())
            .collect();
        assert_eq!(
            values,
            vec![
                ForcedValue::Str("files".into()),
                ForcedValue::Str(NO_MATCH.into()),
                ForcedValue::Str("commits".into()),
            ]
        );
    }

    #[test]
    fn test_combination_caps() {
        let names: Vec<String> = (0..6).map(|i| format!("v{i}")).collect();
        let config = Config {
            pairwise_limit: 0,
            triple_limit: 0,
            ..Config::default()
        };
        // seeds + single flips only; the all-false seed differs from every flip
        assert_eq!(synthesize(&names, &StructuralFacts::default(), &config).len(), 8);

        let config = Config {
            pairwise_limit: 3,
            triple_limit: 3,
            ..Config::default()
        };
        // + 3 pairs + 1 triple
        assert_eq!(synthesize(&names, &StructuralFacts::default(), &config).len(), 12);
    }

    #[test]
    fn test_no_variables_yields_single_empty_seed() {
        let perms = synthesize(&[], &StructuralFacts::default(), &Config::default());
        assert_eq!(perms, vec![Permutation::new()]);
    }
}
