//! Invariants of permutation synthesis over arbitrary variable and fact sets.

use std::collections::HashSet;

use proptest::prelude::*;
use tmplcov::config::Config;
use tmplcov::model::{CaseFact, ComputedVariableFact, ForcedValue, StructuralFacts};
use tmplcov::synth::synthesize;

fn names_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-z]{1,5}[?]?", 1..8).prop_map(|set| set.into_iter().collect())
}

/// Conditional variables plus `calc_<i>` computed variables depending on
/// a window of them.
fn computed_strategy() -> impl Strategy<Value = (Vec<String>, StructuralFacts)> {
    (names_strategy(), 0usize..4).prop_map(|(names, computed)| {
        let mut vars = names.clone();
        let mut facts = StructuralFacts::default();
        for i in 0..computed {
            let name = format!("calc_{i}");
            vars.push(name.clone());
            facts.computed_variables.push(ComputedVariableFact {
                name,
                dependencies: names.iter().skip(i).take(2).cloned().collect(),
            });
        }
        (vars, facts)
    })
}

proptest! {
    #[test]
    fn permutations_are_distinct((vars, facts) in computed_strategy()) {
        let perms = synthesize(&vars, &facts, &Config::default());
        let unique: HashSet<_> = perms.iter().collect();
        prop_assert_eq!(unique.len(), perms.len());
    }

    #[test]
    fn computed_variables_are_never_forced((vars, facts) in computed_strategy()) {
        let perms = synthesize(&vars, &facts, &Config::default());
        prop_assert!(!perms.is_empty());
        for perm in &perms {
            for fact in &facts.computed_variables {
                prop_assert!(!perm.contains_key(&fact.name));
                for dep in &fact.dependencies {
                    prop_assert!(perm.contains_key(dep));
                }
            }
        }
    }

    #[test]
    fn every_plain_variable_takes_both_directions(names in names_strategy()) {
        let perms = synthesize(&names, &StructuralFacts::default(), &Config::default());
        for name in &names {
            let seen: HashSet<_> = perms.iter().filter_map(|p| p.get(name)).collect();
            prop_assert!(seen.contains(&ForcedValue::Bool(true)));
            prop_assert!(seen.contains(&ForcedValue::Bool(false)));
        }
    }

    #[test]
    fn case_values_each_get_a_permutation(
        values in prop::collection::btree_set("[a-z]{1,6}", 1..5)
    ) {
        let values: Vec<String> = values.into_iter().collect();
        let facts = StructuralFacts {
            case_facts: vec![CaseFact { subject: "status".into(), values: values.clone() }],
            ..StructuralFacts::default()
        };
        let perms = synthesize(&["status".to_string()], &facts, &Config::default());
        let forced: HashSet<_> = perms.iter().filter_map(|p| p.get("status")).cloned().collect();
        for value in &values {
            prop_assert!(forced.contains(&ForcedValue::Str(value.clone())));
        }
        prop_assert!(forced.contains(&ForcedValue::Unmatched));
        prop_assert_eq!(forced.len(), values.len() + 1);
    }
}

#[test]
fn case_scenario_a_b() {
    let facts = StructuralFacts {
        case_facts: vec![CaseFact {
            subject: "kind".into(),
            values: vec!["a".into(), "b".into()],
        }],
        ..StructuralFacts::default()
    };
    let perms = synthesize(&["kind".to_string()], &facts, &Config::default());
    let forced: Vec<_> = perms.iter().filter_map(|p| p.get("kind")).cloned().collect();
    assert!(forced.contains(&ForcedValue::Str("a".into())));
    assert!(forced.contains(&ForcedValue::Str("b".into())));
    assert!(forced.contains(&ForcedValue::Unmatched));
}

#[test]
fn pairwise_scenario_active_premium() {
    let vars = vec!["user.active?".to_string(), "user.premium?".to_string()];
    let perms = synthesize(&vars, &StructuralFacts::default(), &Config::default());
    let combos: HashSet<(bool, bool)> = perms
        .iter()
        .map(|p| {
            (
                p.get("user.active?").and_then(ForcedValue::as_bool).unwrap(),
                p.get("user.premium?").and_then(ForcedValue::as_bool).unwrap(),
            )
        })
        .collect();
    for combo in [(true, true), (false, false), (true, false), (false, true)] {
        assert!(combos.contains(&combo), "missing {combo:?}");
    }
}
