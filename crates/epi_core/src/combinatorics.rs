//! Compartment and shortcut generation from a population's divisions.
//!
//! Compartments are the full cartesian product of every division's
//! categories. Shortcuts are the partial products (at least one division,
//! fewer than all) and stand for the sum of every compartment they cover.

use crate::error::{Result, SimulationError};
use crate::model::Division;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const SEPARATOR: char = '_';

/// A derived aggregate over the compartments sharing a set of categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortcut {
    pub name: String,
    /// `+`-joined compartment names, in compartment order.
    pub definition: String,
    pub members: Vec<String>,
}

/// Every compartment name in mixed-radix order: the first division is the
/// slowest-varying digit, the last division the fastest.
pub fn generate_compartments(divisions: &[Division]) -> Vec<String> {
    if divisions.is_empty() {
        return Vec::new();
    }
    let radices: Vec<usize> = divisions.iter().map(|d| d.categories.len()).collect();
    let total: usize = radices.iter().product();
    let mut names = Vec::with_capacity(total);
    let mut digits = vec![0usize; divisions.len()];

    for _ in 0..total {
        let name = digits
            .iter()
            .zip(divisions)
            .map(|(&digit, division)| division.categories[digit].name.as_str())
            .collect::<Vec<_>>()
            .join("_");
        names.push(name);

        // Increment the least significant (last) digit and carry leftwards.
        for pos in (0..digits.len()).rev() {
            digits[pos] += 1;
            if digits[pos] < radices[pos] {
                break;
            }
            digits[pos] = 0;
        }
    }
    names
}

/// Compares loaded compartment names, position by position, with the
/// generated set.
pub fn verify_compartments(divisions: &[Division], loaded: &[String]) -> Result<()> {
    let generated = generate_compartments(divisions);
    for position in 0..generated.len().max(loaded.len()) {
        let expected = generated.get(position);
        let found = loaded.get(position);
        if expected != found {
            return Err(SimulationError::StructuralMismatch {
                position,
                expected: expected.cloned().unwrap_or_else(|| "<none>".to_string()),
                found: found.cloned().unwrap_or_else(|| "<none>".to_string()),
            });
        }
    }
    Ok(())
}

/// Every shortcut implied by the divisions, with its summed definition.
pub fn generate_shortcuts(divisions: &[Division]) -> Vec<Shortcut> {
    let division_count = divisions.len();
    let mut names = Vec::new();
    for start in 0..division_count {
        for category in &divisions[start].categories {
            extend_combinations(divisions, category.name.clone(), start + 1, &mut names);
        }
    }

    let compartments = generate_compartments(divisions);
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|name| !name.is_empty())
        .filter(|name| name.split(SEPARATOR).count() != division_count)
        .filter(|name| seen.insert(name.clone()))
        .map(|name| {
            let members = covered_compartments(&name, &compartments);
            Shortcut {
                definition: members.join("+"),
                name,
                members,
            }
        })
        .collect()
}

fn extend_combinations(divisions: &[Division], prefix: String, next: usize, out: &mut Vec<String>) {
    out.push(prefix.clone());
    for later in next..divisions.len() {
        for category in &divisions[later].categories {
            let combined = format!("{prefix}{SEPARATOR}{}", category.name);
            extend_combinations(divisions, combined, later + 1, out);
        }
    }
}

/// Compartments whose category tokens are a superset of the shortcut's.
fn covered_compartments(shortcut: &str, compartments: &[String]) -> Vec<String> {
    let wanted: Vec<&str> = shortcut.split(SEPARATOR).collect();
    compartments
        .iter()
        .filter(|compartment| {
            let tokens: HashSet<&str> = compartment.split(SEPARATOR).collect();
            wanted.iter().all(|token| tokens.contains(token))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Division};

    fn division(name: &str, categories: &[&str]) -> Division {
        Division {
            name: name.to_string(),
            categories: categories
                .iter()
                .map(|c| Category {
                    name: c.to_string(),
                    description: None,
                })
                .collect(),
        }
    }

    fn age_status() -> Vec<Division> {
        vec![
            division("Age", &["Y", "O"]),
            division("Status", &["S", "I", "R"]),
        ]
    }

    #[test]
    fn compartments_follow_mixed_radix_order() {
        let divisions = vec![
            division("Age", &["Y", "O"]),
            division("Sex", &["M", "F"]),
            division("Status", &["S", "I", "R"]),
        ];
        let names = generate_compartments(&divisions);
        assert_eq!(names.len(), 12);
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), 12);

        let radices = [2usize, 2, 3];
        for (p, name) in names.iter().enumerate() {
            let mut rest = p;
            let mut digits = [0usize; 3];
            for pos in (0..3).rev() {
                digits[pos] = rest % radices[pos];
                rest /= radices[pos];
            }
            let expected = format!(
                "{}_{}_{}",
                divisions[0].categories[digits[0]].name,
                divisions[1].categories[digits[1]].name,
                divisions[2].categories[digits[2]].name
            );
            assert_eq!(name, &expected);
        }
        assert_eq!(names[0], "Y_M_S");
        assert_eq!(names[1], "Y_M_I");
        assert_eq!(names[11], "O_F_R");
    }

    #[test]
    fn empty_inputs_generate_nothing() {
        assert!(generate_compartments(&[]).is_empty());
        assert!(generate_compartments(&[division("Age", &[])]).is_empty());
        assert!(generate_shortcuts(&[division("Status", &["S", "I"])]).is_empty());
    }

    #[test]
    fn shortcut_sums_uncovered_divisions() {
        let shortcuts = generate_shortcuts(&age_status());
        let young = shortcuts
            .iter()
            .find(|s| s.name == "Y")
            .expect("Y shortcut should exist");
        assert_eq!(young.definition, "Y_S+Y_I+Y_R");

        let infected = shortcuts
            .iter()
            .find(|s| s.name == "I")
            .expect("I shortcut should exist");
        assert_eq!(infected.members, vec!["Y_I".to_string(), "O_I".to_string()]);

        let names: Vec<_> = shortcuts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.len(), 5);
        assert!(!names.contains(&"Y_S"));
    }

    #[test]
    fn shortcut_member_count_is_product_of_uncovered_counts() {
        let divisions = vec![
            division("Age", &["Y", "A", "O"]),
            division("Sex", &["M", "F"]),
            division("Status", &["S", "E", "I", "R"]),
        ];
        let counts = [3usize, 2, 4];
        let shortcuts = generate_shortcuts(&divisions);
        // 3 + 2 + 4 singles, 3*2 + 3*4 + 2*4 pairs.
        assert_eq!(shortcuts.len(), 9 + 26);

        for shortcut in &shortcuts {
            let covered: Vec<usize> = shortcut
                .name
                .split(SEPARATOR)
                .map(|token| {
                    divisions
                        .iter()
                        .position(|d| d.categories.iter().any(|c| c.name == token))
                        .expect("token should belong to a division")
                })
                .collect();
            let expected: usize = (0..divisions.len())
                .filter(|i| !covered.contains(i))
                .map(|i| counts[i])
                .product();
            assert_eq!(shortcut.members.len(), expected, "{}", shortcut.name);
            assert_eq!(shortcut.definition.split('+').count(), expected);
        }
    }

    #[test]
    fn verify_reports_first_divergence() {
        let divisions = age_status();
        let mut loaded = generate_compartments(&divisions);
        assert!(verify_compartments(&divisions, &loaded).is_ok());

        loaded.swap(1, 2);
        match verify_compartments(&divisions, &loaded) {
            Err(SimulationError::StructuralMismatch {
                position,
                expected,
                found,
            }) => {
                assert_eq!(position, 1);
                assert_eq!(expected, "Y_I");
                assert_eq!(found, "Y_R");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }

        loaded.truncate(3);
        loaded.swap(1, 2);
        let err = verify_compartments(&divisions, &loaded).expect_err("missing compartments");
        assert!(err.to_string().contains("position 3"));
    }
}
