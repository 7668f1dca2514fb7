//! Candidate duplicate-pair detection.
//!
//! Cheap, local, no network: every unordered pair of entry names in a
//! category is flagged when keyword sets intersect, one name contains the
//! other, or the short-name heuristic matches. All character work uses
//! `char`s so CJK names behave.

use loresmith_shared::Category;

/// One unordered pair of entry names suspected to be aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePair {
    pub a: String,
    pub b: String,
}

/// Scan a category for candidate pairs.
pub fn candidate_pairs(category: &Category) -> Vec<CandidatePair> {
    let names: Vec<&String> = category.keys().collect();
    let mut pairs = Vec::new();

    for i in 0..names.len() {
        for j in i + 1..names.len() {
            let (a, b) = (names[i], names[j]);
            if is_candidate(category, a, b) {
                pairs.push(CandidatePair {
                    a: a.clone(),
                    b: b.clone(),
                });
            }
        }
    }

    pairs
}

fn is_candidate(category: &Category, a: &str, b: &str) -> bool {
    keywords_intersect(category, a, b) || names_overlap(a, b) || short_names_match(a, b)
}

fn keywords_intersect(category: &Category, a: &str, b: &str) -> bool {
    let (Some(ea), Some(eb)) = (category.get(a), category.get(b)) else {
        return false;
    };
    ea.keywords.iter().any(|k| eb.keywords.contains(k))
}

fn names_overlap(a: &str, b: &str) -> bool {
    a.contains(b) || b.contains(a)
}

/// The last two characters of a long name, or the whole name if it is three
/// characters or shorter.
fn short_form(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    if chars.len() <= 3 {
        name.to_string()
    } else {
        chars[chars.len() - 2..].iter().collect()
    }
}

/// Short forms equal, or either name contains the other's short form.
fn short_names_match(a: &str, b: &str) -> bool {
    let (sa, sb) = (short_form(a), short_form(b));
    if sa.is_empty() || sb.is_empty() {
        return false;
    }
    sa == sb || a.contains(&sb) || b.contains(&sa)
}
