//! Entry-level diff between two worldbook snapshots.

use std::collections::BTreeSet;

use loresmith_shared::{ChangeKind, ChangedEntry, Worldbook};

/// Compare two snapshots and produce an ordered change list: set-compare
/// entry keys per category, deep-compare entries present in both. This diff
/// is the unit of history.
pub fn diff_worldbooks(prev: &Worldbook, next: &Worldbook) -> Vec<ChangedEntry> {
    let mut changed = Vec::new();

    let categories: BTreeSet<&String> = prev.keys().chain(next.keys()).collect();

    for category in categories {
        let before = prev.get(category);
        let after = next.get(category);

        let names: BTreeSet<&String> = before
            .map(|c| c.keys().collect::<BTreeSet<_>>())
            .unwrap_or_default()
            .into_iter()
            .chain(after.map(|c| c.keys().collect::<BTreeSet<_>>()).unwrap_or_default())
            .collect();

        for name in names {
            let old_entry = before.and_then(|c| c.get(name));
            let new_entry = after.and_then(|c| c.get(name));

            let kind = match (old_entry, new_entry) {
                (None, Some(_)) => ChangeKind::Add,
                (Some(_), None) => ChangeKind::Delete,
                (Some(old), Some(new)) if old != new => ChangeKind::Modify,
                _ => continue,
            };

            changed.push(ChangedEntry {
                kind,
                category: category.clone(),
                entry_name: name.clone(),
            });
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use loresmith_shared::{Category, Entry};

    fn book_with(category: &str, name: &str, content: &str) -> Worldbook {
        let mut book = Worldbook::new();
        let mut cat = Category::new();
        cat.insert(
            name.into(),
            Entry {
                keywords: vec![],
                content: content.into(),
            },
        );
        book.insert(category.into(), cat);
        book
    }

    #[test]
    fn add_into_empty_book() {
        let prev = Worldbook::new();
        let next = book_with("角色", "A", "a hero");

        let changed = diff_worldbooks(&prev, &next);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].kind, ChangeKind::Add);
        assert_eq!(changed[0].category, "角色");
        assert_eq!(changed[0].entry_name, "A");
    }

    #[test]
    fn modify_and_delete_detected() {
        let prev = {
            let mut b = book_with("角色", "A", "v1");
            b.get_mut("角色").unwrap().insert(
                "B".into(),
                Entry {
                    keywords: vec![],
                    content: "gone soon".into(),
                },
            );
            b
        };
        let next = book_with("角色", "A", "v2");

        let changed = diff_worldbooks(&prev, &next);
        assert_eq!(changed.len(), 2);
        assert!(changed.contains(&ChangedEntry {
            kind: ChangeKind::Modify,
            category: "角色".into(),
            entry_name: "A".into(),
        }));
        assert!(changed.contains(&ChangedEntry {
            kind: ChangeKind::Delete,
            category: "角色".into(),
            entry_name: "B".into(),
        }));
    }

    #[test]
    fn identical_books_produce_empty_diff() {
        let book = book_with("角色", "A", "same");
        assert!(diff_worldbooks(&book, &book.clone()).is_empty());
    }

    #[test]
    fn keyword_only_change_is_a_modify() {
        let prev = book_with("角色", "A", "same");
        let mut next = prev.clone();
        next.get_mut("角色").unwrap().get_mut("A").unwrap().keywords =
            vec!["alias".into()];

        let changed = diff_worldbooks(&prev, &next);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].kind, ChangeKind::Modify);
    }
}
