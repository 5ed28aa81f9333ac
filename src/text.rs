//! Cheap lexical signals used to avoid oracle calls.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "of", "to", "in", "on", "for", "with", "from", "by", "at",
    "as", "is", "are", "be", "into", "via", "this", "that", "it", "its", "new", "some", "all",
];

fn word_regex() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"[A-Za-z0-9]+").expect("static regex"))
}

/// Lowercased word tokens with stop words removed.
///
/// camelCase and snake_case identifiers are split so `userProfile` and
/// `user_profile` tokenize the same way.
pub fn tokenize(text: &str) -> Vec<String> {
    let stop: HashSet<&str> = STOP_WORDS.iter().copied().collect();
    let mut out = Vec::new();
    for m in word_regex().find_iter(text) {
        for part in split_camel(m.as_str()) {
            let lower = part.to_lowercase();
            if lower.len() < 2 || stop.contains(lower.as_str()) {
                continue;
            }
            out.push(lower);
        }
    }
    out
}

fn split_camel(word: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let chars: Vec<(usize, char)> = word.char_indices().collect();
    for window in chars.windows(2) {
        let (_, prev) = window[0];
        let (idx, cur) = window[1];
        if prev.is_lowercase() && cur.is_uppercase() {
            parts.push(&word[start..idx]);
            start = idx;
        }
    }
    parts.push(&word[start..]);
    parts
}

/// Jaccard similarity of the two names' token sets, in [0, 1].
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let left: HashSet<String> = tokenize(a).into_iter().collect();
    let right: HashSet<String> = tokenize(b).into_iter().collect();
    jaccard(&left, &right)
}

pub fn jaccard<T: std::hash::Hash + Eq>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Jaccard similarity of two file lists.
pub fn file_overlap(a: &[String], b: &[String]) -> f64 {
    let left: HashSet<&str> = a.iter().map(String::as_str).collect();
    let right: HashSet<&str> = b.iter().map(String::as_str).collect();
    jaccard(&left, &right)
}

pub fn shares_any_file(a: &[String], b: &[String]) -> bool {
    let left: HashSet<&str> = a.iter().map(String::as_str).collect();
    b.iter().any(|f| left.contains(f.as_str()))
}

/// Broad direction of a change, read from the verbs in its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeVerb {
    Add,
    Remove,
    Modify,
}

const ADD_VERBS: &[&str] = &[
    "add", "adds", "added", "adding", "create", "creates", "introduce", "introduces",
    "implement", "implements", "enable", "enables", "support", "new",
];
const REMOVE_VERBS: &[&str] = &[
    "remove", "removes", "removed", "removing", "delete", "deletes", "drop", "drops",
    "deprecate", "deprecates", "disable", "disables", "revert", "reverts",
];
const MODIFY_VERBS: &[&str] = &[
    "update", "updates", "refactor", "refactors", "rename", "renames", "fix", "fixes",
    "improve", "improves", "change", "changes", "migrate", "migrates", "move", "moves",
];

/// First change verb found in `name`, if any.
pub fn change_verb(name: &str) -> Option<ChangeVerb> {
    for m in word_regex().find_iter(name) {
        let word = m.as_str().to_lowercase();
        if ADD_VERBS.contains(&word.as_str()) {
            return Some(ChangeVerb::Add);
        }
        if REMOVE_VERBS.contains(&word.as_str()) {
            return Some(ChangeVerb::Remove);
        }
        if MODIFY_VERBS.contains(&word.as_str()) {
            return Some(ChangeVerb::Modify);
        }
    }
    None
}

/// Adding and removing the same thing are never duplicates.
pub fn verbs_incompatible(a: &str, b: &str) -> bool {
    matches!(
        (change_verb(a), change_verb(b)),
        (Some(ChangeVerb::Add), Some(ChangeVerb::Remove))
            | (Some(ChangeVerb::Remove), Some(ChangeVerb::Add))
    )
}
