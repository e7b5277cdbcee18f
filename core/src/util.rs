//! Small, stateless helpers shared across the overlay engine: deep
//! structural matching (used by tests and by gossip descriptor lookups),
//! shuffled iteration (peer selection), and arithmetic mean (bandwidth
//! averaging).

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

/// `x ∈ set(seq)` — linear membership check, no allocation.
pub fn contains<T: PartialEq>(x: &T, seq: &[T]) -> bool {
    seq.iter().any(|e| e == x)
}

/// Deep structural "does this template match this element" check
/// (spec.md §8):
///
/// - `contains_match(template, [])` is `false` for any template.
/// - `contains_match({}, xs)` is `xs != []`.
/// - `contains_match(t, [o, ...])` is true iff some element of the array
///   contains every key of `t` with an equal value — recursively for
///   object/array values, exact-equals otherwise. Extra keys in the
///   element beyond the template are allowed.
pub fn contains_match(template: &Value, xs: &[Value]) -> bool {
    if xs.is_empty() {
        return false;
    }
    if is_empty_object(template) {
        return true;
    }
    xs.iter().any(|elem| structurally_matches(template, elem))
}

fn is_empty_object(v: &Value) -> bool {
    matches!(v, Value::Object(m) if m.is_empty())
}

fn structurally_matches(template: &Value, elem: &Value) -> bool {
    match (template, elem) {
        (Value::Object(t), Value::Object(e)) => t
            .iter()
            .all(|(k, tv)| e.get(k).is_some_and(|ev| structurally_matches(tv, ev))),
        (Value::Array(t), Value::Array(e)) => {
            t.len() == e.len() && t.iter().zip(e.iter()).all(|(tv, ev)| structurally_matches(tv, ev))
        }
        _ => template == elem,
    }
}

/// Returns a new vector containing the same elements as `xs`, in a random
/// order. `xs` itself is left untouched.
pub fn shuffled<T: Clone>(xs: &[T]) -> Vec<T> {
    let mut out = xs.to_vec();
    out.shuffle(&mut rand::thread_rng());
    out
}

/// Picks one random element from `xs` via reservoir-free uniform choice.
/// Returns `None` for an empty slice.
pub fn random_choice<T: Clone>(xs: &[T]) -> Option<T> {
    if xs.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..xs.len());
    Some(xs[idx].clone())
}

/// Stable-ish sort into a *new* sequence: `xs` is left unmodified, the
/// result is a permutation of `xs`, and every adjacent pair `(a, b)` in
/// the result satisfies `!cmp(b, a)` (spec.md §8).
pub fn shallow_sort<T: Clone>(xs: &[T], cmp: impl Fn(&T, &T) -> bool) -> Vec<T> {
    let mut out = xs.to_vec();
    out.sort_by(|a, b| {
        if cmp(a, b) {
            std::cmp::Ordering::Less
        } else if cmp(b, a) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    });
    out
}

/// Arithmetic mean of `xs`. `None` for an empty slice (there is no
/// meaningful mean of zero samples — callers decide the fallback).
pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contains_match_empty_array_is_false() {
        assert!(!contains_match(&json!({"a": 1}), &[]));
    }

    #[test]
    fn contains_match_empty_template_is_true_for_nonempty_array() {
        assert!(contains_match(&json!({}), &[json!({"z": 9})]));
    }

    #[test]
    fn contains_match_allows_extra_keys_in_element() {
        let template = json!({"a": 1});
        let xs = vec![json!({"a": 1, "b": 2})];
        assert!(contains_match(&template, &xs));
    }

    #[test]
    fn contains_match_recurses_into_nested_objects() {
        let template = json!({"media": {"bandwidth": 10}});
        let xs = vec![json!({"id": "p1", "media": {"bandwidth": 10, "parts": [1, 2]}})];
        assert!(contains_match(&template, &xs));

        let miss = vec![json!({"id": "p1", "media": {"bandwidth": 11}})];
        assert!(!contains_match(&template, &miss));
    }

    #[test]
    fn shuffled_is_a_permutation() {
        let xs = vec![1, 2, 3, 4, 5];
        let shuffled_xs = shuffled(&xs);
        let mut sorted_shuffled = shuffled_xs.clone();
        sorted_shuffled.sort();
        assert_eq!(sorted_shuffled, xs);
    }

    #[test]
    fn shallow_sort_does_not_mutate_input_and_is_ordered() {
        let xs = vec![3, 1, 2];
        let sorted = shallow_sort(&xs, |a, b| a < b);
        assert_eq!(xs, vec![3, 1, 2]);
        assert_eq!(sorted, vec![1, 2, 3]);
    }

    #[test]
    fn mean_of_samples() {
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(mean(&[]), None);
    }
}
