//! Wildcard expression matching over normalized device paths.
//!
//! Semantics are the standard file-pattern pair: `?` consumes exactly one
//! character, `*` consumes any run including the empty one. Both sides are
//! expected upper-cased already (patterns at insertion, paths once per
//! operation), so the comparison itself is exact.

/// Whether `expression` matches the whole of `name`.
///
/// Iterative with single-star backtracking: on mismatch, retry from the most
/// recent `*` with one more character consumed. Linear in practice for the
/// path-shaped inputs the store sees.
#[must_use]
pub fn matches_expression(expression: &str, name: &str) -> bool {
    let pat: Vec<char> = expression.chars().collect();
    let txt: Vec<char> = name.chars().collect();

    let mut p = 0usize;
    let mut t = 0usize;
    let mut backtrack: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    // Only trailing stars may remain unconsumed.
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
