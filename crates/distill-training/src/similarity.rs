//! Ratcliff/Obershelp string similarity.
//!
//! Finds the longest common block, recurses on both sides of it, and scores
//! `2 * matched / (len_a + len_b)`. Characters that are very common in a long
//! second string (more than 1% of it, for strings of 200+ chars) are not used
//! to seed matches but may still extend one.

use std::collections::{HashMap, HashSet};

const AUTOJUNK_MIN_LEN: usize = 200;

/// Similarity in `[0, 1]`; 1.0 means identical, two empty strings score 1.0.
#[must_use]
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matched: usize = Matcher::new(&a, &b).matching_blocks().iter().map(|m| m.size).sum();
    2.0 * matched as f64 / total as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    a: usize,
    b: usize,
    size: usize,
}

struct Matcher<'a> {
    a: &'a [char],
    b: &'a [char],
    /// Positions of each non-popular char of `b`.
    b2j: HashMap<char, Vec<usize>>,
}

impl<'a> Matcher<'a> {
    fn new(a: &'a [char], b: &'a [char]) -> Self {
        let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
        for (j, c) in b.iter().enumerate() {
            b2j.entry(*c).or_default().push(j);
        }

        if b.len() >= AUTOJUNK_MIN_LEN {
            let limit = b.len() / 100 + 1;
            let popular: HashSet<char> =
                b2j.iter().filter(|(_, js)| js.len() > limit).map(|(c, _)| *c).collect();
            for c in popular {
                b2j.remove(&c);
            }
        }
        Self { a, b, b2j }
    }

    fn longest_match(&self, alo: usize, ahi: usize, blo: usize, bhi: usize) -> Block {
        let (mut best_i, mut best_j, mut best) = (alo, blo, 0);
        let mut j2len: HashMap<usize, usize> = HashMap::new();

        for i in alo..ahi {
            let mut next: HashMap<usize, usize> = HashMap::new();
            if let Some(js) = self.b2j.get(&self.a[i]) {
                for &j in js {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let k = j.checked_sub(1).and_then(|p| j2len.get(&p)).copied().unwrap_or(0) + 1;
                    next.insert(j, k);
                    if k > best {
                        best_i = i + 1 - k;
                        best_j = j + 1 - k;
                        best = k;
                    }
                }
            }
            j2len = next;
        }

        // Grow through popular chars on either side.
        while best_i > alo && best_j > blo && self.a[best_i - 1] == self.b[best_j - 1] {
            best_i -= 1;
            best_j -= 1;
            best += 1;
        }
        while best_i + best < ahi
            && best_j + best < bhi
            && self.a[best_i + best] == self.b[best_j + best]
        {
            best += 1;
        }
        Block { a: best_i, b: best_j, size: best }
    }

    fn matching_blocks(&self) -> Vec<Block> {
        let mut queue = vec![(0, self.a.len(), 0, self.b.len())];
        let mut blocks = Vec::new();

        while let Some((alo, ahi, blo, bhi)) = queue.pop() {
            let m = self.longest_match(alo, ahi, blo, bhi);
            if m.size == 0 {
                continue;
            }
            if alo < m.a && blo < m.b {
                queue.push((alo, m.a, blo, m.b));
            }
            if m.a + m.size < ahi && m.b + m.size < bhi {
                queue.push((m.a + m.size, ahi, m.b + m.size, bhi));
            }
            blocks.push(m);
        }
        blocks.sort_by_key(|m| (m.a, m.b));
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_and_empty() {
        assert!((similarity_ratio("music", "music") - 1.0).abs() < f64::EPSILON);
        assert!((similarity_ratio("", "") - 1.0).abs() < f64::EPSILON);
        assert!(similarity_ratio("abc", "").abs() < f64::EPSILON);
    }

    #[test]
    fn test_known_ratio() {
        assert!((similarity_ratio("abcd", "bcde") - 0.75).abs() < 1e-12);
        assert!(similarity_ratio("abc", "xyz").abs() < f64::EPSILON);
    }

    #[test]
    fn test_recurses_on_both_sides() {
        // Blocks "a" and "cd" around the mismatch: 2 * 3 / 8.
        assert!((similarity_ratio("abcd", "axcd") - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_long_repetitive_strings_stay_in_range() {
        let a = "la ".repeat(100);
        let b = format!("{}sonata", "la ".repeat(90));
        let r = similarity_ratio(&a, &b);
        assert!(r > 0.8 && r <= 1.0, "{r}");
        assert!((similarity_ratio(&a, &a) - 1.0).abs() < f64::EPSILON);
    }
}
