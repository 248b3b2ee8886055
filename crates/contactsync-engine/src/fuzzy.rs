//! Fuzzy name similarity.
//!
//! Combines Levenshtein, Jaro-Winkler and a Soundex check on the family name
//! into one weighted score. Abbreviated given names ("J. Doe") are scored as
//! close matches of the full form.

use strsim::{jaro_winkler, normalized_levenshtein};

use crate::normalize;

/// Score floor for names whose tokens agree up to initials.
const INITIALS_SCORE: f64 = 0.9;

/// Breakdown of one name comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct NameSimilarity {
    pub levenshtein_score: f64,
    pub jaro_winkler_score: f64,
    /// Family names sound alike.
    pub soundex_match: bool,
    /// Tokens agree once initials are expanded.
    pub initials_match: bool,
    /// Combined weighted score (0.0 to 1.0).
    pub score: f64,
}

/// Weights of the combined score.
#[derive(Debug, Clone)]
pub struct NameScorer {
    pub levenshtein_weight: f64,
    pub jaro_winkler_weight: f64,
    pub soundex_weight: f64,
}

impl Default for NameScorer {
    fn default() -> Self {
        Self {
            levenshtein_weight: 0.4,
            jaro_winkler_weight: 0.4,
            soundex_weight: 0.2,
        }
    }
}

impl NameScorer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare two raw names.
    #[must_use]
    pub fn compare(&self, a: &str, b: &str) -> NameSimilarity {
        let a = normalize::name(a);
        let b = normalize::name(b);

        if a.is_empty() || b.is_empty() {
            return NameSimilarity {
                levenshtein_score: 0.0,
                jaro_winkler_score: 0.0,
                soundex_match: false,
                initials_match: false,
                score: 0.0,
            };
        }

        let levenshtein_score = normalized_levenshtein(&a, &b);
        let jaro_winkler_score = jaro_winkler(&a, &b);
        let soundex_match = {
            let code_a = soundex(last_token(&a));
            !code_a.is_empty() && code_a == soundex(last_token(&b))
        };
        let initials_match = initials_compatible(&a, &b);

        let weighted = levenshtein_score * self.levenshtein_weight
            + jaro_winkler_score * self.jaro_winkler_weight
            + if soundex_match { self.soundex_weight } else { 0.0 };
        let score = if initials_match {
            weighted.max(INITIALS_SCORE)
        } else {
            weighted
        };

        NameSimilarity {
            levenshtein_score,
            jaro_winkler_score,
            soundex_match,
            initials_match,
            score: score.clamp(0.0, 1.0),
        }
    }
}

fn last_token(name: &str) -> &str {
    name.rsplit(' ').next().unwrap_or(name)
}

/// Same token count, identical family name, and every other token either equal
/// or a one-letter initial of its counterpart.
fn initials_compatible(a: &str, b: &str) -> bool {
    let ta: Vec<&str> = a.split(' ').collect();
    let tb: Vec<&str> = b.split(' ').collect();
    if ta.len() != tb.len() || ta.len() < 2 || ta.last() != tb.last() {
        return false;
    }
    ta.iter().zip(tb.iter()).all(|(x, y)| {
        x == y
            || (x.chars().count() == 1 && y.starts_with(*x))
            || (y.chars().count() == 1 && x.starts_with(*y))
    })
}

/// Soundex code: first letter plus three digits ("Robert" -> "R163").
#[must_use]
pub fn soundex(s: &str) -> String {
    let Some(first) = s.chars().find(char::is_ascii_alphabetic) else {
        return String::new();
    };

    let code = |c: char| -> Option<char> {
        match c.to_ascii_lowercase() {
            'b' | 'f' | 'p' | 'v' => Some('1'),
            'c' | 'g' | 'j' | 'k' | 'q' | 's' | 'x' | 'z' => Some('2'),
            'd' | 't' => Some('3'),
            'l' => Some('4'),
            'm' | 'n' => Some('5'),
            'r' => Some('6'),
            _ => None,
        }
    };

    let mut result = String::with_capacity(4);
    result.push(first.to_ascii_uppercase());
    let mut prev = code(first);

    for c in s.chars().skip_while(|c| *c != first).skip(1) {
        if result.len() >= 4 {
            break;
        }
        let current = code(c);
        if let Some(digit) = current {
            if current != prev {
                result.push(digit);
            }
        }
        prev = current;
    }

    while result.len() < 4 {
        result.push('0');
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let result = NameScorer::new().compare("Jane Doe", "jane  doe");
        assert!((result.score - 1.0).abs() < 0.001);
        assert!(result.soundex_match);
    }

    #[test]
    fn test_initials_match() {
        let result = NameScorer::new().compare("Jane Doe", "J. Doe");
        assert!(result.initials_match);
        assert!(result.score >= 0.9);
    }

    #[test]
    fn test_similar_names() {
        let result = NameScorer::new().compare("Jon Smith", "John Smith");
        assert!(result.score > 0.85);
    }

    #[test]
    fn test_different_names() {
        let result = NameScorer::new().compare("John Smith", "Jane Doe");
        assert!(result.score < 0.5);
        assert!(!result.initials_match);
    }

    #[test]
    fn test_empty_name_scores_zero() {
        assert_eq!(NameScorer::new().compare("", "Jane").score, 0.0);
    }

    #[test]
    fn test_soundex_codes() {
        assert_eq!(soundex("robert"), "R163");
        assert_eq!(soundex("rupert"), "R163");
        assert_eq!(soundex(""), "");
    }
}
