//! Structured-vs-random classification by per-character entropy and
//! vowel/consonant heuristics.

use crate::config::ClassifierConfig;
use std::collections::HashMap;

/// Shannon entropy over character frequencies, in bits per character.
pub fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut freq: HashMap<char, u32> = HashMap::new();
    let mut total = 0u32;
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
        total += 1;
    }
    let total = total as f64;
    freq.values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Fraction of vowels in the string. `y` counts as a vowel: romanized names
/// and English words both lean on it where no other vowel appears.
pub fn vowel_ratio(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let vowels = s
        .chars()
        .filter(|c| matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u' | 'y'))
        .count();
    vowels as f64 / s.chars().count() as f64
}

/// A plaintext split into leading digits, a lowercased middle root, and the
/// trailing decoration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decomposed {
    pub prefix: String,
    pub root: String,
    /// Trailing special run followed by the trailing digit run, in original
    /// order (`password!23` decomposes to suffix `!23`).
    pub suffix: String,
}

/// Strip leading digits, trailing digits, then trailing specials; what
/// remains in the middle, lowercased, is the root.
pub fn decompose(plaintext: &str) -> Decomposed {
    let chars: Vec<char> = plaintext.chars().collect();

    let mut start = 0;
    while start < chars.len() && chars[start].is_ascii_digit() {
        start += 1;
    }
    let prefix: String = chars[..start].iter().collect();

    let mut end = chars.len();
    while end > start && chars[end - 1].is_ascii_digit() {
        end -= 1;
    }
    let digit_suffix: String = chars[end..].iter().collect();

    let mut mid_end = end;
    while mid_end > start && !chars[mid_end - 1].is_ascii_alphanumeric() {
        mid_end -= 1;
    }
    let special_suffix: String = chars[mid_end..end].iter().collect();

    let root: String = chars[start..mid_end]
        .iter()
        .collect::<String>()
        .to_lowercase();

    Decomposed {
        prefix,
        root,
        suffix: format!("{}{}", special_suffix, digit_suffix),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Structured(Decomposed),
    Random,
}

/// A plaintext is structured when its root looks like language: at least
/// three letters with a vowel, and either long enough to trust outright or
/// short with the vowel-ratio and entropy guards that exclude garbage like
/// `xfr` and `eii`.
pub fn classify(plaintext: &str, config: &ClassifierConfig) -> Classification {
    if shannon_entropy(plaintext) >= config.entropy_threshold {
        return Classification::Random;
    }
    let decomposed = decompose(plaintext);
    let root = &decomposed.root;
    let len = root.chars().count();

    if len < 3 || !root.chars().all(|c| c.is_alphabetic()) {
        return Classification::Random;
    }
    let ratio = vowel_ratio(root);
    if ratio == 0.0 {
        return Classification::Random;
    }
    if len >= 5 {
        return Classification::Structured(decomposed);
    }
    if ratio >= config.min_vowel_ratio && shannon_entropy(root) < config.short_root_entropy {
        return Classification::Structured(decomposed);
    }
    Classification::Random
}
