//! The feedback stage driver: streams a batch's recovered plaintexts, grows
//! `BETA.txt` and `unobtainium.rule`, and reports what changed.

use super::classify::{Classification, classify, decompose};
use super::cohorts::{self, CohortFiles, Discovery};
use super::oracle::BreachCounts;
use crate::config::Config;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::LazyLock;
use tracing::{info, warn};

/// Local-frequency floor for including an unclassified root outright.
const MIN_UNCLASSIFIED_FREQ: u64 = 3;
const MIN_UNCLASSIFIED_LEN: usize = 5;
/// Borderline roots at least this long are eligible for oracle promotion.
const MIN_ORACLE_LEN: usize = 4;
const MIN_ORACLE_COUNT: u64 = 1000;
/// Suffix patterns seen at least this often become append rules.
const MIN_SUFFIX_FREQ: u64 = 3;
const MAX_SUFFIX_LEN: usize = 6;
/// Discovery patterns need this many unclassified roots to surface.
const MIN_DISCOVERY_MATCHES: usize = 3;

static YEAR_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(19|20)\d\d$").expect("compiled-in pattern"));

/// Leet substitutions recognized across all plaintexts, as (letter, leet)
/// pairs in hashcat `sXY` rule order.
const LEET_PAIRS: &[(char, char)] = &[
    ('a', '4'),
    ('a', '@'),
    ('e', '3'),
    ('i', '1'),
    ('o', '0'),
    ('s', '$'),
    ('s', '5'),
];

#[derive(Debug, Default)]
pub struct AnalyzerReport {
    pub total_plaintexts: u64,
    pub structured: u64,
    pub random: u64,
    pub new_roots: u64,
    pub cohort_matched: Vec<String>,
    pub oracle_promoted: Vec<(String, u64)>,
    pub beta_added: Vec<String>,
    pub rules_added: Vec<String>,
    pub discoveries: Vec<Discovery>,
    pub cohort_growth: Vec<(String, String)>,
}

pub struct FeedbackAnalyzer<'a> {
    config: &'a Config,
    /// Roots already covered by the baseline wordlist.
    baseline: HashSet<String>,
    /// Rules already present in the baseline rule files.
    baseline_rules: HashSet<String>,
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

impl<'a> FeedbackAnalyzer<'a> {
    /// Load the dedup baselines. A missing baseline wordlist is tolerated
    /// (every root is then "new"), but it is worth a warning.
    pub fn new(config: &'a Config) -> Result<Self> {
        let baseline_path = config.data_dir.join("wordlists/baseline.txt");
        let baseline = if baseline_path.exists() {
            fs::read_to_string(&baseline_path)
                .with_context(|| format!("Failed to read {}", baseline_path.display()))?
                .lines()
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty())
                .collect()
        } else {
            warn!(
                "Baseline wordlist {} missing; all roots will be treated as new",
                baseline_path.display()
            );
            HashSet::new()
        };

        let mut baseline_rules = HashSet::new();
        let rules_dir = config.data_dir.join("rules");
        if rules_dir.exists() {
            for entry in fs::read_dir(&rules_dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "rule") {
                    for line in fs::read_to_string(&path)?.lines() {
                        let line = line.trim();
                        if !line.is_empty() && !line.starts_with('#') {
                            baseline_rules.insert(line.to_string());
                        }
                    }
                }
            }
        }

        Ok(Self {
            config,
            baseline,
            baseline_rules,
        })
    }

    /// Run the full feedback stage over a batch's plaintexts.
    pub async fn run(
        &self,
        plaintexts: &[String],
        oracle: Option<&dyn BreachCounts>,
    ) -> Result<AnalyzerReport> {
        let mut report = AnalyzerReport {
            total_plaintexts: plaintexts.len() as u64,
            ..Default::default()
        };

        // Frequency over unique plaintexts.
        let mut plain_freq: HashMap<&str, u64> = HashMap::new();
        for p in plaintexts {
            *plain_freq.entry(p.as_str()).or_insert(0) += 1;
        }

        let mut root_freq: HashMap<String, u64> = HashMap::new();
        let mut suffix_freq: HashMap<String, u64> = HashMap::new();
        let mut capitalized = 0u64;
        let mut leet_seen: HashSet<(char, char)> = HashSet::new();

        for (plain, freq) in &plain_freq {
            match classify(plain, &self.config.classifier) {
                Classification::Structured(d) => {
                    report.structured += 1;
                    *root_freq.entry(d.root.clone()).or_insert(0) += freq;
                    if !d.suffix.is_empty() && d.suffix.chars().count() <= MAX_SUFFIX_LEN {
                        *suffix_freq.entry(d.suffix).or_insert(0) += freq;
                    }
                }
                Classification::Random => report.random += 1,
            }
            if plain.chars().next().is_some_and(|c| c.is_uppercase()) {
                capitalized += 1;
            }
            for &(letter, leet) in LEET_PAIRS {
                if plain.contains(leet) {
                    let undone = plain.replace(leet, &letter.to_string());
                    let root = decompose(&undone).root;
                    if root.chars().count() >= 4
                        && root.chars().all(|c| c.is_alphabetic())
                        && self.baseline.contains(&root)
                    {
                        leet_seen.insert((letter, leet));
                    }
                }
            }
        }

        // New roots: not baseline, long enough, not a keyboard walk.
        let new_roots: Vec<(String, u64)> = root_freq
            .iter()
            .filter(|&(root, _)| {
                root.chars().count() >= 3
                    && !self.baseline.contains(root)
                    && !cohorts::is_keyboard_fragment(root.as_str())
            })
            .map(|(root, freq)| (root.clone(), *freq))
            .collect();
        report.new_roots = new_roots.len() as u64;

        let mut cohort_matched: Vec<(String, u64)> = Vec::new();
        let mut unclassified: Vec<(String, u64)> = Vec::new();
        let mut cohort_files = CohortFiles::new(&self.config.feedback_dir);
        for (root, freq) in &new_roots {
            let matches = cohorts::match_cohorts(root.as_str());
            if matches.is_empty() {
                unclassified.push((root.clone(), *freq));
            } else {
                cohort_matched.push((root.clone(), *freq));
                for cohort in matches {
                    cohort_files.grow(cohort, root.as_str())?;
                }
            }
        }
        report.cohort_growth = cohort_files.added.clone();
        report.cohort_matched = cohort_matched.iter().map(|(r, _)| r.clone()).collect();

        let unclassified_roots: Vec<String> =
            unclassified.iter().map(|(r, _)| r.clone()).collect();
        report.discoveries = cohorts::discover(&unclassified_roots, MIN_DISCOVERY_MATCHES);

        // BETA assembly: cohort-matched, then frequent unclassified, then
        // oracle-promoted borderliners.
        let mut included: HashSet<String> = HashSet::new();
        let mut by_frequency: Vec<(String, u64)> = Vec::new();
        for (root, _) in &cohort_matched {
            included.insert(root.clone());
        }
        for (root, freq) in &unclassified {
            if *freq >= MIN_UNCLASSIFIED_FREQ && root.chars().count() >= MIN_UNCLASSIFIED_LEN {
                included.insert(root.clone());
                by_frequency.push((root.clone(), *freq));
            }
        }

        let borderline: Vec<String> = unclassified
            .iter()
            .filter(|(root, _)| {
                !included.contains(root) && root.chars().count() >= MIN_ORACLE_LEN
            })
            .map(|(root, _)| root.clone())
            .collect();
        if let Some(oracle) = oracle {
            let counts = oracle.counts(&borderline).await;
            for root in &borderline {
                let count = counts.get(root).copied().unwrap_or(0);
                if count >= MIN_ORACLE_COUNT {
                    info!("HIBP promoted: {} ({} breaches)", root, group_thousands(count));
                    included.insert(root.clone());
                    report.oracle_promoted.push((root.clone(), count));
                }
            }
        }

        let beta_entries =
            self.assemble_beta(&cohort_matched, &report.oracle_promoted, &by_frequency);
        report.beta_added = self.append_new_lines(&self.config.beta_file(), &beta_entries)?;

        let rules = self.derive_rules(&suffix_freq, capitalized, &leet_seen, &plain_freq);
        report.rules_added = self.append_new_lines(&self.config.rule_file(), &rules)?;

        info!(
            "feedback: {} structured / {} random, {} new roots, {} BETA additions, {} rules",
            report.structured,
            report.random,
            report.new_roots,
            report.beta_added.len(),
            report.rules_added.len()
        );
        Ok(report)
    }

    /// Order matters for the output: cohort-matched first, then
    /// oracle-promoted, then the frequency class, each by local frequency
    /// descending with name as the tiebreak.
    fn assemble_beta(
        &self,
        cohort_matched: &[(String, u64)],
        oracle_promoted: &[(String, u64)],
        by_frequency: &[(String, u64)],
    ) -> Vec<String> {
        fn sorted_desc(entries: &[(String, u64)]) -> Vec<String> {
            let mut entries = entries.to_vec();
            entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            entries.into_iter().map(|(root, _)| root).collect()
        }

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for root in sorted_desc(cohort_matched)
            .into_iter()
            .chain(sorted_desc(oracle_promoted))
            .chain(sorted_desc(by_frequency))
        {
            if seen.insert(root.clone()) {
                out.push(root);
            }
        }
        out
    }

    /// Append-style rules from observed suffixes and transformations, minus
    /// anything the baseline rule files already carry.
    fn derive_rules(
        &self,
        suffix_freq: &HashMap<String, u64>,
        capitalized: u64,
        leet_seen: &HashSet<(char, char)>,
        plain_freq: &HashMap<&str, u64>,
    ) -> Vec<String> {
        let mut rules: Vec<(String, u64)> = Vec::new();

        for (suffix, freq) in suffix_freq {
            if *freq < MIN_SUFFIX_FREQ {
                continue;
            }
            let rule: String = suffix.chars().map(|c| format!("${}", c)).collect();
            rules.push((rule, *freq));
        }
        if capitalized >= MIN_SUFFIX_FREQ {
            rules.push(("c".to_string(), capitalized));
        }
        for (letter, leet) in leet_seen {
            rules.push((format!("s{}{}", letter, leet), 1));
        }
        // Year suffixes often appear spread thin across many years; emit the
        // generic append when any year shows up at all.
        let year_hits: u64 = plain_freq
            .iter()
            .filter(|(p, _)| YEAR_SUFFIX.is_match(p))
            .map(|(_, f)| *f)
            .sum();
        if year_hits >= MIN_SUFFIX_FREQ {
            rules.push(("$2$0$d$d".to_string(), year_hits));
        }

        rules.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rules
            .into_iter()
            .map(|(rule, _)| rule)
            .filter(|rule| !self.baseline_rules.contains(rule))
            .collect()
    }

    /// Append entries not already present in the target file; returns what
    /// was actually added, preserving the given order.
    fn append_new_lines(
        &self,
        path: &std::path::Path,
        entries: &[String],
    ) -> Result<Vec<String>> {
        let existing: HashSet<String> = if path.exists() {
            fs::read_to_string(path)?
                .lines()
                .map(|l| l.trim().to_string())
                .collect()
        } else {
            HashSet::new()
        };
        let fresh: Vec<String> = entries
            .iter()
            .filter(|e| !existing.contains(*e))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(fresh);
        }
        let mut content = if path.exists() {
            fs::read_to_string(path)?
        } else {
            String::new()
        };
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        for entry in &fresh {
            content.push_str(entry);
            content.push('\n');
        }
        fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(fresh)
    }
}
