//! Cohort classification: named cultural/linguistic/topical categories with
//! explicit regex lists over the root, plus the discovery patterns that probe
//! the unclassified residue for potential new cohorts.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::info;

pub struct Cohort {
    pub name: &'static str,
    pub patterns: Vec<Regex>,
    /// Seed list file under the feedback directory, grown when new roots
    /// match this cohort.
    pub seed_file: Option<&'static str>,
}

fn cohort(name: &'static str, seed_file: Option<&'static str>, patterns: &[&str]) -> Cohort {
    Cohort {
        name,
        patterns: patterns
            .iter()
            .map(|p| Regex::new(p).expect("compiled-in cohort pattern"))
            .collect(),
        seed_file,
    }
}

/// The curated cohort set. A root may match zero, one or several cohorts.
static COHORTS: LazyLock<Vec<Cohort>> = LazyLock::new(|| {
    vec![
        cohort(
            "spanish-names",
            Some("cohort-spanish.txt"),
            &[
                r"^(jose|juan|luis|carlos|pedro|jorge|maria|carmen|rosa|ana)",
                r"(ez|ito|ita|illo)$",
                r"^(fernand|gonzal|rodrig|mart[ij]n|garc)",
            ],
        ),
        cohort(
            "portuguese-names",
            Some("cohort-portuguese.txt"),
            &[
                r"^(joao|paulo|pedro|tiago|bruno|marcos|felipe|gabriel)",
                r"(inho|inha|eira|eiro)$",
                r"^(silva|santos|olivei|pereir|almeid)",
            ],
        ),
        cohort(
            "turkish-names",
            Some("cohort-turkish.txt"),
            &[
                r"^(mehmet|mustafa|ahmet|emre|murat|fatma|ayse|elif)",
                r"(oglu|can|han)$",
            ],
        ),
        cohort(
            "vietnamese-names",
            Some("cohort-vietnamese.txt"),
            &[r"^(nguyen|tran|pham|hoang|phan|truong|huynh)", r"^(thanh|minh|tuan|anh|linh)"],
        ),
        cohort(
            "arabic-romanized",
            Some("cohort-arabic.txt"),
            &[
                r"^(mohamed|mohammed|muhammad|ahmed|mahmoud|mostafa|khaled)",
                r"^(abdul|abdel|abd al)",
                r"(allah|eldin|uddin)$",
            ],
        ),
        cohort(
            "music",
            None,
            &[
                r"(metallica|nirvana|beatles|slipknot|eminem|rihanna|beyonce)",
                r"(music|rocker|metal|hiphop|rapper)$",
            ],
        ),
        cohort(
            "gaming",
            None,
            &[
                r"(pokemon|zelda|mario|sonic|halo|warcraft|minecraft|fortnite)",
                r"(gamer|noob|sniper|ninja)$",
            ],
        ),
        cohort(
            "sports",
            None,
            &[
                r"(arsenal|chelsea|liverpool|barcelona|juventus|lakers|yankees)",
                r"(futbol|soccer|football|basket)$",
            ],
        ),
    ]
});

/// Discovery patterns: a human-curated research backlog probed against the
/// unclassified residue. Matching enough roots surfaces a potential new
/// cohort in the report; promotion into `COHORTS` stays manual.
static DISCOVERY_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("korean-romanized", r"^(kim|lee|park|choi|jung|kang|cho|yoon)"),
        ("indonesian", r"^(budi|agus|sri|dewi|putri|wahyu|bayu)"),
        ("polish", r"(czyk|wski|ska|iec)$"),
        ("hindi-romanized", r"^(raj|kumar|singh|sharma|priya|amit|anil)"),
        ("anime", r"(naruto|sasuke|goku|luffy|ichigo|senpai|otaku)"),
        ("crypto", r"(bitcoin|hodl|satoshi|ethereum|doge)"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("compiled-in discovery pattern")))
    .collect()
});

/// Keyboard-pattern fragments excluded from new-root discovery.
const KEYBOARD_PREFIXES: &[&str] = &[
    "qwe", "wer", "ert", "rty", "asd", "sdf", "dfg", "fgh", "zxc", "xcv", "cvb", "qaz", "wsx",
    "edc", "abc", "aaa", "qqq", "111", "123",
];

pub fn is_keyboard_fragment(root: &str) -> bool {
    KEYBOARD_PREFIXES.iter().any(|p| root.starts_with(p))
}

/// Names of every cohort the root matches.
pub fn match_cohorts(root: &str) -> Vec<&'static str> {
    COHORTS
        .iter()
        .filter(|c| c.patterns.iter().any(|p| p.is_match(root)))
        .map(|c| c.name)
        .collect()
}

fn seed_file_for(cohort_name: &str) -> Option<&'static str> {
    COHORTS
        .iter()
        .find(|c| c.name == cohort_name)
        .and_then(|c| c.seed_file)
}

/// A discovery pattern that gathered enough unclassified roots.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    pub name: &'static str,
    pub roots: Vec<String>,
}

/// Probe the unclassified residue; patterns matching at least `min_matches`
/// roots are surfaced as potential new cohorts.
pub fn discover(unclassified: &[String], min_matches: usize) -> Vec<Discovery> {
    DISCOVERY_PATTERNS
        .iter()
        .filter_map(|(name, pattern)| {
            let roots: Vec<String> = unclassified
                .iter()
                .filter(|r| pattern.is_match(r))
                .cloned()
                .collect();
            if roots.len() >= min_matches {
                Some(Discovery { name, roots })
            } else {
                None
            }
        })
        .collect()
}

/// Grows cohort seed files, caching file contents so multiple roots sharing
/// a file do not re-read it.
pub struct CohortFiles {
    feedback_dir: PathBuf,
    cache: HashMap<PathBuf, HashSet<String>>,
    pub added: Vec<(String, String)>,
}

impl CohortFiles {
    pub fn new(feedback_dir: &Path) -> Self {
        Self {
            feedback_dir: feedback_dir.to_path_buf(),
            cache: HashMap::new(),
            added: Vec::new(),
        }
    }

    /// Append `root` to the cohort's seed file unless already present.
    /// Returns true when the file was grown.
    pub fn grow(&mut self, cohort_name: &str, root: &str) -> Result<bool> {
        let Some(seed_file) = seed_file_for(cohort_name) else {
            return Ok(false);
        };
        let path = self.feedback_dir.join(seed_file);
        if !self.cache.contains_key(&path) {
            let existing: HashSet<String> = if path.exists() {
                fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?
                    .lines()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect()
            } else {
                HashSet::new()
            };
            self.cache.insert(path.clone(), existing);
        }
        let entries = self.cache.get_mut(&path).expect("cache primed above");
        if entries.contains(root) {
            return Ok(false);
        }
        let mut content = if path.exists() {
            fs::read_to_string(&path)?
        } else {
            String::new()
        };
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(root);
        content.push('\n');
        fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        entries.insert(root.to_string());
        self.added.push((cohort_name.to_string(), root.to_string()));
        info!("cohort {}: added {}", cohort_name, root);
        Ok(true)
    }
}
