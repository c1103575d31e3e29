//! Feedback analyzer: mines the plaintexts recovered in Stage 2 to grow a
//! domain-specific wordlist (`BETA.txt`) and append-rule set
//! (`unobtainium.rule`) that make subsequent batches more productive.

mod analyzer;
mod classify;
mod cohorts;
mod oracle;

pub use analyzer::{AnalyzerReport, FeedbackAnalyzer};
pub use classify::{Classification, Decomposed, classify, decompose, shannon_entropy, vowel_ratio};
pub use cohorts::{CohortFiles, Discovery, discover, is_keyboard_fragment, match_cohorts};
pub use oracle::{BreachCounts, BreachOracle, parse_range_response};
