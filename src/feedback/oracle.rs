//! Breach-count oracle client.
//!
//! The oracle is an HTTPS endpoint with a k-anonymity prefix query: only the
//! first five hex characters of the candidate's SHA-1 ever leave the process,
//! and the response is scanned locally for the exact suffix. The call is best
//! effort — a network failure yields count 0 and the root falls back to the
//! local frequency thresholds.

use async_trait::async_trait;
use futures::future::join_all;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait BreachCounts: Send + Sync {
    /// Breach counts for each candidate. Best effort: failures count as 0,
    /// and candidates beyond the per-batch query cap are simply absent.
    async fn counts(&self, candidates: &[String]) -> HashMap<String, u64>;
}

pub struct BreachOracle {
    http: reqwest::Client,
    base_url: String,
    max_queries: usize,
    batch_size: usize,
    batch_gap: Duration,
}

/// SHA-1 the candidate and split the uppercase hex into the 5-char prefix
/// sent to the oracle and the 35-char suffix matched locally.
pub fn hash_split(candidate: &str) -> (String, String) {
    let digest = Sha1::digest(candidate.as_bytes());
    let hex = hex::encode_upper(digest);
    (hex[..5].to_string(), hex[5..].to_string())
}

/// Scan a `/range/<prefix>` response body for the exact remaining suffix.
pub fn parse_range_response(body: &str, suffix: &str) -> u64 {
    for line in body.lines() {
        if let Some((line_suffix, count)) = line.trim().split_once(':') {
            if line_suffix.eq_ignore_ascii_case(suffix) {
                return count.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

impl BreachOracle {
    pub fn new(config: &crate::config::Config) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: config.oracle_url.trim_end_matches('/').to_string(),
            max_queries: config.oracle_max_queries,
            batch_size: config.oracle_batch_size,
            batch_gap: Duration::from_millis(config.oracle_batch_gap_ms),
        }
    }

    async fn count_one(&self, candidate: &str) -> u64 {
        let (prefix, suffix) = hash_split(candidate);
        let url = format!("{}/range/{}", self.base_url, prefix);
        match self.http.get(&url).send().await {
            Ok(response) => match response.text().await {
                Ok(body) => parse_range_response(&body, &suffix),
                Err(e) => {
                    warn!("oracle body read failed for {}: {}", prefix, e);
                    0
                }
            },
            Err(e) => {
                warn!("oracle query failed for {}: {}", prefix, e);
                0
            }
        }
    }
}

/// Split candidates into concurrent batches, honoring the total query cap.
pub(crate) fn plan_batches(
    candidates: &[String],
    max_queries: usize,
    batch_size: usize,
) -> Vec<Vec<String>> {
    candidates
        .iter()
        .take(max_queries)
        .cloned()
        .collect::<Vec<_>>()
        .chunks(batch_size.max(1))
        .map(|c| c.to_vec())
        .collect()
}

#[async_trait]
impl BreachCounts for BreachOracle {
    async fn counts(&self, candidates: &[String]) -> HashMap<String, u64> {
        let mut results = HashMap::new();
        if candidates.len() > self.max_queries {
            debug!(
                "oracle cap: querying {} of {} candidates",
                self.max_queries,
                candidates.len()
            );
        }
        let batches = plan_batches(candidates, self.max_queries, self.batch_size);
        let total = batches.len();
        for (i, batch) in batches.into_iter().enumerate() {
            let counts = join_all(batch.iter().map(|c| self.count_one(c))).await;
            for (candidate, count) in batch.into_iter().zip(counts) {
                results.insert(candidate, count);
            }
            if i + 1 < total {
                tokio::time::sleep(self.batch_gap).await;
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_split_of_known_value() {
        // SHA-1("password") = 5BAA61E4C9B93F3F0682250B6CF8331B7EE68FD8
        let (prefix, suffix) = hash_split("password");
        assert_eq!(prefix, "5BAA6");
        assert_eq!(suffix, "1E4C9B93F3F0682250B6CF8331B7EE68FD8");
        assert_eq!(suffix.len(), 35);
    }

    #[test]
    fn test_parse_range_response_finds_exact_suffix() {
        let body = "003D68EB55068C33ACE09247EE4C639306B:3\n\
                    1E4C9B93F3F0682250B6CF8331B7EE68FD8:9545824\n\
                    011053FD0102E94D6AE2F8B83D76FAF94F6:1";
        assert_eq!(
            parse_range_response(body, "1E4C9B93F3F0682250B6CF8331B7EE68FD8"),
            9_545_824
        );
        assert_eq!(
            parse_range_response(body, "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF"),
            0
        );
    }

    #[test]
    fn test_parse_range_response_is_case_insensitive() {
        let body = "1e4c9b93f3f0682250b6cf8331b7ee68fd8:42";
        assert_eq!(
            parse_range_response(body, "1E4C9B93F3F0682250B6CF8331B7EE68FD8"),
            42
        );
    }

    #[test]
    fn test_plan_batches_caps_and_chunks() {
        let candidates: Vec<String> = (0..50).map(|n| format!("root{}", n)).collect();
        let batches = plan_batches(&candidates, 30, 20);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 20);
        assert_eq!(batches[1].len(), 10);

        let uncapped = plan_batches(&candidates, 200, 20);
        assert_eq!(uncapped.len(), 3);
        assert_eq!(uncapped.iter().map(Vec::len).sum::<usize>(), 50);
    }
}
