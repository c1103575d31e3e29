//! The compiled-in attack table.
//!
//! Every named attack maps to exactly one remote command form; the scheduler
//! is attack-agnostic and only consumes this table. The default order is
//! compile-time so that reordering proposals stay reviewable: instant
//! exhaustive brute force first, then the high-ROI lengths, then funnel
//! masks, then the feedback attacks that use the wordlist grown from prior
//! batches, then targeted hybrids, then long-password discovery, then
//! low-ROI clean-up.

use crate::service::TaskRequest;

/// Hashcat-style attack modes.
pub const MODE_DICT: u8 = 0;
pub const MODE_COMBINATOR: u8 = 1;
pub const MODE_MASK: u8 = 3;
pub const MODE_HYBRID_DICT_MASK: u8 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct AttackSpec {
    pub name: &'static str,
    /// Tier 0-4; used for staging and the REORDER adjacency check.
    pub tier: u8,
    pub mode: u8,
    pub wordlist: Option<&'static str>,
    pub rule: Option<&'static str>,
    pub mask: Option<&'static str>,
    /// Extra flags, e.g. `--increment` ranges.
    pub flags: Option<&'static str>,
}

impl AttackSpec {
    const fn mask(name: &'static str, tier: u8, mask: &'static str) -> Self {
        Self {
            name,
            tier,
            mode: MODE_MASK,
            wordlist: None,
            rule: None,
            mask: Some(mask),
            flags: None,
        }
    }

    const fn mask_incr(
        name: &'static str,
        tier: u8,
        mask: &'static str,
        flags: &'static str,
    ) -> Self {
        Self {
            name,
            tier,
            mode: MODE_MASK,
            wordlist: None,
            rule: None,
            mask: Some(mask),
            flags: Some(flags),
        }
    }

    const fn dict(
        name: &'static str,
        tier: u8,
        wordlist: &'static str,
        rule: Option<&'static str>,
    ) -> Self {
        Self {
            name,
            tier,
            mode: MODE_DICT,
            wordlist: Some(wordlist),
            rule,
            mask: None,
            flags: None,
        }
    }

    const fn hybrid(
        name: &'static str,
        tier: u8,
        wordlist: &'static str,
        mask: &'static str,
    ) -> Self {
        Self {
            name,
            tier,
            mode: MODE_HYBRID_DICT_MASK,
            wordlist: Some(wordlist),
            rule: None,
            mask: Some(mask),
            flags: None,
        }
    }

    /// The command fragment submitted as the task's `attackCmd`.
    pub fn attack_cmd(&self) -> String {
        let mut parts = vec![format!("-a {}", self.mode)];
        if let Some(flags) = self.flags {
            parts.push(flags.to_string());
        }
        if let Some(rule) = self.rule {
            parts.push(format!("-r rules/{}", rule));
        }
        match self.mode {
            MODE_MASK => {
                parts.push(self.mask.expect("mask attacks carry a mask").to_string());
            }
            MODE_HYBRID_DICT_MASK => {
                parts.push(format!(
                    "wordlists/{}",
                    self.wordlist.expect("hybrid attacks carry a wordlist")
                ));
                parts.push(self.mask.expect("hybrid attacks carry a mask").to_string());
            }
            MODE_COMBINATOR => {
                let wordlist = self.wordlist.expect("combinator attacks carry a wordlist");
                parts.push(format!("wordlists/{0} wordlists/{0}", wordlist));
            }
            _ => {
                parts.push(format!(
                    "wordlists/{}",
                    self.wordlist.expect("dictionary attacks carry a wordlist")
                ));
            }
        }
        parts.join(" ")
    }

    pub fn to_task_request(&self, hashlist_id: i64) -> TaskRequest {
        TaskRequest {
            name: self.name.to_string(),
            hashlist_id,
            attack_cmd: self.attack_cmd(),
            wordlist_file_id: None,
            rule_file_id: None,
            mask: self.mask.map(|m| m.to_string()),
        }
    }
}

/// The default attack order. New batches always seed from this list, never
/// from the on-disk order, which may predate a binary upgrade.
pub fn default_attacks() -> Vec<AttackSpec> {
    vec![
        // Tier 0: instant exhaustive coverage of the tiny keyspaces.
        AttackSpec::mask("brute-3", 0, "?a?a?a"),
        AttackSpec::mask("brute-4", 0, "?a?a?a?a"),
        AttackSpec::mask_incr(
            "digits-4-8",
            0,
            "?d?d?d?d?d?d?d?d",
            "--increment --increment-min 4",
        ),
        // Tier 1: the high-ROI middle lengths.
        AttackSpec::mask("brute-5", 1, "?a?a?a?a?a"),
        AttackSpec::mask("brute-6", 1, "?a?a?a?a?a?a"),
        AttackSpec::mask("brute-7", 1, "?a?a?a?a?a?a?a"),
        AttackSpec::dict("dict-best64", 1, "baseline.txt", Some("best64.rule")),
        AttackSpec::dict("dict-plain", 1, "baseline.txt", None),
        // Tier 2: funnel masks for short lowercase and capitalized shapes.
        AttackSpec::mask("lower-6", 2, "?l?l?l?l?l?l"),
        AttackSpec::mask("lower-7", 2, "?l?l?l?l?l?l?l"),
        AttackSpec::mask("lower-8", 2, "?l?l?l?l?l?l?l?l"),
        AttackSpec::mask("cap-lower-6", 2, "?u?l?l?l?l?l"),
        AttackSpec::mask("cap-lower-7", 2, "?u?l?l?l?l?l?l"),
        AttackSpec::mask("lower-digit-tail", 2, "?l?l?l?l?l?d?d"),
        // Tier 3: the feedback loop and targeted hybrids.
        AttackSpec::dict("feedback-beta", 3, "BETA.txt", Some("unobtainium.rule")),
        AttackSpec::dict("feedback-beta-best64", 3, "BETA.txt", Some("best64.rule")),
        AttackSpec::hybrid("hybrid-2digit", 3, "baseline.txt", "?d?d"),
        AttackSpec::hybrid("hybrid-4digit", 3, "baseline.txt", "?d?d?d?d"),
        AttackSpec::hybrid("hybrid-special", 3, "baseline.txt", "?s"),
        AttackSpec::hybrid("hybrid-special-digit", 3, "baseline.txt", "?s?d?d"),
        AttackSpec::hybrid("year-append", 3, "baseline.txt", "19?d?d"),
        AttackSpec::hybrid("year-append-2000s", 3, "baseline.txt", "20?d?d"),
        // Tier 4: long-password discovery and low-ROI clean-up.
        AttackSpec {
            name: "double-word",
            tier: 4,
            mode: MODE_COMBINATOR,
            wordlist: Some("baseline.txt"),
            rule: None,
            mask: None,
            flags: None,
        },
        AttackSpec::dict("passphrase", 4, "phrases.txt", None),
        AttackSpec::mask_incr(
            "lower-9-10",
            4,
            "?l?l?l?l?l?l?l?l?l?l",
            "--increment --increment-min 9",
        ),
        AttackSpec::mask("hex-8", 4, "?h?h?h?h?h?h?h?h"),
    ]
}

/// The compiled-in default execution order, by name.
pub fn default_order() -> Vec<&'static str> {
    default_attacks().iter().map(|a| a.name).collect()
}

pub fn get_attack(name: &str) -> Option<AttackSpec> {
    default_attacks().into_iter().find(|a| a.name == name)
}

/// Tier of a named attack; unknown names sort last.
pub fn tier_of(name: &str) -> u8 {
    get_attack(name).map(|a| a.tier).unwrap_or(u8::MAX)
}
