//! Potfile parsing shared by Stage 1 and the collect step.
//!
//! The remote cracking binary records successes as `hash:plain` lines, where
//! `plain` may be `$HEX[aabbcc]` for non-printable bytes. The potfile's line
//! count is the authoritative crack counter.

use serde::{Deserialize, Serialize};

/// One recovered (hash, plaintext) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PotfileEntry {
    /// Uppercase 40-char hex SHA-1.
    pub hash: String,
    /// Raw plaintext bytes, already `$HEX[...]`-decoded.
    pub plain: Vec<u8>,
}

impl PotfileEntry {
    /// Plaintext as a string, with invalid UTF-8 replaced.
    pub fn plain_lossy(&self) -> String {
        String::from_utf8_lossy(&self.plain).into_owned()
    }
}

/// The JSONL record appended to the PEARLS and DIAMONDS pair files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairRecord {
    pub hash: String,
    pub plain: String,
}

impl From<&PotfileEntry> for PairRecord {
    fn from(entry: &PotfileEntry) -> Self {
        Self {
            hash: entry.hash.clone(),
            plain: entry.plain_lossy(),
        }
    }
}

/// Decode a potfile plaintext field. `$HEX[...]` wraps raw bytes; anything
/// else is taken verbatim.
pub fn decode_plain(field: &str) -> Vec<u8> {
    if let Some(inner) = field
        .strip_prefix("$HEX[")
        .and_then(|rest| rest.strip_suffix(']'))
    {
        if let Ok(bytes) = hex::decode(inner) {
            return bytes;
        }
    }
    field.as_bytes().to_vec()
}

/// Parse one potfile line. Returns `None` for malformed lines (no separator,
/// or a hash that is not 40 hex chars); callers count and report those.
pub fn parse_line(line: &str) -> Option<PotfileEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (hash, plain) = line.split_once(':')?;
    if hash.len() != 40 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(PotfileEntry {
        hash: hash.to_ascii_uppercase(),
        plain: decode_plain(plain),
    })
}

/// Parse a whole potfile body. Returns the entries and the malformed count.
pub fn parse(content: &str) -> (Vec<PotfileEntry>, u64) {
    let mut entries = Vec::new();
    let mut malformed = 0u64;
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(entry) => entries.push(entry),
            None => malformed += 1,
        }
    }
    (entries, malformed)
}
