//! Stable identity hashing for job postings.
//!
//! The fingerprint is the deduplication key shared by every lifecycle stage. It is derived
//! from the raw title, company, location and posted-date text (trimmed and lowercased) and
//! must stay byte-compatible with fingerprints already stored in existing archives.

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 over the canonical identity fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Accepts a previously computed fingerprint, e.g. when decoding a stored row.
    pub fn parse(hex_digest: &str) -> Option<Self> {
        let ok = hex_digest.len() == 64
            && hex_digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        ok.then(|| Self(hex_digest.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the identity fingerprint of a posting.
///
/// Absent fields hash as empty strings, so a posting with none of the four fields collides
/// with every other such posting.
pub fn fingerprint(
    title: Option<&str>,
    company: Option<&str>,
    location: Option<&str>,
    posted_date: Option<&str>,
) -> Fingerprint {
    let fold = |value: Option<&str>| value.unwrap_or_default().trim().to_lowercase();

    let mut parts = BTreeMap::new();
    parts.insert("title", fold(title));
    parts.insert("company", fold(company));
    parts.insert("location", fold(location));
    parts.insert("posted_date", fold(posted_date));

    let canonical = canonical_json(&parts);
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Fingerprint(hex::encode(hasher.finalize()))
}

fn canonical_json(parts: &BTreeMap<&str, String>) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
    parts
        .serialize(&mut ser)
        .expect("serializing a string map into memory cannot fail");
    out
}

/// `{"a": "x", "b": "y"}` separators, matching the archives written before this service.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}
