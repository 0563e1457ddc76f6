use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 content hash of a frame, rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint of a frame, or `None` when there is nothing to hash.
///
/// An empty payload yields no fingerprint so that the dedup gate never treats
/// two failed reads as the same screen.
pub fn fingerprint(bytes: &[u8]) -> Option<Fingerprint> {
    if bytes.is_empty() {
        None
    } else {
        Some(Fingerprint::of(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::{Fingerprint, fingerprint};

    #[test]
    fn identical_bytes_share_a_fingerprint() {
        assert_eq!(Fingerprint::of(b"frame"), Fingerprint::of(b"frame"));
        assert_ne!(Fingerprint::of(b"frame"), Fingerprint::of(b"frame!"));
    }

    #[test]
    fn renders_fixed_width_hex() {
        let fp = Fingerprint::of(b"");
        assert_eq!(
            fp.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(fp.short(), "e3b0c44298fc");
    }

    #[test]
    fn empty_payload_has_no_fingerprint() {
        assert!(fingerprint(&[]).is_none());
        assert!(fingerprint(b"x").is_some());
    }
}
