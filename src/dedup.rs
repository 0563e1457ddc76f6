use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Duplicate,
    Distinct,
}

/// Remembers the fingerprint of the previous sample of one session.
#[derive(Debug, Default, Clone)]
pub struct DedupGate {
    last_seen: Option<Fingerprint>,
}

impl DedupGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Duplicate` only when both fingerprints exist and match; otherwise the new
    /// fingerprint (possibly absent) becomes the one to compare against next.
    pub fn check(&mut self, fingerprint: Option<&Fingerprint>) -> DedupOutcome {
        match (fingerprint, self.last_seen.as_ref()) {
            (Some(current), Some(previous)) if current == previous => DedupOutcome::Duplicate,
            _ => {
                self.last_seen = fingerprint.cloned();
                DedupOutcome::Distinct
            }
        }
    }

    pub fn last_seen(&self) -> Option<&Fingerprint> {
        self.last_seen.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::{DedupGate, DedupOutcome};
    use crate::fingerprint::Fingerprint;

    #[test]
    fn first_frame_is_distinct() {
        let mut gate = DedupGate::new();
        assert_eq!(gate.check(Some(&Fingerprint::of(b"a"))), DedupOutcome::Distinct);
    }

    #[test]
    fn consecutive_equal_frames_are_duplicates() {
        let mut gate = DedupGate::new();
        let a = Fingerprint::of(b"a");
        let b = Fingerprint::of(b"b");

        assert_eq!(gate.check(Some(&a)), DedupOutcome::Distinct);
        assert_eq!(gate.check(Some(&a)), DedupOutcome::Duplicate);
        assert_eq!(gate.check(Some(&a)), DedupOutcome::Duplicate);
        assert_eq!(gate.check(Some(&b)), DedupOutcome::Distinct);
        assert_eq!(gate.check(Some(&a)), DedupOutcome::Distinct);
        assert_eq!(gate.last_seen(), Some(&a));
    }

    #[test]
    fn missing_fingerprint_resets_comparison() {
        let mut gate = DedupGate::new();
        let a = Fingerprint::of(b"a");

        assert_eq!(gate.check(Some(&a)), DedupOutcome::Distinct);
        assert_eq!(gate.check(None), DedupOutcome::Distinct);
        assert_eq!(gate.last_seen(), None);
        assert_eq!(gate.check(None), DedupOutcome::Distinct);
        assert_eq!(gate.check(Some(&a)), DedupOutcome::Distinct);
    }
}
