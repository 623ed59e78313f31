use std::fmt;

/// A change-detection hash of a session payload.
///
/// Every driver keeps the fingerprint of the payload it last read or
/// confirmed persisted, and compares it against the incoming payload on
/// `write` to decide between a full payload write and a touch-only update.
/// The hash is not security-sensitive; it only has to be collision-resistant
/// enough that identical fingerprints mean "nothing to persist".
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    /// Fingerprint of the given payload bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    /// The canonical "empty/untouched" fingerprint.
    ///
    /// This is what a driver holds after reading a missing record, after a
    /// failed lock acquisition, and after an undecodable record was treated
    /// as absent.
    pub fn empty() -> Self {
        Self::of(&[])
    }

    /// Whether `data` hashes to this fingerprint.
    pub fn matches(&self, data: &[u8]) -> bool {
        *self == Self::of(data)
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.0.to_hex()[..8])
    }
}
