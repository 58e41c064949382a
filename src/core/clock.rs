//! Version vectors for causality tracking.

use std::collections::BTreeMap;

use super::error::DecodeError;
use super::ids::{AuthorId, OpId};

/// Highest operation counter observed per author.
///
/// Entries are never zero: an author that has not been observed is absent.
/// Because operations are folded in causal order, a vector is an exact
/// summary of the observed set: `contains(id)` iff `id.counter <= vv[author]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VersionVector {
    entries: BTreeMap<AuthorId, u64>,
}

impl VersionVector {
    /// Create an empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the counter for an author (0 if never observed).
    pub fn get(&self, author: AuthorId) -> u64 {
        self.entries.get(&author).copied().unwrap_or(0)
    }

    /// Set the counter for an author. Setting 0 removes the entry.
    pub fn set(&mut self, author: AuthorId, counter: u64) {
        if counter == 0 {
            self.entries.remove(&author);
        } else {
            self.entries.insert(author, counter);
        }
    }

    /// Record an observed operation.
    pub fn observe(&mut self, id: OpId) {
        let entry = self.entries.entry(id.author).or_insert(0);
        *entry = (*entry).max(id.counter);
    }

    /// Check whether an operation is covered by this vector.
    pub fn contains(&self, id: OpId) -> bool {
        id.counter != 0 && id.counter <= self.get(id.author)
    }

    /// Merge with another vector (pointwise max).
    pub fn merge(&mut self, other: &VersionVector) {
        for (&author, &counter) in &other.entries {
            let entry = self.entries.entry(author).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Pointwise minimum of two vectors.
    pub fn meet(&self, other: &VersionVector) -> VersionVector {
        let mut out = VersionVector::new();
        for (&author, &counter) in &self.entries {
            out.set(author, counter.min(other.get(author)));
        }
        out
    }

    /// Check that every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .entries
            .iter()
            .all(|(&author, &counter)| self.get(author) >= counter)
    }

    /// Highest counter across all authors.
    pub fn max_counter(&self) -> u64 {
        self.entries.values().copied().max().unwrap_or(0)
    }

    /// Number of authors observed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in author order.
    pub fn iter(&self) -> impl Iterator<Item = (AuthorId, u64)> + '_ {
        self.entries.iter().map(|(&a, &c)| (a, c))
    }

    /// Authors present in either vector.
    pub fn authors_union(&self, other: &VersionVector) -> Vec<AuthorId> {
        let mut authors: Vec<AuthorId> = self
            .entries
            .keys()
            .chain(other.entries.keys())
            .copied()
            .collect();
        authors.sort_unstable();
        authors.dedup();
        authors
    }

    /// Stable checksum of the encoded vector.
    pub fn fingerprint(&self) -> u32 {
        crc32c::crc32c(&self.encode())
    }

    /// Encode to bytes.
    ///
    /// ```text
    /// +0  Entry count (4 bytes LE32)
    /// +4  Entries: author (8 bytes LE64) + counter (8 bytes LE64)
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.entries.len() * 16);
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (author, counter) in &self.entries {
            buf.extend_from_slice(&author.0.to_le_bytes());
            buf.extend_from_slice(&counter.to_le_bytes());
        }
    }

    /// Decode from bytes, returning the vector and bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::UnexpectedEof);
        }
        let count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let needed = count
            .checked_mul(16)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(|| DecodeError::InvalidEncoding("vector length overflow".into()))?;
        if data.len() < needed {
            return Err(DecodeError::UnexpectedEof);
        }

        let mut vv = VersionVector::new();
        let mut offset = 4;
        let mut previous: Option<AuthorId> = None;
        for _ in 0..count {
            let author = AuthorId(read_u64(data, offset));
            let counter = read_u64(data, offset + 8);
            offset += 16;
            if previous.is_some_and(|p| p >= author) {
                return Err(DecodeError::InvalidEncoding(
                    "vector entries not strictly ordered".into(),
                ));
            }
            if counter == 0 {
                return Err(DecodeError::InvalidEncoding("zero vector entry".into()));
            }
            previous = Some(author);
            vv.entries.insert(author, counter);
        }
        Ok((vv, offset))
    }
}

impl FromIterator<(AuthorId, u64)> for VersionVector {
    fn from_iter<T: IntoIterator<Item = (AuthorId, u64)>>(iter: T) -> Self {
        let mut vv = VersionVector::new();
        for (author, counter) in iter {
            if counter > vv.get(author) {
                vv.set(author, counter);
            }
        }
        vv
    }
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vv(entries: &[(u64, u64)]) -> VersionVector {
        entries.iter().map(|&(a, c)| (AuthorId(a), c)).collect()
    }

    #[test]
    fn test_observe_and_contains() {
        let mut v = VersionVector::new();
        v.observe(OpId::new(AuthorId(1), 3));
        assert!(v.contains(OpId::new(AuthorId(1), 2)));
        assert!(v.contains(OpId::new(AuthorId(1), 3)));
        assert!(!v.contains(OpId::new(AuthorId(1), 4)));
        assert!(!v.contains(OpId::new(AuthorId(2), 1)));

        // Observing an older op never lowers the entry
        v.observe(OpId::new(AuthorId(1), 1));
        assert_eq!(v.get(AuthorId(1)), 3);
    }

    #[test]
    fn test_merge_takes_max() {
        let mut a = vv(&[(1, 5), (2, 1)]);
        let b = vv(&[(1, 3), (3, 7)]);
        a.merge(&b);
        assert_eq!(a, vv(&[(1, 5), (2, 1), (3, 7)]));
    }

    #[test]
    fn test_dominates() {
        let a = vv(&[(1, 1)]);
        let b = vv(&[(1, 2)]);
        let c = vv(&[(2, 1)]);

        assert!(b.dominates(&a));
        assert!(!a.dominates(&b));
        assert!(a.dominates(&a));
        assert!(!a.dominates(&c) && !c.dominates(&a));
        assert!(a.dominates(&VersionVector::new()));
    }

    #[test]
    fn test_meet() {
        let a = vv(&[(1, 5), (2, 4)]);
        let b = vv(&[(1, 3), (3, 9)]);
        assert_eq!(a.meet(&b), vv(&[(1, 3)]));
    }

    #[test]
    fn test_set_zero_removes() {
        let mut v = vv(&[(1, 5)]);
        v.set(AuthorId(1), 0);
        assert!(v.is_empty());
    }

    #[test]
    fn test_encode_decode() {
        let v = vv(&[(1, 5), (42, 9)]);
        let mut bytes = v.encode();
        bytes.extend_from_slice(&[0xAA; 3]);

        let (decoded, consumed) = VersionVector::decode(&bytes).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(consumed, 4 + 2 * 16);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let bytes = vv(&[(1, 5)]).encode();
        assert!(matches!(
            VersionVector::decode(&bytes[..10]),
            Err(DecodeError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_decode_rejects_unordered() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        for (a, c) in [(5u64, 1u64), (3, 1)] {
            bytes.extend_from_slice(&a.to_le_bytes());
            bytes.extend_from_slice(&c.to_le_bytes());
        }
        assert!(matches!(
            VersionVector::decode(&bytes),
            Err(DecodeError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_fingerprint_differs() {
        assert_ne!(vv(&[(1, 1)]).fingerprint(), vv(&[(1, 2)]).fingerprint());
        assert_eq!(vv(&[]).fingerprint(), VersionVector::new().fingerprint());
    }
}
