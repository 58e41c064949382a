//! Author, operation, and writer identifiers.

use std::cmp::Ordering;
use std::fmt;

/// Device identifier of an operation's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AuthorId(pub u64);

impl AuthorId {
    /// Create an author id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for AuthorId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Globally unique operation identifier.
///
/// `counter` strictly increases per author and doubles as the operation's
/// Lamport timestamp. Ordering is by counter, then author, which yields the
/// deterministic fold order for concurrent operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId {
    /// Lamport counter.
    pub counter: u64,
    /// Authoring device.
    pub author: AuthorId,
}

impl OpId {
    /// Create an op id.
    pub const fn new(author: AuthorId, counter: u64) -> Self {
        Self { counter, author }
    }

    /// Writer stamp used for last-writer-wins.
    pub const fn stamp(self) -> WriterStamp {
        WriterStamp {
            lamport: self.counter,
            author: self.author,
        }
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then(self.author.cmp(&other.author))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.author)
    }
}

/// Last-writer-wins precedence.
///
/// A greater stamp wins. Higher lamport wins outright; on an exact lamport
/// tie the lower author id is the greater stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriterStamp {
    /// Lamport timestamp of the write.
    pub lamport: u64,
    /// Author of the write.
    pub author: AuthorId,
}

impl Ord for WriterStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then(other.author.cmp(&self.author))
    }
}

impl PartialOrd for WriterStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Position of a record in the operation log (0-based, gap-free).
pub type LogPosition = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_id_orders_by_counter_then_author() {
        let a = OpId::new(AuthorId(2), 5);
        let b = OpId::new(AuthorId(1), 6);
        let c = OpId::new(AuthorId(1), 5);
        assert!(a < b);
        assert!(c < a);
    }

    #[test]
    fn test_writer_stamp_higher_lamport_wins() {
        let old = WriterStamp {
            lamport: 3,
            author: AuthorId(1),
        };
        let new = WriterStamp {
            lamport: 4,
            author: AuthorId(9),
        };
        assert!(new > old);
    }

    #[test]
    fn test_writer_stamp_tie_prefers_lower_author() {
        let a = WriterStamp {
            lamport: 3,
            author: AuthorId(7),
        };
        let b = WriterStamp {
            lamport: 3,
            author: AuthorId(2),
        };
        assert!(b > a);
        assert_eq!(a.max(b), b);
    }

    #[test]
    fn test_display() {
        let id = OpId::new(AuthorId(0xab), 12);
        assert_eq!(id.to_string(), "12@00000000000000ab");
    }
}
