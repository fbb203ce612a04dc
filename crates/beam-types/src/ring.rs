//! Fixed-capacity circular buffer.
//!
//! Backs the per-payer recent-hash, history, and fraud-record windows. The
//! backing storage is a `[T; N]` array with explicit head and length, so the
//! capacity is part of the type and pushing never reallocates. When full, a
//! push overwrites (and returns) the oldest entry.
//!
//! Serialized as a plain sequence, oldest first.

use serde::{Deserialize, Serialize};

use crate::BeamError;

/// Circular buffer holding at most `N` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "Vec<T>", try_from = "Vec<T>")]
#[serde(bound(
    serialize = "T: Copy + Default + Serialize",
    deserialize = "T: Copy + Default + Deserialize<'de>"
))]
pub struct RingBuffer<T: Copy + Default, const N: usize> {
    slots: [T; N],
    /// Index of the oldest entry.
    head: usize,
    len: usize,
}

impl<T: Copy + Default, const N: usize> RingBuffer<T, N> {
    /// Create an empty buffer.
    ///
    /// # Panics
    /// Panics if `N` is zero.
    #[must_use]
    pub fn new() -> Self {
        assert!(N > 0, "RingBuffer capacity must be > 0");
        Self {
            slots: [T::default(); N],
            head: 0,
            len: 0,
        }
    }

    /// Append an entry, evicting and returning the oldest one when full.
    pub fn push(&mut self, value: T) -> Option<T> {
        if self.len < N {
            let tail = (self.head + self.len) % N;
            self.slots[tail] = value;
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.head];
            self.slots[self.head] = value;
            self.head = (self.head + 1) % N;
            Some(evicted)
        }
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        (0..self.len).map(move |i| &self.slots[(self.head + i) % N])
    }

    /// First entry (oldest to newest) matching the predicate.
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<&T> {
        self.iter().find(|item| pred(item))
    }

    /// Whether any entry matches the predicate.
    pub fn any(&self, pred: impl FnMut(&T) -> bool) -> bool {
        self.find(pred).is_some()
    }

    /// Most recently pushed entry.
    #[must_use]
    pub fn newest(&self) -> Option<&T> {
        self.iter().next_back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == N
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: Copy + Default + PartialEq, const N: usize> RingBuffer<T, N> {
    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        self.iter().any(|item| item == value)
    }
}

impl<T: Copy + Default + PartialEq, const N: usize> PartialEq for RingBuffer<T, N> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl<T: Copy + Default + Eq, const N: usize> Eq for RingBuffer<T, N> {}

impl<T: Copy + Default, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default, const N: usize> From<RingBuffer<T, N>> for Vec<T> {
    fn from(ring: RingBuffer<T, N>) -> Self {
        ring.iter().copied().collect()
    }
}

impl<T: Copy + Default, const N: usize> TryFrom<Vec<T>> for RingBuffer<T, N> {
    type Error = BeamError;

    fn try_from(items: Vec<T>) -> Result<Self, Self::Error> {
        if items.len() > N {
            return Err(BeamError::Serialization(format!(
                "ring buffer holds at most {N} entries, got {}",
                items.len()
            )));
        }
        let mut ring = Self::new();
        for item in items {
            ring.push(item);
        }
        Ok(ring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_until_full_keeps_order() {
        let mut ring: RingBuffer<u32, 3> = RingBuffer::new();
        assert!(ring.is_empty());
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), None);
        assert!(ring.is_full());
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut ring: RingBuffer<u32, 3> = RingBuffer::new();
        for i in 1..=3 {
            ring.push(i);
        }
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.push(5), Some(2));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(!ring.contains(&1));
        assert!(ring.contains(&5));
        assert_eq!(ring.newest(), Some(&5));
    }

    #[test]
    fn capacity_is_fixed() {
        let mut ring: RingBuffer<[u8; 32], 16> = RingBuffer::new();
        for i in 0..100u8 {
            ring.push([i; 32]);
        }
        assert_eq!(ring.len(), 16);
        assert_eq!(ring.capacity(), 16);
        assert!(ring.contains(&[99; 32]));
        assert!(!ring.contains(&[83; 32]));
        assert!(ring.contains(&[84; 32]));
    }

    #[test]
    fn serializes_oldest_first() {
        let mut ring: RingBuffer<u8, 2> = RingBuffer::new();
        ring.push(1);
        ring.push(2);
        ring.push(3);
        let json = serde_json::to_string(&ring).unwrap();
        assert_eq!(json, "[2,3]");
        let back: RingBuffer<u8, 2> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(back, ring);
    }

    #[test]
    fn rejects_oversized_sequence() {
        assert!(serde_json::from_str::<RingBuffer<u8, 2>>("[1,2,3]").is_err());
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn zero_capacity_panics() {
        let _ = RingBuffer::<u8, 0>::new();
    }
}
