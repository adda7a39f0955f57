//! Fixed-capacity history buffer.
//!
//! Once full, each push overwrites the oldest slot in place. Nothing is
//! shifted, so pushing stays O(1) however long the governor runs.

/// A bounded FIFO of the most recent `capacity` items.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    /// Index the next push writes to.
    next: usize,
    len: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            next: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, item: T) {
        self.slots[self.next] = Some(item);
        self.next = (self.next + 1) % self.capacity();
        self.len = (self.len + 1).min(self.capacity());
    }

    /// Most recently pushed item.
    pub fn latest(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        let idx = (self.next + self.slots.len() - 1) % self.slots.len();
        self.slots[idx].as_ref()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let cap = self.slots.len();
        let start = (self.next + cap - self.len) % cap;
        (0..self.len).filter_map(move |i| self.slots[(start + i) % cap].as_ref())
    }

    /// Owned copy, oldest to newest.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order_before_wrap() {
        let mut r = RingBuffer::new(4);
        r.push(1);
        r.push(2);
        assert_eq!(r.to_vec(), vec![1, 2]);
        assert_eq!(r.latest(), Some(&2));
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut r = RingBuffer::new(3);
        for i in 1..=5 {
            r.push(i);
        }
        assert_eq!(r.len(), 3);
        assert_eq!(r.to_vec(), vec![3, 4, 5]);
        assert_eq!(r.latest(), Some(&5));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut r = RingBuffer::new(0);
        r.push("a");
        r.push("b");
        assert_eq!(r.capacity(), 1);
        assert_eq!(r.to_vec(), vec!["b"]);
    }
}
