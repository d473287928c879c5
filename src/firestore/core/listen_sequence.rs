use crate::firestore::core::ListenSequenceNumber;

/// Monotonic source of LRU sequence numbers.
#[derive(Clone, Debug)]
pub struct ListenSequence {
    previous_value: ListenSequenceNumber,
}

impl ListenSequence {
    pub const INVALID: ListenSequenceNumber = -1;

    pub fn new(previous_value: ListenSequenceNumber) -> Self {
        Self { previous_value }
    }

    pub fn next(&mut self) -> ListenSequenceNumber {
        self.previous_value += 1;
        self.previous_value
    }

    pub fn current(&self) -> ListenSequenceNumber {
        self.previous_value
    }

    /// Moves past a sequence number observed elsewhere, such as another client.
    pub fn observe(&mut self, value: ListenSequenceNumber) {
        self.previous_value = self.previous_value.max(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_increasing_numbers() {
        let mut sequence = ListenSequence::new(5);
        assert_eq!(sequence.next(), 6);
        sequence.observe(10);
        assert_eq!(sequence.next(), 11);
        sequence.observe(3);
        assert_eq!(sequence.next(), 12);
    }
}
