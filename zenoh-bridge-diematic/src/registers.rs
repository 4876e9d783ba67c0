//! Sparse array of raw register words for one acquisition cycle.

use std::fmt::Write;

/// One optional 16-bit word per register address, starting at address 0.
///
/// A slot is `None` when the address was never read or its block failed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawRegisterArray {
    slots: Vec<Option<u16>>,
}

impl RawRegisterArray {
    /// An array of `len` unknown slots.
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Word at `address`, `None` when unknown or beyond the array.
    pub fn get(&self, address: u16) -> Option<u16> {
        self.slots.get(usize::from(address)).copied().flatten()
    }

    /// Store `words` starting at `start`. Words past the end of the array are dropped.
    pub fn fill(&mut self, start: u16, words: &[u16]) {
        let start = usize::from(start);
        if start >= self.slots.len() {
            return;
        }
        for (slot, word) in self.slots[start..].iter_mut().zip(words) {
            *slot = Some(*word);
        }
    }

    /// Number of slots holding a word.
    pub fn known_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// One `address: word` line per slot, `None` for unknown slots.
    pub fn dump(&self) -> String {
        let mut output = String::new();
        for (address, slot) in self.slots.iter().enumerate() {
            let _ = match slot {
                Some(word) => writeln!(output, "{}: {:#06x}", address, word),
                None => writeln!(output, "{}: None", address),
            };
        }
        output
    }
}

impl FromIterator<Option<u16>> for RawRegisterArray {
    fn from_iter<I: IntoIterator<Item = Option<u16>>>(iter: I) -> Self {
        Self {
            slots: iter.into_iter().collect(),
        }
    }
}
