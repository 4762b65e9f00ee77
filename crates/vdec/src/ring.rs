//! Ring of scratch buffers indexed by frame sequence number.
//!
//! Every `sequence % depth` computation in the decoder goes through
//! [`ScratchRing::index`].

/// Fixed set of per-frame scratch resources cycled by sequence number.
#[derive(Debug)]
pub struct ScratchRing<T> {
    entries: Vec<T>,
}

impl<T> ScratchRing<T> {
    /// Build a ring of `depth` entries. `depth` must be at least one.
    pub fn try_from_fn<E>(depth: u32, mut make: impl FnMut(usize) -> Result<T, E>) -> Result<Self, E> {
        debug_assert!(depth > 0);
        let entries = (0..depth as usize).map(&mut make).collect::<Result<Vec<_>, E>>()?;
        Ok(Self { entries })
    }

    pub fn depth(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Ring position used by frame `sequence`.
    pub fn index(&self, sequence: u64) -> usize {
        (sequence % self.entries.len() as u64) as usize
    }

    /// Entry used by frame `sequence`.
    pub fn get(&self, sequence: u64) -> &T {
        &self.entries[self.index(sequence)]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}
