//! The memory-usage report (`spec.md` §6).

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemUsage {
    pub leaves: u64,
    pub live: u64,
    pub used: u64,
    pub hold: u64,
    pub free: u64,
    pub node_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    pub bytes: u64,
    pub fragmented: bool,
}
