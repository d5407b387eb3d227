use std::fmt;

/// A forwarding relationship inside one AS, identified by its interface pair.
///
/// Both interface ids are given in beaconing direction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Hop {
    pub ingress: u16,
    pub egress: u16,
}

impl Hop {
    pub fn new(ingress: u16, egress: u16) -> Self {
        Self { ingress, egress }
    }

    /// Key of this hop in the filter's `counters` map.
    ///
    /// The filter stores the raw (network order) interface ids from the hop
    /// field, so each id is byte-swapped: ingress in the low half, egress in
    /// the high half.
    pub fn map_key(&self) -> u32 {
        (self.ingress.swap_bytes() as u32) | ((self.egress.swap_bytes() as u32) << 16)
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.ingress, self.egress)
    }
}
