use core::cmp::Ordering;
use std::{
    cmp::{max, min},
    fmt::{Display, Formatter, Result},
    ops::Deref,
};

/// Half open host address range `[start, end)`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MemoryRange {
    start: usize,
    end: usize,
}

impl MemoryRange {
    pub fn new_range(addr: usize, num_bytes: usize) -> MemoryRange {
        MemoryRange {
            start: addr,
            end: addr + num_bytes,
        }
    }

    pub fn contains_addr(&self, p: usize) -> bool {
        self.start <= p && p < self.end
    }

    pub fn intersects(&self, other: &MemoryRange) -> bool {
        let s = max(self.start, other.start);
        let e = min(self.end, other.end);
        s < e
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }
}

impl Display for MemoryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}-{:#x}", self.start, self.end)
    }
}

/// Ordering wrapper so that a `BTreeMap` keyed by ranges can be probed with
/// a one byte range: overlapping ranges compare equal.
#[derive(Copy, Clone, Debug)]
pub struct MemoryRangeKey(pub MemoryRange);

impl MemoryRangeKey {
    pub fn for_addr(addr: usize) -> MemoryRangeKey {
        MemoryRangeKey(MemoryRange::new_range(addr, 1))
    }
}

impl PartialOrd for MemoryRangeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemoryRangeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.intersects(&other.0) {
            Ordering::Equal
        } else {
            self.0.start.cmp(&other.0.start)
        }
    }
}

impl PartialEq for MemoryRangeKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemoryRangeKey {}

impl Deref for MemoryRangeKey {
    type Target = MemoryRange;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<MemoryRange> for MemoryRangeKey {
    fn from(r: MemoryRange) -> Self {
        MemoryRangeKey(r)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    pub fn lookup_by_contained_address() {
        let mut m: BTreeMap<MemoryRangeKey, u64> = BTreeMap::new();
        m.insert(MemoryRange::new_range(0x1000, 0x3000).into(), 1);
        m.insert(MemoryRange::new_range(0x8000, 0x1000).into(), 2);
        assert_eq!(m.get(&MemoryRangeKey::for_addr(0x1000)), Some(&1));
        assert_eq!(m.get(&MemoryRangeKey::for_addr(0x3fff)), Some(&1));
        assert_eq!(m.get(&MemoryRangeKey::for_addr(0x4000)), None);
        assert_eq!(m.get(&MemoryRangeKey::for_addr(0x8abc)), Some(&2));
        assert_eq!(m.get(&MemoryRangeKey::for_addr(0x9000)), None);
        assert!(m.remove(&MemoryRangeKey::for_addr(0x2000)).is_some());
        assert_eq!(m.len(), 1);
    }

    #[test]
    pub fn range_basics() {
        let r = MemoryRange::new_range(0x10, 0x20);
        assert_eq!(r.size(), 0x20);
        assert!(r.contains_addr(0x2f));
        assert!(!r.contains_addr(0x30));
        assert!(!r.intersects(&MemoryRange::new_range(0x30, 4)));
        assert_eq!(r.to_string(), "0x10-0x30");
    }
}
