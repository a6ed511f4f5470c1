//! Index translation used when the replay device differs from the one the
//! trace was captured on.

use crate::api::types::{MemoryProperties, MemoryPropertyFlags, QueueFamilyProperties, QueueFlags};

/// Picks a replay memory type for an allocation that used `trace_index`
/// (with `trace_flags`) at capture time. `type_bits` restricts the choice to
/// the types the bound resource accepts.
///
/// First match wins, in this order: exact flags at the same index, exact
/// flags anywhere, a superset of the flags, any host visible and coherent
/// type, any device local type.
pub fn find_memory_type(
    trace_flags: MemoryPropertyFlags,
    trace_index: u32,
    type_bits: u32,
    replay: &MemoryProperties,
) -> Option<u32> {
    let allowed = |i: usize| i < 32 && type_bits & (1 << i) != 0;
    let candidates = || {
        replay
            .memory_types
            .iter()
            .enumerate()
            .filter(move |(i, _)| allowed(*i))
    };

    if let Some(t) = replay.memory_types.get(trace_index as usize) {
        if allowed(trace_index as usize) && t.property_flags == trace_flags {
            return Some(trace_index);
        }
    }
    let tiers: [fn(MemoryPropertyFlags, MemoryPropertyFlags) -> bool; 4] = [
        |f, want| f == want,
        |f, want| f.contains(want),
        |f, _| f.contains(MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT),
        |f, _| f.contains(MemoryPropertyFlags::DEVICE_LOCAL),
    ];
    tiers.iter().find_map(|matches| {
        candidates()
            .find(|(_, t)| matches(t.property_flags, trace_flags))
            .map(|(i, _)| i as u32)
    })
}

/// Picks a replay queue family for one captured with `trace_index` and
/// `trace_flags`. Each tier searches from `trace_index` and wraps around.
///
/// Tiers: exact flags, a superset of the flags, then the trace flags cut
/// down to graphics+compute+transfer, graphics+compute and graphics alone,
/// each of which must still be offered in full.
pub fn find_queue_family(
    trace_flags: QueueFlags,
    trace_index: u32,
    families: &[QueueFamilyProperties],
) -> Option<u32> {
    let n = families.len();
    if n == 0 {
        return None;
    }
    let start = trace_index as usize % n;
    let search = |pred: &dyn Fn(QueueFlags) -> bool| {
        (0..n)
            .map(|k| (start + k) % n)
            .find(|i| pred(families[*i].queue_flags))
            .map(|i| i as u32)
    };

    if let Some(i) = search(&|f| f == trace_flags) {
        return Some(i);
    }
    if let Some(i) = search(&|f| f.contains(trace_flags)) {
        return Some(i);
    }
    let masks = [
        QueueFlags::GRAPHICS | QueueFlags::COMPUTE | QueueFlags::TRANSFER,
        QueueFlags::GRAPHICS | QueueFlags::COMPUTE,
        QueueFlags::GRAPHICS,
    ];
    for mask in masks.iter() {
        let required = trace_flags & *mask;
        if required.is_empty() {
            continue;
        }
        if let Some(i) = search(&|f| f.contains(required)) {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::types::MemoryType;

    fn props(flags: &[MemoryPropertyFlags]) -> MemoryProperties {
        MemoryProperties {
            memory_types: flags
                .iter()
                .map(|f| MemoryType {
                    property_flags: *f,
                    heap_index: 0,
                })
                .collect(),
            memory_heaps: Vec::new(),
        }
    }

    const DL: MemoryPropertyFlags = MemoryPropertyFlags::DEVICE_LOCAL;
    const HV: MemoryPropertyFlags = MemoryPropertyFlags::HOST_VISIBLE;
    const HC: MemoryPropertyFlags = MemoryPropertyFlags::HOST_COHERENT;
    const CACHED: MemoryPropertyFlags = MemoryPropertyFlags::HOST_CACHED;

    #[test]
    pub fn memory_type_tiers_in_order() {
        // Same index, exact.
        let p = props(&[HV | HC, HV | HC]);
        assert_eq!(find_memory_type(HV | HC, 1, 0b11, &p), Some(1));
        // Exact elsewhere beats a superset at a lower index.
        let p = props(&[HV | HC | CACHED, DL, HV | HC]);
        assert_eq!(find_memory_type(HV | HC, 1, 0b111, &p), Some(2));
        // Superset only.
        let p = props(&[DL, HV | HC | CACHED]);
        assert_eq!(find_memory_type(HV | HC, 0, 0b11, &p), Some(1));
        // Host visible and coherent when nothing covers the trace flags.
        let p = props(&[DL, HV | HC]);
        assert_eq!(find_memory_type(HV | CACHED, 0, 0b11, &p), Some(1));
        // Device local as the last resort.
        let p = props(&[HV, DL]);
        assert_eq!(find_memory_type(HV | CACHED, 0, 0b11, &p), Some(1));
        // Nothing at all.
        let p = props(&[HV]);
        assert_eq!(find_memory_type(HV | CACHED, 0, 0b1, &p), None);
    }

    #[test]
    pub fn memory_type_respects_type_bits() {
        let p = props(&[HV | HC, HV | HC]);
        assert_eq!(find_memory_type(HV | HC, 0, 0b10, &p), Some(1));
        assert_eq!(find_memory_type(HV | HC, 0, 0, &p), None);
    }

    #[test]
    pub fn coherent_allocation_lands_on_cached_superset() {
        let p = props(&[DL, HV, HV | HC | CACHED]);
        assert_eq!(find_memory_type(HV | HC, 0, 0b101, &p), Some(2));
    }

    fn families(flags: &[QueueFlags]) -> Vec<QueueFamilyProperties> {
        flags
            .iter()
            .map(|f| QueueFamilyProperties {
                queue_flags: *f,
                queue_count: 1,
            })
            .collect()
    }

    #[test]
    pub fn queue_family_tiers_in_order() {
        let g = QueueFlags::GRAPHICS;
        let c = QueueFlags::COMPUTE;
        let t = QueueFlags::TRANSFER;
        let s = QueueFlags::SPARSE_BINDING;

        // Exact, found by wrapping from the trace index.
        let f = families(&[g | c | t, t, c]);
        assert_eq!(find_queue_family(g | c | t, 2, &f), Some(0));
        assert_eq!(find_queue_family(c, 2, &f), Some(2));
        // Superset, first one at or after the trace index.
        let f = families(&[g | c | t, t, g | c | t | s]);
        assert_eq!(find_queue_family(c | t, 2, &f), Some(2));
        assert_eq!(find_queue_family(c | t, 0, &f), Some(0));
        // Sparse binding dropped by the G|C|T mask.
        let f = families(&[t, g | c | t]);
        assert_eq!(find_queue_family(g | c | t | s, 0, &f), Some(1));
        // Down to graphics+compute.
        let f = families(&[t, g | c]);
        assert_eq!(find_queue_family(g | c | t | s, 0, &f), Some(1));
        // Down to graphics.
        let f = families(&[c | t, g]);
        assert_eq!(find_queue_family(g | c | t, 0, &f), Some(1));
        // Transfer-only traces have no relaxed form.
        let f = families(&[g | c]);
        assert_eq!(find_queue_family(t | s, 0, &f), None);
        assert_eq!(find_queue_family(g, 0, &[]), None);
    }
}
