//! Trace handle to replay handle translation, one table per object kind.

use crate::{
    api::handles::{HandleField, HandleRole, HandleVisitor, ObjectKind, SlotRef, NULL_HANDLE},
    log::LogLevel::{LogDebug, LogWarn},
};
use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Display, Formatter},
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemapError {
    AlreadyMapped {
        kind: ObjectKind,
        trace: u64,
    },
    Unmapped {
        kind: ObjectKind,
        trace: u64,
        field: &'static str,
    },
    /// A premapped slot was read before the call creating its object ran.
    EmptySlot {
        kind: ObjectKind,
        trace: u64,
        field: &'static str,
    },
}

impl Display for RemapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RemapError::AlreadyMapped { kind, trace } => {
                write!(f, "{} {:#x} is already mapped", kind, trace)
            }
            RemapError::Unmapped { kind, trace, field } => {
                write!(f, "argument `{}`: {} {:#x} has no replay object", field, kind, trace)
            }
            RemapError::EmptySlot { kind, trace, field } => write!(
                f,
                "argument `{}`: premapped {} {:#x} was never created",
                field, kind, trace
            ),
        }
    }
}

impl Error for RemapError {}

#[derive(Default)]
struct KindTable {
    map: HashMap<u64, u64>,
    /// Slots handed out by `premap`. Never shrinks, so a `SlotRef` stays
    /// valid for the life of the remapper.
    slots: Vec<u64>,
    /// Slot each trace handle is currently bound to, if any.
    bound: HashMap<u64, u32>,
}

pub struct ObjectRemapper {
    tables: Vec<KindTable>,
    /// Device that owns each device child, by trace handle.
    owners: HashMap<(ObjectKind, u64), u64>,
}

impl Default for ObjectRemapper {
    fn default() -> Self {
        ObjectRemapper::new()
    }
}

impl ObjectRemapper {
    pub fn new() -> ObjectRemapper {
        ObjectRemapper {
            tables: (0..ObjectKind::COUNT).map(|_| KindTable::default()).collect(),
            owners: HashMap::new(),
        }
    }

    fn table(&self, kind: ObjectKind) -> &KindTable {
        &self.tables[kind.as_index()]
    }

    fn table_mut(&mut self, kind: ObjectKind) -> &mut KindTable {
        &mut self.tables[kind.as_index()]
    }

    pub fn add(&mut self, kind: ObjectKind, trace: u64, replay: u64) -> Result<(), RemapError> {
        let t = self.table_mut(kind);
        if t.map.contains_key(&trace) {
            return Err(RemapError::AlreadyMapped { kind, trace });
        }
        t.map.insert(trace, replay);
        if let Some(slot) = t.bound.get(&trace) {
            t.slots[*slot as usize] = replay;
        }
        Ok(())
    }

    /// Returns false (after warning) if nothing was mapped.
    pub fn remove(&mut self, kind: ObjectKind, trace: u64) -> bool {
        let t = self.table_mut(kind);
        let found = t.map.remove(&trace).is_some();
        if let Some(slot) = t.bound.remove(&trace) {
            t.slots[slot as usize] = NULL_HANDLE;
        }
        self.owners.remove(&(kind, trace));
        if !found {
            log!(LogWarn, "Removing unmapped {} {:#x}", kind, trace);
        }
        found
    }

    /// The replay handle, or `NULL_HANDLE` if there is none.
    pub fn remap(&self, kind: ObjectKind, trace: u64) -> u64 {
        self.table(kind)
            .map
            .get(&trace)
            .copied()
            .unwrap_or(NULL_HANDLE)
    }

    pub fn contains(&self, kind: ObjectKind, trace: u64) -> bool {
        self.table(kind).map.contains_key(&trace)
    }

    pub fn len(&self, kind: ObjectKind) -> usize {
        self.table(kind).map.len()
    }

    /// Trace handles currently mapped for `kind`, in no particular order.
    pub fn traces(&self, kind: ObjectKind) -> Vec<u64> {
        self.table(kind).map.keys().copied().collect()
    }

    /// Binds `trace` to a slot. The slot holds the replay handle while the
    /// object lives: right away if it is already mapped, otherwise from the
    /// moment `add` maps it.
    pub fn premap(&mut self, kind: ObjectKind, trace: u64) -> SlotRef {
        let t = self.table_mut(kind);
        if let Some(slot) = t.bound.get(&trace) {
            return SlotRef { kind, index: *slot };
        }
        let index = t.slots.len() as u32;
        let value = t.map.get(&trace).copied().unwrap_or(NULL_HANDLE);
        t.slots.push(value);
        t.bound.insert(trace, index);
        SlotRef { kind, index }
    }

    /// A fresh slot for an object about to be created under `trace`, even if
    /// an earlier lifetime of the same value still holds one.
    pub fn premap_new_lifetime(&mut self, kind: ObjectKind, trace: u64) -> SlotRef {
        self.table_mut(kind).bound.remove(&trace);
        self.premap(kind, trace)
    }

    /// Forget which slot `trace` is bound to. Packets already pointing at
    /// the slot keep it.
    pub fn unbind(&mut self, kind: ObjectKind, trace: u64) {
        self.table_mut(kind).bound.remove(&trace);
    }

    pub fn fill_slot(&mut self, slot: SlotRef, replay: u64) {
        if let Some(v) = self.table_mut(slot.kind).slots.get_mut(slot.index as usize) {
            *v = replay;
        }
    }

    pub fn slot_value(&self, slot: SlotRef) -> u64 {
        self.table(slot.kind)
            .slots
            .get(slot.index as usize)
            .copied()
            .unwrap_or(NULL_HANDLE)
    }

    pub fn slot_count(&self, kind: ObjectKind) -> usize {
        self.table(kind).slots.len()
    }

    pub fn set_owner(&mut self, kind: ObjectKind, trace: u64, device: u64) {
        self.owners.insert((kind, trace), device);
    }

    pub fn owner(&self, kind: ObjectKind, trace: u64) -> Option<u64> {
        self.owners.get(&(kind, trace)).copied()
    }

    /// Drops every mapping owned by `device`. Returns how many went.
    pub fn remove_device_children(&mut self, device: u64) -> usize {
        let children: Vec<(ObjectKind, u64)> = self
            .owners
            .iter()
            .filter(|(_, d)| **d == device)
            .map(|(k, _)| *k)
            .collect();
        for (kind, trace) in &children {
            self.remove(*kind, *trace);
        }
        if !children.is_empty() {
            log!(LogDebug, "Dropped {} objects owned by device {:#x}", children.len(), device);
        }
        children.len()
    }
}

/// Fills in the replay value of every input handle of a call. Stops
/// resolving after the first failure and keeps that failure.
pub struct RemapVisitor<'a> {
    remapper: &'a ObjectRemapper,
    failure: Option<RemapError>,
}

impl<'a> RemapVisitor<'a> {
    pub fn new(remapper: &'a ObjectRemapper) -> RemapVisitor<'a> {
        RemapVisitor {
            remapper,
            failure: None,
        }
    }

    pub fn into_failure(self) -> Option<RemapError> {
        self.failure
    }
}

impl<'a> HandleVisitor for RemapVisitor<'a> {
    fn visit(&mut self, field: &'static str, kind: ObjectKind, role: HandleRole, h: &mut HandleField) {
        if self.failure.is_some() {
            return;
        }
        match role {
            HandleRole::Out => return,
            HandleRole::Opt | HandleRole::Destroyed if h.is_null() => {
                h.set_replay(NULL_HANDLE);
                return;
            }
            _ => (),
        }
        let trace = h.trace();
        let replay = match h.slot() {
            Some(slot) => {
                let v = self.remapper.slot_value(slot);
                if v == NULL_HANDLE {
                    self.failure = Some(RemapError::EmptySlot { kind, trace, field });
                    return;
                }
                v
            }
            None => self.remapper.remap(kind, trace),
        };
        if replay == NULL_HANDLE {
            self.failure = Some(RemapError::Unmapped { kind, trace, field });
            return;
        }
        h.set_replay(replay);
    }
}

/// Runs after a call succeeded: maps what it created, unmaps what it
/// destroyed, and notes which device owns each new object.
pub struct RegisterVisitor<'a> {
    remapper: &'a mut ObjectRemapper,
    device: Option<u64>,
    pub errors: Vec<RemapError>,
}

impl<'a> RegisterVisitor<'a> {
    pub fn new(remapper: &'a mut ObjectRemapper) -> RegisterVisitor<'a> {
        RegisterVisitor {
            remapper,
            device: None,
            errors: Vec::new(),
        }
    }
}

impl<'a> HandleVisitor for RegisterVisitor<'a> {
    fn visit(&mut self, field: &'static str, kind: ObjectKind, role: HandleRole, h: &mut HandleField) {
        match role {
            HandleRole::In if kind == ObjectKind::Device => self.device = Some(h.trace()),
            HandleRole::Out => {
                if h.is_null() {
                    return;
                }
                if h.replay() == NULL_HANDLE {
                    log!(
                        LogWarn,
                        "`{}`: replay produced no {} for trace {:#x}",
                        field,
                        kind,
                        h.trace()
                    );
                    return;
                }
                if let Err(e) = self.remapper.add(kind, h.trace(), h.replay()) {
                    self.errors.push(e);
                    return;
                }
                if let Some(slot) = h.slot() {
                    self.remapper.fill_slot(slot, h.replay());
                }
                if let (true, Some(device)) = (kind.is_device_child(), self.device) {
                    self.remapper.set_owner(kind, h.trace(), device);
                }
            }
            HandleRole::Destroyed if !h.is_null() => {
                self.remapper.remove(kind, h.trace());
                if let Some(slot) = h.slot() {
                    self.remapper.fill_slot(slot, NULL_HANDLE);
                }
            }
            _ => (),
        }
    }
}

/// Binds every premap-kind handle of a decoded call to a slot, walking the
/// preloaded packets in replay order.
pub struct PremapVisitor<'a> {
    remapper: &'a mut ObjectRemapper,
    pub bound: usize,
}

impl<'a> PremapVisitor<'a> {
    pub fn new(remapper: &'a mut ObjectRemapper) -> PremapVisitor<'a> {
        PremapVisitor { remapper, bound: 0 }
    }
}

impl<'a> HandleVisitor for PremapVisitor<'a> {
    fn visit(&mut self, _field: &'static str, kind: ObjectKind, role: HandleRole, h: &mut HandleField) {
        if !kind.is_premap_kind() || h.is_null() {
            return;
        }
        let slot = match role {
            HandleRole::Out => self.remapper.premap_new_lifetime(kind, h.trace()),
            _ => self.remapper.premap(kind, h.trace()),
        };
        h.set_slot(slot);
        self.bound += 1;
        if role == HandleRole::Destroyed {
            // Later packets naming this value refer to a new object.
            self.remapper.unbind(kind, h.trace());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{
        calls::{AllocateCommandBuffers, ApiCall, CmdDispatch, DestroyBuffer, FreeCommandBuffers},
        handles::HandleFields,
    };

    #[test]
    pub fn add_remap_remove_and_reuse() {
        let mut r = ObjectRemapper::new();
        r.add(ObjectKind::Buffer, 0x1000, 0x9000).unwrap();
        assert_eq!(r.remap(ObjectKind::Buffer, 0x1000), 0x9000);
        // Categories are separate namespaces.
        assert_eq!(r.remap(ObjectKind::Image, 0x1000), NULL_HANDLE);
        assert_eq!(
            r.add(ObjectKind::Buffer, 0x1000, 0x9002),
            Err(RemapError::AlreadyMapped {
                kind: ObjectKind::Buffer,
                trace: 0x1000
            })
        );
        assert!(r.remove(ObjectKind::Buffer, 0x1000));
        assert_eq!(r.remap(ObjectKind::Buffer, 0x1000), NULL_HANDLE);
        assert!(!r.remove(ObjectKind::Buffer, 0x1000));
        r.add(ObjectKind::Buffer, 0x1000, 0x9001).unwrap();
        assert_eq!(r.remap(ObjectKind::Buffer, 0x1000), 0x9001);
    }

    #[test]
    pub fn remap_stays_stable_until_removed() {
        let mut r = ObjectRemapper::new();
        for i in 1..=64u64 {
            r.add(ObjectKind::Fence, i, i << 20).unwrap();
        }
        for i in 1..=64u64 {
            assert_eq!(r.remap(ObjectKind::Fence, i), i << 20);
        }
        for i in (2..=64u64).step_by(2) {
            r.remove(ObjectKind::Fence, i);
        }
        for i in 1..=64u64 {
            let expected = if i % 2 == 0 { NULL_HANDLE } else { i << 20 };
            assert_eq!(r.remap(ObjectKind::Fence, i), expected);
        }
        assert_eq!(r.len(ObjectKind::Fence), 32);
    }

    #[test]
    pub fn premapped_slots_match_direct_lookup() {
        let mut r = ObjectRemapper::new();
        r.add(ObjectKind::CommandBuffer, 0xc0, 0xaa0).unwrap();
        // Already live when premapped.
        let live = r.premap(ObjectKind::CommandBuffer, 0xc0);
        assert_eq!(r.slot_value(live), r.remap(ObjectKind::CommandBuffer, 0xc0));
        // Created later.
        let later = r.premap(ObjectKind::CommandBuffer, 0xc1);
        assert_eq!(r.slot_value(later), NULL_HANDLE);
        r.add(ObjectKind::CommandBuffer, 0xc1, 0xaa1).unwrap();
        assert_eq!(r.slot_value(later), 0xaa1);
        assert_eq!(r.slot_value(later), r.remap(ObjectKind::CommandBuffer, 0xc1));
        assert_eq!(r.premap(ObjectKind::CommandBuffer, 0xc1), later);
    }

    #[test]
    pub fn visitors_resolve_register_and_report() {
        let mut r = ObjectRemapper::new();
        r.add(ObjectKind::Device, 0xd, 0xdd).unwrap();
        r.add(ObjectKind::CommandPool, 0xf, 0xff).unwrap();

        let mut call: ApiCall = AllocateCommandBuffers {
            device: HandleField::new(0xd),
            pool: HandleField::new(0xf),
            command_buffers: vec![HandleField::new(0xc0)],
            ..Default::default()
        }
        .into();
        let mut v = RemapVisitor::new(&r);
        call.visit_handles(&mut v);
        assert!(v.into_failure().is_none());
        // What the driver would do.
        if let ApiCall::AllocateCommandBuffers(a) = &mut call {
            assert_eq!(a.pool.replay(), 0xff);
            a.command_buffers[0].set_replay(0xcc0);
        }
        let mut reg = RegisterVisitor::new(&mut r);
        call.visit_handles(&mut reg);
        assert!(reg.errors.is_empty());
        assert_eq!(r.remap(ObjectKind::CommandBuffer, 0xc0), 0xcc0);
        assert_eq!(r.owner(ObjectKind::CommandBuffer, 0xc0), Some(0xd));

        let mut missing: ApiCall = DestroyBuffer {
            device: HandleField::new(0xd),
            buffer: HandleField::new(0xb),
        }
        .into();
        let mut v = RemapVisitor::new(&r);
        missing.visit_handles(&mut v);
        assert_eq!(
            v.into_failure(),
            Some(RemapError::Unmapped {
                kind: ObjectKind::Buffer,
                trace: 0xb,
                field: "buffer"
            })
        );

        let mut null_destroy: ApiCall = DestroyBuffer {
            device: HandleField::new(0xd),
            buffer: HandleField::null(),
        }
        .into();
        let mut v = RemapVisitor::new(&r);
        null_destroy.visit_handles(&mut v);
        assert!(v.into_failure().is_none());

        assert_eq!(r.remove_device_children(0xd), 1);
        assert_eq!(r.remap(ObjectKind::CommandBuffer, 0xc0), NULL_HANDLE);
        assert_eq!(r.remap(ObjectKind::CommandPool, 0xf), 0xff);
    }

    #[test]
    pub fn premap_pass_tracks_lifetimes_inside_the_window() {
        let mut r = ObjectRemapper::new();
        r.add(ObjectKind::Device, 0xd, 0xdd).unwrap();
        r.add(ObjectKind::CommandPool, 0xf, 0xff).unwrap();
        let alloc = || -> ApiCall {
            AllocateCommandBuffers {
                device: HandleField::new(0xd),
                pool: HandleField::new(0xf),
                command_buffers: vec![HandleField::new(0xc0)],
                ..Default::default()
            }
            .into()
        };
        let dispatch = || -> ApiCall {
            CmdDispatch {
                command_buffer: HandleField::new(0xc0),
                group_count: [1, 1, 1],
            }
            .into()
        };
        let free: ApiCall = FreeCommandBuffers {
            device: HandleField::new(0xd),
            pool: HandleField::new(0xf),
            command_buffers: vec![HandleField::new(0xc0)],
        }
        .into();
        let mut window = vec![alloc(), dispatch(), free, alloc(), dispatch()];
        let mut p = PremapVisitor::new(&mut r);
        for c in window.iter_mut() {
            c.visit_handles(&mut p);
        }
        assert_eq!(p.bound, 5);
        let slot_of = |c: &ApiCall| match c {
            ApiCall::CmdDispatch(d) => d.command_buffer.slot(),
            ApiCall::AllocateCommandBuffers(a) => a.command_buffers[0].slot(),
            ApiCall::FreeCommandBuffers(f) => f.command_buffers[0].slot(),
            _ => None,
        };
        let first = slot_of(&window[1]).unwrap();
        let second = slot_of(&window[4]).unwrap();
        assert_ne!(first, second);
        assert_eq!(slot_of(&window[0]), Some(first));
        assert_eq!(slot_of(&window[2]), Some(first));
        assert_eq!(slot_of(&window[3]), Some(second));
        assert_eq!(r.slot_count(ObjectKind::CommandBuffer), 2);

        // Replaying the first allocation fills the first lifetime's slot.
        if let ApiCall::AllocateCommandBuffers(a) = &mut window[0] {
            a.command_buffers[0].set_replay(0xaa0);
        }
        let mut reg = RegisterVisitor::new(&mut r);
        window[0].visit_handles(&mut reg);
        assert_eq!(r.slot_value(first), 0xaa0);
        let mut v = RemapVisitor::new(&r);
        window[1].visit_handles(&mut v);
        assert!(v.into_failure().is_none());
    }
}
