//! Channel id allocation.

use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a logical channel, in `1..=channel_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u16);

impl ChannelId {
    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry misuse or exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Every id in `1..=channel_max` is allocated.
    #[error("channel ids exhausted (channel max {channel_max})")]
    Exhausted { channel_max: u16 },

    /// The id is not in the reserved-but-unbound state.
    #[error("channel {0} is not reserved")]
    NotReserved(ChannelId),

    /// The id is not bound to a channel handle.
    #[error("channel {0} is not bound")]
    NotBound(ChannelId),
}

enum Slot<H> {
    Reserved,
    Bound(H),
}

/// Tracks which channel ids are allocated and, once opened, their handles.
///
/// An id blocks reuse from the moment [`reserve_next`](Self::reserve_next)
/// returns it. It then becomes bound ([`bind`](Self::bind)) or free again
/// ([`release`](Self::release)); bound ids are freed by
/// [`remove`](Self::remove).
///
/// The registry itself is not synchronized. The owning connection keeps it
/// behind a mutex so that "find lowest free id and mark it reserved" is a
/// single critical section.
pub struct ChannelRegistry<H> {
    channel_max: u16,
    slots: BTreeMap<u16, Slot<H>>,
    first_free: u32,
}

impl<H> ChannelRegistry<H> {
    /// Create an empty registry handing out ids in `1..=channel_max`.
    pub fn new(channel_max: u16) -> Self {
        Self {
            channel_max,
            slots: BTreeMap::new(),
            first_free: 1,
        }
    }

    /// Reserve the lowest unused id.
    pub fn reserve_next(&mut self) -> Result<ChannelId, RegistryError> {
        // Every id below `first_free` is allocated, so the first gap at or
        // above it is the lowest free id.
        let mut candidate = self.first_free;
        if candidate <= u32::from(u16::MAX) {
            for &id in self.slots.range(candidate as u16..).map(|(id, _)| id) {
                if u32::from(id) != candidate {
                    break;
                }
                candidate += 1;
            }
        }

        self.first_free = candidate;
        if candidate > u32::from(self.channel_max) {
            return Err(RegistryError::Exhausted {
                channel_max: self.channel_max,
            });
        }

        let id = candidate as u16;
        self.slots.insert(id, Slot::Reserved);
        self.first_free = candidate + 1;
        Ok(ChannelId(id))
    }

    /// Attach a handle to a reserved id.
    pub fn bind(&mut self, id: ChannelId, handle: H) -> Result<(), RegistryError> {
        match self.slots.get_mut(&id.0) {
            Some(slot) if matches!(slot, Slot::Reserved) => {
                *slot = Slot::Bound(handle);
                Ok(())
            }
            _ => Err(RegistryError::NotReserved(id)),
        }
    }

    /// Free a reserved id that never got bound.
    pub fn release(&mut self, id: ChannelId) -> Result<(), RegistryError> {
        match self.slots.get(&id.0) {
            Some(Slot::Reserved) => {
                self.slots.remove(&id.0);
                self.mark_free(id);
                Ok(())
            }
            _ => Err(RegistryError::NotReserved(id)),
        }
    }

    /// Free a bound id, returning its handle.
    pub fn remove(&mut self, id: ChannelId) -> Result<H, RegistryError> {
        match self.slots.remove(&id.0) {
            Some(Slot::Bound(handle)) => {
                self.mark_free(id);
                Ok(handle)
            }
            Some(Slot::Reserved) => {
                self.slots.insert(id.0, Slot::Reserved);
                Err(RegistryError::NotBound(id))
            }
            None => Err(RegistryError::NotBound(id)),
        }
    }

    /// Handle bound to `id`, if any.
    pub fn get(&self, id: ChannelId) -> Option<&H> {
        match self.slots.get(&id.0) {
            Some(Slot::Bound(handle)) => Some(handle),
            Some(Slot::Reserved) | None => None,
        }
    }

    /// True if `id` is reserved or bound.
    pub fn is_allocated(&self, id: ChannelId) -> bool {
        self.slots.contains_key(&id.0)
    }

    /// Number of reserved plus bound ids.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn channel_max(&self) -> u16 {
        self.channel_max
    }

    /// Currently allocated ids, ascending.
    pub fn allocated(&self) -> Vec<ChannelId> {
        self.slots.keys().copied().map(ChannelId).collect()
    }

    /// Drop every reservation and binding.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.first_free = 1;
    }

    fn mark_free(&mut self, id: ChannelId) {
        self.first_free = self.first_free.min(u32::from(id.0));
    }
}

impl<H> fmt::Debug for ChannelRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channel_max", &self.channel_max)
            .field("allocated", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(channel_max: u16, count: u16) -> ChannelRegistry<()> {
        let mut registry = ChannelRegistry::new(channel_max);
        for expected in 1..=count {
            assert_eq!(registry.reserve_next().unwrap(), ChannelId(expected));
        }
        registry
    }

    #[test]
    fn reserves_lowest_free_id_first() {
        let mut registry: ChannelRegistry<()> = ChannelRegistry::new(8);
        assert_eq!(registry.reserve_next().unwrap(), ChannelId(1));
        assert_eq!(registry.reserve_next().unwrap(), ChannelId(2));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn released_id_is_reused_next() {
        for n in 1..=12u16 {
            for k in 1..=n {
                let mut registry = filled(32, n);
                registry.release(ChannelId(k)).unwrap();
                assert_eq!(
                    registry.reserve_next().unwrap(),
                    ChannelId(k),
                    "n={n} k={k}"
                );
            }
        }
    }

    #[test]
    fn removed_bound_id_is_reused_next() {
        let mut registry = filled(16, 5);
        registry.bind(ChannelId(3), ()).unwrap();
        registry.remove(ChannelId(3)).unwrap();
        assert_eq!(registry.reserve_next().unwrap(), ChannelId(3));
    }

    #[test]
    fn exhaustion_and_recovery() {
        let mut registry = filled(4, 4);
        assert_eq!(
            registry.reserve_next(),
            Err(RegistryError::Exhausted { channel_max: 4 })
        );

        registry.release(ChannelId(2)).unwrap();
        assert_eq!(registry.reserve_next().unwrap(), ChannelId(2));
        assert!(registry.reserve_next().is_err());
    }

    #[test]
    fn full_protocol_range_is_usable() {
        let mut registry: ChannelRegistry<()> = ChannelRegistry::new(u16::MAX);
        for _ in 0..u16::MAX {
            registry.reserve_next().unwrap();
        }
        assert_eq!(registry.len(), u16::MAX as usize);
        assert_eq!(
            registry.reserve_next(),
            Err(RegistryError::Exhausted {
                channel_max: u16::MAX
            })
        );
    }

    #[test]
    fn zero_channel_max_is_always_exhausted() {
        let mut registry: ChannelRegistry<()> = ChannelRegistry::new(0);
        assert!(registry.reserve_next().is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn bind_requires_reservation() {
        let mut registry: ChannelRegistry<&str> = ChannelRegistry::new(4);
        assert_eq!(
            registry.bind(ChannelId(1), "ch"),
            Err(RegistryError::NotReserved(ChannelId(1)))
        );

        let id = registry.reserve_next().unwrap();
        registry.bind(id, "ch").unwrap();
        assert_eq!(registry.get(id), Some(&"ch"));
        assert_eq!(
            registry.bind(id, "again"),
            Err(RegistryError::NotReserved(id))
        );
    }

    #[test]
    fn release_rejects_bound_ids_and_remove_rejects_reserved_ids() {
        let mut registry: ChannelRegistry<u8> = ChannelRegistry::new(4);
        let bound = registry.reserve_next().unwrap();
        registry.bind(bound, 7).unwrap();
        let reserved = registry.reserve_next().unwrap();

        assert_eq!(
            registry.release(bound),
            Err(RegistryError::NotReserved(bound))
        );
        assert_eq!(
            registry.remove(reserved),
            Err(RegistryError::NotBound(reserved))
        );
        assert!(registry.is_allocated(reserved));
        assert_eq!(registry.get(reserved), None);

        assert_eq!(registry.remove(bound), Ok(7));
        assert!(!registry.is_allocated(bound));
    }

    #[test]
    fn clear_frees_everything() {
        let mut registry = filled(4, 3);
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.reserve_next().unwrap(), ChannelId(1));
        assert_eq!(registry.allocated(), vec![ChannelId(1)]);
    }
}
