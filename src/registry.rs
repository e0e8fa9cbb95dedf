//! Generation-checked slab of live connections.
//!
//! The server keeps one entry per accepted client. A connection learns its
//! [`ConnectionId`] when it is inserted and uses it to remove itself once it
//! closes; the generation counter keeps a stale id from removing a newer
//! connection that reused the slot.
//!
//! No unsafe code; lookups go through bounds checks and generation matches.

use std::fmt;

/// Opaque handle to a registered connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    /// Slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when this id was issued.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({}:{})", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// Slab of connection records keyed by [`ConnectionId`].
#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnectionRegistry<T> {
    /// Empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of registered connections.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no connection is registered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Register a record built from its own id.
    ///
    /// Returns `None` only when the slot index space is exhausted.
    pub fn insert_with<F>(&mut self, build: F) -> Option<ConnectionId>
    where
        F: FnOnce(ConnectionId) -> T,
    {
        let id = match self.free_head {
            Some(index) => match self.slots.get(index as usize)? {
                Slot::Vacant { next_free, generation } => {
                    self.free_head = *next_free;
                    ConnectionId {
                        index,
                        generation: *generation,
                    }
                }
                Slot::Occupied { .. } => return None,
            },
            None => {
                let index = u32::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot::Vacant {
                    next_free: None,
                    generation: 0,
                });
                ConnectionId { index, generation: 0 }
            }
        };

        self.slots[id.index as usize] = Slot::Occupied {
            value: build(id),
            generation: id.generation,
        };
        self.len += 1;
        Some(id)
    }

    /// Register a record.
    pub fn insert(&mut self, value: T) -> Option<ConnectionId> {
        self.insert_with(|_| value)
    }

    /// Remove a record. Stale or unknown ids return `None`.
    pub fn remove(&mut self, id: ConnectionId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {
                let vacant = Slot::Vacant {
                    next_free: self.free_head,
                    generation: generation.wrapping_add(1),
                };
                let Slot::Occupied { value, .. } = std::mem::replace(slot, vacant) else {
                    return None;
                };
                self.free_head = Some(id.index);
                self.len -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    /// Look a record up.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { value, generation } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Whether `id` refers to a live record.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    /// Live records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &T)> {
        self.slots.iter().zip(0u32..).filter_map(|(slot, index)| match slot {
            Slot::Occupied { value, generation } => Some((
                ConnectionId {
                    index,
                    generation: *generation,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut registry = ConnectionRegistry::new();
        let id = registry.insert("a").unwrap();
        assert_eq!(registry.get(id), Some(&"a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_id_cannot_remove_reused_slot() {
        let mut registry = ConnectionRegistry::new();
        let first = registry.insert(1).unwrap();
        assert_eq!(registry.remove(first), Some(1));
        assert!(registry.is_empty());

        let second = registry.insert(2).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());

        assert_eq!(registry.remove(first), None);
        assert_eq!(registry.get(second), Some(&2));
    }

    #[test]
    fn insert_with_sees_assigned_id() {
        let mut registry = ConnectionRegistry::new();
        registry.insert_with(|id| id).unwrap();
        let id = registry.insert_with(|id| id).unwrap();
        assert_eq!(registry.get(id), Some(&id));
        assert_eq!(id.index(), 1);
    }

    #[test]
    fn iter_skips_vacant_slots() {
        let mut registry = ConnectionRegistry::new();
        let a = registry.insert('a').unwrap();
        let b = registry.insert('b').unwrap();
        let c = registry.insert('c').unwrap();
        registry.remove(b);
        let live: Vec<_> = registry.iter().map(|(id, value)| (id, *value)).collect();
        assert_eq!(live, vec![(a, 'a'), (c, 'c')]);
        assert!(!registry.contains(b));
    }
}
