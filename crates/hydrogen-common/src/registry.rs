//! Generation-checked registry for objects that may vanish while referenced.
//!
//! Connections and drivers can disappear at any moment (peer hangs up,
//! process crashes, queue overflow). Work that outlives the current event,
//! such as a reader task that already parsed a message or a restart timer,
//! must never act on a removed entry, and must never be confused by a newer
//! entry that happens to occupy the same slot.
//!
//! [`SafeRegistry`] solves both problems:
//!
//! - Ids carry a generation, so a stale [`EntryId`] never resolves to a newer
//!   object stored in a recycled slot.
//! - [`Heartbeat`] wraps a `Weak` handle to a per-entry token. Checking it is
//!   O(1) and needs no access to the registry at all, so it can be carried
//!   into other tasks.
//!
//! Like `SyncMap`-style maps, nothing is created implicitly: `lookup()` and
//! `erase()` on unknown ids simply return `None`.

use std::fmt;
use std::sync::{Arc, Weak};

/// Opaque handle to a registry entry.
///
/// Ids are never reused for a different object: erasing an entry bumps the
/// slot generation, and slots whose generation is exhausted are retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

impl EntryId {
    /// Returns the slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the slot generation.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Liveness capability for one registry entry.
///
/// `alive()` turns false the moment the entry is erased (or the registry is
/// dropped) and never turns true again.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    id: EntryId,
    token: Weak<()>,
}

impl Heartbeat {
    /// Returns the id this heartbeat tracks.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Returns true while the entry is still registered.
    pub fn alive(&self) -> bool {
        self.token.strong_count() > 0
    }
}

struct Occupied<T> {
    value: T,
    token: Arc<()>,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Occupied<T>>,
}

/// Keyed collection handing out generation-checked ids.
pub struct SafeRegistry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> SafeRegistry<T> {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Creates a registry with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a value and returns its id.
    pub fn insert(&mut self, value: T) -> EntryId {
        let occupied = Occupied {
            value,
            token: Arc::new(()),
        };
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(occupied);
            return EntryId {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            entry: Some(occupied),
        });
        EntryId {
            index,
            generation: 0,
        }
    }

    /// Removes an entry and returns its value.
    ///
    /// Unknown or stale ids are a no-op.
    pub fn erase(&mut self, id: EntryId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let occupied = slot.entry.take()?;
        self.len -= 1;

        // Retire exhausted slots instead of wrapping the generation.
        if let Some(next) = slot.generation.checked_add(1) {
            slot.generation = next;
            self.free.push(id.index);
        }

        // Dropping the token is what flips every outstanding heartbeat.
        drop(occupied.token);
        Some(occupied.value)
    }

    /// Returns a reference to the entry, if it is still registered.
    pub fn lookup(&self, id: EntryId) -> Option<&T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref().map(|o| &o.value)
    }

    /// Returns a mutable reference to the entry, if it is still registered.
    pub fn lookup_mut(&mut self, id: EntryId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut().map(|o| &mut o.value)
    }

    /// Returns true if the id refers to a live entry.
    pub fn contains(&self, id: EntryId) -> bool {
        self.lookup(id).is_some()
    }

    /// Returns a liveness token for the entry.
    pub fn heartbeat(&self, id: EntryId) -> Option<Heartbeat> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref().map(|o| Heartbeat {
            id,
            token: Arc::downgrade(&o.token),
        })
    }

    /// Iterates over live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|o| {
                (
                    EntryId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    &o.value,
                )
            })
        })
    }

    /// Snapshots the live ids.
    ///
    /// Use this to walk the registry while erasing: ids erased during the
    /// walk simply fail their `lookup()`.
    pub fn ids(&self) -> Vec<EntryId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

impl<T> Default for SafeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for SafeRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_insert_lookup_erase() {
        let mut reg = SafeRegistry::new();
        assert!(reg.is_empty());

        let a = reg.insert("a");
        let b = reg.insert("b");
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.lookup(a), Some(&"a"));
        assert_eq!(reg.lookup(b), Some(&"b"));

        assert_eq!(reg.erase(a), Some("a"));
        assert_eq!(reg.lookup(a), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_unknown_id_is_noop() {
        let mut reg: SafeRegistry<u32> = SafeRegistry::new();
        let id = reg.insert(7);
        reg.erase(id);

        // Second erase and lookups on a stale id are not errors.
        assert_eq!(reg.erase(id), None);
        assert_eq!(reg.lookup(id), None);
        assert!(reg.lookup_mut(id).is_none());
        assert!(reg.heartbeat(id).is_none());
    }

    #[test]
    fn test_recycled_slot_never_aliases() {
        let mut reg = SafeRegistry::new();
        let old = reg.insert("old");
        let old_heartbeat = reg.heartbeat(old).unwrap();
        reg.erase(old);

        let new = reg.insert("new");
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);

        assert_eq!(reg.lookup(old), None);
        assert_eq!(reg.lookup(new), Some(&"new"));
        assert!(!old_heartbeat.alive());
        assert!(reg.heartbeat(new).unwrap().alive());
    }

    #[test]
    fn test_heartbeat_tracks_erase() {
        let mut reg = SafeRegistry::new();
        let id = reg.insert(String::from("driver"));
        let hb = reg.heartbeat(id).unwrap();
        let hb2 = hb.clone();

        assert!(hb.alive());
        assert_eq!(hb.id(), id);

        reg.erase(id);
        assert!(!hb.alive());
        assert!(!hb2.alive());
    }

    #[test]
    fn test_heartbeat_dies_with_registry() {
        let mut reg = SafeRegistry::new();
        let id = reg.insert(1u8);
        let hb = reg.heartbeat(id).unwrap();
        drop(reg);
        assert!(!hb.alive());
    }

    #[test]
    fn test_erase_while_walking_ids() {
        let mut reg = SafeRegistry::new();
        for i in 0..10 {
            reg.insert(i);
        }

        let mut seen = Vec::new();
        for id in reg.ids() {
            // Erase the neighbour ahead of the walk.
            let next = EntryId {
                index: id.index() + 1,
                generation: 0,
            };
            if let Some(v) = reg.lookup(id).copied() {
                seen.push(v);
                if v % 2 == 0 {
                    reg.erase(next);
                }
            }
        }

        assert_eq!(seen, vec![0, 2, 4, 6, 8]);
        assert_eq!(reg.len(), 5);
    }

    #[test]
    fn test_iter_skips_missing_slots() {
        let mut reg = SafeRegistry::new();
        let a = reg.insert('a');
        let b = reg.insert('b');
        let c = reg.insert('c');
        reg.erase(b);

        let live: Vec<_> = reg.iter().map(|(id, v)| (id, *v)).collect();
        assert_eq!(live, vec![(a, 'a'), (c, 'c')]);
    }

    #[test]
    fn test_lookup_mut() {
        let mut reg = SafeRegistry::new();
        let id = reg.insert(vec![1]);
        reg.lookup_mut(id).unwrap().push(2);
        assert_eq!(reg.lookup(id), Some(&vec![1, 2]));
    }

    #[test]
    fn test_display() {
        let mut reg = SafeRegistry::new();
        let id = reg.insert(());
        assert_eq!(id.to_string(), "#0.0");
        reg.erase(id);
        let id = reg.insert(());
        assert_eq!(id.to_string(), "#0.1");
    }
}
