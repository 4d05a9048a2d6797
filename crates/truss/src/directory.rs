use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use crate::reactor::Inbox;

const CHUNK_LEN: usize = 64;

/// Stable actor identity: a slot index plus the generation the slot had
/// when the actor registered. A stale generation never matches, so a
/// recycled slot cannot be reached through an old id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActorId {
    pub index: u32,
    pub generation: u32,
}

#[derive(Clone)]
pub(crate) struct Route {
    pub reactor: usize,
    pub inbox: Arc<Inbox>,
}

struct Slot {
    generation: u32,
    route: Option<Route>,
}

struct Chunk {
    slots: Mutex<Vec<Slot>>,
}

impl Chunk {
    fn new() -> Arc<Self> {
        let slots = (0..CHUNK_LEN).map(|_| Slot { generation: 0, route: None }).collect();
        Arc::new(Self { slots: Mutex::new(slots) })
    }
}

/// Directory of live actors, readable from any thread.
///
/// Storage is chunked; slot access locks only the owning chunk. The chunk
/// list itself is published in two generations behind an atomic index:
/// readers go through the active generation while growth builds the
/// inactive one and swaps, so lookups never block on concurrent
/// registrations.
pub struct Directory {
    gens: [spin::RwLock<Vec<Arc<Chunk>>>; 2],
    active: AtomicUsize,
    grow: Mutex<GrowState>,
}

struct GrowState {
    free: Vec<u32>,
    len: u32,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            gens: [spin::RwLock::new(Vec::new()), spin::RwLock::new(Vec::new())],
            active: AtomicUsize::new(0),
            grow: Mutex::new(GrowState { free: Vec::new(), len: 0 }),
        }
    }

    /// Live actors currently registered.
    pub fn len(&self) -> usize {
        let grow = self.grow.lock().expect("directory growth lock");
        grow.len as usize - grow.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn register(&self, route: Route) -> ActorId {
        let index = {
            let mut grow = self.grow.lock().expect("directory growth lock");
            match grow.free.pop() {
                Some(index) => index,
                None => {
                    let index = grow.len;
                    grow.len += 1;
                    if index as usize % CHUNK_LEN == 0 {
                        self.push_chunk();
                    }
                    index
                }
            }
        };
        self.with_slot(index, |slot| {
            slot.route = Some(route);
            ActorId { index, generation: slot.generation }
        })
        .expect("registered slot exists")
    }

    pub(crate) fn unregister(&self, id: ActorId) {
        let freed = self.with_slot(id.index, |slot| {
            if slot.generation != id.generation {
                return false;
            }
            slot.generation = slot.generation.wrapping_add(1);
            slot.route = None;
            true
        });
        if freed == Some(true) {
            self.grow.lock().expect("directory growth lock").free.push(id.index);
        }
    }

    /// Generation-checked lookup of the reactor hosting `id`.
    pub(crate) fn route(&self, id: ActorId) -> Option<Route> {
        self.with_slot(id.index, |slot| {
            (slot.generation == id.generation).then(|| slot.route.clone()).flatten()
        })?
    }

    fn with_slot<R>(&self, index: u32, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let chunk = {
            let chunks = self.gens[self.active.load(Ordering::Acquire)].read();
            chunks.get(index as usize / CHUNK_LEN)?.clone()
        };
        let mut slots = chunk.slots.lock().expect("directory chunk lock");
        Some(f(&mut slots[index as usize % CHUNK_LEN]))
    }

    /// Builds the next generation with one more chunk and publishes it.
    /// Callers hold the growth lock, so builders are serialized.
    fn push_chunk(&self) {
        let active = self.active.load(Ordering::Acquire);
        let mut next = self.gens[active].read().clone();
        next.push(Chunk::new());
        *self.gens[1 - active].write() = next;
        self.active.store(1 - active, Ordering::Release);
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Inbox;

    fn dummy_route() -> Route {
        Route { reactor: 0, inbox: Arc::new(Inbox::for_tests()) }
    }

    #[test]
    fn register_lookup_unregister() {
        let dir = Directory::new();
        let id = dir.register(dummy_route());
        assert_eq!(dir.len(), 1);
        assert!(dir.route(id).is_some());

        dir.unregister(id);
        assert_eq!(dir.len(), 0);
        assert!(dir.route(id).is_none());
    }

    #[test]
    fn stale_generation_never_matches_recycled_slot() {
        let dir = Directory::new();
        let old = dir.register(dummy_route());
        dir.unregister(old);

        let new = dir.register(dummy_route());
        assert_eq!(new.index, old.index);
        assert_ne!(new.generation, old.generation);
        assert!(dir.route(old).is_none());
        assert!(dir.route(new).is_some());
    }

    #[test]
    fn growth_keeps_existing_slots_reachable() {
        let dir = Directory::new();
        let ids: Vec<_> = (0..CHUNK_LEN * 3 + 5).map(|_| dir.register(dummy_route())).collect();
        for id in &ids {
            assert!(dir.route(*id).is_some());
        }
        assert_eq!(dir.len(), CHUNK_LEN * 3 + 5);
    }

    #[test]
    fn lookups_race_registrations() {
        let dir = Arc::new(Directory::new());
        let id = dir.register(dummy_route());

        let reader = {
            let dir = dir.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    assert!(dir.route(id).is_some());
                }
            })
        };
        let writer = {
            let dir = dir.clone();
            std::thread::spawn(move || {
                for _ in 0..CHUNK_LEN * 8 {
                    dir.register(dummy_route());
                }
            })
        };
        reader.join().unwrap();
        writer.join().unwrap();
    }
}
