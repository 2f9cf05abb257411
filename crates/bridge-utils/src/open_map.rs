//! A small open-addressed map keyed by `usize`, used by the event core for
//! its fd/token to callback lookup. Linear probing, power-of-two capacity,
//! grow-on-load-factor rather than chaining — this is the "small utility"
//! named in the transport engine's component list, kept out of the hot
//! reactor path's main crate so it can be unit tested in isolation.

const EMPTY: usize = usize::MAX;

struct Slot<V> {
    key: usize,
    value: Option<V>,
}

pub struct OpenMap<V> {
    slots: Vec<Slot<V>>,
    len: usize,
}

impl<V> Default for OpenMap<V> {
    fn default() -> Self {
        Self::with_capacity(16)
    }
}

impl<V> OpenMap<V> {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.next_power_of_two().max(4);
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, || Slot { key: EMPTY, value: None });
        Self { slots, len: 0 }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn probe(&self, key: usize) -> usize {
        debug_assert_ne!(key, EMPTY, "usize::MAX is reserved as the empty sentinel");
        let mask = self.mask();
        let mut idx = key & mask;
        loop {
            match &self.slots[idx] {
                Slot { key: k, .. } if *k == EMPTY || *k == key => return idx,
                _ => idx = (idx + 1) & mask,
            }
        }
    }

    fn grow(&mut self) {
        let old = std::mem::replace(&mut self.slots, Vec::new());
        *self = Self::with_capacity(old.len() * 2);
        for slot in old {
            if let Some(v) = slot.value {
                self.insert(slot.key, v);
            }
        }
    }

    pub fn insert(&mut self, key: usize, value: V) -> Option<V> {
        if (self.len + 1) * 4 >= self.slots.len() * 3 {
            self.grow();
        }
        let idx = self.probe(key);
        let slot = &mut self.slots[idx];
        let prev = if slot.key == EMPTY {
            slot.key = key;
            self.len += 1;
            None
        } else {
            slot.value.take()
        };
        slot.value = Some(value);
        prev
    }

    pub fn get(&self, key: usize) -> Option<&V> {
        let idx = self.probe(key);
        self.slots[idx].value.as_ref()
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut V> {
        let idx = self.probe(key);
        self.slots[idx].value.as_mut()
    }

    /// Removes the entry. Leaves a tombstone (empty key, no value slot
    /// reused) rather than compacting; simple and correct for the small,
    /// low-churn fd sets this map serves.
    pub fn remove(&mut self, key: usize) -> Option<V> {
        let idx = self.probe(key);
        let removed = self.slots[idx].value.take();
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &V)> {
        self.slots.iter().filter_map(|s| s.value.as_ref().map(|v| (s.key, v)))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.slots.iter_mut().filter_map(|s| s.value.as_mut())
    }
}
