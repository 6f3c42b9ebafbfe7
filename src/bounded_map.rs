// SPDX-License-Identifier: MIT OR Apache-2.0

//! Arena-backed map with a fixed capacity which evicts its oldest entries first.
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use serde::de::Deserializer;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};

/// Map holding at most `capacity` entries.
///
/// Entries live in a slot arena and are additionally kept in insertion order. Inserting into a
/// full map evicts the entry which was inserted first. Overwriting an existing key keeps its
/// original position.
#[derive(Clone, Debug)]
pub struct BoundedMap<K, V> {
    capacity: usize,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    /// Slot positions in insertion order, tagged with the generation they were filled with.
    /// Removed entries are skipped lazily.
    order: VecDeque<(usize, u64)>,
    next_generation: u64,
}

#[derive(Clone, Debug)]
struct Slot<K, V> {
    key: K,
    value: V,
    generation: u64,
}

impl<K, V> BoundedMap<K, V>
where
    K: Clone + Eq + Hash,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            order: VecDeque::new(),
            next_generation: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let position = self.index.get(key)?;
        self.slots[*position].as_ref().map(|slot| &slot.value)
    }

    /// Inserts an entry and returns the entries which had to be evicted to make room for it.
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        if let Some(position) = self.index.get(&key) {
            if let Some(slot) = self.slots[*position].as_mut() {
                slot.value = value;
            }
            return Vec::new();
        }

        if self.capacity == 0 {
            return vec![(key, value)];
        }

        let mut evicted = Vec::new();
        while self.len() >= self.capacity {
            match self.pop_oldest() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let slot = Slot {
            key: key.clone(),
            value,
            generation,
        };
        let position = match self.free.pop() {
            Some(position) => {
                self.slots[position] = Some(slot);
                position
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        self.index.insert(key, position);
        self.order.push_back((position, generation));

        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let position = self.index.remove(key)?;
        let slot = self.slots[position].take()?;
        self.free.push(position);
        self.compact();
        Some(slot.value)
    }

    /// Removes and returns the entry which was inserted first.
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        while let Some((position, generation)) = self.order.pop_front() {
            if !self.is_live(position, generation) {
                continue;
            }
            let slot = self.slots[position].take()?;
            self.index.remove(&slot.key);
            self.free.push(position);
            return Some((slot.key, slot.value));
        }
        None
    }

    /// Iterates over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order.iter().filter_map(|(position, generation)| {
            self.slots[*position]
                .as_ref()
                .filter(|slot| slot.generation == *generation)
                .map(|slot| (&slot.key, &slot.value))
        })
    }

    fn is_live(&self, position: usize, generation: u64) -> bool {
        matches!(&self.slots[position], Some(slot) if slot.generation == generation)
    }

    /// Drops stale positions from the order queue once they dominate it.
    fn compact(&mut self) {
        if self.order.len() <= self.len() * 2 + 16 {
            return;
        }
        let slots = &self.slots;
        self.order.retain(
            |(position, generation)| matches!(&slots[*position], Some(slot) if slot.generation == *generation),
        );
    }
}

impl<K, V> PartialEq for BoundedMap<K, V>
where
    K: Clone + Eq + Hash,
    V: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.capacity == other.capacity && self.iter().eq(other.iter())
    }
}

impl<K, V> Eq for BoundedMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Eq,
{
}

impl<K, V> Serialize for BoundedMap<K, V>
where
    K: Clone + Eq + Hash + Serialize,
    V: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<(&K, &V)> = self.iter().collect();
        let mut state = serializer.serialize_struct("BoundedMap", 2)?;
        state.serialize_field("capacity", &self.capacity)?;
        state.serialize_field("entries", &entries)?;
        state.end()
    }
}

#[derive(Deserialize)]
struct BoundedMapRepr<K, V> {
    capacity: usize,
    entries: Vec<(K, V)>,
}

impl<'de, K, V> Deserialize<'de> for BoundedMap<K, V>
where
    K: Clone + Eq + Hash + Deserialize<'de>,
    V: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = BoundedMapRepr::<K, V>::deserialize(deserializer)?;
        let mut map = BoundedMap::new(repr.capacity);
        for (key, value) in repr.entries {
            map.insert(key, value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::BoundedMap;

    #[test]
    fn evicts_oldest_first() {
        let mut map = BoundedMap::new(3);
        assert!(map.insert("a", 1).is_empty());
        assert!(map.insert("b", 2).is_empty());
        assert!(map.insert("c", 3).is_empty());

        assert_eq!(map.insert("d", 4), vec![("a", 1)]);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&"a"), None);

        // Removing frees a slot without evicting.
        assert_eq!(map.remove(&"c"), Some(3));
        assert!(map.insert("e", 5).is_empty());
        assert_eq!(
            map.iter().collect::<Vec<_>>(),
            vec![(&"b", &2), (&"d", &4), (&"e", &5)]
        );

        // Overwriting keeps the position.
        assert!(map.insert("b", 20).is_empty());
        assert_eq!(map.insert("f", 6), vec![("b", 20)]);
    }

    #[test]
    fn reuses_slots() {
        let mut map = BoundedMap::new(2);
        for i in 0..100u32 {
            map.insert(i, i);
            if i % 2 == 0 {
                map.remove(&i);
            }
        }
        assert_eq!(map.len(), 2);
        assert!(map.slots.len() <= 3);
        assert!(map.order.len() <= map.len() * 2 + 16);
        assert_eq!(map.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![97, 99]);
    }

    #[test]
    fn zero_capacity() {
        let mut map = BoundedMap::new(0);
        assert_eq!(map.insert(1, "one"), vec![(1, "one")]);
        assert!(map.is_empty());
    }

    #[test]
    fn serde_keeps_order() {
        let mut map = BoundedMap::new(3);
        map.insert(3u8, "c".to_string());
        map.insert(1u8, "a".to_string());
        map.insert(2u8, "b".to_string());
        map.remove(&1);

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&map, &mut bytes).unwrap();
        let decoded: BoundedMap<u8, String> = ciborium::de::from_reader(&bytes[..]).unwrap();

        assert_eq!(map, decoded);
        assert_eq!(decoded.capacity(), 3);
    }
}
