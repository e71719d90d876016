// rockup_core is the core incremental backup/restore engine of Rockup.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use indexmap::IndexMap;

/// Anything that can live in an [`Identity`] registry carries its own key.
///
/// Equality and lookup for these objects always go through [`Identify::key`]
/// alone, never through structural equality of the rest of the value.
pub trait Identify {
    fn key(&self) -> &str;
}

/// A get-or-put map keyed by [`Identify::key`], iterating in insertion order.
///
/// This is the "identity map" of the design: [`Identity::insert_or_get`]
/// returns whatever is already stored under a key rather than clobbering it,
/// while [`Identity::replace`] unconditionally takes the new value.
#[derive(Debug)]
pub struct Identity<T: Identify> {
    entries: IndexMap<String, T>,
}

impl<T: Identify> Identity<T> {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    /// Returns the existing entry under `value.key()` if present, otherwise
    /// inserts `value` and returns it.
    pub fn insert_or_get(&mut self, value: T) -> &mut T {
        let key = value.key().to_string();
        self.entries.entry(key).or_insert(value)
    }

    /// Deletes any existing entry under `value.key()` and inserts `value`.
    pub fn replace(&mut self, value: T) -> &mut T {
        let key = value.key().to_string();
        self.entries.insert(key.clone(), value);
        self.entries
            .get_mut(&key)
            .expect("just inserted this key")
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.entries.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Identify> Default for Identity<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: String,
        value: u32,
    }

    impl Identify for Item {
        fn key(&self) -> &str {
            &self.id
        }
    }

    #[test]
    fn insert_or_get_keeps_first_value() {
        let mut reg: Identity<Item> = Identity::new();
        reg.insert_or_get(Item {
            id: "a".into(),
            value: 1,
        });
        let got = reg.insert_or_get(Item {
            id: "a".into(),
            value: 2,
        });
        assert_eq!(got.value, 1);
    }

    #[test]
    fn replace_overwrites_existing_value() {
        let mut reg: Identity<Item> = Identity::new();
        reg.insert_or_get(Item {
            id: "a".into(),
            value: 1,
        });
        let got = reg.replace(Item {
            id: "a".into(),
            value: 2,
        });
        assert_eq!(got.value, 2);
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut reg: Identity<Item> = Identity::new();
        reg.insert_or_get(Item {
            id: "b".into(),
            value: 1,
        });
        reg.insert_or_get(Item {
            id: "a".into(),
            value: 2,
        });
        let keys: Vec<&str> = reg.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}
