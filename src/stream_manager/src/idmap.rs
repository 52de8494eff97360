//! Map handing out increasing ids; removed ids are never reused.

use std::collections::{hash_map::Iter, HashMap};

#[derive(Debug)]
pub(crate) struct IdMap<T> {
    inner: HashMap<usize, T>,
    next_id: usize,
}

impl<T> IdMap<T> {
    pub fn new() -> Self {
        IdMap {
            inner: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn insert(&mut self, item: T) -> usize {
        let id = self.next_id;
        self.inner.insert(id, item);
        self.next_id += 1;
        id
    }

    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.inner.remove(&id)
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.inner.get(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl<'a, T> IntoIterator for &'a IdMap<T> {
    type Item = (&'a usize, &'a T);
    type IntoIter = Iter<'a, usize, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}
