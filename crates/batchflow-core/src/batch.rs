//! Non-empty, append-only group of upstream items

use std::ops::Deref;

/// Ordered group of upstream items handed to the worker in one invocation.
///
/// A batch always holds at least one item: it is created from the item that
/// opened it and only ever grows by appending. Once dispatched it is moved
/// into the worker, so the operator can no longer touch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    items: Vec<T>,
}

impl<T> Batch<T> {
    /// Start a batch with its first item
    pub(crate) fn single(item: T) -> Self {
        Self { items: vec![item] }
    }

    /// Append an item, keeping arrival order
    pub(crate) fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Borrow the items in arrival order
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Take ownership of the items in arrival order
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> Deref for Batch<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T> From<Batch<T>> for Vec<T> {
    fn from(batch: Batch<T>) -> Self {
        batch.items
    }
}

impl<T> IntoIterator for Batch<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Batch<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
