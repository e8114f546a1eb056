use std::collections::VecDeque;

/// FIFO buffer a processor consumes from.
///
/// A processor removes the items it has handled; whatever it leaves behind is
/// offered again on the next call.
#[derive(Debug)]
pub struct Inbox<T> {
    items: VecDeque<T>,
}

impl<T> Default for Inbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Inbox<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub fn add(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn poll(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Removes the head item, which the caller already looked at via [`Inbox::peek`].
    pub fn remove(&mut self) {
        self.items.pop_front();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Moves every item into `target`, returning how many were moved.
    pub fn drain_to(&mut self, target: &mut Vec<T>) -> usize {
        let n = self.items.len();
        target.extend(self.items.drain(..));
        n
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T> FromIterator<T> for Inbox<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T> Extend<T> for Inbox<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}
