use std::collections::VecDeque;

/// First-in first-out queue with an optional capacity bound.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fifo<T> {
    inner: VecDeque<T>,
    max_size: Option<usize>,
}

impl<T> std::iter::IntoIterator for Fifo<T> {
    type Item = T;
    type IntoIter = std::collections::vec_deque::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<T> std::fmt::Display for Fifo<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Fifo({:>2}/{:<2}){:?}",
            self.inner.len(),
            self.max_size
                .map(|max| max.to_string())
                .as_deref()
                .unwrap_or(""),
            self.inner
                .iter()
                .map(std::string::ToString::to_string)
                .collect::<Vec<_>>()
        )
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> Fifo<T> {
    #[must_use]
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            inner: VecDeque::new(),
            max_size,
        }
    }

    #[must_use]
    pub fn iter(&self) -> std::collections::vec_deque::Iter<T> {
        self.inner.iter()
    }

    pub fn enqueue(&mut self, value: T) {
        self.inner.push_back(value);
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    #[must_use]
    pub fn first(&self) -> Option<&T> {
        self.inner.front()
    }

    #[must_use]
    pub fn full(&self) -> bool {
        match self.max_size {
            Some(max) => self.inner.len() >= max,
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn can_fit(&self, n: usize) -> bool {
        match self.max_size {
            Some(max) => self.inner.len() + n <= max,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Fifo;

    #[test]
    fn preserves_order() {
        let mut fifo = Fifo::new(None);
        fifo.enqueue(1);
        fifo.enqueue(2);
        fifo.enqueue(3);
        assert_eq!(fifo.dequeue(), Some(1));
        assert_eq!(fifo.first(), Some(&2));
        assert_eq!(fifo.dequeue(), Some(2));
        assert_eq!(fifo.dequeue(), Some(3));
        assert_eq!(fifo.dequeue(), None);
    }

    #[test]
    fn bounded_capacity() {
        let mut fifo = Fifo::new(Some(2));
        assert!(fifo.can_fit(2));
        fifo.enqueue('a');
        assert!(!fifo.full());
        fifo.enqueue('b');
        assert!(fifo.full());
        assert!(!fifo.can_fit(1));
    }
}
