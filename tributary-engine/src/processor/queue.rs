use std::collections::VecDeque;

/// A fixed-capacity FIFO that rejects new records when full.
///
/// It also counts every record it has accepted and handed out, so a flush can
/// be bounded to "everything accepted before this point".
#[derive(Debug)]
pub(crate) struct BoundedQueue<R> {
    items: VecDeque<R>,
    capacity: usize,
    pushed: u64,
    popped: u64,
    closed: bool,
}

impl<R> BoundedQueue<R> {
    pub(crate) fn new(capacity: usize) -> BoundedQueue<R> {
        BoundedQueue {
            items: VecDeque::with_capacity(capacity),
            capacity,
            pushed: 0,
            popped: 0,
            closed: false,
        }
    }

    /// Returns the new length, or the record back if it was not accepted.
    pub(crate) fn push(&mut self, record: R) -> Result<usize, R> {
        if self.closed || self.items.len() >= self.capacity {
            return Err(record);
        }

        self.items.push_back(record);
        self.pushed += 1;

        Ok(self.items.len())
    }

    /// Removes up to `max` of the oldest records.
    pub(crate) fn pop_batch(&mut self, max: usize) -> Vec<R> {
        self.pop_batch_until(max, u64::MAX)
    }

    /// Removes up to `max` of the oldest records, stopping once `target`
    /// records have been handed out in total.
    pub(crate) fn pop_batch_until(&mut self, max: usize, target: u64) -> Vec<R> {
        let allowed = target.saturating_sub(self.popped);
        let count = max
            .min(self.items.len())
            .min(usize::try_from(allowed).unwrap_or(usize::MAX));

        self.popped += count as u64;
        self.items.drain(..count).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Rejects all further pushes and returns whatever was still queued.
    pub(crate) fn close(&mut self) -> Vec<R> {
        self.closed = true;
        self.popped += self.items.len() as u64;
        self.items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_newest_when_full() {
        let mut queue = BoundedQueue::new(2);

        assert_eq!(queue.push('A'), Ok(1));
        assert_eq!(queue.push('B'), Ok(2));
        assert_eq!(queue.push('C'), Err('C'));

        assert_eq!(queue.pop_batch(2), vec!['A', 'B']);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn pops_oldest_first_in_bounded_batches() {
        let mut queue = BoundedQueue::new(10);
        for i in 0..5 {
            queue.push(i).unwrap();
        }

        assert_eq!(queue.pop_batch(2), vec![0, 1]);
        assert_eq!(queue.pop_batch(2), vec![2, 3]);
        assert_eq!(queue.pop_batch(2), vec![4]);
        assert!(queue.pop_batch(2).is_empty());
    }

    #[test]
    fn pop_until_stops_at_target() {
        let mut queue = BoundedQueue::new(10);
        for i in 0..3 {
            queue.push(i).unwrap();
        }

        let target = queue.pushed();
        queue.push(3).unwrap();
        queue.push(4).unwrap();

        assert_eq!(queue.pop_batch_until(2, target), vec![0, 1]);
        assert_eq!(queue.pop_batch_until(2, target), vec![2]);
        assert!(queue.pop_batch_until(2, target).is_empty());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn closed_queue_rejects_pushes() {
        let mut queue = BoundedQueue::new(4);
        queue.push(1).unwrap();

        assert_eq!(queue.close(), vec![1]);
        assert_eq!(queue.push(2), Err(2));
        assert_eq!(queue.len(), 0);
    }
}
