use std::collections::{HashSet, VecDeque};

/// Queue of execution record ids to be processed
#[derive(Debug)]
pub struct ExecutionQueue {
    /// Ids waiting for a worker
    pending: VecDeque<String>,
    /// Ids that are currently being worked on
    in_flight: HashSet<String>,
    /// Ids that have been pushed to the queue or are in-flight
    queued: HashSet<String>,
    /// Maximum number of ids that can be in the queue (including in-progress)
    capacity: usize,
}

/// Rejection returned when the queue is at capacity.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("execution queue is full, please try again later")]
pub struct QueueFull;

impl ExecutionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: HashSet::new(),
            queued: HashSet::new(),
            capacity,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.queued.contains(id)
    }

    /// Check if the queue is at capacity
    pub fn is_at_capacity(&self) -> bool {
        self.queued.len() >= self.capacity
    }

    /// Current queue size (including in-progress ids)
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Add an id to the back of the queue. Ids already queued or in flight
    /// are accepted without being duplicated.
    pub fn push(&mut self, id: &str) -> Result<(), QueueFull> {
        if self.queued.contains(id) {
            return Ok(());
        }
        if self.is_at_capacity() {
            return Err(QueueFull);
        }
        self.queued.insert(id.to_string());
        self.pending.push_back(id.to_string());
        oscar_metrics::QUEUE_DEPTH.set(self.queued.len() as i64);
        Ok(())
    }

    /// Move the oldest pending id into the in-flight set.
    pub fn try_next(&mut self) -> Option<String> {
        let id = self.pending.pop_front()?;
        self.in_flight.insert(id.clone());
        Some(id)
    }

    /// Release an id once its processing is over, successful or not.
    pub fn complete(&mut self, id: &str) {
        self.in_flight.remove(id);
        self.queued.remove(id);
        oscar_metrics::QUEUE_DEPTH.set(self.queued.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let mut queue = ExecutionQueue::new(10);
        for id in ["a", "b", "c"] {
            queue.push(id).unwrap();
        }
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.try_next().as_deref(), Some("a"));
        assert_eq!(queue.try_next().as_deref(), Some("b"));

        // In-flight ids still count against capacity and containment.
        assert!(queue.contains("a"));
        queue.complete("a");
        assert!(!queue.contains("a"));

        assert_eq!(queue.try_next().as_deref(), Some("c"));
        assert_eq!(queue.try_next(), None);

        queue.complete("b");
        queue.complete("c");
        assert!(queue.is_empty());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut queue = ExecutionQueue::new(2);
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        assert!(queue.is_at_capacity());
        assert_eq!(queue.push("c"), Err(QueueFull));
        assert_eq!(queue.len(), 2);

        // Dequeuing alone does not free capacity; completion does.
        let id = queue.try_next().unwrap();
        assert_eq!(queue.push("c"), Err(QueueFull));
        queue.complete(&id);
        queue.push("c").unwrap();
    }

    #[test]
    fn duplicate_ids_are_not_requeued() {
        let mut queue = ExecutionQueue::new(10);
        queue.push("a").unwrap();
        queue.push("a").unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_next().as_deref(), Some("a"));
        assert_eq!(queue.try_next(), None);
    }
}
