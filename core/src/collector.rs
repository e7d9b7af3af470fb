use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Groups items per partition until a group reaches `max_size` or its
/// oldest item has waited `timeout`.
///
/// This is the upstream batching step: it decides *when* a group is handed
/// to a partition writer, not how much the writer flushes.
#[derive(Debug)]
pub struct Collector<T> {
    max_size: usize,
    timeout: Duration,
    pending: BTreeMap<String, Pending<T>>,
}

#[derive(Debug)]
struct Pending<T> {
    items: Vec<T>,
    started: Instant,
}

impl<T> Collector<T> {
    pub fn new(max_size: usize, timeout: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            timeout,
            pending: BTreeMap::new(),
        }
    }

    /// Adds an item; returns the group when it just reached `max_size`.
    pub fn push(&mut self, partition: &str, item: T, now: Instant) -> Option<Vec<T>> {
        let group = self
            .pending
            .entry(partition.to_string())
            .or_insert_with(|| Pending {
                items: Vec::new(),
                started: now,
            });
        group.items.push(item);

        if group.items.len() >= self.max_size {
            return self.pending.remove(partition).map(|p| p.items);
        }
        None
    }

    /// Removes every group whose first item arrived at least `timeout` ago.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<(String, Vec<T>)> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, group)| now.saturating_duration_since(group.started) >= self.timeout)
            .map(|(partition, _)| partition.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|partition| {
                self.pending
                    .remove(&partition)
                    .map(|group| (partition, group.items))
            })
            .collect()
    }

    pub fn drain_all(&mut self) -> Vec<(String, Vec<T>)> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(partition, group)| (partition, group.items))
            .collect()
    }

    /// When the oldest pending group times out, if any group is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|group| group.started + self.timeout)
            .min()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(|group| group.items.len()).sum()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emits_full_group() {
        let mut collector = Collector::new(3, Duration::from_secs(1));
        let now = Instant::now();

        assert!(collector.push("p0", 1, now).is_none());
        assert!(collector.push("p1", 10, now).is_none());
        assert!(collector.push("p0", 2, now).is_none());
        assert_eq!(collector.push("p0", 3, now), Some(vec![1, 2, 3]));
        assert_eq!(collector.pending_len(), 1);
    }

    #[test]
    fn test_drains_expired_groups_only() {
        let mut collector = Collector::new(100, Duration::from_millis(500));
        let start = Instant::now();

        collector.push("p0", "a", start);
        collector.push("p1", "b", start + Duration::from_millis(400));

        assert!(collector.drain_expired(start + Duration::from_millis(499)).is_empty());
        let drained = collector.drain_expired(start + Duration::from_millis(600));
        assert_eq!(drained, vec![("p0".to_string(), vec!["a"])]);
        assert_eq!(
            collector.next_deadline(),
            Some(start + Duration::from_millis(900))
        );
    }

    #[test]
    fn test_group_timer_starts_at_first_item() {
        let mut collector = Collector::new(100, Duration::from_millis(100));
        let start = Instant::now();

        collector.push("p0", 1, start);
        collector.push("p0", 2, start + Duration::from_millis(90));

        let drained = collector.drain_expired(start + Duration::from_millis(100));
        assert_eq!(drained, vec![("p0".to_string(), vec![1, 2])]);
        assert_eq!(collector.next_deadline(), None);
    }

    #[test]
    fn test_drain_all() {
        let mut collector = Collector::new(10, Duration::from_secs(60));
        let now = Instant::now();
        collector.push("p1", 1, now);
        collector.push("p0", 2, now);

        let drained = collector.drain_all();
        assert_eq!(
            drained,
            vec![("p0".to_string(), vec![2]), ("p1".to_string(), vec![1])]
        );
        assert_eq!(collector.pending_len(), 0);
    }
}
