//! 短期记忆：固定容量环形缓冲，O(1) 追加，满时淘汰最旧条目

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::memory::MemoryItem;

#[derive(Debug, Clone)]
pub struct ShortTermMemory {
    capacity: usize,
    items: VecDeque<MemoryItem>,
}

impl ShortTermMemory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// 追加；超出容量时返回被淘汰的最旧条目（交给调用方决定是否晋升）
    pub fn push(&mut self, item: MemoryItem) -> Option<MemoryItem> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 删除过期条目，返回删除数量
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.items.len();
        self.items.retain(|i| !i.is_expired(now));
        before - self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryKind, MemoryTier};

    fn item(n: usize) -> MemoryItem {
        let now = Utc::now();
        MemoryItem {
            id: format!("m{n}"),
            content: format!("note {n}"),
            key: format!("note|{n}"),
            importance: 0.5,
            timestamp: now,
            expires_at: now + chrono::Duration::hours(1),
            tier: MemoryTier::Short,
            kind: MemoryKind::Observation,
            outcome: None,
        }
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut stm = ShortTermMemory::new(2);
        assert!(stm.push(item(1)).is_none());
        assert!(stm.push(item(2)).is_none());
        let evicted = stm.push(item(3)).unwrap();
        assert_eq!(evicted.id, "m1");
        let ids: Vec<_> = stm.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
    }

    #[test]
    fn test_purge_expired() {
        let mut stm = ShortTermMemory::new(4);
        let mut old = item(1);
        old.expires_at = Utc::now() - chrono::Duration::seconds(1);
        stm.push(old);
        stm.push(item(2));
        assert_eq!(stm.purge_expired(Utc::now()), 1);
        assert_eq!(stm.len(), 1);
    }
}
