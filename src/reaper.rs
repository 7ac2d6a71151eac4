use async_trait::async_trait;
use bridge_core::endpoint::ClosedListener;
use bridge_core::types::CallId;
use dashmap::DashMap;
use std::sync::{Arc, Weak};

pub type CallTable<V> = DashMap<CallId, Arc<V>>;

/// Drops an entry from its table once the endpoint it watches closes,
/// unless a newer entry has taken the call id in the meantime.
pub struct Reaper<V> {
    table: Weak<CallTable<V>>,
    entry: Weak<V>,
}

impl<V> Reaper<V> {
    pub fn new(table: &Arc<CallTable<V>>, entry: &Arc<V>) -> Arc<Self> {
        Arc::new(Self {
            table: Arc::downgrade(table),
            entry: Arc::downgrade(entry),
        })
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> ClosedListener for Reaper<V> {
    async fn on_closed(&self, call_id: &CallId) {
        if let Some(table) = self.table.upgrade() {
            table.remove_if(call_id, |_, current| {
                std::ptr::eq(Arc::as_ptr(current), self.entry.as_ptr())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_removes_the_entry_it_watches() {
        let table: Arc<CallTable<String>> = Arc::new(DashMap::new());
        let old = Arc::new("old".to_string());
        let reaper = Reaper::new(&table, &old);

        let newer = Arc::new("newer".to_string());
        table.insert("c1".into(), newer.clone());
        reaper.on_closed(&"c1".into()).await;
        assert!(table.contains_key(&CallId::from("c1")));

        table.insert("c1".into(), old.clone());
        reaper.on_closed(&"c1".into()).await;
        assert!(table.is_empty());
    }
}
