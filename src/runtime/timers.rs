//! In-process fallback timer service for providers without delayed
//! visibility. Holds a min-ordered heap of pending `TimerSchedule` items and
//! enqueues `TimerFired` to the orchestrator queue when due; the originating
//! queue item is acked only after the fire lands, so a crash redelivers it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use crate::providers::{Provider, WorkItem};
use crate::wall_clock_ms;

pub(crate) struct TimerWithToken {
    pub item: WorkItem,
    pub ack_token: String,
}

pub(crate) struct TimerService {
    provider: Arc<dyn Provider>,
    rx: tokio::sync::mpsc::UnboundedReceiver<TimerWithToken>,
    /// key -> (instance, execution_id, id, ack token)
    items: HashMap<String, (String, u64, u64, String)>,
    keys: HashSet<String>,
    min_heap: BinaryHeap<Reverse<(u64, String)>>,
}

impl TimerService {
    pub(crate) fn start(
        provider: Arc<dyn Provider>,
    ) -> (
        tokio::task::JoinHandle<()>,
        tokio::sync::mpsc::UnboundedSender<TimerWithToken>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut service = TimerService {
            provider,
            rx,
            items: HashMap::new(),
            keys: HashSet::new(),
            min_heap: BinaryHeap::new(),
        };
        let handle = tokio::spawn(async move { service.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        loop {
            while let Ok(timer) = self.rx.try_recv() {
                self.insert(timer);
            }

            let now = wall_clock_ms();
            let mut due = Vec::new();
            while let Some(Reverse((fire_at_ms, key))) = self.min_heap.peek().cloned() {
                if fire_at_ms > now {
                    break;
                }
                self.min_heap.pop();
                if let Some(entry) = self.items.remove(&key) {
                    self.keys.remove(&key);
                    due.push((entry, fire_at_ms));
                }
            }

            for ((instance, execution_id, id, ack_token), fire_at_ms) in due {
                let fired = WorkItem::TimerFired {
                    instance,
                    execution_id,
                    id,
                    fire_at_ms,
                };
                if self.provider.enqueue_orchestrator_work(fired, None).await.is_ok() {
                    let _ = self.provider.ack_timer(&ack_token).await;
                }
                // Failed enqueue: the schedule stays unacked and will be
                // redelivered; the idempotent append drops the extra fire.
            }

            if let Some(Reverse((next_fire, _))) = self.min_heap.peek().cloned() {
                let wait = next_fire.saturating_sub(wall_clock_ms()).max(1);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(wait)) => {}
                    received = self.rx.recv() => match received {
                        Some(timer) => self.insert(timer),
                        None => return,
                    },
                }
            } else {
                match self.rx.recv().await {
                    Some(timer) => self.insert(timer),
                    None => return,
                }
            }
        }
    }

    fn insert(&mut self, timer: TimerWithToken) {
        if let WorkItem::TimerSchedule {
            instance,
            execution_id,
            id,
            fire_at_ms,
        } = timer.item
        {
            let key = format!("{instance}|{execution_id}|{id}|{fire_at_ms}");
            if self.keys.insert(key.clone()) {
                self.min_heap.push(Reverse((fire_at_ms, key.clone())));
                self.items.insert(key, (instance, execution_id, id, timer.ack_token));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryProvider;

    #[tokio::test]
    async fn fires_due_timers_in_order() {
        let provider: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
        let (_handle, tx) = TimerService::start(provider.clone());
        let now = wall_clock_ms();
        for (id, offset) in [(1u64, 0u64), (2, 40), (3, 20)] {
            let item = WorkItem::TimerSchedule {
                instance: "i".into(),
                execution_id: 1,
                id,
                fire_at_ms: now + offset,
            };
            // The service acks through the provider; these test items were
            // never dequeued, so hand it throwaway tokens.
            tx.send(TimerWithToken {
                item,
                ack_token: format!("tok-{id}"),
            })
            .unwrap();
        }

        let mut fired = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(500);
        while fired.len() < 3 && std::time::Instant::now() < deadline {
            if let Some(item) = provider.fetch_orchestration_item().await {
                for message in &item.messages {
                    if let WorkItem::TimerFired { id, .. } = message {
                        fired.push(*id);
                    }
                }
                provider
                    .ack_orchestration_item(
                        &item.lock_token,
                        1,
                        vec![],
                        vec![],
                        vec![],
                        vec![],
                        vec![],
                        Default::default(),
                    )
                    .await
                    .unwrap();
            } else {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }
        assert_eq!(fired, vec![1, 3, 2]);
    }
}
