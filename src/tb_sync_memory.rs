//! In-process coordination service
//!
//! Stands in for the external sync service when every instance of a swarm
//! runs inside one process (simulator, tests). Clones share state, so each
//! instance gets its own clone as its client.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::{mpsc, watch};

use crate::tb_error::CoordinationError;
use crate::tb_sync::{InstanceOutcome, Subscription, SyncClient};

#[derive(Default)]
struct TopicState {
    history: Vec<Vec<u8>>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Default)]
struct SyncState {
    topics: HashMap<String, TopicState>,
    states: HashMap<String, watch::Sender<u64>>,
    outcomes: Vec<(u64, InstanceOutcome)>,
}

#[derive(Clone, Default)]
pub struct MemorySyncService {
    inner: Arc<Mutex<SyncState>>,
}

impl MemorySyncService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        // a poisoned lock only means another instance task panicked
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Outcomes recorded so far, in arrival order
    pub fn outcomes(&self) -> Vec<(u64, InstanceOutcome)> {
        self.lock().outcomes.clone()
    }

    /// Current count of a barrier state
    pub fn state_count(&self, state: &str) -> u64 {
        self.lock().states.get(state).map(|tx| *tx.borrow()).unwrap_or(0)
    }

    /// Number of payloads published to a topic
    pub fn topic_len(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map(|t| t.history.len()).unwrap_or(0)
    }

    fn state_receiver(&self, state: &str) -> watch::Receiver<u64> {
        let mut st = self.lock();
        st.states
            .entry(state.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }
}

#[async_trait]
impl SyncClient for MemorySyncService {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<u64, CoordinationError> {
        let mut st = self.lock();
        let entry = st.topics.entry(topic.to_string()).or_default();
        entry.history.push(payload.clone());
        entry.subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        Ok(entry.history.len() as u64)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, CoordinationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.lock();
        let entry = st.topics.entry(topic.to_string()).or_default();
        // replay under the lock so no publish can slip between history and live
        for payload in &entry.history {
            tx.send(payload.clone())
                .map_err(|_| CoordinationError::SubscriptionClosed(topic.to_string()))?;
        }
        entry.subscribers.push(tx);
        Ok(Subscription::new(topic.to_string(), rx))
    }

    async fn signal_entry(&self, state: &str) -> Result<u64, CoordinationError> {
        let mut st = self.lock();
        let tx = st
            .states
            .entry(state.to_string())
            .or_insert_with(|| watch::channel(0).0);
        tx.send_modify(|count| *count += 1);
        let count = *tx.borrow();
        Ok(count)
    }

    async fn barrier(&self, state: &str, target: u64) -> Result<(), CoordinationError> {
        let mut rx = self.state_receiver(state);
        rx.wait_for(|count| *count >= target)
            .await
            .map(|_| ())
            .map_err(|_| CoordinationError::SubscriptionClosed(state.to_string()))
    }

    async fn record_outcome(&self, instance: u64, outcome: InstanceOutcome) -> Result<(), CoordinationError> {
        self.lock().outcomes.push((instance, outcome));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tb_sync::{signal_and_wait_for_all, Topic};
    use std::time::Duration;
    use tokio::time::Instant;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_publish_returns_sequence_numbers() {
        let sync = MemorySyncService::new();
        assert_eq!(sync.publish("peers", vec![1]).await.unwrap(), 1);
        assert_eq!(sync.publish("peers", vec![2]).await.unwrap(), 2);
        assert_eq!(sync.publish("other", vec![3]).await.unwrap(), 1);
        assert_eq!(sync.topic_len("peers"), 2);
    }

    #[tokio::test]
    async fn test_subscribe_replays_history_then_live() {
        let sync = MemorySyncService::new();
        sync.publish("t", vec![1]).await.unwrap();

        let mut sub = sync.subscribe("t").await.unwrap();
        sync.publish("t", vec![2]).await.unwrap();

        assert_eq!(sub.next().await, Some(vec![1]));
        assert_eq!(sub.next().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn test_typed_topic_wait_first() {
        let sync = MemorySyncService::new();
        let topic: Topic<String> = Topic::new("root-cid-0");

        let waiter = {
            let sync = sync.clone();
            tokio::spawn(async move {
                let topic: Topic<String> = Topic::new("root-cid-0");
                topic.wait_first(&sync, deadline()).await
            })
        };

        topic.publish(&sync, &"abc".to_string()).await.unwrap();
        topic.publish(&sync, &"def".to_string()).await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_first_times_out() {
        let sync = MemorySyncService::new();
        let topic: Topic<u64> = Topic::new("never");

        let err = topic
            .wait_first(&sync, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_collect_reads_exact_count() {
        let sync = MemorySyncService::new();
        let topic: Topic<u64> = Topic::new("peerInfos");
        for i in 0..5u64 {
            topic.publish(&sync, &i).await.unwrap();
        }

        let values = topic.collect(&sync, 3, deadline()).await.unwrap();
        assert_eq!(values, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_signal_and_wait_releases_all() {
        let sync = MemorySyncService::new();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let sync = sync.clone();
            handles.push(tokio::spawn(async move {
                signal_and_wait_for_all(&sync, "ready", 3, deadline()).await
            }));
        }

        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap().unwrap());
        }
        seqs.sort();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(sync.state_count("ready"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_times_out_when_instance_missing() {
        let sync = MemorySyncService::new();
        let err = signal_and_wait_for_all(&sync, "ready", 2, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Timeout(state) if state == "ready"));
    }

    #[tokio::test]
    async fn test_phase_ordering_across_three_instances() {
        use std::sync::Mutex as StdMutex;

        #[derive(Debug, Clone, Copy, PartialEq)]
        enum Mark {
            Signal(usize),
            Enter(usize),
        }

        let sync = MemorySyncService::new();
        let log: Arc<StdMutex<Vec<(usize, Mark)>>> = Arc::new(StdMutex::new(Vec::new()));
        let phases = 5;

        let mut handles = Vec::new();
        for instance in 0..3 {
            let sync = sync.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                for phase in 0..phases {
                    log.lock().unwrap().push((instance, Mark::Enter(phase)));
                    tokio::task::yield_now().await;
                    log.lock().unwrap().push((instance, Mark::Signal(phase)));
                    signal_and_wait_for_all(&sync, &format!("phase-{}", phase), 3, deadline())
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let log = log.lock().unwrap();
        for phase in 1..phases {
            let first_enter = log
                .iter()
                .position(|(_, m)| *m == Mark::Enter(phase))
                .unwrap();
            let signals_before = log[..first_enter]
                .iter()
                .filter(|(_, m)| *m == Mark::Signal(phase - 1))
                .count();
            assert_eq!(signals_before, 3, "phase {} entered early", phase);
        }
    }

    #[tokio::test]
    async fn test_outcomes_are_recorded() {
        let sync = MemorySyncService::new();
        sync.record_outcome(1, InstanceOutcome::Success).await.unwrap();
        sync.record_outcome(2, InstanceOutcome::Failure("boom".into()))
            .await
            .unwrap();
        assert_eq!(sync.outcomes().len(), 2);
    }
}
