//! Coordination Client
//!
//! The testbed consumes an external pub/sub and barrier service through
//! [`SyncClient`]. Payloads are opaque bytes at this level; [`Topic`] adds a
//! typed CBOR layer on top and the rendezvous helpers every phase needs:
//!
//! - [`Topic::wait_first`]: subscribe, block until the first value or the deadline, unsubscribe
//! - [`Topic::collect`]: gather a fixed number of values (the peer roster)
//! - [`signal_and_wait_for_all`]: signal a state and block until `target` instances did
//!
//! All waits are bounded by a [`tokio::time::Instant`] deadline. Expiry is a
//! [`CoordinationError::Timeout`], which is fatal to the instance.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::tb_error::CoordinationError;

/// Final report of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceOutcome {
    Success,
    Failure(String),
}

/// Receiving end of a topic subscription. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(topic: String, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { topic, rx }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Append a payload to a topic and return its 1-based position
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<u64, CoordinationError>;

    /// Deliver every payload of the topic, past and future, in publish order
    async fn subscribe(&self, topic: &str) -> Result<Subscription, CoordinationError>;

    /// Signal arrival at a state and return the new count
    async fn signal_entry(&self, state: &str) -> Result<u64, CoordinationError>;

    /// Block until `target` instances signalled `state`, without signalling
    async fn barrier(&self, state: &str, target: u64) -> Result<(), CoordinationError>;

    async fn signal_and_wait(&self, state: &str, target: u64) -> Result<u64, CoordinationError> {
        let seq = self.signal_entry(state).await?;
        self.barrier(state, target).await?;
        Ok(seq)
    }

    async fn record_outcome(&self, instance: u64, outcome: InstanceOutcome) -> Result<(), CoordinationError>;
}

/// Signal `state` and wait for the whole swarm, bounded by `deadline`
pub async fn signal_and_wait_for_all(
    client: &dyn SyncClient,
    state: &str,
    target: u64,
    deadline: Instant,
) -> Result<u64, CoordinationError> {
    log::debug!("signal and wait {} ({})", state, target);
    timeout_at(deadline, client.signal_and_wait(state, target))
        .await
        .map_err(|_| CoordinationError::Timeout(state.to_string()))?
}

// ============================================================================
// Typed Topics
// ============================================================================

pub struct Topic<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Topic<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn publish(&self, client: &dyn SyncClient, value: &T) -> Result<u64, CoordinationError> {
        let mut payload = Vec::new();
        ciborium::into_writer(value, &mut payload).map_err(|e| CoordinationError::Encode {
            topic: self.name.clone(),
            reason: e.to_string(),
        })?;
        client.publish(&self.name, payload).await
    }

    fn decode(&self, payload: &[u8]) -> Result<T, CoordinationError> {
        ciborium::from_reader(payload).map_err(|e| CoordinationError::Decode {
            topic: self.name.clone(),
            reason: e.to_string(),
        })
    }

    async fn next(&self, sub: &mut Subscription, deadline: Instant) -> Result<T, CoordinationError> {
        match timeout_at(deadline, sub.next()).await {
            Ok(Some(payload)) => self.decode(&payload),
            Ok(None) => Err(CoordinationError::SubscriptionClosed(self.name.clone())),
            Err(_) => Err(CoordinationError::Timeout(self.name.clone())),
        }
    }

    /// One-shot rendezvous on the first value published to this topic
    pub async fn wait_first(&self, client: &dyn SyncClient, deadline: Instant) -> Result<T, CoordinationError> {
        let mut sub = client.subscribe(&self.name).await?;
        self.next(&mut sub, deadline).await
    }

    /// Collect exactly `count` values in publish order
    pub async fn collect(
        &self,
        client: &dyn SyncClient,
        count: usize,
        deadline: Instant,
    ) -> Result<Vec<T>, CoordinationError> {
        let mut sub = client.subscribe(&self.name).await?;
        let mut values = Vec::with_capacity(count);
        while values.len() < count {
            values.push(self.next(&mut sub, deadline).await?);
        }
        Ok(values)
    }
}
