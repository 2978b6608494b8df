use super::{Delivery, DeliveryStream, QueueService};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

struct Message {
    id: String,
    body: Vec<u8>,
    redelivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    unacked: HashMap<String, Message>,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    acked: Mutex<Vec<Delivery>>,
    nacked: Mutex<Vec<(Delivery, bool)>>,
}

impl Inner {
    fn take_next(&self, queue: &str) -> Option<Delivery> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues.get_mut(queue)?;
        let message = state.ready.pop_front()?;
        let delivery = Delivery {
            queue: queue.to_string(),
            tag: message.id.clone(),
            body: message.body.clone(),
            redelivery_count: message.redelivery_count,
        };
        state.unacked.insert(message.id.clone(), message);
        Some(delivery)
    }

    fn settle(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| Error::Queue(format!("queue '{}' not declared", delivery.queue)))?;
        let mut message = state.unacked.remove(&delivery.tag).ok_or_else(|| {
            Error::Queue(format!("unknown delivery tag '{}'", delivery.tag))
        })?;
        if requeue {
            message.redelivery_count += 1;
            state.ready.push_back(message);
        }
        Ok(())
    }
}

/// In-process queue with broker semantics: manual ack, requeue with a
/// redelivery counter, and unacked messages held until settled.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acked(&self) -> Vec<Delivery> {
        self.inner.acked.lock().unwrap().clone()
    }

    pub fn nacked(&self) -> Vec<(Delivery, bool)> {
        self.inner.nacked.lock().unwrap().clone()
    }

    /// Bodies waiting for delivery, oldest first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|state| state.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|state| state.unacked.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl QueueService for MemoryQueue {
    async fn declare_durable_queue(&self, name: &str) -> Result<()> {
        self.inner
            .queues
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        if !self.inner.queues.lock().unwrap().contains_key(queue) {
            return Err(Error::Queue(format!("queue '{}' not declared", queue)));
        }

        let state = (self.inner.clone(), queue.to_string());
        let stream = futures::stream::unfold(state, |(inner, queue)| async move {
            loop {
                let next = {
                    let notified = inner.notify.notified();
                    tokio::pin!(notified);
                    // Register before checking so a publish in between is not missed.
                    notified.as_mut().enable();
                    match inner.take_next(&queue) {
                        Some(delivery) => Some(delivery),
                        None => {
                            notified.await;
                            None
                        }
                    }
                };
                if let Some(delivery) = next {
                    return Some((Ok(delivery), (inner, queue)));
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.inner.settle(delivery, false)?;
        self.inner.acked.lock().unwrap().push(delivery.clone());
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.inner.settle(delivery, requeue)?;
        self.inner
            .nacked
            .lock()
            .unwrap()
            .push((delivery.clone(), requeue));
        if requeue {
            self.inner.notify.notify_waiters();
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.inner
            .queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Message {
                id: Uuid::new_v4().to_string(),
                body: payload.to_vec(),
                redelivery_count: 0,
            });
        self.inner.notify.notify_waiters();
        Ok(())
    }
}
