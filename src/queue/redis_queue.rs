//! Durable queue on Redis Streams
//!
//! Each queue is a stream read through a single consumer group, so an entry
//! is handed to one worker at a time and stays in the group's pending list
//! until it is acked. Entries left pending longer than the visibility
//! timeout are claimed by the next worker that polls, whether their owner
//! died or its ack never reached Redis. Settled entries are deleted; a
//! requeue appends a fresh entry carrying the incremented redelivery count.
//!
//! Needs Redis 6.2 or later for `XPENDING ... IDLE`.

use super::{Delivery, DeliveryStream, QueueService};
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionLike, ConnectionManager, MultiplexedConnection};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Consumer group every worker joins.
const CONSUMER_GROUP: &str = "workers";

const BODY_FIELD: &str = "body";
const REDELIVERIES_FIELD: &str = "redeliveries";

// Milliseconds an XREADGROUP blocks before the stream polls again.
const BLOCK_MS: u64 = 1000;
// Pending entries claimed per round trip.
const CLAIM_BATCH: usize = 10;
const CLAIM_INTERVAL: Duration = Duration::from_secs(5);

/// Entry id and its field/value pairs, as returned by XREADGROUP and XCLAIM.
type StreamEntry = (String, HashMap<String, Vec<u8>>);

/// One row of `XPENDING`: id, owning consumer, idle ms, delivery count.
type PendingEntry = (String, String, u64, u64);

/// `XADD` appending `body` to `queue` as requeued `redeliveries` times.
fn add_entry(queue: &str, body: &[u8], redeliveries: u32) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(queue)
        .arg("*")
        .arg(BODY_FIELD)
        .arg(body)
        .arg(REDELIVERIES_FIELD)
        .arg(redeliveries);
    cmd
}

/// Turn a stream entry into a delivery. `deliveries` is how often the group
/// has handed the entry out, this time included; every earlier hand-out
/// that was never settled counts as a redelivery. Entries without a body
/// field (written by another producer) are delivered with an empty body.
fn entry_to_delivery(
    queue: &str,
    (id, mut fields): StreamEntry,
    deliveries: u64,
) -> Delivery {
    let requeued = fields
        .get(REDELIVERIES_FIELD)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|raw| raw.parse::<u32>().ok())
        .unwrap_or(0);
    let unsettled = u32::try_from(deliveries.saturating_sub(1)).unwrap_or(u32::MAX);
    Delivery {
        queue: queue.to_string(),
        tag: id,
        body: fields.remove(BODY_FIELD).unwrap_or_default(),
        redelivery_count: requeued.saturating_add(unsettled),
    }
}

/// Create the consumer group (and the stream) unless it already exists.
async fn ensure_group<C>(conn: &mut C, queue: &str) -> Result<()>
where
    C: ConnectionLike + Send,
{
    let created = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(queue)
        .arg(CONSUMER_GROUP)
        .arg("0")
        .arg("MKSTREAM")
        .query_async::<_, ()>(conn)
        .await;
    match created {
        Ok(()) => Ok(()),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Read side of one `consume` call. Idle pending entries are served before
/// new ones.
struct StreamReader {
    conn: MultiplexedConnection,
    queue: String,
    consumer: String,
    visibility_timeout: Duration,
    buffered: VecDeque<Delivery>,
    next_claim: Instant,
}

impl StreamReader {
    async fn next_delivery(&mut self) -> Result<Delivery> {
        loop {
            if let Some(delivery) = self.buffered.pop_front() {
                return Ok(delivery);
            }
            if Instant::now() >= self.next_claim {
                let claimed = self.claim_idle().await?;
                self.next_claim = if claimed.len() == CLAIM_BATCH {
                    Instant::now()
                } else {
                    Instant::now() + CLAIM_INTERVAL
                };
                if !claimed.is_empty() {
                    self.buffered.extend(claimed);
                    continue;
                }
            }
            if let Some(delivery) = self.read_new().await? {
                return Ok(delivery);
            }
        }
    }

    async fn claim_idle(&mut self) -> Result<Vec<Delivery>> {
        let idle_ms = self.visibility_timeout.as_millis() as u64;
        let pending = redis::cmd("XPENDING")
            .arg(&self.queue)
            .arg(CONSUMER_GROUP)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(CLAIM_BATCH)
            .query_async::<_, Vec<PendingEntry>>(&mut self.conn)
            .await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = pending.iter().map(|(id, ..)| id.as_str()).collect();
        // The min-idle argument makes a concurrent claim by another worker a no-op.
        let claimed = redis::cmd("XCLAIM")
            .arg(&self.queue)
            .arg(CONSUMER_GROUP)
            .arg(&self.consumer)
            .arg(idle_ms)
            .arg(&ids[..])
            .query_async::<_, Vec<Option<StreamEntry>>>(&mut self.conn)
            .await?;

        let previous: HashMap<&str, (&str, u64)> = pending
            .iter()
            .map(|(id, owner, _, count)| (id.as_str(), (owner.as_str(), *count)))
            .collect();
        let deliveries = claimed
            .into_iter()
            .flatten()
            .map(|entry| {
                let (owner, count) = previous.get(entry.0.as_str()).copied().unwrap_or(("", 0));
                tracing::warn!(
                    queue = %self.queue,
                    id = %entry.0,
                    previous_owner = owner,
                    "Claimed delivery left unacknowledged past the visibility timeout"
                );
                entry_to_delivery(&self.queue, entry, count + 1)
            })
            .collect();
        Ok(deliveries)
    }

    async fn read_new(&mut self) -> Result<Option<Delivery>> {
        let reply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(CONSUMER_GROUP)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.queue)
            .arg(">")
            .query_async::<_, Option<Vec<(String, Vec<StreamEntry>)>>>(&mut self.conn)
            .await?;
        Ok(reply
            .into_iter()
            .flatten()
            .flat_map(|(_, entries)| entries)
            .next()
            .map(|entry| entry_to_delivery(&self.queue, entry, 1)))
    }
}

pub struct RedisQueue {
    client: redis::Client,
    manager: ConnectionManager,
    consumer_id: String,
    visibility_timeout: Duration,
}

impl RedisQueue {
    pub async fn connect(
        redis_url: &str,
        consumer_id: String,
        visibility_timeout: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        tracing::info!(consumer_id = %consumer_id, "Connected to Redis queue");
        Ok(Self {
            client,
            manager,
            consumer_id,
            visibility_timeout,
        })
    }

    /// Ack and delete `delivery`, running `then` in the same transaction.
    /// Returns false when the entry had already been settled.
    async fn settle(&self, delivery: &Delivery, then: Option<redis::Cmd>) -> Result<bool> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XACK")
            .arg(&delivery.queue)
            .arg(CONSUMER_GROUP)
            .arg(&delivery.tag)
            .cmd("XDEL")
            .arg(&delivery.queue)
            .arg(&delivery.tag)
            .ignore();
        if let Some(cmd) = then {
            pipe.add_command(cmd).ignore();
        }
        let (acked,) = pipe.query_async::<_, (i64,)>(&mut conn).await?;
        if acked == 0 {
            tracing::warn!(queue = %delivery.queue, id = %delivery.tag, "Settled delivery was no longer pending");
        }
        Ok(acked > 0)
    }
}

#[async_trait]
impl QueueService for RedisQueue {
    async fn declare_durable_queue(&self, name: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        ensure_group(&mut conn, name).await
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        // Blocking reads get their own connection so they never stall acks.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        ensure_group(&mut conn, queue).await?;
        let reader = StreamReader {
            conn,
            queue: queue.to_string(),
            consumer: self.consumer_id.clone(),
            visibility_timeout: self.visibility_timeout,
            buffered: VecDeque::new(),
            next_claim: Instant::now(),
        };

        let stream = futures::stream::unfold(reader, |mut reader| async move {
            let next = reader.next_delivery().await;
            Some((next, reader))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.settle(delivery, None).await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let then = requeue.then(|| {
            add_entry(
                &delivery.queue,
                &delivery.body,
                delivery.redelivery_count.saturating_add(1),
            )
        });
        self.settle(delivery, then).await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.manager.clone();
        add_entry(queue, payload, 0)
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, fields: &[(&str, &str)]) -> StreamEntry {
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        (id.to_string(), fields)
    }

    #[test]
    fn test_new_entry_is_a_first_delivery() {
        let delivery = entry_to_delivery(
            "tasks",
            entry("1-0", &[("body", "{\"productID\":1}"), ("redeliveries", "0")]),
            1,
        );

        assert_eq!(delivery.queue, "tasks");
        assert_eq!(delivery.tag, "1-0");
        assert_eq!(delivery.body, b"{\"productID\":1}".to_vec());
        assert_eq!(delivery.redelivery_count, 0);
    }

    #[test]
    fn test_requeued_entry_carries_its_count() {
        let delivery = entry_to_delivery(
            "tasks",
            entry("7-0", &[("body", "payload"), ("redeliveries", "3")]),
            1,
        );

        assert_eq!(delivery.redelivery_count, 3);
    }

    #[test]
    fn test_entry_claimed_from_dead_worker_counts_as_redelivery() {
        // worker-a read the entry once and never acked it.
        let pending: PendingEntry = ("1-0".to_string(), "worker-a".to_string(), 400_000, 1);

        let delivery = entry_to_delivery(
            "tasks",
            entry("1-0", &[("body", "payload"), ("redeliveries", "0")]),
            pending.3 + 1,
        );

        assert_eq!(delivery.redelivery_count, 1);
        assert_eq!(delivery.body, b"payload".to_vec());
    }

    #[test]
    fn test_claimed_requeued_entry_adds_both_counts() {
        let delivery = entry_to_delivery(
            "tasks",
            entry("1-0", &[("body", "payload"), ("redeliveries", "2")]),
            3,
        );

        assert_eq!(delivery.redelivery_count, 4);
    }

    #[test]
    fn test_foreign_entry_has_empty_body() {
        let delivery = entry_to_delivery("tasks", entry("1-0", &[("payload", "x")]), 1);

        assert!(delivery.body.is_empty());
        assert_eq!(delivery.redelivery_count, 0);
    }

    #[test]
    fn test_add_entry_writes_body_and_count() {
        let packed = add_entry("tasks", b"payload", 2).get_packed_command();
        let packed = String::from_utf8_lossy(&packed);

        assert!(packed.contains("$4\r\nXADD\r\n$5\r\ntasks\r\n$1\r\n*\r\n"));
        assert!(packed.contains("$4\r\nbody\r\n$7\r\npayload\r\n"));
        assert!(packed.contains("$12\r\nredeliveries\r\n$1\r\n2\r\n"));
    }
}
