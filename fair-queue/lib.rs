#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Byte-weighted fair queueing across named flows.
//!
//! [`FairQueue`] holds one FIFO per flow and dequeues from the flow with
//! the smallest byte deficit, so a flow sending large packets cannot starve
//! a flow sending small ones. Deficits decay with the time since a flow was
//! last served, letting long-idle flows regain priority.

use std::{
    collections::{HashMap, VecDeque},
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

/// The weight of a payload when charging a flow's deficit.
pub trait ByteLen {
    fn byte_len(&self) -> usize;
}

impl ByteLen for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl ByteLen for Box<[u8]> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

/// A payload together with its queueing metadata.
#[derive(Debug)]
pub struct Item<T> {
    pub flow: String,
    pub payload: T,
    pub enqueued_at: Instant,
    /// Set once the item has been handed out by [`FairQueue::dequeue`].
    pub dequeued_at: Option<Instant>,
}

/// Per-flow throughput and latency over the sliding stats window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowStats {
    pub mean_latency_ms: f64,
    pub bytes: usize,
    pub items: u64,
}

struct Deficit {
    bytes: usize,
    updated_at: Instant,
}

impl Deficit {
    /// Deficits shrink with the inverse of the time since the flow was last
    /// served; after a second of idleness a flow starts regaining priority.
    fn decayed(&self, now: Instant) -> usize {
        let elapsed = now.duration_since(self.updated_at).as_secs_f32().max(1.0);

        (self.bytes as f32 / elapsed) as usize
    }
}

struct LatencySample {
    latency_ms: f64,
    bytes: usize,
    recorded_at: Instant,
}

pub struct FairQueue<T> {
    queues: HashMap<String, VecDeque<Item<T>>>,
    deficits: HashMap<String, Deficit>,
    latencies: HashMap<String, VecDeque<LatencySample>>,
    stats_window: Duration,
    idle_timeout: Duration,
    last_idle_sweep: Option<Instant>,
    len: usize,
}

impl<T> FairQueue<T>
where
    T: ByteLen,
{
    /// `stats_window` bounds how far back [`average_latency`](Self::average_latency)
    /// looks; `idle_timeout` controls when empty flows are swept.
    pub fn new(stats_window: Duration, idle_timeout: Duration) -> Self {
        Self {
            queues: HashMap::new(),
            deficits: HashMap::new(),
            latencies: HashMap::new(),
            stats_window,
            idle_timeout,
            last_idle_sweep: None,
            len: 0,
        }
    }

    /// The total number of queued items across all flows.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of tracked flows in (queues, deficits, latency counters).
    pub fn flow_counts(&self) -> (usize, usize, usize) {
        (self.queues.len(), self.deficits.len(), self.latencies.len())
    }

    /// Appends a payload to the back of its flow's queue.
    pub fn enqueue(&mut self, flow: impl Into<String>, payload: T) {
        let flow = flow.into();

        let item = Item {
            flow: flow.clone(),
            payload,
            enqueued_at: Instant::now(),
            dequeued_at: None,
        };

        self.queues.entry(flow).or_default().push_back(item);
        self.len += 1;
    }

    /// Removes the front item of the flow with the smallest decayed deficit.
    ///
    /// The served flow is charged the payload's byte length, a latency
    /// sample is recorded and idle flows are swept opportunistically.
    pub fn dequeue(&mut self) -> Option<Item<T>> {
        let flow = self.next_flow()?;
        let mut item = self.queues.get_mut(&flow)?.pop_front()?;

        let now = Instant::now();
        item.dequeued_at = Some(now);
        self.len -= 1;

        let deficit = self.deficits.entry(flow.clone()).or_insert(Deficit {
            bytes: 0,
            updated_at: now,
        });
        deficit.bytes = deficit.decayed(now) + item.payload.byte_len();
        deficit.updated_at = now;

        let samples = self.latencies.entry(flow).or_default();
        samples.push_back(LatencySample {
            latency_ms: now.duration_since(item.enqueued_at).as_secs_f64() * 1000.0,
            bytes: item.payload.byte_len(),
            recorded_at: now,
        });
        let window = self.stats_window;
        samples.retain(|s| now.duration_since(s.recorded_at) <= window);

        self.maybe_sweep_idle(now);

        Some(item)
    }

    /// Drops empty flows whose last activity is older than `max_idle`,
    /// together with their deficit and latency state.
    pub fn prune_idle_flows(&mut self, max_idle: Duration) {
        let now = Instant::now();

        self.queues.retain(|flow, queue| {
            if !queue.is_empty() {
                return true;
            }

            let last_activity = self
                .latencies
                .get(flow)
                .and_then(|samples| samples.back())
                .map(|sample| sample.recorded_at);

            match last_activity {
                Some(at) if now.duration_since(at) > max_idle => {
                    tracing::debug!(%flow, "Removing idle flow");

                    self.deficits.remove(flow);
                    self.latencies.remove(flow);

                    false
                }
                Some(_) | None => true,
            }
        });
    }

    /// Mean latency, byte and item counts per flow over the stats window.
    pub fn average_latency(&self) -> HashMap<String, FlowStats> {
        let mut result = HashMap::new();

        for (flow, samples) in &self.latencies {
            if samples.is_empty() {
                continue;
            }

            let mut total_latency_ms = 0.0;
            let mut bytes = 0;
            let mut items = 0u64;

            for sample in samples {
                total_latency_ms += sample.latency_ms;
                bytes += sample.bytes;
                items += 1;
            }

            result.insert(
                flow.clone(),
                FlowStats {
                    mean_latency_ms: total_latency_ms / items as f64,
                    bytes,
                    items,
                },
            );
        }

        result
    }

    fn next_flow(&self) -> Option<String> {
        let now = Instant::now();

        let mut min_deficit = usize::MAX;
        let mut next = None;

        for (flow, queue) in &self.queues {
            if queue.is_empty() {
                continue;
            }

            let deficit = self
                .deficits
                .get(flow)
                .map(|d| d.decayed(now))
                .unwrap_or(0);

            if deficit < min_deficit {
                min_deficit = deficit;
                next = Some(flow.clone());
            }
        }

        next
    }

    fn maybe_sweep_idle(&mut self, now: Instant) {
        let due = match self.last_idle_sweep {
            Some(last) => now.duration_since(last) > self.idle_timeout,
            None => true,
        };

        if due {
            self.prune_idle_flows(self.idle_timeout);
            self.last_idle_sweep = Some(now);
        }
    }
}

impl<T> futures::Stream for FairQueue<T>
where
    T: ByteLen + Unpin,
{
    type Item = Item<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.dequeue() {
            Some(item) => Poll::Ready(Some(item)),
            None => {
                // Producers have no handle to wake us with, so an empty
                // queue schedules an immediate re-poll instead of parking
                // the task.
                cx.waker().wake_by_ref();

                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{FutureExt as _, StreamExt as _};
    use rand::Rng as _;

    const FLOWS: [&str; 10] = ["A", "B", "C", "D", "E", "F", "G", "H", "I", "J"];

    #[test]
    fn drains_everything_it_holds() {
        let mut rng = rand::thread_rng();
        let mut queue = new_queue();

        let num_packets = 1000;

        for _ in 0..num_packets {
            let flow = FLOWS[rng.gen_range(0..FLOWS.len())];
            let payload: Vec<u8> = (0..rng.gen_range(1..1500)).map(|_| rng.r#gen()).collect();

            queue.enqueue(flow, payload);
        }

        assert_eq!(queue.len(), num_packets);

        let mut dequeued = 0;
        while let Some(item) = queue.dequeue() {
            assert!(item.dequeued_at.is_some());
            dequeued += 1;
        }

        assert_eq!(dequeued, num_packets);
        assert!(queue.is_empty());
    }

    #[test]
    fn small_flow_is_not_starved_by_large_flow() {
        let mut queue = new_queue();

        for _ in 0..10 {
            queue.enqueue("elephant", vec![0u8; 1000]);
        }
        for _ in 0..10 {
            queue.enqueue("mouse", vec![0u8; 10]);
        }

        let mut mouse_positions = Vec::new();

        for position in 0..20 {
            let item = queue.dequeue().unwrap();

            if item.flow == "mouse" {
                mouse_positions.push(position);
            }
        }

        // One elephant packet outweighs the entire mouse backlog, so at
        // most one elephant may be served before the mice drain.
        assert_eq!(mouse_positions.len(), 10);
        assert!(*mouse_positions.last().unwrap() <= 10);
    }

    #[test]
    fn records_latency_per_flow() {
        let mut queue = new_queue();

        queue.enqueue("a", vec![0u8; 42]);
        queue.dequeue().unwrap();

        let stats = queue.average_latency();
        let a = &stats["a"];

        assert_eq!(a.bytes, 42);
        assert_eq!(a.items, 1);
        assert!(a.mean_latency_ms >= 0.0);
    }

    #[test]
    fn prunes_idle_flows_with_their_counters() {
        let mut queue = new_queue();

        queue.enqueue("a", vec![0u8; 1]);
        queue.dequeue().unwrap();

        std::thread::sleep(Duration::from_millis(10));
        queue.prune_idle_flows(Duration::from_millis(1));

        assert_eq!(queue.flow_counts(), (0, 0, 0));
    }

    #[test]
    fn active_flows_survive_the_sweep() {
        let mut queue = new_queue();

        queue.enqueue("a", vec![0u8; 1]);

        queue.prune_idle_flows(Duration::ZERO);

        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn streams_queued_items() {
        let mut queue = new_queue();

        queue.enqueue("a", vec![0u8; 1]);
        queue.enqueue("b", vec![0u8; 2]);

        futures::executor::block_on(async {
            assert!(queue.next().await.is_some());
            assert!(queue.next().await.is_some());
        });

        assert!(queue.next().now_or_never().is_none());
    }

    fn new_queue() -> FairQueue<Vec<u8>> {
        FairQueue::new(Duration::from_secs(30), Duration::from_secs(30))
    }
}
