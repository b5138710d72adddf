/*! User-facing façade: [`Receiver`] owns an ingest session and exposes
only lifecycle control, callback registration, and observability —
stats and current state — over the heavier [`crate::ingest::Pipeline`]
machinery underneath. Mirrors this crate's general preference for a
small struct that owns the moving parts and keeps a narrow stable
surface for callers.
*/
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::ingest::{IngestConfig, Pipeline};
use crate::{Error, Packet, Result};

/// Receiver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReceiverState {
    /// No ingest session running.
    Idle,
    /// Producer and consumer threads are active.
    Running,
    /// `stop()` has been called; workers are winding down.
    Stopping,
}

/// Observational counters accumulated by the consumer thread. Purely
/// informational: nothing here feeds back into protocol decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Datagrams pulled off the ring by the consumer.
    pub packets_received: u64,
    /// Of those, how many decoded successfully.
    pub packets_decoded: u64,
    /// Of those, how many were dropped for a decode error.
    pub packets_dropped: u64,
    /// Heaps a host application has reported as finalized, via
    /// [`Stats::note_heap_finalized`]. The pipeline itself has no notion
    /// of heaps; this counter exists for hosts that want one stats
    /// struct covering both layers.
    pub heaps_finalized: u64,
}

impl Stats {
    /// Record that a heap was finalized. Call this from the packet
    /// callback when a heap assembled from delivered packets is done.
    pub fn note_heap_finalized(&mut self) {
        self.heaps_finalized += 1;
    }
}

/// Configuration for [`Receiver::start`].
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    /// UDP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address to bind to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: Ipv4Addr,
    /// Number of slots in the ingest ring.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Requested OS receive-buffer size, in bytes.
    #[serde(default)]
    pub rcvbuf: Option<usize>,
    /// Multicast group to join, if any.
    #[serde(default)]
    pub multicast_group: Option<Ipv4Addr>,
}

fn default_port() -> u16 {
    crate::DEFAULT_PORT
}

fn default_bind_addr() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_ring_capacity() -> usize {
    crate::DEFAULT_RING_CAPACITY
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr: default_bind_addr(),
            ring_capacity: default_ring_capacity(),
            rcvbuf: None,
            multicast_group: None,
        }
    }
}

impl From<&ReceiverConfig> for IngestConfig {
    fn from(cfg: &ReceiverConfig) -> Self {
        IngestConfig {
            port: cfg.port,
            bind_addr: cfg.bind_addr,
            ring_capacity: cfg.ring_capacity,
            rcvbuf: cfg.rcvbuf,
            multicast_group: cfg.multicast_group,
        }
    }
}

type Callback = Arc<dyn Fn(Packet) -> i32 + Send + Sync>;

/// Owns one UDP ingest session: socket, ring, and worker threads.
/// `start`/`stop` drive the `Idle -> Running -> Stopping -> Idle`
/// lifecycle; the registered callback is invoked from the consumer
/// thread for every successfully decoded packet.
pub struct Receiver {
    pipeline: Option<Pipeline>,
    stats: Arc<Mutex<Stats>>,
    callback: Option<Callback>,
    state: ReceiverState,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    /// A fresh, idle receiver with no callback registered.
    pub fn new() -> Self {
        Self {
            pipeline: None,
            stats: Arc::new(Mutex::new(Stats::default())),
            callback: None,
            state: ReceiverState::Idle,
        }
    }

    /// Register the packet callback. The callback takes ownership of
    /// each decoded [`Packet`] and returns `0` to keep running or
    /// nonzero to request a stop.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: Fn(Packet) -> i32 + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    /// If the pipeline has self-terminated (stream-ctrl-term packet,
    /// callback requesting a stop, or a fatal producer/consumer error)
    /// since it was last observed, join its workers and fall back to
    /// [`ReceiverState::Idle`]. This is what lets the receiver reach
    /// `Idle` on its own, matching `spec.md` §8 scenario 3 ("the receiver
    /// transitions to Idle after processing") instead of reporting
    /// `Stopping` forever until a caller happens to call `stop()`.
    fn reclaim_if_self_terminated(&mut self) {
        let self_terminated = matches!(&self.pipeline, Some(p) if !p.is_running());
        if self_terminated {
            if let Some(pipeline) = self.pipeline.take() {
                pipeline.stop();
            }
            self.state = ReceiverState::Idle;
        }
    }

    /// Bind the socket and start the producer/consumer threads.
    /// Requires [`ReceiverState::Idle`] (a pipeline that self-terminated
    /// since the last call is reclaimed first, so `start()` succeeds
    /// right after a stream-term packet or a callback-requested stop,
    /// not just after an explicit `stop()`).
    pub fn start(&mut self, cfg: &ReceiverConfig) -> Result<()> {
        self.reclaim_if_self_terminated();
        if self.state != ReceiverState::Idle {
            return Err(Error::AlreadyRunning);
        }
        let callback = self.callback.clone().unwrap_or_else(|| Arc::new(|_pkt| 0));
        let ingest_cfg: IngestConfig = cfg.into();
        let pipeline = Pipeline::start(&ingest_cfg, Arc::clone(&self.stats), callback)?;
        self.pipeline = Some(pipeline);
        self.state = ReceiverState::Running;
        Ok(())
    }

    /// Signal the workers to stop and join them. Requires
    /// [`ReceiverState::Running`]. Does not deadlock on an in-flight
    /// callback: it only waits for the workers' next poll edge.
    pub fn stop(&mut self) -> Result<()> {
        self.reclaim_if_self_terminated();
        if self.state != ReceiverState::Running {
            return Err(Error::NotRunning);
        }
        self.state = ReceiverState::Stopping;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop();
        }
        self.state = ReceiverState::Idle;
        Ok(())
    }

    /// Current lifecycle state. Reclaims a self-terminated pipeline
    /// before reporting, so hosts that poll `state()` observe `Idle`
    /// after a stream-term packet or a callback-requested stop without
    /// needing to call `stop()` themselves.
    pub fn state(&mut self) -> ReceiverState {
        self.reclaim_if_self_terminated();
        match &self.pipeline {
            Some(_) => ReceiverState::Running,
            None => self.state,
        }
    }

    /// A snapshot of the current ingest statistics.
    pub fn stats(&self) -> Stats {
        self.stats.lock().expect("stats mutex poisoned").clone()
    }
}
