//! Single-threaded readiness loop driving all in-flight connections.
//!
//! The reactor owns at most `max_connections` slots. Each slot maps to one
//! poll token; admission pulls jobs off the control channel only while a
//! free slot exists, so the channel itself is the queue and submitters are
//! never told "busy". One extra token belongs to the waker that the
//! [`Fetcher`] handle pokes when it submits a job or hangs up.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::FetcherConfig;
use crate::conn::{ConnProgress, Connection, Want};
use crate::error::FetchError;
use crate::job::{FetchJob, FetchOutcome, FetchResult};
use crate::resolver;
use crate::tls;
use crate::uri::HttpsUri;

/// Handle to a running retrieval engine. Submitting is non-blocking up to
/// the channel bound; results arrive on their own channel in completion
/// order. Dropping the handle (or calling [`Fetcher::shutdown`]) lets
/// in-flight fetches finish, then stops the reactor thread.
pub struct Fetcher {
    jobs: Option<Sender<FetchJob>>,
    results: Receiver<FetchResult>,
    waker: Arc<Waker>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Fetcher {
    /// Build the TLS configuration, spawn the reactor thread, and return
    /// the control handle.
    pub fn spawn(cfg: FetcherConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(cfg.max_connections > 0, "max_connections must be at least 1");
        let tls_config = tls::client_config(cfg.ca_bundle.as_deref())?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), Token(cfg.max_connections))?);
        // bound the job queue so a runaway producer backs off instead of
        // piling sinks up in memory
        let (job_tx, job_rx) = crossbeam_channel::bounded(cfg.max_connections);
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let mut reactor = Reactor::new(cfg, tls_config, poll, job_rx, result_tx);
        let worker = thread::Builder::new()
            .name("hfetch-reactor".into())
            .spawn(move || reactor.run())?;
        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            waker,
            worker: Some(worker),
        })
    }

    /// Queue a fetch. Blocks only when the bounded job channel is full.
    /// Errors once the reactor has shut down.
    pub fn submit(&self, job: FetchJob) -> anyhow::Result<()> {
        let Some(jobs) = &self.jobs else {
            anyhow::bail!("fetcher already shut down");
        };
        jobs.send(job).map_err(|_| anyhow::anyhow!("reactor gone"))?;
        self.waker.wake()?;
        Ok(())
    }

    /// Wait for the next result. `None` once the reactor has exited and
    /// all results were drained.
    pub fn recv_result(&self) -> Option<FetchResult> {
        self.results.recv().ok()
    }

    pub fn try_recv_result(&self) -> Option<FetchResult> {
        self.results.try_recv().ok()
    }

    /// Stop accepting jobs, let in-flight fetches run to completion, and
    /// join the reactor thread.
    pub fn shutdown(&mut self) {
        self.jobs = None;
        let _ = self.waker.wake();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("reactor thread panicked");
            }
        }
    }
}

impl Drop for Fetcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Slot {
    conn: Connection,
    /// Socket generation last registered with the poller; a mismatch means
    /// the connection swapped sockets (failover, redirect) and the new one
    /// still needs registering.
    registered_gen: u32,
    interest: Option<Interest>,
}

struct Reactor {
    cfg: FetcherConfig,
    tls_config: Arc<rustls::ClientConfig>,
    poll: Poll,
    events: Events,
    slots: Vec<Option<Slot>>,
    jobs: Receiver<FetchJob>,
    results: Sender<FetchResult>,
    /// Set once the job channel hung up; the loop exits when the last slot
    /// empties.
    draining: bool,
}

impl Reactor {
    fn new(
        cfg: FetcherConfig,
        tls_config: Arc<rustls::ClientConfig>,
        poll: Poll,
        jobs: Receiver<FetchJob>,
        results: Sender<FetchResult>,
    ) -> Self {
        let slots = (0..cfg.max_connections).map(|_| None).collect();
        Self {
            cfg,
            tls_config,
            poll,
            events: Events::with_capacity(64),
            slots,
            jobs,
            results,
            draining: false,
        }
    }

    fn run(&mut self) {
        tracing::debug!(slots = self.slots.len(), "reactor started");
        loop {
            self.admit();
            if self.draining && self.slots.iter().all(Option::is_none) {
                break;
            }
            let timeout = self.next_deadline().map(|d| {
                d.checked_duration_since(Instant::now())
                    .unwrap_or(Duration::ZERO)
            });
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "poll failed, shutting down");
                    break;
                }
            }
            let ready: Vec<usize> = self
                .events
                .iter()
                .map(|ev| ev.token().0)
                .filter(|&t| t < self.slots.len())
                .collect();
            for idx in ready {
                if self.slots[idx].is_some() {
                    self.drive(idx);
                }
            }
            self.expire();
        }
        tracing::debug!("reactor stopped");
    }

    /// Fill free slots from the job channel. Jobs that fail before holding
    /// a slot (bad URL, failed resolution) are answered immediately.
    fn admit(&mut self) {
        loop {
            let Some(idx) = self.slots.iter().position(Option::is_none) else {
                return;
            };
            let job = match self.jobs.try_recv() {
                Ok(job) => job,
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.draining = true;
                    return;
                }
            };
            match self.start(job) {
                Ok(conn) => {
                    self.slots[idx] = Some(Slot {
                        conn,
                        registered_gen: 0,
                        interest: None,
                    });
                    self.drive(idx);
                }
                Err((id, err)) => {
                    tracing::warn!(id, error = %err, "fetch rejected at admission");
                    self.send_result(FetchResult {
                        id,
                        outcome: FetchOutcome::Failed,
                        last_modified: None,
                    });
                }
            }
        }
    }

    /// Parse and resolve up front; both must succeed before the job may
    /// occupy a slot.
    fn start(&self, job: FetchJob) -> Result<Connection, (u64, FetchError)> {
        let id = job.id;
        let target = HttpsUri::parse(&job.url).map_err(|e| (id, e))?;
        let addrs = resolver::resolve(&target.host, target.port).map_err(|e| (id, e))?;
        tracing::info!(id, url = %target.to_url(), "fetch started");
        Ok(Connection::new(job, target, addrs, self.tls_config.clone(), &self.cfg))
    }

    /// Run one connection until it wants readiness or terminates.
    fn drive(&mut self, idx: usize) {
        let (outcome, result) = match self.slots[idx].as_mut() {
            Some(slot) => (drive_conn(&mut slot.conn), slot.conn.take_result()),
            None => return,
        };
        // forward a result as soon as it exists; termination may lag behind
        // while close_notify drains
        if let Some(result) = result {
            self.send_result(result);
        }
        match outcome {
            Ok(ConnProgress::Want(want)) => {
                let registered = {
                    let Some(slot) = self.slots[idx].as_mut() else {
                        return;
                    };
                    slot.conn.deadline = Instant::now() + self.cfg.step_timeout;
                    register_slot(&mut self.poll, idx, slot, want)
                        .map_err(|e| format!("{}: {e}", slot.conn.url_display()))
                };
                if let Err(e) = registered {
                    tracing::error!(error = %e, "poll registration failed");
                    self.finish(idx);
                }
            }
            Ok(ConnProgress::Finished) => self.finish(idx),
            Ok(ConnProgress::Advance) => unreachable!("drive_conn returns no Advance"),
            Err(e) => {
                let url = self.slots[idx]
                    .as_ref()
                    .map(|s| s.conn.url_display().to_string())
                    .unwrap_or_default();
                tracing::warn!(url = %url, error = %e, "fetch failed");
                self.finish(idx);
            }
        }
    }

    /// Release a slot: settle the result exactly once, close the sink, and
    /// drop the connection.
    fn finish(&mut self, idx: usize) {
        let Some(mut slot) = self.slots[idx].take() else {
            return;
        };
        if let Some(result) = slot.conn.take_result() {
            self.send_result(result);
        } else if !slot.conn.has_completed() {
            self.send_result(FetchResult {
                id: slot.conn.id(),
                outcome: FetchOutcome::Failed,
                last_modified: None,
            });
        }
        slot.conn.close_sink();
    }

    fn send_result(&self, result: FetchResult) {
        tracing::info!(id = result.id, outcome = ?result.outcome, "fetch settled");
        if self.results.send(result).is_err() {
            tracing::debug!("result receiver gone");
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .flatten()
            .map(|s| s.conn.deadline)
            .min()
    }

    /// Fail every connection whose per-step deadline has passed.
    fn expire(&mut self) {
        let now = Instant::now();
        for idx in 0..self.slots.len() {
            let expired = self.slots[idx]
                .as_ref()
                .is_some_and(|s| s.conn.deadline <= now);
            if expired {
                let slot = self.slots[idx].as_ref().unwrap_or_else(|| unreachable!());
                tracing::warn!(url = %slot.conn.url_display(), error = %FetchError::Timeout, "fetch failed");
                self.finish(idx);
            }
        }
    }
}

/// Step the state machine, cascading through `Advance` transitions, until
/// it blocks on readiness or terminates.
fn drive_conn(conn: &mut Connection) -> Result<ConnProgress, FetchError> {
    let mut progress = conn.step()?;
    while progress == ConnProgress::Advance {
        progress = conn.advance()?;
    }
    Ok(progress)
}

/// Point the poller at the slot's current socket with the requested
/// interest, re-registering only on change.
fn register_slot(poll: &mut Poll, idx: usize, slot: &mut Slot, want: Want) -> io::Result<()> {
    let interest = match want {
        Want::Read => Interest::READABLE,
        Want::Write => Interest::WRITABLE,
    };
    let gen = slot.conn.socket_generation();
    let fresh = slot.registered_gen != gen || slot.interest.is_none();
    if !fresh && slot.interest == Some(interest) {
        return Ok(());
    }
    let registry = poll.registry();
    let Some(sock) = slot.conn.socket_mut() else {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "connection wants readiness but has no socket",
        ));
    };
    if fresh {
        registry.register(sock, Token(idx), interest)?;
    } else {
        registry.reregister(sock, Token(idx), interest)?;
    }
    slot.registered_gen = gen;
    slot.interest = Some(interest);
    Ok(())
}
