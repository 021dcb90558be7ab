//! Signal supervision: bridges OS interrupts into context cancellation.
//!
//! The [`Supervisor`] owns the root cancellation token and a registry of
//! in-flight jobs. Every signal delivery cancels the token and broadcasts
//! `cancel()` to the registered jobs; the first delivery announces a
//! graceful shutdown on stderr, any later one announces a forceful
//! shutdown exactly once. Tests drive the same path by calling
//! [`Supervisor::cancel`] directly, no OS signals involved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::job::Job;

/// Object-safe cancellation surface of a job, so the registry can hold
/// jobs of any concrete type.
pub trait CancelJob: Send + Sync {
    fn cancel(&self);
}

impl<J: Job> CancelJob for J {
    fn cancel(&self) {
        Job::cancel(self);
    }
}

/// Owns signal registration, the cancellation context, and the in-flight
/// job registry. Installed once per run; shared by reference everywhere
/// else.
pub struct Supervisor {
    token: CancellationToken,
    inflight: Mutex<HashMap<u64, Arc<dyn CancelJob>>>,
    next_id: AtomicU64,
    graceful: AtomicBool,
    forceful: AtomicBool,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            graceful: AtomicBool::new(false),
            forceful: AtomicBool::new(false),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled. Monotonic: resolves
    /// immediately if cancellation already happened.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Cancel the context and interrupt every in-flight job. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
        let inflight: Vec<_> = self.inflight.lock().unwrap().values().cloned().collect();
        tracing::debug!(jobs = inflight.len(), "broadcasting cancellation");
        for job in inflight {
            job.cancel();
        }
    }

    /// Track a job for the duration of its run; the returned guard
    /// deregisters on drop.
    pub fn register(&self, job: Arc<dyn CancelJob>) -> InflightGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.inflight.lock().unwrap().insert(id, job);
        InflightGuard {
            supervisor: self,
            id,
        }
    }

    fn on_signal(&self) {
        if !self.graceful.swap(true, Ordering::SeqCst) {
            eprintln!("\nterrallel shutting down gracefully...");
        } else if !self.forceful.swap(true, Ordering::SeqCst) {
            eprintln!("\nterrallel forcefully shutting down...");
        }
        self.cancel();
    }

    /// Install the process signal handler: SIGINT and SIGTERM on unix,
    /// ctrl-c elsewhere. Repeated deliveries are forwarded so operators
    /// can keep hammering interrupt at stubborn children.
    pub fn listen(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut interrupt = match signal(SignalKind::interrupt()) {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                let mut terminate = match signal(SignalKind::terminate()) {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                loop {
                    tokio::select! {
                        _ = interrupt.recv() => {}
                        _ = terminate.recv() => {}
                    }
                    supervisor.on_signal();
                }
            }
            #[cfg(not(unix))]
            {
                loop {
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                    supervisor.on_signal();
                }
            }
        });
    }
}

/// Removes the job from the in-flight registry when dropped.
pub struct InflightGuard<'a> {
    supervisor: &'a Supervisor,
    id: u64,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.supervisor.inflight.lock().unwrap().remove(&self.id);
    }
}
