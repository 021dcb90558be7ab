//! Traversal scheduler: drives a plan under a cancellation context.
//!
//! Forward order runs each node's parallel children, then its own jobs,
//! then the serial successor; reverse order (selected by a `destroy`
//! token in the command) mirrors it. Within a fan-out siblings never
//! cancel one another: every sibling runs to completion and their errors
//! are aggregated in completion order. A node whose phase errored skips
//! its remaining phases, so strictly-dependent future work is never
//! started while peers elsewhere in the tree finish normally.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::{ErrorStack, JobError};
use crate::job::Job;
use crate::plan::Plan;
use crate::signal::{CancelJob, Supervisor};

/// Traversal order. Modelled as data so job code never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    /// Reverse is selected by the literal token `destroy` anywhere in the
    /// external command.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Self {
        if args.iter().any(|arg| arg.as_ref() == "destroy") {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }
}

/// Drive `plan` to completion under the supervisor's cancellation context.
/// The plan is executed at most once; job labels carry the outcome and the
/// returned stack carries every sibling error of the traversal.
pub async fn traverse<J: Job>(
    plan: &Plan<J>,
    supervisor: &Supervisor,
    dryrun: bool,
    direction: Direction,
) -> Result<(), ErrorStack> {
    let run = Run { supervisor, dryrun };
    tracing::debug!(?direction, jobs = plan.job_count(), "starting traversal");
    match direction {
        Direction::Forward => run.forward(plan).await,
        Direction::Reverse => run.reverse(plan).await,
    }
}

struct Run<'a> {
    supervisor: &'a Supervisor,
    dryrun: bool,
}

impl Run<'_> {
    fn forward<'a, J: Job>(&'a self, plan: &'a Plan<J>) -> BoxFuture<'a, Result<(), ErrorStack>> {
        Box::pin(async move {
            fan_out(plan.group.iter().map(|child| self.forward(child))).await?;
            self.jobs(&plan.jobs).await?;
            match &plan.next {
                Some(next) => self.forward(next).await,
                None => Ok(()),
            }
        })
    }

    fn reverse<'a, J: Job>(&'a self, plan: &'a Plan<J>) -> BoxFuture<'a, Result<(), ErrorStack>> {
        Box::pin(async move {
            if let Some(next) = &plan.next {
                self.reverse(next).await?;
            }
            self.jobs(&plan.jobs).await?;
            fan_out(plan.group.iter().map(|child| self.reverse(child))).await
        })
    }

    async fn jobs<J: Job>(&self, jobs: &[Arc<J>]) -> Result<(), ErrorStack> {
        fan_out(
            jobs.iter()
                .map(|job| async move { self.run_job(job).await.map_err(ErrorStack::from) }),
        )
        .await
    }

    /// Run one job, racing it against the cancellation context. A context
    /// cancelled before launch interrupts the job without spawning; one
    /// cancelled mid-flight delivers a single `cancel()` and then keeps
    /// waiting for the child to be reaped.
    async fn run_job<J: Job>(&self, job: &Arc<J>) -> Result<(), JobError> {
        if self.supervisor.is_cancelled() {
            job.cancel();
            return Err(JobError::Interrupted {
                name: job.name().to_string(),
            });
        }
        let _inflight = self.supervisor.register(Arc::clone(job) as Arc<dyn CancelJob>);
        let mut run = job.run(self.dryrun);
        let mut delivered = false;
        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = self.supervisor.cancelled(), if !delivered => {
                    delivered = true;
                    job.cancel();
                }
            }
        }
    }
}

/// Await every future of a concurrent level, aggregating sibling errors in
/// completion order. No sibling is cancelled by another's failure.
async fn fan_out<F>(futures: impl Iterator<Item = F>) -> Result<(), ErrorStack>
where
    F: Future<Output = Result<(), ErrorStack>>,
{
    let mut pending: FuturesUnordered<F> = futures.collect();
    let mut errors = ErrorStack::default();
    while let Some(result) = pending.next().await {
        if let Err(stack) = result {
            errors.absorb(stack);
        }
    }
    errors.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type EventLog = Arc<Mutex<Vec<String>>>;

    /// Scripted in-memory job: sleeps for a fixed duration, then resolves
    /// to its scripted outcome, honouring cancellation like the
    /// subprocess variant.
    struct MockJob {
        name: String,
        delay: Duration,
        fail: bool,
        state: Mutex<JobState>,
        cancelled: AtomicBool,
        log: EventLog,
    }

    impl MockJob {
        fn ok(name: &str, delay_ms: u64, log: &EventLog) -> Arc<Self> {
            Self::scripted(name, delay_ms, false, log)
        }

        fn failing(name: &str, delay_ms: u64, log: &EventLog) -> Arc<Self> {
            Self::scripted(name, delay_ms, true, log)
        }

        fn scripted(name: &str, delay_ms: u64, fail: bool, log: &EventLog) -> Arc<Self> {
            Arc::new(MockJob {
                name: name.to_string(),
                delay: Duration::from_millis(delay_ms),
                fail,
                state: Mutex::new(JobState::NeverRan),
                cancelled: AtomicBool::new(false),
                log: Arc::clone(log),
            })
        }

        fn push(&self, event: &str) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event));
        }
    }

    #[async_trait]
    impl Job for MockJob {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, dryrun: bool) -> Result<(), JobError> {
            if dryrun {
                *self.state.lock().unwrap() = JobState::Success;
                return Ok(());
            }
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(JobError::Interrupted {
                    name: self.name.clone(),
                });
            }
            *self.state.lock().unwrap() = JobState::Running;
            self.push("start");
            tokio::time::sleep(self.delay).await;
            self.push("end");
            if self.cancelled.load(Ordering::SeqCst) {
                *self.state.lock().unwrap() = JobState::Interrupted;
                return Err(JobError::Interrupted {
                    name: self.name.clone(),
                });
            }
            if self.fail {
                *self.state.lock().unwrap() = JobState::Failed;
                Err(JobError::Run {
                    command: self.name.clone(),
                    reason: "exit code 1".to_string(),
                })
            } else {
                *self.state.lock().unwrap() = JobState::Success;
                Ok(())
            }
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
            let mut state = self.state.lock().unwrap();
            if matches!(*state, JobState::NeverRan | JobState::Running) {
                *state = JobState::Interrupted;
            }
        }

        fn state(&self) -> JobState {
            *self.state.lock().unwrap()
        }
    }

    fn leaf(name: &str, jobs: Vec<Arc<MockJob>>) -> Plan<MockJob> {
        Plan {
            name: name.to_string(),
            jobs,
            group: Vec::new(),
            next: None,
        }
    }

    #[test]
    fn destroy_selects_reverse() {
        let forward = vec!["terraform".to_string(), "apply".to_string()];
        let reverse = vec!["terraform".to_string(), "destroy".to_string()];
        assert_eq!(Direction::from_args(&forward), Direction::Forward);
        assert_eq!(Direction::from_args(&reverse), Direction::Reverse);
    }

    #[tokio::test]
    async fn clean_forward_runs_jobs_then_next() {
        let log: EventLog = EventLog::default();
        let j1 = MockJob::ok("j1", 20, &log);
        let j2 = MockJob::ok("j2", 10, &log);
        let j3 = MockJob::ok("j3", 5, &log);
        let mut plan = leaf("root", vec![Arc::clone(&j1), Arc::clone(&j2)]);
        plan.next = Some(Box::new(leaf("next", vec![Arc::clone(&j3)])));

        let supervisor = Supervisor::new();
        traverse(&plan, &supervisor, false, Direction::Forward)
            .await
            .unwrap();

        assert_eq!(j1.state(), JobState::Success);
        assert_eq!(j2.state(), JobState::Success);
        assert_eq!(j3.state(), JobState::Success);
        // strict happens-before between the jobs level and next
        let events = log.lock().unwrap().clone();
        let j3_start = events.iter().position(|e| e == "j3:start").unwrap();
        let j1_end = events.iter().position(|e| e == "j1:end").unwrap();
        let j2_end = events.iter().position(|e| e == "j2:end").unwrap();
        assert!(j3_start > j1_end && j3_start > j2_end, "events: {events:?}");
    }

    #[tokio::test]
    async fn failing_sibling_does_not_cancel_the_others() {
        let log: EventLog = EventLog::default();
        let a = MockJob::ok("a", 30, &log);
        let b = MockJob::ok("b", 20, &log);
        let c = MockJob::failing("c", 10, &log);
        let d = MockJob::ok("d", 40, &log);
        let e = MockJob::ok("e", 30, &log);
        let plan = leaf(
            "root",
            vec![
                Arc::clone(&a),
                Arc::clone(&b),
                Arc::clone(&c),
                Arc::clone(&d),
                Arc::clone(&e),
            ],
        );

        let supervisor = Supervisor::new();
        let err = traverse(&plan, &supervisor, false, Direction::Forward)
            .await
            .unwrap_err();

        assert_eq!(err.len(), 1);
        for job in [&a, &b, &d, &e] {
            assert_eq!(job.state(), JobState::Success);
        }
        assert_eq!(c.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn forward_failure_skips_next() {
        let log: EventLog = EventLog::default();
        let j1 = MockJob::ok("j1", 10, &log);
        let j2 = MockJob::failing("j2", 10, &log);
        let j3 = MockJob::ok("j3", 5, &log);
        let mut plan = leaf("root", vec![Arc::clone(&j1), Arc::clone(&j2)]);
        plan.next = Some(Box::new(leaf("next", vec![Arc::clone(&j3)])));

        let supervisor = Supervisor::new();
        let err = traverse(&plan, &supervisor, false, Direction::Forward)
            .await
            .unwrap_err();

        assert_eq!(j1.state(), JobState::Success);
        assert_eq!(j2.state(), JobState::Failed);
        assert_eq!(j3.state(), JobState::NeverRan);
        assert!(!err.interrupted_only());
    }

    #[tokio::test]
    async fn reverse_runs_next_first_and_failure_skips_the_rest() {
        let log: EventLog = EventLog::default();
        let j1 = MockJob::ok("j1", 10, &log);
        let j2 = MockJob::ok("j2", 10, &log);
        let j3 = MockJob::failing("j3", 5, &log);
        let mut plan = leaf("root", vec![Arc::clone(&j1), Arc::clone(&j2)]);
        plan.next = Some(Box::new(leaf("next", vec![Arc::clone(&j3)])));

        let supervisor = Supervisor::new();
        traverse(&plan, &supervisor, false, Direction::Reverse)
            .await
            .unwrap_err();

        assert_eq!(j3.state(), JobState::Failed);
        assert_eq!(j1.state(), JobState::NeverRan);
        assert_eq!(j2.state(), JobState::NeverRan);
        let events = log.lock().unwrap().clone();
        assert_eq!(events, vec!["j3:start", "j3:end"]);
    }

    #[tokio::test]
    async fn reverse_clean_run_reaches_group_after_jobs() {
        let log: EventLog = EventLog::default();
        let inner = MockJob::ok("inner", 5, &log);
        let own = MockJob::ok("own", 5, &log);
        let tail = MockJob::ok("tail", 5, &log);
        let mut plan = leaf("root", vec![Arc::clone(&own)]);
        plan.group = vec![leaf("child", vec![Arc::clone(&inner)])];
        plan.next = Some(Box::new(leaf("next", vec![Arc::clone(&tail)])));

        let supervisor = Supervisor::new();
        traverse(&plan, &supervisor, false, Direction::Reverse)
            .await
            .unwrap();

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "tail:start",
                "tail:end",
                "own:start",
                "own:end",
                "inner:start",
                "inner:end"
            ]
        );
    }

    #[tokio::test]
    async fn group_failure_is_isolated_from_sibling_groups() {
        let log: EventLog = EventLog::default();
        let f = MockJob::failing("f", 10, &log);
        let s = MockJob::ok("s", 5, &log);
        let o = MockJob::ok("o", 10, &log);
        let t = MockJob::ok("t", 5, &log);
        let l = MockJob::ok("l", 5, &log);

        let mut g1 = leaf("g1", vec![Arc::clone(&f)]);
        g1.next = Some(Box::new(leaf("next", vec![Arc::clone(&s)])));
        let mut g2 = leaf("g2", vec![Arc::clone(&o)]);
        g2.next = Some(Box::new(leaf("next", vec![Arc::clone(&t)])));
        let mut plan = leaf("root", Vec::new());
        plan.group = vec![g1, g2];
        plan.next = Some(Box::new(leaf("next", vec![Arc::clone(&l)])));

        let supervisor = Supervisor::new();
        let err = traverse(&plan, &supervisor, false, Direction::Forward)
            .await
            .unwrap_err();

        assert_eq!(f.state(), JobState::Failed);
        assert_eq!(s.state(), JobState::NeverRan);
        assert_eq!(o.state(), JobState::Success);
        assert_eq!(t.state(), JobState::Success);
        assert_eq!(l.state(), JobState::NeverRan);
        assert_eq!(err.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_and_skips_later_work() {
        let log: EventLog = EventLog::default();
        let short1 = MockJob::ok("short1", 30, &log);
        let long1 = MockJob::ok("long1", 400, &log);
        let tail1 = MockJob::ok("tail1", 5, &log);
        let short2 = MockJob::ok("short2", 30, &log);
        let long2 = MockJob::ok("long2", 400, &log);
        let tail2 = MockJob::ok("tail2", 5, &log);

        let subtree =
            |name: &str, short: &Arc<MockJob>, long: &Arc<MockJob>, tail: &Arc<MockJob>| {
                let mut inner_next = leaf("next", vec![Arc::clone(long)]);
                inner_next.next = Some(Box::new(leaf("next", vec![Arc::clone(tail)])));
                let mut node = leaf(name, vec![Arc::clone(short)]);
                node.next = Some(Box::new(inner_next));
                node
            };
        let mut plan = leaf("root", Vec::new());
        plan.group = vec![
            subtree("one", &short1, &long1, &tail1),
            subtree("two", &short2, &long2, &tail2),
        ];

        let supervisor = Supervisor::new();
        {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                supervisor.cancel();
            });
        }
        let err = traverse(&plan, &supervisor, false, Direction::Forward)
            .await
            .unwrap_err();

        assert_eq!(short1.state(), JobState::Success);
        assert_eq!(short2.state(), JobState::Success);
        assert_eq!(long1.state(), JobState::Interrupted);
        assert_eq!(long2.state(), JobState::Interrupted);
        assert_eq!(tail1.state(), JobState::NeverRan);
        assert_eq!(tail2.state(), JobState::NeverRan);
        assert!(err.interrupted_only());
    }

    #[tokio::test]
    async fn cancelled_context_interrupts_jobs_before_launch() {
        let log: EventLog = EventLog::default();
        let j1 = MockJob::ok("j1", 10, &log);
        let j2 = MockJob::ok("j2", 10, &log);
        let mut plan = leaf("root", vec![Arc::clone(&j1)]);
        plan.next = Some(Box::new(leaf("next", vec![Arc::clone(&j2)])));

        let supervisor = Supervisor::new();
        supervisor.cancel();
        let err = traverse(&plan, &supervisor, false, Direction::Forward)
            .await
            .unwrap_err();

        assert_eq!(j1.state(), JobState::Interrupted);
        assert_eq!(j2.state(), JobState::NeverRan);
        assert!(err.interrupted_only());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn aggregate_keeps_failed_and_interrupted_identities() {
        let log: EventLog = EventLog::default();
        let quick_fail = MockJob::failing("quick", 10, &log);
        let long = MockJob::ok("long", 300, &log);
        let plan = leaf("root", vec![Arc::clone(&quick_fail), Arc::clone(&long)]);

        let supervisor = Supervisor::new();
        {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                supervisor.cancel();
            });
        }
        let err = traverse(&plan, &supervisor, false, Direction::Forward)
            .await
            .unwrap_err();

        assert_eq!(err.len(), 2);
        assert_eq!(err.iter().filter(|e| e.is_interrupted()).count(), 1);
        assert_eq!(quick_fail.state(), JobState::Failed);
        assert_eq!(long.state(), JobState::Interrupted);
    }

    #[tokio::test]
    async fn dry_run_resolves_everything_successfully() {
        let log: EventLog = EventLog::default();
        let would_fail = MockJob::failing("would-fail", 10, &log);
        let after = MockJob::ok("after", 10, &log);
        let mut plan = leaf("root", vec![Arc::clone(&would_fail)]);
        plan.next = Some(Box::new(leaf("next", vec![Arc::clone(&after)])));

        let supervisor = Supervisor::new();
        traverse(&plan, &supervisor, true, Direction::Forward)
            .await
            .unwrap();

        assert_eq!(would_fail.state(), JobState::Success);
        assert_eq!(after.state(), JobState::Success);
    }
}
