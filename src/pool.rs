use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use indicatif::ProgressStyle;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::env::Environment;
use crate::error::TaskError;
use crate::exec::Exec;
use crate::graph::TaskId;
use crate::hash::{Digest, Hasher};
use crate::node::NodeTree;
use crate::task::{HookContext, RunContext, State, Task};

/// Everything a worker needs to run one task, detached from the graph.
pub(crate) struct Job {
    pub(crate) id: TaskId,
    pub(crate) task: Arc<Task>,
    pub(crate) env: Arc<Environment>,
    pub(crate) name: String,
    pub(crate) sig: Digest,
    pub(crate) cwd: Utf8PathBuf,
    pub(crate) timeout: Option<Duration>,
}

/// A finished job on its way back to the scheduler.
pub(crate) struct Outcome {
    pub(crate) id: TaskId,
    pub(crate) state: State,
    pub(crate) error: Option<TaskError>,
    pub(crate) more_tasks: Vec<Task>,
    pub(crate) duration: Duration,
}

impl Outcome {
    pub(crate) fn failed(id: TaskId, message: impl Into<String>) -> Self {
        Self {
            id,
            state: State::Exception,
            error: Some(TaskError::Exception(message.into())),
            more_tasks: Vec::new(),
            duration: Duration::ZERO,
        }
    }
}

/// Shared, thread-safe part of the build context used by workers.
#[derive(Clone)]
pub(crate) struct Worker {
    pub(crate) nodes: Arc<NodeTree>,
    pub(crate) hasher: Arc<Hasher>,
    pub(crate) exec: Arc<dyn Exec>,
}

impl Worker {
    /// Runs a task in the current thread, inside its own progress span.
    pub(crate) fn run(&self, job: Job, slot: usize, parent: &Span) -> Outcome {
        let span = tracing::span!(parent: parent, Level::INFO, "task", name = job.name.as_str());
        span.pb_set_style(&style_task());
        span.pb_set_message(&format!("Running {}", job.name));
        let _enter = span.enter();

        self.process(&job, slot)
    }

    /// Worker entry point: runs the action and turns its result into a
    /// terminal state. On success, the outputs take the task signature.
    pub(crate) fn process(&self, job: &Job, slot: usize) -> Outcome {
        let start = Instant::now();

        let mut ctx = RunContext {
            nodes: &self.nodes,
            env: &job.env,
            inputs: &job.task.inputs,
            outputs: &job.task.outputs,
            exec: self.exec.as_ref(),
            slot,
            cwd: &job.cwd,
            timeout: job.timeout,
            more_tasks: Vec::new(),
            stderr: String::new(),
            timed_out: false,
        };

        // The task only sees shared immutable state and its own context, a
        // panic cannot leave anything half-updated for other workers.
        let result = catch_unwind(AssertUnwindSafe(|| job.task.run(&mut ctx)));

        let (mut state, mut error) = match result {
            Ok(Ok(_)) if ctx.timed_out => (
                State::Crashed,
                Some(TaskError::Timeout(job.timeout.unwrap_or_default())),
            ),
            Ok(Ok(0)) => match self.missing_output(job) {
                Some(path) => (State::Exception, Some(TaskError::MissingOutput(path))),
                None => (State::Success, None),
            },
            Ok(Ok(code)) => (
                State::Crashed,
                Some(TaskError::Command {
                    code,
                    stderr: std::mem::take(&mut ctx.stderr),
                }),
            ),
            Ok(Err(e)) => (State::Exception, Some(TaskError::Exception(format!("{e:#}")))),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };

                (State::Exception, Some(TaskError::Exception(msg)))
            }
        };

        let mut more_tasks = ctx.more_tasks;

        if state == State::Success
            && let Some(hook) = &job.task.follow_up
        {
            let hook_ctx = HookContext {
                nodes: &self.nodes,
                task: &job.task,
                env: &job.env,
            };

            match hook(&hook_ctx) {
                Ok(tasks) => more_tasks.extend(tasks),
                Err(e) => {
                    state = State::Exception;
                    error = Some(TaskError::Exception(format!("{e:#}")));
                }
            }
        }

        if state == State::Success {
            for &output in &job.task.outputs {
                self.hasher.forget(&self.nodes.abspath(output));
                self.nodes.set_sig(output, Some(job.sig));
            }
        }

        Outcome {
            id: job.id,
            state,
            error,
            more_tasks,
            duration: start.elapsed(),
        }
    }

    fn missing_output(&self, job: &Job) -> Option<Utf8PathBuf> {
        if job.task.no_errcheck_out {
            return None;
        }

        job.task
            .outputs
            .iter()
            .map(|&output| self.nodes.abspath(output))
            .find(|path| !path.exists())
    }
}

pub(crate) fn style_task() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Dispatcher thread of the worker pool.
///
/// The spawner takes jobs from the bounded `ready` queue, waits for one of
/// `numjobs` slots to be free and runs the job on a short-lived consumer
/// thread. The slot index travels with the job so that execution back-ends
/// can keep one resource per slot. Finished jobs are published on `out`.
pub(crate) struct Spawner {
    ready: Option<Sender<Job>>,
    out: Receiver<Outcome>,
    handle: Option<JoinHandle<()>>,
}

impl Spawner {
    pub(crate) fn start(numjobs: usize, worker: Worker, parent: Span) -> std::io::Result<Self> {
        let numjobs = numjobs.max(1);
        let (ready, jobs) = bounded::<Job>(numjobs);
        let (done, out) = unbounded::<Outcome>();

        let handle = thread::Builder::new()
            .name("spawner".into())
            .spawn(move || {
                let (release, slots) = bounded::<usize>(numjobs);
                for slot in 0..numjobs {
                    let _ = release.send(slot);
                }

                for job in jobs.iter() {
                    let Ok(slot) = slots.recv() else { break };
                    let id = job.id;

                    let worker = worker.clone();
                    let parent = parent.clone();
                    let done_c = done.clone();
                    let release_c = release.clone();

                    let spawned = thread::Builder::new()
                        .name(format!("consumer-{slot}"))
                        .spawn(move || {
                            let outcome = worker.run(job, slot, &parent);
                            let _ = done_c.send(outcome);
                            let _ = release_c.send(slot);
                        });

                    if let Err(e) = spawned {
                        tracing::error!("couldn't start a worker thread: {e}");
                        let _ = done.send(Outcome::failed(id, format!("no worker thread: {e}")));
                        let _ = release.send(slot);
                    }
                }
            })?;

        Ok(Self {
            ready: Some(ready),
            out,
            handle: Some(handle),
        })
    }

    /// Queues a job, blocking while `ready` is full. Gives the job back as
    /// a failed outcome if the pool is gone.
    pub(crate) fn dispatch(&self, job: Job) -> Option<Outcome> {
        let sender = self.ready.as_ref()?;

        match sender.send(job) {
            Ok(()) => None,
            Err(e) => Some(Outcome::failed(e.0.id, "the worker pool has stopped")),
        }
    }

    /// Waits for the next finished job.
    pub(crate) fn recv(&self) -> Option<Outcome> {
        self.out.recv().ok()
    }

    pub(crate) fn shutdown(mut self) {
        drop(self.ready.take());

        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("the spawner thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Inline;
    use crate::graph::TaskGraph;
    use std::collections::HashSet;
    use std::fs;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: Utf8PathBuf,
        worker: Worker,
        graph: TaskGraph,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

            Self {
                _dir: dir,
                root,
                worker: Worker {
                    nodes: Arc::new(NodeTree::new()),
                    hasher: Arc::new(Hasher::new(false)),
                    exec: Arc::new(Inline),
                },
                graph: TaskGraph::default(),
            }
        }

        fn job(&mut self, task: Task) -> Job {
            let env = Arc::new(Environment::new());
            let id = self
                .graph
                .add(task, &self.worker.nodes, env.clone(), 0, 0)
                .unwrap();

            Job {
                id,
                task: Arc::new(self.graph.task(id).clone()),
                env,
                name: self.graph.name(id).to_string(),
                sig: Digest::of("sig"),
                cwd: self.root.clone(),
                timeout: None,
            }
        }
    }

    #[test]
    fn test_success_sets_output_signatures() {
        let mut fx = Fixture::new();
        let out = fx.worker.nodes.node(fx.root.join("out.txt"));

        let job = fx.job(
            Task::function("write", |ctx| {
                fs::write(ctx.output_path(0).unwrap(), "data")?;
                Ok(0)
            })
            .output(out),
        );

        let outcome = fx.worker.process(&job, 0);
        assert_eq!(outcome.state, State::Success);
        assert_eq!(fx.worker.nodes.sig(out), Some(job.sig));
    }

    #[test]
    fn test_missing_output_is_an_exception() {
        let mut fx = Fixture::new();
        let out = fx.worker.nodes.node(fx.root.join("never.txt"));

        let job = fx.job(Task::function("lazy", |_| Ok(0)).output(out));
        let outcome = fx.worker.process(&job, 0);
        assert_eq!(outcome.state, State::Exception);
        assert!(matches!(outcome.error, Some(TaskError::MissingOutput(_))));

        let out = fx.worker.nodes.node(fx.root.join("optional.txt"));
        let job = fx.job(Task::function("lazy", |_| Ok(0)).output(out).no_errcheck_out());
        assert_eq!(fx.worker.process(&job, 0).state, State::Success);
    }

    #[test]
    fn test_failures_and_panics() {
        let mut fx = Fixture::new();

        let job = fx.job(Task::function("exit", |_| Ok(2)));
        let outcome = fx.worker.process(&job, 0);
        assert_eq!(outcome.state, State::Crashed);
        assert!(matches!(outcome.error, Some(TaskError::Command { code: 2, .. })));

        let job = fx.job(Task::function("error", |_| anyhow::bail!("boom")));
        let outcome = fx.worker.process(&job, 0);
        assert_eq!(outcome.state, State::Exception);
        assert_eq!(outcome.error, Some(TaskError::Exception("boom".into())));

        let job = fx.job(Task::function("panic", |_| panic!("oops")));
        let outcome = fx.worker.process(&job, 0);
        assert_eq!(outcome.state, State::Exception);
        assert_eq!(
            outcome.error,
            Some(TaskError::Exception("Task panicked: oops".into()))
        );
    }

    #[test]
    fn test_wrapped_action_runs_after_inner() {
        let mut fx = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let (first, second) = (log.clone(), log.clone());
        let task = Task::function("inner", move |_| {
            first.lock().unwrap().push("inner");
            Ok(0)
        })
        .wrap(move |_| {
            second.lock().unwrap().push("then");
            Ok(0)
        });

        let job = fx.job(task);
        assert_eq!(fx.worker.process(&job, 0).state, State::Success);
        assert_eq!(*log.lock().unwrap(), vec!["inner", "then"]);
    }

    #[test]
    fn test_follow_up_runs_after_success() {
        let mut fx = Fixture::new();
        let out = fx.worker.nodes.node(fx.root.join("list.txt"));

        let job = fx.job(
            Task::function("list", |ctx| {
                fs::write(ctx.output_path(0).unwrap(), "a b")?;
                Ok(0)
            })
            .output(out)
            .follow_up(|ctx| {
                let text = fs::read_to_string(ctx.output_path(0).unwrap())?;
                Ok(text.split(' ').map(|_| Task::function("item", |_| Ok(0))).collect())
            }),
        );

        let outcome = fx.worker.process(&job, 0);
        assert_eq!(outcome.state, State::Success);
        assert_eq!(outcome.more_tasks.len(), 2);

        let job = fx.job(
            Task::function("broken", |_| Ok(0)).follow_up(|_| anyhow::bail!("no list")),
        );
        let outcome = fx.worker.process(&job, 0);
        assert_eq!(outcome.state, State::Exception);
        assert_eq!(outcome.error, Some(TaskError::Exception("no list".into())));
        assert!(outcome.more_tasks.is_empty());

        let job = fx.job(
            Task::function("failing", |_| Ok(1)).follow_up(|_| anyhow::bail!("unreachable")),
        );
        assert_eq!(fx.worker.process(&job, 0).state, State::Crashed);
    }

    #[test]
    fn test_spawner_bounds_concurrency() {
        let mut fx = Fixture::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let spawner = Spawner::start(2, fx.worker.clone(), Span::none()).unwrap();
        let mut ids = HashSet::new();

        for _ in 0..6 {
            let (running, peak) = (running.clone(), peak.clone());
            let job = fx.job(Task::function("sleep", move |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(0)
            }));
            ids.insert(job.id);
            assert!(spawner.dispatch(job).is_none());
        }

        for _ in 0..6 {
            let outcome = spawner.recv().unwrap();
            assert_eq!(outcome.state, State::Success);
            assert!(ids.remove(&outcome.id));
        }

        spawner.shutdown();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
