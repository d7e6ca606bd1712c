use std::collections::VecDeque;
use std::sync::Arc;

use indicatif::ProgressStyle;
use rand::Rng;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::build::{BuildContext, KeepGoing};
use crate::error::{BuildError, DeadlockError, FrozenTask, TaskError};
use crate::graph::{SignContext, TaskId};
use crate::pool::{Job, Outcome, Spawner, Worker};
use crate::task::{HookContext, State, Status, Task};

/// Tasks in flight per job before the scheduler waits for results.
pub(crate) const GAP: usize = 10;

/// The scheduler. Runs on the calling thread and owns every mutation of the
/// task graph and the signature store; workers only report back outcomes.
///
/// Tasks are taken from `outstanding`, checked with `runnable_status` and
/// either dispatched, skipped, cancelled or parked in `frozen` until some
/// other task made progress. A group is posted only when the previous one
/// has been fully processed.
pub(crate) struct Parallel<'a> {
    bld: &'a mut BuildContext,
    numjobs: usize,
    keep_going: KeepGoing,
    outstanding: VecDeque<TaskId>,
    frozen: VecDeque<TaskId>,
    /// Tasks dispatched and not collected yet.
    count: usize,
    processed: usize,
    total: usize,
    stop: bool,
    error: Vec<TaskId>,
    /// Value of `processed` when `frozen` was last promoted.
    deadlock: Option<usize>,
    pool: Option<Spawner>,
    /// Outcomes that did not come through the pool: inline runs when
    /// `numjobs` is 1 and jobs the pool refused.
    done: VecDeque<Outcome>,
    worker: Worker,
    span: Span,
}

impl<'a> Parallel<'a> {
    pub(crate) fn new(bld: &'a mut BuildContext) -> Self {
        let worker = Worker {
            nodes: bld.nodes.clone(),
            hasher: bld.hasher.clone(),
            exec: bld.exec.clone(),
        };

        Self {
            numjobs: bld.options.jobs.max(1),
            keep_going: bld.options.keep_going,
            total: bld.total(),
            bld,
            outstanding: VecDeque::new(),
            frozen: VecDeque::new(),
            count: 0,
            processed: 1,
            stop: false,
            error: Vec::new(),
            deadlock: None,
            pool: None,
            done: VecDeque::new(),
            worker,
            span: tracing::span!(Level::INFO, "building_tasks"),
        }
    }

    /// Runs every group to completion. Returns the failures to surface.
    pub(crate) fn start(mut self) -> Result<Vec<TaskId>, BuildError> {
        let span = self.span.clone();
        span.pb_set_style(&style_root());
        span.pb_set_length(self.total as u64);
        span.pb_set_message("Building tasks...");
        let _enter = span.enter();

        if self.numjobs > 1 {
            let pool = Spawner::start(self.numjobs, self.worker.clone(), span.clone())?;
            self.pool = Some(pool);
        }

        let result = self.run();

        // in-flight tasks always finish, their signatures must be recorded
        while self.count > 0 && self.get_out() {}

        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }

        result?;

        if self.stop {
            let left: Vec<TaskId> = self.outstanding.drain(..).chain(self.frozen.drain(..)).collect();
            for id in left {
                if !self.bld.graph.state(id).is_terminal() {
                    self.cancel(id);
                }
            }
        }

        Ok(self.error)
    }

    fn run(&mut self) -> Result<(), BuildError> {
        while !self.stop {
            self.refill_task_list()?;

            let Some(id) = self.outstanding.pop_front() else {
                if self.count > 0 {
                    continue;
                }
                break;
            };

            if self.bld.graph.state(id).is_terminal() {
                self.processed += 1;
                continue;
            }

            if self.stop {
                self.outstanding.push_front(id);
                break;
            }

            let Some(status) = self.task_status(id) else {
                continue;
            };

            match status {
                Status::RunMe => {
                    self.count += 1;
                    self.processed += 1;
                    self.dispatch(id);
                }
                Status::AskLater => self.postpone(id),
                Status::SkipMe => {
                    self.processed += 1;
                    self.skip(id);
                }
                Status::CancelMe => {
                    self.processed += 1;
                    self.cancel(id);
                }
            }
        }

        Ok(())
    }

    /// Makes sure `outstanding` has something to look at: collects results
    /// while too much is in flight, replays frozen tasks, detects deadlocks
    /// and posts the next group once the current one is done.
    fn refill_task_list(&mut self) -> Result<(), BuildError> {
        while self.count > self.numjobs * GAP {
            if !self.get_out() {
                return Err(pool_stopped());
            }
        }

        while self.outstanding.is_empty() && !self.stop {
            if self.count > 0 {
                if !self.get_out() {
                    return Err(pool_stopped());
                }

                if self.outstanding.is_empty() && !self.frozen.is_empty() {
                    self.outstanding.extend(self.frozen.drain(..));
                }
            } else if !self.frozen.is_empty() {
                if self.deadlock == Some(self.processed) {
                    return Err(self.deadlock_error().into());
                }

                self.deadlock = Some(self.processed);
                self.outstanding.extend(self.frozen.drain(..));
            } else {
                match self.bld.next_group()? {
                    Some(ids) => {
                        self.outstanding.extend(ids);
                        self.update_total();
                    }
                    None => break,
                }
            }
        }

        Ok(())
    }

    fn task_status(&mut self, id: TaskId) -> Option<Status> {
        let bld = &mut *self.bld;
        let mut ctx = SignContext {
            nodes: &bld.nodes,
            hasher: &bld.hasher,
            store: &mut bld.store,
            force: bld.options.force,
        };

        match bld.graph.runnable_status(id, &mut ctx) {
            Ok(verdict) => {
                if !verdict.spawned.is_empty() {
                    self.outstanding.extend(verdict.spawned);
                    self.update_total();
                }
                Some(verdict.status)
            }
            Err(e) => {
                self.processed += 1;

                let entry = self.bld.graph.entry_mut(id);
                tracing::error!("{}: {e:#}", entry.name);
                entry.state = State::Exception;
                entry.error = Some(TaskError::Exception(format!("{e:#}")));

                self.error_handler(id);
                self.span.pb_inc(1);
                None
            }
        }
    }

    /// Parks a task that cannot run yet at either end of `frozen`, so that
    /// no fixed order can starve it.
    fn postpone(&mut self, id: TaskId) {
        if rand::thread_rng().gen_bool(0.5) {
            self.frozen.push_front(id);
        } else {
            self.frozen.push_back(id);
        }
    }

    fn dispatch(&mut self, id: TaskId) {
        let entry = self.bld.graph.entry(id);

        let Some(sig) = entry.cache_sig else {
            self.done
                .push_back(Outcome::failed(id, "task dispatched without a signature"));
            return;
        };

        let job = Job {
            id,
            task: entry.task.clone(),
            env: entry.env.clone(),
            name: entry.name.clone(),
            sig,
            cwd: entry
                .task
                .cwd
                .clone()
                .unwrap_or_else(|| self.bld.nodes.abspath(self.bld.bldnode())),
            timeout: entry.task.timeout.or(self.bld.options.timeout),
        };

        tracing::debug!("dispatching {}", job.name);

        match &self.pool {
            Some(pool) => {
                if let Some(outcome) = pool.dispatch(job) {
                    self.done.push_back(outcome);
                }
            }
            None => {
                let outcome = self.worker.run(job, 0, &self.span);
                self.done.push_back(outcome);
                self.get_out();
            }
        }
    }

    fn skip(&mut self, id: TaskId) {
        let entry = self.bld.graph.entry_mut(id);
        entry.state = State::Skipped;

        if let Some(sig) = entry.cache_sig {
            for &output in &entry.task.outputs {
                self.bld.nodes.set_sig(output, Some(sig));
            }
        }

        tracing::debug!("up to date: {}", entry.name);
        self.span.pb_inc(1);

        // up-to-date outputs still yield the tasks that consume them
        let Some(hook) = entry.task.follow_up.clone() else {
            return;
        };

        let (task, env) = (entry.task.clone(), entry.env.clone());
        let created = hook(&HookContext {
            nodes: &self.bld.nodes,
            task: &task,
            env: &env,
        });

        match created {
            Ok(tasks) if tasks.is_empty() => (),
            Ok(tasks) => self.add_more_tasks(id, tasks),
            Err(e) => {
                let entry = self.bld.graph.entry_mut(id);
                tracing::error!("{}: {e:#}", entry.name);
                entry.state = State::Exception;
                entry.error = Some(TaskError::Exception(format!("{e:#}")));
                self.error_handler(id);
            }
        }
    }

    fn cancel(&mut self, id: TaskId) {
        let entry = self.bld.graph.entry_mut(id);
        entry.state = State::Cancelled;
        entry.error = Some(TaskError::Cancelled);
        tracing::debug!("cancelled: {}", entry.name);

        if self.keep_going == KeepGoing::Verbose {
            self.error.push(id);
        }

        self.span.pb_inc(1);
    }

    /// Collects one finished task. Returns `false` if nothing can arrive
    /// anymore.
    fn get_out(&mut self) -> bool {
        let outcome = match self.done.pop_front() {
            Some(outcome) => outcome,
            None => match self.pool.as_ref().and_then(Spawner::recv) {
                Some(outcome) => outcome,
                None => return false,
            },
        };

        self.count = self.count.saturating_sub(1);
        self.absorb(outcome);
        true
    }

    fn absorb(&mut self, outcome: Outcome) {
        let id = outcome.id;
        let bld = &mut *self.bld;

        let entry = bld.graph.entry_mut(id);
        entry.state = outcome.state;
        entry.error = outcome.error;
        entry.duration = Some(outcome.duration);

        if outcome.state == State::Success {
            if let Some(sig) = entry.cache_sig {
                bld.store.set_task_sig(entry.uid, sig);

                for &output in &entry.task.outputs {
                    bld.store.set_node_sig(bld.nodes.abspath(output), sig);
                }
            }
        } else if let Some(error) = &entry.error {
            tracing::error!("{}: {error}", entry.name);
            self.error_handler(id);
        }

        if !outcome.more_tasks.is_empty() {
            self.add_more_tasks(id, outcome.more_tasks);
        }

        self.span.pb_inc(1);
    }

    /// Registers the tasks a task created while running.
    fn add_more_tasks(&mut self, parent: TaskId, tasks: Vec<Task>) {
        let bld = &mut *self.bld;
        let entry = bld.graph.entry(parent);
        let env = Arc::clone(&entry.env);
        let (generator, group) = (entry.generator, entry.group);

        let mut added = Vec::with_capacity(tasks.len());
        for task in tasks {
            match bld.graph.add(task, &bld.nodes, env.clone(), generator, group) {
                Ok(id) => added.push(id),
                Err(e) => {
                    let entry = bld.graph.entry_mut(parent);
                    tracing::error!("{}: {e}", entry.name);
                    entry.state = State::Exception;
                    entry.error = Some(TaskError::Exception(e.to_string()));
                    self.error_handler(parent);
                    break;
                }
            }
        }

        self.bld.graph.link_producers(&added);
        self.outstanding.extend(added);
        self.update_total();
    }

    fn error_handler(&mut self, id: TaskId) {
        let uid = self.bld.graph.uid(id);
        self.bld.store.invalidate(&uid);

        match self.keep_going {
            KeepGoing::Off => {
                self.stop = true;
                if self.error.is_empty() {
                    self.error.push(id);
                }
            }
            KeepGoing::On | KeepGoing::Verbose => {
                if !self.error.contains(&id) {
                    self.error.push(id);
                }
            }
        }
    }

    fn update_total(&mut self) {
        self.total = self.bld.total();
        self.span.pb_set_length(self.total as u64);
    }

    fn deadlock_error(&self) -> DeadlockError {
        let graph = &self.bld.graph;
        let ids: Vec<TaskId> = self.frozen.iter().copied().collect();
        let describe = |id: TaskId| format!("{} ({})", graph.name(id), graph.uid(id).to_hex());

        let frozen: Vec<FrozenTask> = ids
            .iter()
            .map(|&id| FrozenTask {
                uid: graph.uid(id).to_hex(),
                name: graph.name(id).to_string(),
                run_after: graph.pending_after(id).into_iter().map(describe).collect(),
            })
            .collect();

        let hint = if frozen.iter().any(|task| task.run_after.is_empty()) {
            "check the methods runnable_status"
        } else {
            "check the build order for the tasks"
        };

        let cycles = graph
            .cycles(&ids)
            .into_iter()
            .map(|cycle| cycle.into_iter().map(|id| graph.name(id).to_string()).collect())
            .collect();

        DeadlockError {
            hint,
            frozen,
            cycles,
        }
    }
}

fn pool_stopped() -> BuildError {
    BuildError::Io(std::io::Error::other("the worker pool stopped unexpectedly"))
}

fn style_root() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}
