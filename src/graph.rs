use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use rayon::prelude::*;

use crate::env::Environment;
use crate::error::{BuildError, TaskError};
use crate::hash::{Digest, Hasher, SigHasher};
use crate::node::{NodeId, NodeTree};
use crate::scan::{Scan, ScanContext};
use crate::store::SignatureStore;
use crate::task::{HookContext, State, Status, Task};

/// Handle to a task registered in a [`TaskGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A task together with its scheduling state.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) task: Arc<Task>,
    pub(crate) uid: Digest,
    pub(crate) name: String,
    pub(crate) env: Arc<Environment>,
    pub(crate) generator: usize,
    pub(crate) group: usize,
    pub(crate) run_after: BTreeSet<TaskId>,
    pub(crate) state: State,
    pub(crate) cache_sig: Option<Digest>,
    pub(crate) error: Option<TaskError>,
    pub(crate) duration: Option<Duration>,
    pre_scheduled: bool,
}

/// Borrowed build state needed to sign tasks.
pub(crate) struct SignContext<'a> {
    pub(crate) nodes: &'a NodeTree,
    pub(crate) hasher: &'a Hasher,
    pub(crate) store: &'a mut SignatureStore,
    pub(crate) force: bool,
}

/// Result of the runnable check, with tasks created by a `pre_schedule`
/// hook that the scheduler has to pick up.
#[derive(Debug)]
pub(crate) struct Verdict {
    pub(crate) status: Status,
    pub(crate) spawned: Vec<TaskId>,
}

impl From<Status> for Verdict {
    fn from(status: Status) -> Self {
        Self {
            status,
            spawned: Vec::new(),
        }
    }
}

enum Signed {
    Ready {
        sig: Digest,
        deps: Option<(Vec<Utf8PathBuf>, Vec<String>)>,
    },
    NotReady,
}

/// Marker folded into a signature in place of a vanished dependency.
const MISSING: &[u8] = b"\0missing";

/// Arena of every task known to the build.
///
/// Tasks refer to each other by [`TaskId`]. The graph also indexes which
/// task produces which node, no node may be produced twice.
#[derive(Debug, Default)]
pub struct TaskGraph {
    entries: Vec<Entry>,
    producers: HashMap<NodeId, TaskId>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        (0..self.entries.len()).map(TaskId)
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.entries[id.0].task
    }

    pub fn state(&self, id: TaskId) -> State {
        self.entries[id.0].state
    }

    pub fn name(&self, id: TaskId) -> &str {
        &self.entries[id.0].name
    }

    pub fn uid(&self, id: TaskId) -> Digest {
        self.entries[id.0].uid
    }

    pub fn run_after(&self, id: TaskId) -> &BTreeSet<TaskId> {
        &self.entries[id.0].run_after
    }

    /// Task declaring `node` as output.
    pub fn producer(&self, node: NodeId) -> Option<TaskId> {
        self.producers.get(&node).copied()
    }

    pub(crate) fn entry(&self, id: TaskId) -> &Entry {
        &self.entries[id.0]
    }

    pub(crate) fn entry_mut(&mut self, id: TaskId) -> &mut Entry {
        &mut self.entries[id.0]
    }

    /// Registers a task. Fails when one of its outputs already has a
    /// producer or when it refers to an unknown predecessor.
    pub(crate) fn add(
        &mut self,
        mut task: Task,
        nodes: &NodeTree,
        env: Arc<Environment>,
        generator: usize,
        group: usize,
    ) -> Result<TaskId, BuildError> {
        let id = TaskId(self.entries.len());
        let name = task.display(nodes);

        for &output in &task.outputs {
            if let Some(other) = self.producers.get(&output) {
                return Err(BuildError::Configuration(format!(
                    "'{}' is produced by both '{}' and '{name}'",
                    nodes.abspath(output),
                    self.entries[other.0].name,
                )));
            }
        }

        let run_after: BTreeSet<TaskId> = std::mem::take(&mut task.after).into_iter().collect();
        if let Some(unknown) = run_after.iter().find(|pred| pred.0 >= id.0) {
            return Err(BuildError::Configuration(format!(
                "'{name}' runs after unknown task {}",
                unknown.0
            )));
        }

        for &output in &task.outputs {
            self.producers.insert(output, id);
        }

        self.entries.push(Entry {
            uid: task.uid(nodes),
            env: task.env.clone().unwrap_or(env),
            task: Arc::new(task),
            name,
            generator,
            group,
            run_after,
            state: State::NotRun,
            cache_sig: None,
            error: None,
            duration: None,
            pre_scheduled: false,
        });

        Ok(id)
    }

    /// Declares that `task` may only run after `pred` reached a terminal
    /// state.
    pub(crate) fn set_run_after(&mut self, task: TaskId, pred: TaskId) -> Result<(), BuildError> {
        if task.0 >= self.entries.len() || pred.0 >= self.entries.len() {
            return Err(BuildError::Configuration(format!(
                "unknown task in ordering constraint {} -> {}",
                task.0, pred.0
            )));
        }

        self.entries[task.0].run_after.insert(pred);
        Ok(())
    }

    /// Orders every task in `ids` after the producers of its inputs.
    pub(crate) fn link_producers(&mut self, ids: &[TaskId]) {
        for &id in ids {
            let preds: Vec<TaskId> = self.entries[id.0]
                .task
                .inputs
                .iter()
                .filter_map(|input| self.producers.get(input))
                .filter(|&&pred| pred != id)
                .copied()
                .collect();

            self.entries[id.0].run_after.extend(preds);
        }
    }

    /// Predecessors of `id` that have not reached a terminal state.
    pub(crate) fn pending_after(&self, id: TaskId) -> Vec<TaskId> {
        self.entries[id.0]
            .run_after
            .iter()
            .filter(|pred| !self.entries[pred.0].state.is_terminal())
            .copied()
            .collect()
    }

    /// Strongly connected sets of `ids` with respect to `run_after`, i.e.
    /// the ordering cycles among them.
    pub(crate) fn cycles(&self, ids: &[TaskId]) -> Vec<Vec<TaskId>> {
        let mut graph = DiGraphMap::<usize, ()>::new();
        let members: BTreeSet<usize> = ids.iter().map(|id| id.0).collect();

        for &id in &members {
            graph.add_node(id);
            for pred in &self.entries[id].run_after {
                if members.contains(&pred.0) {
                    graph.add_edge(id, pred.0, ());
                }
            }
        }

        let mut cycles: Vec<Vec<TaskId>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|mut scc| {
                scc.sort_unstable();
                scc.into_iter().map(TaskId).collect()
            })
            .collect();

        cycles.sort();
        cycles
    }

    /// Signature of a produced node, or the content digest of a source.
    fn node_digest(
        &self,
        node: NodeId,
        nodes: &NodeTree,
        hasher: &Hasher,
        store: &SignatureStore,
    ) -> std::io::Result<Digest> {
        let path = nodes.abspath(node);

        if self.producers.contains_key(&node) {
            if let Some(sig) = nodes.sig(node).or_else(|| store.node_sig(&path)) {
                return Ok(sig);
            }
        }

        hasher.file_digest(&path)
    }

    /// Computes the signature of a task: class, command, inputs, variables,
    /// implicit dependencies and predecessor outputs, in this order.
    fn compute_signature(
        &self,
        id: TaskId,
        nodes: &NodeTree,
        hasher: &Hasher,
        store: &SignatureStore,
    ) -> anyhow::Result<Signed> {
        let entry = &self.entries[id.0];
        let task = &entry.task;
        let mut sig = SigHasher::default();

        sig.part(task.class.as_bytes());

        let command = task
            .command_line(nodes, &entry.env)
            .map(|cmd| cmd.to_string())
            .unwrap_or_default();
        sig.part(command.as_bytes());

        let inputs = task
            .inputs
            .par_iter()
            .map(|&node| {
                self.node_digest(node, nodes, hasher, store)
                    .with_context(|| format!("missing input '{}'", nodes.abspath(node)))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        for digest in &inputs {
            sig.digest(digest);
        }

        for var in &task.vars {
            sig.part(var.as_bytes());
            sig.part(entry.env.get_str(var).as_bytes());
        }

        let mut deps = None;
        if let Some(scanner) = &task.scanner {
            let pending = |node: NodeId| {
                self.producers
                    .get(&node)
                    .is_some_and(|p| *p != id && !self.entries[p.0].state.is_terminal())
            };

            let ctx = ScanContext {
                nodes,
                inputs: &task.inputs,
                env: &entry.env,
                pending: &pending,
            };

            let (found, names) = match scanner.scan(&ctx).context("scanner failed")? {
                Scan::NotReady => return Ok(Signed::NotReady),
                Scan::Ready { nodes, names } => (nodes, names),
            };

            let digests: Vec<Option<Digest>> = found
                .par_iter()
                .map(|&node| match self.node_digest(node, nodes, hasher, store) {
                    Ok(digest) => Some(digest),
                    Err(e) => {
                        tracing::warn!(
                            "{}: dependency '{}' is gone ({e})",
                            entry.name,
                            nodes.abspath(node)
                        );
                        None
                    }
                })
                .collect();

            for digest in &digests {
                match digest {
                    Some(digest) => sig.digest(digest),
                    None => sig.part(MISSING),
                };
            }

            for name in &names {
                sig.part(name.as_bytes());
            }

            let paths = found.iter().map(|&node| nodes.abspath(node)).collect();
            deps = Some((paths, names));
        }

        let mut preds: Vec<&Entry> = entry.run_after.iter().map(|p| &self.entries[p.0]).collect();
        preds.sort_by_key(|pred| pred.uid);

        for pred in preds {
            for &output in &pred.task.outputs {
                let path = nodes.abspath(output);
                match nodes.sig(output).or_else(|| store.node_sig(&path)) {
                    Some(digest) => sig.digest(&digest),
                    None => sig.part(MISSING),
                };
            }
        }

        Ok(Signed::Ready {
            sig: sig.finish(),
            deps,
        })
    }

    /// Decides whether a task runs now, later, never, or is up to date.
    pub(crate) fn runnable_status(
        &mut self,
        id: TaskId,
        ctx: &mut SignContext<'_>,
    ) -> anyhow::Result<Verdict> {
        let entry = &self.entries[id.0];

        if !self.pending_after(id).is_empty() {
            return Ok(Status::AskLater.into());
        }

        if entry
            .run_after
            .iter()
            .any(|pred| !self.entries[pred.0].state.is_ok())
        {
            return Ok(Status::CancelMe.into());
        }

        if !entry.pre_scheduled
            && let Some(hook) = entry.task.pre_schedule.clone()
        {
            let task = entry.task.clone();
            let env = entry.env.clone();
            let (generator, group) = (entry.generator, entry.group);
            self.entries[id.0].pre_scheduled = true;

            let created = hook(&HookContext {
                nodes: ctx.nodes,
                task: &task,
                env: &env,
            })?;

            if !created.is_empty() {
                let mut spawned = Vec::with_capacity(created.len());
                for task in created {
                    spawned.push(self.add(task, ctx.nodes, env.clone(), generator, group)?);
                }

                self.link_producers(&spawned);
                self.entries[id.0].run_after.extend(spawned.iter().copied());
                return Ok(Verdict {
                    status: Status::AskLater,
                    spawned,
                });
            }
        }

        let (sig, deps) = match self.compute_signature(id, ctx.nodes, ctx.hasher, ctx.store)? {
            Signed::NotReady => return Ok(Status::AskLater.into()),
            Signed::Ready { sig, deps } => (sig, deps),
        };

        let entry = &mut self.entries[id.0];
        entry.cache_sig = Some(sig);

        if let Some((paths, names)) = deps {
            ctx.store.set_deps(entry.uid, paths, names);
        }

        if ctx.force || entry.task.always_stale {
            return Ok(Status::RunMe.into());
        }

        if ctx.store.task_sig(&entry.uid) != Some(sig) {
            return Ok(Status::RunMe.into());
        }

        for &output in &entry.task.outputs {
            let path = ctx.nodes.abspath(output);
            if !path.exists() || ctx.store.node_sig(&path) != Some(sig) {
                return Ok(Status::RunMe.into());
            }
        }

        Ok(Status::SkipMe.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        nodes: NodeTree,
        root: NodeId,
        hasher: Hasher,
        store: SignatureStore,
        graph: TaskGraph,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
            let nodes = NodeTree::new();
            let root = nodes.node(&path);

            Self {
                _dir: dir,
                nodes,
                root,
                hasher: Hasher::new(false),
                store: SignatureStore::in_memory(),
                graph: TaskGraph::default(),
            }
        }

        fn file(&self, name: &str, text: &str) -> NodeId {
            let node = self.nodes.make_node(self.root, name);
            fs::write(self.nodes.abspath(node), text).unwrap();
            node
        }

        fn add(&mut self, task: Task) -> TaskId {
            let env = Arc::new(Environment::new());
            let id = self.graph.add(task, &self.nodes, env, 0, 0).unwrap();
            self.graph.link_producers(&[id]);
            id
        }

        fn status(&mut self, id: TaskId) -> Status {
            let mut ctx = SignContext {
                nodes: &self.nodes,
                hasher: &self.hasher,
                store: &mut self.store,
                force: false,
            };
            self.graph.runnable_status(id, &mut ctx).unwrap().status
        }

        /// Records a successful run the way the scheduler does.
        fn succeed(&mut self, id: TaskId) {
            let entry = self.graph.entry_mut(id);
            entry.state = State::Success;
            let sig = entry.cache_sig.unwrap();
            self.store.set_task_sig(entry.uid, sig);

            for &output in &entry.task.outputs {
                let path = self.nodes.abspath(output);
                fs::write(&path, "built").unwrap();
                self.nodes.set_sig(output, Some(sig));
                self.store.set_node_sig(path, sig);
            }
        }
    }

    #[test]
    fn test_double_producer_is_rejected() {
        let mut fx = Fixture::new();
        let out = fx.nodes.make_node(fx.root, "a.o");
        fx.add(Task::command("cc", "true").output(out));

        let env = Arc::new(Environment::new());
        let result = fx
            .graph
            .add(Task::command("cxx", "true").output(out), &fx.nodes, env, 0, 0);
        assert!(matches!(result, Err(BuildError::Configuration(_))));
    }

    #[test]
    fn test_inputs_are_ordered_after_producers() {
        let mut fx = Fixture::new();
        let src = fx.file("a.c", "int a;");
        let obj = fx.nodes.make_node(fx.root, "a.o");
        let app = fx.nodes.make_node(fx.root, "app");

        let compile = fx.add(Task::command("cc", "true").input(src).output(obj));
        let link = fx.add(Task::command("link", "true").input(obj).output(app));

        assert_eq!(fx.graph.run_after(link), &BTreeSet::from([compile]));
        assert_eq!(fx.status(link), Status::AskLater);
    }

    #[test]
    fn test_run_then_skip_then_rerun_on_change() {
        let mut fx = Fixture::new();
        let src = fx.file("a.c", "int a;");
        let obj = fx.nodes.make_node(fx.root, "a.o");
        let compile = fx.add(Task::command("cc", "true").input(src).output(obj));

        assert_eq!(fx.status(compile), Status::RunMe);
        fx.succeed(compile);
        assert_eq!(fx.status(compile), Status::SkipMe);

        fx.file("a.c", "int b;");
        assert_eq!(fx.status(compile), Status::RunMe);
    }

    #[test]
    fn test_missing_output_forces_run() {
        let mut fx = Fixture::new();
        let src = fx.file("a.c", "int a;");
        let obj = fx.nodes.make_node(fx.root, "a.o");
        let compile = fx.add(Task::command("cc", "true").input(src).output(obj));

        fx.status(compile);
        fx.succeed(compile);
        fs::remove_file(fx.nodes.abspath(obj)).unwrap();
        assert_eq!(fx.status(compile), Status::RunMe);
    }

    #[test]
    fn test_failed_predecessor_cancels() {
        let mut fx = Fixture::new();
        let first = fx.add(Task::command("a", "false"));
        let second = fx.add(Task::command("b", "true").after(first));

        fx.graph.entry_mut(first).state = State::Crashed;
        assert_eq!(fx.status(second), Status::CancelMe);
    }

    fn signature_with(env: &Environment) -> Option<Digest> {
        let mut fx = Fixture::new();
        let task = Task::function("fn", |_| Ok(0))
            .env(Arc::new(env.clone()))
            .vars(["FLAGS"]);
        let id = fx.add(task);
        fx.status(id);
        fx.graph.entry(id).cache_sig
    }

    #[test]
    fn test_vars_change_signature() {
        let mut env = Environment::new();
        env.set("FLAGS", "-O2").set("OTHER", "x");
        let before = signature_with(&env);

        env.set("OTHER", "y");
        assert_eq!(signature_with(&env), before);

        env.set("FLAGS", "-O3");
        assert_ne!(signature_with(&env), before);
    }

    #[test]
    fn test_scan_not_ready_asks_later() {
        let mut fx = Fixture::new();
        let not_ready = |_: &ScanContext<'_>| -> anyhow::Result<Scan> { Ok(Scan::NotReady) };
        let task = Task::function("scan", |_| Ok(0)).scanner(not_ready);
        let id = fx.add(task);
        assert_eq!(fx.status(id), Status::AskLater);
    }

    #[test]
    fn test_scanned_dependency_changes_signature() {
        let mut fx = Fixture::new();
        let header = fx.file("h1.h", "#define A 1");
        let src = fx.file("a.c", "#include \"h1.h\"");
        let obj = fx.nodes.make_node(fx.root, "a.o");

        let scanner = move |_: &ScanContext<'_>| -> anyhow::Result<Scan> {
            Ok(Scan::Ready {
                nodes: vec![header],
                names: vec![],
            })
        };
        let id = fx.add(Task::command("cc", "true").input(src).output(obj).scanner(scanner));

        assert_eq!(fx.status(id), Status::RunMe);
        fx.succeed(id);
        assert_eq!(fx.status(id), Status::SkipMe);
        assert_eq!(
            fx.store.node_deps(&fx.graph.uid(id)),
            Some(&[fx.nodes.abspath(header)][..])
        );

        fx.file("h1.h", "#define A 2");
        assert_eq!(fx.status(id), Status::RunMe);
        fx.succeed(id);

        fs::remove_file(fx.nodes.abspath(header)).unwrap();
        assert_eq!(fx.status(id), Status::RunMe);
    }

    #[test]
    fn test_pre_schedule_adds_predecessors() {
        let mut fx = Fixture::new();
        let task = Task::function("moc", |_| Ok(0))
            .pre_schedule(|_| Ok(vec![Task::function("generated", |_| Ok(0))]));
        let id = fx.add(task);

        let mut ctx = SignContext {
            nodes: &fx.nodes,
            hasher: &fx.hasher,
            store: &mut fx.store,
            force: false,
        };
        let verdict = fx.graph.runnable_status(id, &mut ctx).unwrap();

        assert_eq!(verdict.status, Status::AskLater);
        assert_eq!(verdict.spawned.len(), 1);
        assert!(fx.graph.run_after(id).contains(&verdict.spawned[0]));

        // the hook runs once
        fx.graph.entry_mut(verdict.spawned[0]).state = State::Success;
        assert_eq!(fx.status(id), Status::RunMe);
    }

    #[test]
    fn test_cycles() {
        let mut fx = Fixture::new();
        let t1 = fx.add(Task::function("t1", |_| Ok(0)));
        let t2 = fx.add(Task::function("t2", |_| Ok(0)));
        let t3 = fx.add(Task::function("t3", |_| Ok(0)));
        let t4 = fx.add(Task::function("t4", |_| Ok(0)));

        fx.graph.set_run_after(t1, t2).unwrap();
        fx.graph.set_run_after(t2, t3).unwrap();
        fx.graph.set_run_after(t3, t1).unwrap();
        fx.graph.set_run_after(t4, t1).unwrap();

        assert_eq!(fx.graph.cycles(&[t1, t2, t3, t4]), vec![vec![t1, t2, t3]]);
    }
}
