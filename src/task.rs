use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::env::{Environment, Value};
use crate::exec::{Cmd, Exec, Request};
use crate::graph::TaskId;
use crate::hash::{Digest, SigHasher};
use crate::node::{NodeId, NodeTree};
use crate::scan::Scanner;

/// Lifecycle state of a task, `hasrun` in build parlance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    NotRun,
    Skipped,
    Success,
    Crashed,
    Exception,
    Cancelled,
}

impl State {
    pub fn is_terminal(self) -> bool {
        self != State::NotRun
    }

    /// The task ran and did not succeed.
    pub fn is_failure(self) -> bool {
        matches!(self, State::Crashed | State::Exception)
    }

    /// The outputs of the task can be relied upon.
    pub fn is_ok(self) -> bool {
        matches!(self, State::Success | State::Skipped)
    }
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            State::NotRun => "NOT_RUN",
            State::Skipped => "SKIPPED",
            State::Success => "SUCCESS",
            State::Crashed => "CRASHED",
            State::Exception => "EXCEPTION",
            State::Cancelled => "CANCELLED",
        })
    }
}

/// Verdict of the runnable check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    RunMe,
    SkipMe,
    AskLater,
    CancelMe,
}

/// In-process task body. Returns the exit code, non-zero means crashed.
pub type TaskFn = Arc<dyn Fn(&mut RunContext<'_>) -> anyhow::Result<i32> + Send + Sync>;

/// Hook creating tasks from the definition of an existing one, see
/// [`Task::pre_schedule`] and [`Task::follow_up`].
pub type TaskHook = Arc<dyn Fn(&HookContext<'_>) -> anyhow::Result<Vec<Task>> + Send + Sync>;

/// What a task does when it runs.
#[derive(Clone)]
pub enum Action {
    /// A command template interpolated against the task environment. `SRC`
    /// and `TGT` expand to the absolute paths of inputs and outputs.
    Command { template: String, shell: bool },
    /// A function executed in the worker thread.
    Function(TaskFn),
    /// Runs `inner`, then `then` if `inner` succeeded.
    Chain { inner: Box<Action>, then: TaskFn },
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Command { template, shell } => f
                .debug_struct("Command")
                .field("template", template)
                .field("shell", shell)
                .finish(),
            Action::Function(_) => f.write_str("Function"),
            Action::Chain { inner, .. } => f.debug_tuple("Chain").field(inner).finish(),
        }
    }
}

/// Definition of a unit of work.
///
/// A task is built once by a generator and never changes afterwards; the
/// scheduler keeps its runtime state separately and hands the definition to
/// workers as `Arc<Task>`.
#[derive(Clone)]
pub struct Task {
    pub(crate) class: Cow<'static, str>,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) outputs: Vec<NodeId>,
    pub(crate) env: Option<Arc<Environment>>,
    pub(crate) action: Action,
    pub(crate) scanner: Option<Arc<dyn Scanner>>,
    pub(crate) vars: Vec<String>,
    pub(crate) after: Vec<TaskId>,
    pub(crate) always_stale: bool,
    pub(crate) no_errcheck_out: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cwd: Option<Utf8PathBuf>,
    pub(crate) pre_schedule: Option<TaskHook>,
    pub(crate) follow_up: Option<TaskHook>,
}

impl Task {
    fn with_action(class: impl Into<Cow<'static, str>>, action: Action) -> Self {
        Self {
            class: class.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            env: None,
            action,
            scanner: None,
            vars: Vec::new(),
            after: Vec::new(),
            always_stale: false,
            no_errcheck_out: false,
            timeout: None,
            cwd: None,
            pre_schedule: None,
            follow_up: None,
        }
    }

    /// A task running an external command split into argv words.
    pub fn command(class: impl Into<Cow<'static, str>>, template: impl Into<String>) -> Self {
        Self::with_action(
            class,
            Action::Command {
                template: template.into(),
                shell: false,
            },
        )
    }

    /// A task running a command line through the shell.
    pub fn shell(class: impl Into<Cow<'static, str>>, template: impl Into<String>) -> Self {
        Self::with_action(
            class,
            Action::Command {
                template: template.into(),
                shell: true,
            },
        )
    }

    /// A task running a function in-process.
    pub fn function<F>(class: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: Fn(&mut RunContext<'_>) -> anyhow::Result<i32> + Send + Sync + 'static,
    {
        Self::with_action(class, Action::Function(Arc::new(f)))
    }

    /// Chains `then` after the current action of the task, e.g. to strip a
    /// freshly linked binary. `then` only runs when the action succeeded.
    pub fn wrap<F>(mut self, then: F) -> Self
    where
        F: Fn(&mut RunContext<'_>) -> anyhow::Result<i32> + Send + Sync + 'static,
    {
        self.action = Action::Chain {
            inner: Box::new(self.action),
            then: Arc::new(then),
        };
        self
    }

    pub fn input(mut self, node: NodeId) -> Self {
        self.inputs.push(node);
        self
    }

    pub fn inputs(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.inputs.extend(nodes);
        self
    }

    pub fn output(mut self, node: NodeId) -> Self {
        self.outputs.push(node);
        self
    }

    pub fn outputs(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.outputs.extend(nodes);
        self
    }

    /// Attaches an environment snapshot; without one the task uses the
    /// environment of the build context.
    pub fn env(mut self, env: Arc<Environment>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn scanner(mut self, scanner: impl Scanner + 'static) -> Self {
        self.scanner = Some(Arc::new(scanner));
        self
    }

    /// Environment variables whose values are part of the signature.
    pub fn vars(mut self, vars: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.vars.extend(vars.into_iter().map(Into::into));
        self
    }

    /// Runs this task only after `task` reached a terminal state.
    pub fn after(mut self, task: TaskId) -> Self {
        self.after.push(task);
        self
    }

    /// Never consider the task up to date.
    pub fn always_stale(mut self) -> Self {
        self.always_stale = true;
        self
    }

    /// Do not require the outputs to exist after a successful run.
    pub fn no_errcheck_out(mut self) -> Self {
        self.no_errcheck_out = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Creates predecessors of this task right before it is signed. The
    /// task waits for them, the hook runs once per build.
    pub fn pre_schedule<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HookContext<'_>) -> anyhow::Result<Vec<Task>> + Send + Sync + 'static,
    {
        self.pre_schedule = Some(Arc::new(hook));
        self
    }

    /// Creates tasks that depend on the outputs of this one, e.g. one
    /// compilation per file listed in a generated manifest.
    ///
    /// The hook runs once the outputs are valid: after a successful run, or
    /// in place of the run when the task is up to date. Tasks added with
    /// [`RunContext::add_task`] only exist in builds where the task runs.
    pub fn follow_up<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HookContext<'_>) -> anyhow::Result<Vec<Task>> + Send + Sync + 'static,
    {
        self.follow_up = Some(Arc::new(hook));
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn input_nodes(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn output_nodes(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Stable identity of the task across runs: class name followed by the
    /// absolute paths of inputs and outputs.
    pub fn uid(&self, nodes: &NodeTree) -> Digest {
        let mut hasher = SigHasher::default();
        hasher.part(self.class.as_bytes());

        for &node in self.inputs.iter().chain(&self.outputs) {
            hasher.part(nodes.abspath(node).as_str());
        }

        hasher.finish()
    }

    /// Human-readable name, `class: inputs -> outputs`.
    pub fn display(&self, nodes: &NodeTree) -> String {
        let names = |list: &[NodeId]| {
            list.iter()
                .map(|&node| nodes.name(node))
                .collect::<Vec<_>>()
                .join(" ")
        };

        match (self.inputs.is_empty(), self.outputs.is_empty()) {
            (true, true) => self.class.to_string(),
            (false, true) => format!("{}: {}", self.class, names(&self.inputs)),
            (true, false) => format!("{}: -> {}", self.class, names(&self.outputs)),
            (false, false) => format!(
                "{}: {} -> {}",
                self.class,
                names(&self.inputs),
                names(&self.outputs)
            ),
        }
    }

    /// Variables available to command templates in addition to the
    /// environment.
    fn specials(&self, nodes: &NodeTree) -> BTreeMap<String, Value> {
        let paths = |list: &[NodeId]| {
            Value::List(
                list.iter()
                    .map(|&node| nodes.abspath(node).into_string())
                    .collect(),
            )
        };

        BTreeMap::from([
            ("SRC".to_string(), paths(&self.inputs)),
            ("TGT".to_string(), paths(&self.outputs)),
        ])
    }

    /// The interpolated command of the action, if it has one.
    pub(crate) fn command_line(&self, nodes: &NodeTree, env: &Environment) -> Option<Cmd> {
        let mut action = &self.action;

        loop {
            match action {
                Action::Command { template, shell } => {
                    let specials = self.specials(nodes);
                    return Some(match shell {
                        true => Cmd::Shell(env.subst(template, &specials)),
                        false => Cmd::Argv(env.subst_argv(template, &specials)),
                    });
                }
                Action::Function(_) => return None,
                Action::Chain { inner, .. } => action = inner,
            }
        }
    }

    /// Executes the action and returns its exit code.
    pub(crate) fn run(&self, ctx: &mut RunContext<'_>) -> anyhow::Result<i32> {
        self.run_action(&self.action, ctx)
    }

    fn run_action(&self, action: &Action, ctx: &mut RunContext<'_>) -> anyhow::Result<i32> {
        match action {
            Action::Command { .. } => match self.command_line(ctx.nodes, ctx.env) {
                Some(cmd) => ctx.exec_command(cmd),
                None => Ok(0),
            },
            Action::Function(f) => f(ctx),
            Action::Chain { inner, then } => match self.run_action(inner, ctx)? {
                0 => then(ctx),
                code => Ok(code),
            },
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("class", &self.class)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("action", &self.action)
            .field("after", &self.after)
            .finish_non_exhaustive()
    }
}

/// View of the build offered to a task while it runs on a worker.
pub struct RunContext<'a> {
    pub nodes: &'a NodeTree,
    pub env: &'a Environment,
    pub inputs: &'a [NodeId],
    pub outputs: &'a [NodeId],
    pub(crate) exec: &'a dyn Exec,
    pub(crate) slot: usize,
    pub(crate) cwd: &'a Utf8Path,
    pub(crate) timeout: Option<Duration>,
    pub(crate) more_tasks: Vec<Task>,
    pub(crate) stderr: String,
    pub(crate) timed_out: bool,
}

impl<'a> RunContext<'a> {
    /// Runs a command through the execution back-end of the build, with the
    /// task environment merged over the process environment.
    ///
    /// Returns the exit code. Captured standard output is logged, standard
    /// error is kept for the failure report.
    pub fn exec_command(&mut self, cmd: Cmd) -> anyhow::Result<i32> {
        let mut request = Request::new(cmd);
        request.cwd = Some(self.cwd.to_owned());
        request.timeout = self.timeout.map(|t| t.as_millis() as u64);
        request.env = self
            .env
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        let response = self.exec.exec(self.slot, &request)?;

        if let Some(exception) = response.exception {
            anyhow::bail!("{}: {exception}", request.cmd);
        }

        let stdout = response.stdout_lossy();
        if !stdout.trim().is_empty() {
            tracing::info!("{}", stdout.trim_end());
        }

        self.stderr.push_str(&response.stderr_lossy());
        self.timed_out |= response.timed_out;

        Ok(response.code)
    }

    /// Schedules a task discovered while running, e.g. the compilation of
    /// a generated source file. It joins the current group.
    pub fn add_task(&mut self, task: Task) {
        self.more_tasks.push(task);
    }

    pub fn input_path(&self, index: usize) -> Option<Utf8PathBuf> {
        self.inputs.get(index).map(|&node| self.nodes.abspath(node))
    }

    pub fn output_path(&self, index: usize) -> Option<Utf8PathBuf> {
        self.outputs.get(index).map(|&node| self.nodes.abspath(node))
    }
}

/// What a task hook can see of the task it is attached to.
pub struct HookContext<'a> {
    pub nodes: &'a NodeTree,
    pub task: &'a Task,
    pub env: &'a Environment,
}

impl<'a> HookContext<'a> {
    pub fn input_path(&self, index: usize) -> Option<Utf8PathBuf> {
        self.task.inputs.get(index).map(|&node| self.nodes.abspath(node))
    }

    pub fn output_path(&self, index: usize) -> Option<Utf8PathBuf> {
        self.task.outputs.get(index).map(|&node| self.nodes.abspath(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_depends_on_class_and_paths() {
        let nodes = NodeTree::new();
        let root = nodes.node("/project");
        let a = nodes.make_node(root, "a.c");
        let o = nodes.make_node(root, "a.o");

        let t1 = Task::command("cc", "cc -c ${SRC}").input(a).output(o);
        let t2 = Task::command("cc", "gcc -O2 -c ${SRC}").input(a).output(o);
        let t3 = Task::command("cxx", "cc -c ${SRC}").input(a).output(o);
        let t4 = Task::command("cc", "cc -c ${SRC}").input(o).output(a);

        assert_eq!(t1.uid(&nodes), t2.uid(&nodes));
        assert_ne!(t1.uid(&nodes), t3.uid(&nodes));
        assert_ne!(t1.uid(&nodes), t4.uid(&nodes));

        // a fresh tree with nodes created in another order
        let other = NodeTree::new();
        let root = other.node("/project");
        let o2 = other.make_node(root, "a.o");
        let a2 = other.make_node(root, "a.c");
        let t5 = Task::command("cc", "").input(a2).output(o2);
        assert_eq!(t1.uid(&nodes), t5.uid(&other));
    }

    #[test]
    fn test_command_line_interpolation() {
        let nodes = NodeTree::new();
        let root = nodes.node("/project");
        let a = nodes.make_node(root, "a.c");
        let o = nodes.make_node(root, "a.o");

        let mut env = Environment::new();
        env.set("CC", "cc").set("CFLAGS", vec!["-O2", "-g"]);

        let task = Task::command("cc", "${CC} ${CFLAGS} -c ${SRC} -o ${TGT}")
            .input(a)
            .output(o);
        assert_eq!(
            task.command_line(&nodes, &env),
            Some(Cmd::Argv(
                ["cc", "-O2", "-g", "-c", "/project/a.c", "-o", "/project/a.o"]
                    .map(String::from)
                    .to_vec()
            ))
        );

        let task = Task::shell("cc", "${CC} ${CFLAGS} ${SRC} > ${TGT}")
            .input(a)
            .output(o)
            .wrap(|_| Ok(0));
        assert_eq!(
            task.command_line(&nodes, &env),
            Some(Cmd::Shell("cc -O2 -g /project/a.c > /project/a.o".into()))
        );

        assert_eq!(Task::function("fn", |_| Ok(0)).command_line(&nodes, &env), None);
    }

    #[test]
    fn test_display_name() {
        let nodes = NodeTree::new();
        let root = nodes.node("/project");
        let a = nodes.make_node(root, "a.c");
        let o = nodes.make_node(root, "a.o");

        assert_eq!(Task::command("cc", "").input(a).output(o).display(&nodes), "cc: a.c -> a.o");
        assert_eq!(Task::command("gen", "").output(o).display(&nodes), "gen: -> a.o");
        assert_eq!(Task::command("noop", "").display(&nodes), "noop");
    }

    #[test]
    fn test_state_predicates() {
        assert!(!State::NotRun.is_terminal());
        assert!(State::Cancelled.is_terminal());
        assert!(State::Crashed.is_failure());
        assert!(!State::Cancelled.is_failure());
        assert!(State::Skipped.is_ok());
    }
}
