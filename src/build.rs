use std::collections::{HashSet, VecDeque};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use serde::{Deserialize, Deserializer};

use crate::env::Environment;
use crate::error::BuildError;
use crate::exec::{Exec, Inline};
use crate::graph::{TaskGraph, TaskId};
use crate::hash::Hasher;
use crate::node::{GlobOptions, NodeId, NodeTree};
use crate::prefork::Prefork;
use crate::report::Report;
use crate::runner::Parallel;
use crate::store::SignatureStore;
use crate::task::{State, Task};

/// How the scheduler reacts to failed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepGoing {
    /// Stop dispatching at the first failure, `-k` not given.
    #[default]
    Off,
    /// Keep building independent tasks and report every failure, `-k`.
    On,
    /// Like `On`, cancelled tasks are reported as well, `-kk`.
    Verbose,
}

/// Settings of a build, usually filled from the command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Number of tasks running at the same time.
    pub jobs: usize,
    pub keep_going: KeepGoing,
    pub verbose: u8,
    /// Time budget of every task that does not set its own, in seconds.
    #[serde(deserialize_with = "seconds")]
    pub timeout: Option<Duration>,
    /// Consider every task out of date.
    pub force: bool,
    /// Trust file modification times to skip rehashing unchanged files.
    pub fast_hash: bool,
    /// Location of the signature store, relative to the build directory.
    pub store_dir: Utf8PathBuf,
    /// Files whose modification discards the signature store.
    pub config_files: Vec<Utf8PathBuf>,
    /// Path of the `kamado-prefork` executable; when set, commands run
    /// through a pool of pre-forked servers.
    pub prefork: Option<Utf8PathBuf>,
    /// Delete files of the build directory that no task produces, e.g.
    /// outputs of renamed targets. Only done after a build that posted
    /// every group.
    pub remove_stale: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            keep_going: KeepGoing::Off,
            verbose: 0,
            timeout: None,
            force: false,
            fast_hash: false,
            store_dir: Utf8PathBuf::from(".kamado"),
            config_files: Vec::new(),
            prefork: None,
            remove_stale: false,
        }
    }
}

impl Options {
    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> Result<Self, BuildError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;

        serde_json::from_str(&text)
            .map_err(|e| BuildError::Configuration(format!("invalid options in '{path}': {e}")))
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    let secs = Option::<f64>::deserialize(deserializer)?;

    match secs {
        Some(secs) if !secs.is_finite() || secs < 0.0 => Err(serde::de::Error::custom(
            "timeout must be a non-negative number of seconds",
        )),
        Some(secs) => Ok(Some(Duration::from_secs_f64(secs))),
        None => Ok(None),
    }
}

type Generator = Box<dyn FnOnce(&mut GenContext<'_>) -> anyhow::Result<()>>;

/// The state of a build, passed explicitly to everything that needs it.
///
/// Generators are registered into groups. A group is only posted, i.e. its
/// generators are called and their tasks created, once every task of the
/// previous group has finished.
pub struct BuildContext {
    pub(crate) nodes: Arc<NodeTree>,
    pub(crate) hasher: Arc<Hasher>,
    pub(crate) exec: Arc<dyn Exec>,
    pub(crate) options: Options,
    pub(crate) graph: TaskGraph,
    pub(crate) store: SignatureStore,
    pub(crate) generators: Vec<String>,
    env: Arc<Environment>,
    groups: VecDeque<Vec<(usize, Generator)>>,
    group: usize,
    srcnode: NodeId,
    bldnode: NodeId,
}

impl BuildContext {
    /// Prepares a build of the sources in `srcdir` into `blddir`, loading
    /// the signature store left there by the previous build.
    pub fn new(
        srcdir: impl AsRef<Utf8Path>,
        blddir: impl AsRef<Utf8Path>,
        options: Options,
    ) -> Result<Self, BuildError> {
        let srcdir = absolute(srcdir.as_ref())?;
        let blddir = absolute(blddir.as_ref())?;

        if !srcdir.is_dir() {
            return Err(BuildError::Configuration(format!(
                "source directory '{srcdir}' does not exist"
            )));
        }

        fs::create_dir_all(&blddir)?;

        let nodes = NodeTree::new();
        let srcnode = nodes.node(&srcdir);
        let bldnode = nodes.node(&blddir);

        let store = SignatureStore::open(&blddir.join(&options.store_dir), &options.config_files)?;
        let hasher = Hasher::with_cache(options.fast_hash, store.hashes().clone());

        let exec: Arc<dyn Exec> = match &options.prefork {
            Some(program) => Arc::new(Prefork::spawn(program, options.jobs.max(1))?),
            None => Arc::new(Inline),
        };

        tracing::debug!("build {srcdir} -> {blddir} with {} executor", exec.name());

        Ok(Self {
            nodes: Arc::new(nodes),
            hasher: Arc::new(hasher),
            exec,
            options,
            graph: TaskGraph::default(),
            store,
            generators: Vec::new(),
            env: Arc::new(Environment::new()),
            groups: VecDeque::from([Vec::new()]),
            group: 0,
            srcnode,
            bldnode,
        })
    }

    /// Replaces the command execution back-end.
    pub fn set_exec(&mut self, exec: Arc<dyn Exec>) {
        self.exec = exec;
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn nodes(&self) -> &NodeTree {
        &self.nodes
    }

    pub fn srcnode(&self) -> NodeId {
        self.srcnode
    }

    pub fn bldnode(&self) -> NodeId {
        self.bldnode
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn store(&self) -> &SignatureStore {
        &self.store
    }

    pub fn state(&self, id: TaskId) -> State {
        self.graph.state(id)
    }

    /// Environment given to tasks that do not bring their own. Changes only
    /// affect generators posted afterwards.
    pub fn env_mut(&mut self) -> &mut Environment {
        Arc::make_mut(&mut self.env)
    }

    /// Registers a generator in the current group.
    pub fn add_generator<F>(&mut self, name: impl Into<String>, generator: F) -> &mut Self
    where
        F: FnOnce(&mut GenContext<'_>) -> anyhow::Result<()> + 'static,
    {
        let index = self.generators.len();
        self.generators.push(name.into());

        match self.groups.back_mut() {
            Some(group) => group.push((index, Box::new(generator))),
            None => self.groups.push_back(vec![(index, Box::new(generator))]),
        }

        self
    }

    /// Starts a new group, the generators registered from now on only run
    /// after every task of the previous groups has finished.
    pub fn add_group(&mut self) -> &mut Self {
        self.groups.push_back(Vec::new());
        self
    }

    /// Posts the next group: calls its generators and returns the tasks
    /// they created. `None` once every group has been posted.
    pub fn next_group(&mut self) -> Result<Option<Vec<TaskId>>, BuildError> {
        let Some(generators) = self.groups.pop_front() else {
            return Ok(None);
        };

        let group = self.group;
        self.group += 1;

        let mut added = Vec::new();
        for (index, generator) in generators {
            let mut ctx = GenContext {
                nodes: &self.nodes,
                graph: &mut self.graph,
                env: self.env.clone(),
                srcnode: self.srcnode,
                bldnode: self.bldnode,
                generator: index,
                group,
                added: &mut added,
            };

            tracing::debug!("posting generator '{}'", self.generators[index]);
            generator(&mut ctx).map_err(|e| BuildError::Generator(self.generators[index].clone(), e))?;
        }

        self.graph.link_producers(&added);
        Ok(Some(added))
    }

    /// Number of tasks created so far.
    pub fn total(&self) -> usize {
        self.graph.len()
    }

    /// Runs every group to completion and saves the signature store.
    ///
    /// Task failures do not make this function fail, they are listed in
    /// the returned [`Report`], see [`Report::into_result`]. A deadlock or a
    /// failing generator does.
    pub fn execute(&mut self) -> Result<Report, BuildError> {
        let start = Instant::now();
        let result = Parallel::new(self).start();

        self.store.set_hashes(self.hasher.snapshot());
        let saved = self.store.save();

        let surfaced = result?;
        saved?;

        if self.options.remove_stale && self.groups.is_empty() {
            self.remove_stale()?;
        }

        let report = Report::collect(&self.graph, &self.generators, &surfaced, start.elapsed());
        tracing::info!(
            "{} tasks: {} ran, {} skipped, {} failed in {:.2?}",
            report.tasks.len(),
            report.passed() + report.failed(),
            report.skipped(),
            report.failed(),
            report.elapsed
        );

        Ok(report)
    }

    /// Deletes the files under the build directory that are not an output
    /// of any task, except the signature store and the config files.
    /// Returns the number of files removed.
    fn remove_stale(&self) -> Result<usize, BuildError> {
        let mut keep: HashSet<Utf8PathBuf> = self
            .options
            .config_files
            .iter()
            .filter_map(|path| absolute(path).ok())
            .collect();

        for id in self.graph.ids() {
            for &output in self.graph.task(id).output_nodes() {
                keep.insert(self.nodes.abspath(output));
            }
        }

        let store_dir = Pattern::escape(self.options.store_dir.as_str());
        let opts = GlobOptions {
            excl: vec![store_dir.clone(), format!("{store_dir}/**")],
            default_excludes: false,
            ..GlobOptions::default()
        };

        let mut removed = 0;
        for node in self.nodes.ant_glob(self.bldnode, "**", &opts)? {
            let path = self.nodes.abspath(node);
            if keep.contains(&path) {
                continue;
            }

            tracing::warn!("removing stale file {path}");
            fs::remove_file(&path)?;
            removed += 1;
        }

        Ok(removed)
    }
}

fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf, BuildError> {
    let path = std::path::absolute(path)?;
    Utf8PathBuf::try_from(path)
        .map_err(|e| BuildError::Configuration(format!("path is not UTF-8: {e}")))
}

/// Handle given to generators to declare nodes and tasks.
pub struct GenContext<'a> {
    nodes: &'a NodeTree,
    graph: &'a mut TaskGraph,
    env: Arc<Environment>,
    srcnode: NodeId,
    bldnode: NodeId,
    generator: usize,
    group: usize,
    added: &'a mut Vec<TaskId>,
}

impl<'a> GenContext<'a> {
    pub fn nodes(&self) -> &NodeTree {
        self.nodes
    }

    pub fn env(&self) -> Arc<Environment> {
        self.env.clone()
    }

    pub fn srcnode(&self) -> NodeId {
        self.srcnode
    }

    pub fn bldnode(&self) -> NodeId {
        self.bldnode
    }

    /// A source file, relative to the source directory.
    pub fn src(&self, rel: impl AsRef<Utf8Path>) -> NodeId {
        self.nodes.make_node(self.srcnode, rel)
    }

    /// A build output, relative to the build directory.
    pub fn bld(&self, rel: impl AsRef<Utf8Path>) -> Result<NodeId, BuildError> {
        Ok(self.nodes.find_or_declare(self.bldnode, rel)?)
    }

    /// Source files matching an Ant-style pattern.
    pub fn glob(&self, pattern: &str) -> Result<Vec<NodeId>, BuildError> {
        Ok(self
            .nodes
            .ant_glob(self.srcnode, pattern, &GlobOptions::default())?)
    }

    pub fn add(&mut self, task: Task) -> Result<TaskId, BuildError> {
        let id = self
            .graph
            .add(task, self.nodes, self.env.clone(), self.generator, self.group)?;
        self.added.push(id);
        Ok(id)
    }

    /// Orders `task` after `pred`, both tasks must exist already.
    pub fn run_after(&mut self, task: TaskId, pred: TaskId) -> Result<(), BuildError> {
        self.graph.set_run_after(task, pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(options: Options) -> (TempDir, BuildContext) {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        let bld = BuildContext::new(root.join("src"), root.join("build"), options).unwrap();
        (dir, bld)
    }

    #[test]
    fn test_options_from_json() {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("options.json")).unwrap();
        fs::write(&path, r#"{ "jobs": 3, "keep_going": "verbose", "timeout": 1.5 }"#).unwrap();

        let options = Options::from_json_file(&path).unwrap();
        assert_eq!(options.jobs, 3);
        assert_eq!(options.keep_going, KeepGoing::Verbose);
        assert_eq!(options.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.store_dir, ".kamado");
        assert!(!options.fast_hash);

        fs::write(&path, r#"{ "timeout": -1 }"#).unwrap();
        assert!(matches!(
            Options::from_json_file(&path),
            Err(BuildError::Configuration(_))
        ));
    }

    #[test]
    fn test_groups_are_posted_lazily() {
        let (_dir, mut bld) = context(Options::default());

        bld.add_generator("first", |ctx| {
            let out = ctx.bld("a.txt")?;
            ctx.add(Task::function("write", |_| Ok(0)).output(out))?;
            Ok(())
        });
        bld.add_group();
        bld.add_generator("second", |ctx| {
            ctx.add(Task::function("noop", |_| Ok(0)))?;
            ctx.add(Task::function("noop", |_| Ok(0)))?;
            Ok(())
        });

        assert_eq!(bld.total(), 0);
        assert_eq!(bld.next_group().unwrap().map(|ids| ids.len()), Some(1));
        assert_eq!(bld.total(), 1);
        assert_eq!(bld.next_group().unwrap().map(|ids| ids.len()), Some(2));
        assert_eq!(bld.total(), 3);
        assert!(bld.next_group().unwrap().is_none());
    }

    #[test]
    fn test_generator_error_is_reported() {
        let (_dir, mut bld) = context(Options::default());
        bld.add_generator("broken", |_| anyhow::bail!("no sources"));

        match bld.next_group() {
            Err(BuildError::Generator(name, _)) => assert_eq!(name, "broken"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_source_directory() {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let result = BuildContext::new(root.join("nope"), root.join("build"), Options::default());
        assert!(matches!(result, Err(BuildError::Configuration(_))));
    }
}
