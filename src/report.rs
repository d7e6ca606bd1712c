use std::fmt::{Display, Formatter, Write};
use std::time::Duration;

use console::style;

use crate::error::{BuildError, TaskError};
use crate::graph::{TaskGraph, TaskId};
use crate::task::State;

/// Outcome of a single task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: TaskId,
    /// Name of the generator that created the task.
    pub generator: String,
    pub name: String,
    pub class: String,
    pub state: State,
    /// Wall time of the run, `None` when the task did not run.
    pub duration: Option<Duration>,
    pub error: Option<TaskError>,
}

/// Summary of a build, returned by [`crate::BuildContext::execute`].
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub tasks: Vec<TaskReport>,
    /// Failures to show the user, in the order they happened.
    pub surfaced: Vec<TaskId>,
    pub elapsed: Duration,
}

impl Report {
    pub(crate) fn collect(
        graph: &TaskGraph,
        generators: &[String],
        surfaced: &[TaskId],
        elapsed: Duration,
    ) -> Self {
        let tasks = graph
            .ids()
            .map(|id| {
                let entry = graph.entry(id);
                TaskReport {
                    id,
                    generator: generators.get(entry.generator).cloned().unwrap_or_default(),
                    name: entry.name.clone(),
                    class: entry.task.class().to_string(),
                    state: entry.state,
                    duration: entry.duration,
                    error: entry.error.clone(),
                }
            })
            .collect();

        Self {
            tasks,
            surfaced: surfaced.to_vec(),
            elapsed,
        }
    }

    /// First task with the given display name.
    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|task| task.name == name)
    }

    pub fn state_of(&self, name: &str) -> Option<State> {
        self.task(name).map(|task| task.state)
    }

    pub fn count(&self, state: State) -> usize {
        self.tasks.iter().filter(|task| task.state == state).count()
    }

    pub fn passed(&self) -> usize {
        self.count(State::Success)
    }

    pub fn skipped(&self) -> usize {
        self.count(State::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.tasks.iter().filter(|task| task.state.is_failure()).count()
    }

    pub fn cancelled(&self) -> usize {
        self.count(State::Cancelled)
    }

    pub fn is_success(&self) -> bool {
        self.surfaced.is_empty() && self.failed() == 0
    }

    /// Process exit code for the build: 0 on success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    /// Surfaced failures with their reasons.
    pub fn errors(&self) -> impl Iterator<Item = (&TaskReport, &TaskError)> {
        self.surfaced.iter().filter_map(|id| {
            let task = self.tasks.get(id.index())?;
            Some((task, task.error.as_ref()?))
        })
    }

    /// Turns a failed build into an error.
    pub fn into_result(self) -> Result<Self, BuildError> {
        if self.is_success() {
            return Ok(self);
        }

        let first = match self.errors().next() {
            Some((task, error)) => format!("{}: {error}", task.name),
            None => String::from("unknown"),
        };

        Err(BuildError::Failed {
            count: self.failed(),
            first,
        })
    }

    /// Human-readable summary: every task grouped by generator, then the
    /// surfaced failures and the totals.
    pub fn render(&self) -> String {
        let mut f = String::new();

        let mut generators: Vec<&str> = Vec::new();
        for task in &self.tasks {
            if !generators.contains(&task.generator.as_str()) {
                generators.push(&task.generator);
            }
        }

        for generator in generators {
            let _ = writeln!(f, "{}", style(generator).bold());

            for task in self.tasks.iter().filter(|task| task.generator == generator) {
                let state = format!("{:<9}", task.state.to_string());
                let state = match task.state {
                    State::Success => style(state).green(),
                    State::Skipped | State::NotRun => style(state).dim(),
                    State::Crashed | State::Exception => style(state).red(),
                    State::Cancelled => style(state).yellow(),
                };

                let duration = task
                    .duration
                    .map(|d| format!("{d:.2?}"))
                    .unwrap_or_else(|| String::from("-"));

                let _ = writeln!(f, "  {state} {duration:>10}  {}", task.name);
            }
        }

        for (task, error) in self.errors() {
            let _ = writeln!(f, "{} {}\n{error}", style("error:").red().bold(), task.name);
        }

        let _ = write!(
            f,
            "{} passed, {} skipped, {} failed, {} cancelled in {:.2?}",
            style(self.passed()).green(),
            self.skipped(),
            style(self.failed()).red(),
            self.cancelled(),
            self.elapsed
        );

        f
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Environment;
    use crate::node::NodeTree;
    use crate::task::Task;
    use std::sync::Arc;

    fn report() -> Report {
        let nodes = NodeTree::new();
        let mut graph = TaskGraph::default();
        let env = Arc::new(Environment::new());

        let ok = graph.add(Task::function("ok", |_| Ok(0)), &nodes, env.clone(), 0, 0).unwrap();
        let bad = graph.add(Task::function("bad", |_| Ok(2)), &nodes, env.clone(), 1, 0).unwrap();
        let skip = graph.add(Task::function("skip", |_| Ok(0)), &nodes, env, 1, 0).unwrap();

        graph.entry_mut(ok).state = State::Success;
        graph.entry_mut(ok).duration = Some(Duration::from_millis(5));
        graph.entry_mut(bad).state = State::Crashed;
        graph.entry_mut(bad).error = Some(TaskError::Command {
            code: 2,
            stderr: String::from("oops"),
        });
        graph.entry_mut(skip).state = State::Skipped;

        let generators = [String::from("lib"), String::from("app")];
        Report::collect(&graph, &generators, &[bad], Duration::from_secs(1))
    }

    #[test]
    fn test_counts_and_exit_code() {
        let report = report();
        assert_eq!(report.passed(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.cancelled(), 0);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.state_of("skip"), Some(State::Skipped));
        assert_eq!(report.task("bad").map(|t| t.generator.as_str()), Some("app"));

        match report.into_result() {
            Err(BuildError::Failed { count, first }) => {
                assert_eq!(count, 1);
                assert!(first.starts_with("bad: "));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_render_lists_every_task() {
        console::set_colors_enabled(false);
        let text = report().render();

        assert!(text.contains("lib\n"));
        assert!(text.contains("app\n"));
        assert!(text.contains("SUCCESS"));
        assert!(text.contains("CRASHED"));
        assert!(text.contains("error: bad"));
        assert!(text.ends_with("1 passed, 1 skipped, 1 failed, 0 cancelled in 1.00s"));
    }

    #[test]
    fn test_empty_report_is_success() {
        let report = Report::default();
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert!(report.into_result().is_ok());
    }
}
