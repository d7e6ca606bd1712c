use std::collections::HashSet;
use std::fs;
use std::sync::LazyLock;

use regex::Regex;

use crate::env::Environment;
use crate::node::{NodeId, NodeTree};

/// Outcome of an implicit dependency scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// Dependencies found in the inputs: nodes that were resolved and names
    /// that could not be resolved to any file.
    Ready {
        nodes: Vec<NodeId>,
        names: Vec<String>,
    },
    /// A file the scan needs is produced by a task that has not run yet.
    NotReady,
}

impl Scan {
    pub fn empty() -> Self {
        Scan::Ready {
            nodes: Vec::new(),
            names: Vec::new(),
        }
    }
}

/// What a scanner can see of the task being scanned.
pub struct ScanContext<'a> {
    pub nodes: &'a NodeTree,
    pub inputs: &'a [NodeId],
    pub env: &'a Environment,
    pub(crate) pending: &'a dyn Fn(NodeId) -> bool,
}

impl<'a> ScanContext<'a> {
    /// Whether `node` is the output of a task that has not finished yet.
    pub fn is_pending(&self, node: NodeId) -> bool {
        (self.pending)(node)
    }
}

/// Discovers implicit dependencies of a task from the content of its inputs.
pub trait Scanner: Send + Sync {
    fn scan(&self, ctx: &ScanContext<'_>) -> anyhow::Result<Scan>;
}

impl<F> Scanner for F
where
    F: Fn(&ScanContext<'_>) -> anyhow::Result<Scan> + Send + Sync,
{
    fn scan(&self, ctx: &ScanContext<'_>) -> anyhow::Result<Scan> {
        self(ctx)
    }
}

static RE_INCLUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*#[ \t]*include[ \t]*([<"])([^>"\r\n]+)[>"]"#)
        .expect("include pattern is valid")
});

/// Follows `#include` directives of the first input.
///
/// Quoted includes are looked up next to the including file first, then in
/// `paths`; angle-bracket includes only in `paths`. Headers found on the way
/// are scanned as well. Includes that resolve nowhere are reported as names,
/// so that a header appearing later changes the signature.
#[derive(Debug, Clone, Default)]
pub struct IncludeScanner {
    pub paths: Vec<NodeId>,
}

impl IncludeScanner {
    pub fn new(paths: Vec<NodeId>) -> Self {
        Self { paths }
    }

    fn resolve(&self, ctx: &ScanContext<'_>, from: NodeId, quoted: bool, name: &str) -> Resolved {
        let local = match quoted {
            true => ctx.nodes.parent(from),
            false => None,
        };

        for dir in local.iter().chain(self.paths.iter()) {
            if let Some(node) = ctx.nodes.search(*dir, name)
                && ctx.is_pending(node)
            {
                return Resolved::Pending;
            }

            if let Some(node) = ctx.nodes.find_node(*dir, name)
                && ctx.nodes.abspath(node).is_file()
            {
                return Resolved::Found(node);
            }
        }

        Resolved::Missing
    }
}

enum Resolved {
    Found(NodeId),
    Missing,
    Pending,
}

impl Scanner for IncludeScanner {
    fn scan(&self, ctx: &ScanContext<'_>) -> anyhow::Result<Scan> {
        let Some(&first) = ctx.inputs.first() else {
            return Ok(Scan::empty());
        };

        let mut nodes = Vec::new();
        let mut names = Vec::new();
        let mut seen = HashSet::from([first]);
        let mut queue = vec![first];

        while let Some(current) = queue.pop() {
            let text = fs::read(ctx.nodes.abspath(current))?;
            let text = String::from_utf8_lossy(&text);

            for capture in RE_INCLUDE.captures_iter(&text) {
                let quoted = &capture[1] == "\"";
                let name = capture[2].trim();

                match self.resolve(ctx, current, quoted, name) {
                    Resolved::Pending => return Ok(Scan::NotReady),
                    Resolved::Missing => {
                        if !names.iter().any(|n| n == name) {
                            names.push(name.to_string());
                        }
                    }
                    Resolved::Found(node) => {
                        if seen.insert(node) {
                            nodes.push(node);
                            queue.push(node);
                        }
                    }
                }
            }
        }

        Ok(Scan::Ready { nodes, names })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn write(root: &Utf8PathBuf, file: &str, text: &str) {
        let path = root.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    #[test]
    fn test_include_scanner_follows_headers() {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        write(&root, "a.c", "#include \"a.h\"\n  # include <sys.h>\n#include <missing.h>\n");
        write(&root, "a.h", "#include \"b.h\"\n");
        write(&root, "b.h", "int b;\n");
        write(&root, "inc/sys.h", "#include \"a.h\"\n");

        let tree = NodeTree::new();
        let base = tree.node(&root);
        let a_c = tree.make_node(base, "a.c");
        let inc = tree.make_node(base, "inc");
        let env = Environment::new();
        let pending = |_: NodeId| false;

        let ctx = ScanContext {
            nodes: &tree,
            inputs: &[a_c],
            env: &env,
            pending: &pending,
        };

        let scan = IncludeScanner::new(vec![inc]).scan(&ctx).unwrap();
        let Scan::Ready { nodes, names } = scan else {
            panic!("expected a ready scan");
        };

        let mut found: Vec<_> = nodes.iter().map(|&n| tree.name(n)).collect();
        found.sort();
        assert_eq!(found, vec!["a.h", "b.h", "sys.h"]);
        assert_eq!(names, vec!["missing.h"]);
    }

    #[test]
    fn test_include_of_pending_output_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        write(&root, "a.c", "#include \"gen.h\"\n");

        let tree = NodeTree::new();
        let base = tree.node(&root);
        let a_c = tree.make_node(base, "a.c");
        let generated = tree.make_node(base, "gen.h");
        let env = Environment::new();
        let pending = move |node: NodeId| node == generated;

        let ctx = ScanContext {
            nodes: &tree,
            inputs: &[a_c],
            env: &env,
            pending: &pending,
        };

        assert_eq!(IncludeScanner::default().scan(&ctx).unwrap(), Scan::NotReady);
    }
}
