use std::collections::BTreeMap;
use std::fs;
use std::sync::RwLock;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern, PatternError};

use crate::hash::Digest;

/// Handle to a file-system path stored in a [`NodeTree`].
///
/// Nodes are the only identity shared between tasks: two tasks refer to the
/// same file if and only if they hold the same `NodeId`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

struct Entry {
    name: String,
    parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
    sig: Option<Digest>,
}

#[derive(Default)]
struct Arena {
    entries: Vec<Entry>,
    roots: BTreeMap<String, NodeId>,
}

impl Arena {
    fn push(&mut self, name: String, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.entries.len() as u32);

        self.entries.push(Entry {
            name: name.clone(),
            parent,
            children: BTreeMap::new(),
            sig: None,
        });

        match parent {
            Some(parent) => {
                self.entries[parent.index()].children.insert(name, id);
            }
            None => {
                self.roots.insert(name, id);
            }
        }

        id
    }

    fn child(&mut self, parent: NodeId, name: &str) -> NodeId {
        match self.entries[parent.index()].children.get(name) {
            Some(&id) => id,
            None => self.push(name.to_string(), Some(parent)),
        }
    }

    fn root(&mut self, name: &str) -> NodeId {
        match self.roots.get(name) {
            Some(&id) => id,
            None => self.push(name.to_string(), None),
        }
    }

    fn abspath(&self, id: NodeId) -> Utf8PathBuf {
        let mut names = Vec::new();
        let mut cursor = Some(id);

        while let Some(current) = cursor {
            let entry = &self.entries[current.index()];
            names.push(entry.name.as_str());
            cursor = entry.parent;
        }

        let mut path = Utf8PathBuf::new();
        for name in names.into_iter().rev() {
            path.push(name);
        }
        path
    }
}

/// Options for [`NodeTree::ant_glob`].
#[derive(Debug, Clone)]
pub struct GlobOptions {
    /// Patterns to exclude, matched like the include patterns.
    pub excl: Vec<String>,
    /// Return directories.
    pub dir: bool,
    /// Return files.
    pub src: bool,
    /// Apply [`DEFAULT_EXCLUDES`] in addition to `excl`.
    pub default_excludes: bool,
}

impl Default for GlobOptions {
    fn default() -> Self {
        Self {
            excl: Vec::new(),
            dir: false,
            src: true,
            default_excludes: true,
        }
    }
}

/// Version-control and editor leftovers that are never matched by `ant_glob`.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/*~",
    "**/#*#",
    "**/.#*",
    "**/%*%",
    "**/._*",
    "**/CVS",
    "**/CVS/**",
    "**/.git",
    "**/.git/**",
    "**/.gitignore",
    "**/.svn",
    "**/.svn/**",
    "**/.hg",
    "**/.hg/**",
    "**/.DS_Store",
];

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Tree of file-system paths owned by the build context.
///
/// Each node has a name unique among its siblings, an optional parent and an
/// optional content signature. The absolute path of a node is derived from
/// its parent chain. All methods take `&self`, the arena is guarded by a lock
/// so that workers can record signatures of the outputs they produced.
#[derive(Default)]
pub struct NodeTree {
    arena: RwLock<Arena>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node for an absolute path, creating missing entries.
    pub fn node(&self, path: impl AsRef<Utf8Path>) -> NodeId {
        let path = path.as_ref();
        let mut arena = self.arena.write().unwrap();

        let mut root = String::new();
        let mut rest = Vec::new();

        for component in path.components() {
            match component {
                Utf8Component::Prefix(prefix) => root.push_str(prefix.as_str()),
                Utf8Component::RootDir => root.push(std::path::MAIN_SEPARATOR),
                other => rest.push(other),
            }
        }

        if root.is_empty() {
            root.push(std::path::MAIN_SEPARATOR);
        }

        let mut cursor = arena.root(&root);
        for component in rest {
            cursor = match component {
                Utf8Component::CurDir => cursor,
                Utf8Component::ParentDir => arena.entries[cursor.index()].parent.unwrap_or(cursor),
                Utf8Component::Normal(name) => arena.child(cursor, name),
                _ => cursor,
            };
        }

        cursor
    }

    /// Returns the node for `rel` relative to `base`, creating every missing
    /// entry on the way. Nothing is created on disk.
    pub fn make_node(&self, base: NodeId, rel: impl AsRef<Utf8Path>) -> NodeId {
        let rel = rel.as_ref();

        if rel.is_absolute() {
            return self.node(rel);
        }

        self.node(self.abspath(base).join(rel))
    }

    /// Looks `rel` up in the tree without touching the file system.
    pub fn search(&self, base: NodeId, rel: impl AsRef<Utf8Path>) -> Option<NodeId> {
        let arena = self.arena.read().unwrap();
        let mut cursor = base;

        for component in rel.as_ref().components() {
            cursor = match component {
                Utf8Component::CurDir => cursor,
                Utf8Component::ParentDir => arena.entries[cursor.index()].parent?,
                Utf8Component::Normal(name) => *arena.entries[cursor.index()].children.get(name)?,
                _ => return None,
            };
        }

        Some(cursor)
    }

    /// Returns the node for `rel` if it is already known or exists on disk.
    pub fn find_node(&self, base: NodeId, rel: impl AsRef<Utf8Path>) -> Option<NodeId> {
        let rel = rel.as_ref();

        if let Some(id) = self.search(base, rel) {
            return Some(id);
        }

        let path = match rel.is_absolute() {
            true => rel.to_path_buf(),
            false => self.abspath(base).join(rel),
        };

        fs::metadata(&path).ok().map(|_| self.node(path))
    }

    /// Returns the node for a build output, creating its parent directory.
    pub fn find_or_declare(
        &self,
        base: NodeId,
        rel: impl AsRef<Utf8Path>,
    ) -> std::io::Result<NodeId> {
        let id = self.make_node(base, rel);

        if let Some(parent) = self.abspath(id).parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(id)
    }

    pub fn abspath(&self, id: NodeId) -> Utf8PathBuf {
        self.arena.read().unwrap().abspath(id)
    }

    pub fn name(&self, id: NodeId) -> String {
        self.arena.read().unwrap().entries[id.index()].name.clone()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.arena.read().unwrap().entries[id.index()].parent
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let arena = self.arena.read().unwrap();
        arena.entries[id.index()].children.values().copied().collect()
    }

    /// Path of `id` relative to `base`, if `base` is one of its ancestors.
    pub fn path_from(&self, id: NodeId, base: NodeId) -> Option<Utf8PathBuf> {
        let path = self.abspath(id);
        let base = self.abspath(base);
        path.strip_prefix(&base).ok().map(Utf8Path::to_path_buf)
    }

    pub fn is_child_of(&self, id: NodeId, ancestor: NodeId) -> bool {
        let arena = self.arena.read().unwrap();
        let mut cursor = Some(id);

        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = arena.entries[current.index()].parent;
        }

        false
    }

    pub fn sig(&self, id: NodeId) -> Option<Digest> {
        self.arena.read().unwrap().entries[id.index()].sig
    }

    pub fn set_sig(&self, id: NodeId, sig: Option<Digest>) {
        self.arena.write().unwrap().entries[id.index()].sig = sig;
    }

    pub fn len(&self) -> usize {
        self.arena.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds files (and optionally directories) below `base` matching any of
    /// the whitespace-separated Ant-style patterns in `incl`.
    ///
    /// `**/` crosses any number of directories, `*` stays within one
    /// directory and matching is case-sensitive. A pattern ending in `/`
    /// matches everything below that directory. Results are sorted by path.
    pub fn ant_glob(
        &self,
        base: NodeId,
        incl: &str,
        opts: &GlobOptions,
    ) -> Result<Vec<NodeId>, PatternError> {
        let include = compile(incl.split_whitespace())?;

        let mut exclude = compile(opts.excl.iter().map(String::as_str))?;
        if opts.default_excludes {
            exclude.extend(compile(DEFAULT_EXCLUDES.iter().copied())?);
        }

        let root = self.abspath(base);
        let mut found = Vec::new();
        walk(&root, Utf8Path::new(""), &include, &exclude, opts, &mut found);
        found.sort();

        Ok(found
            .into_iter()
            .map(|rel| self.make_node(base, rel))
            .collect())
    }
}

fn compile<'a>(patterns: impl Iterator<Item = &'a str>) -> Result<Vec<Pattern>, PatternError> {
    patterns
        .map(|pattern| {
            let pattern = pattern.trim_start_matches("./");
            match pattern.ends_with('/') {
                true => Pattern::new(&format!("{pattern}**")),
                false => Pattern::new(pattern),
            }
        })
        .collect()
}

fn walk(
    root: &Utf8Path,
    rel: &Utf8Path,
    include: &[Pattern],
    exclude: &[Pattern],
    opts: &GlobOptions,
    found: &mut Vec<Utf8PathBuf>,
) {
    let Ok(entries) = root.join(rel).read_dir_utf8() else {
        return;
    };

    for entry in entries.flatten() {
        let path = rel.join(entry.file_name());

        if exclude.iter().any(|p| p.matches_with(path.as_str(), MATCH)) {
            continue;
        }

        let Ok(kind) = entry.file_type() else {
            continue;
        };

        let matched = include.iter().any(|p| p.matches_with(path.as_str(), MATCH));

        if kind.is_dir() {
            if matched && opts.dir {
                found.push(path.clone());
            }
            walk(root, &path, include, exclude, opts, found);
        } else if matched && opts.src {
            found.push(path);
        }
    }
}
