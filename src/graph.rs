//! The target graph.
//!
//! Targets live in a [`petgraph::Graph`] arena and refer to each other by
//! [`NodeIndex`]. An edge points from a dependency to the target depending
//! on it, so the children of a node are its incoming neighbours and its
//! parents are the outgoing ones.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::Dfs;

use crate::conf::{self, CONFIG_FILE_NAME, Command, DependencyKind, Kilnfile};
use crate::error::GraphError;

/// One `(configuration file, target name)` pair, or the synthetic root.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// Directory of the owning file; globs and commands are relative to it.
    pub dir: Utf8PathBuf,
    pub globs: Vec<String>,
    pub commands: Vec<Command>,
    /// Higher runs first.
    pub priority: f32,
    pub clean: bool,
    visiting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Wraps every requested target.
    Root,
    Target { file: Utf8PathBuf, name: String },
}

impl Node {
    fn root() -> Self {
        Self {
            kind: NodeKind::Root,
            dir: Utf8PathBuf::new(),
            globs: Vec::new(),
            commands: Vec::new(),
            priority: 0.0,
            clean: false,
            visiting: false,
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, NodeKind::Root)
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            NodeKind::Root => "<root>",
            NodeKind::Target { name, .. } => name,
        }
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            NodeKind::Root => f.write_str("<root>"),
            NodeKind::Target { file, name } => write!(f, "{name}@{file}"),
        }
    }
}

/// Graph of every target reachable from the requested ones.
#[derive(Debug)]
pub struct TargetGraph {
    pub(crate) graph: Graph<Node, ()>,
    pub(crate) root: NodeIndex,
}

impl TargetGraph {
    /// Resolves `targets` declared in `entry` and everything they depend on,
    /// across imported files.
    pub fn build(entry: &Utf8Path, targets: &[String]) -> Result<Self, GraphError> {
        let mut builder = GraphBuilder::new();
        let entry = canonical(entry)?;

        for target in targets {
            let child = builder.visit(&entry, target)?;
            builder.graph.update_edge(child, builder.root, ());
        }

        let mut graph = TargetGraph {
            graph: builder.graph,
            root: builder.root,
        };
        graph.assign_priorities();

        tracing::debug!(
            "target graph: {} targets from {} files",
            graph.graph.node_count() - 1,
            builder.files.len()
        );

        Ok(graph)
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn children(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Incoming)
    }

    pub fn parents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Outgoing)
    }

    /// Looks a target up by name, regardless of the file declaring it.
    pub fn find(&self, name: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&index| !self.graph[index].is_root() && self.graph[index].name() == name)
    }

    /// Priority of a target is the number of distinct targets transitively
    /// waiting on it.
    fn assign_priorities(&mut self) {
        for index in self.graph.node_indices() {
            let mut dependents = 0usize;
            let mut dfs = Dfs::new(&self.graph, index);
            while let Some(next) = dfs.next(&self.graph) {
                if next != index && next != self.root {
                    dependents += 1;
                }
            }
            self.graph[index].priority = dependents as f32;
        }
    }
}

impl std::ops::Index<NodeIndex> for TargetGraph {
    type Output = Node;

    fn index(&self, index: NodeIndex) -> &Node {
        &self.graph[index]
    }
}

impl std::ops::IndexMut<NodeIndex> for TargetGraph {
    fn index_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.graph[index]
    }
}

impl Display for TargetGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let label = node.to_string().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), label)?;
        }

        for edge in self.graph.edge_indices() {
            if let Some((source, target)) = self.graph.edge_endpoints(edge) {
                writeln!(f, "    {} --> {}", source.index(), target.index())?;
            }
        }

        Ok(())
    }
}

/// Memoization state for a single graph construction.
struct GraphBuilder {
    graph: Graph<Node, ()>,
    root: NodeIndex,
    files: HashMap<Utf8PathBuf, Arc<Kilnfile>>,
    nodes: HashMap<(Utf8PathBuf, String), NodeIndex>,
    /// Targets currently being visited, outermost first.
    stack: Vec<NodeIndex>,
}

impl GraphBuilder {
    fn new() -> Self {
        let mut graph = Graph::new();
        let root = graph.add_node(Node::root());

        Self {
            graph,
            root,
            files: HashMap::new(),
            nodes: HashMap::new(),
            stack: Vec::new(),
        }
    }

    fn visit(&mut self, path: &Utf8Path, target: &str) -> Result<NodeIndex, GraphError> {
        let key = (path.to_owned(), target.to_owned());
        if let Some(&index) = self.nodes.get(&key) {
            if self.graph[index].visiting {
                return Err(self.cycle(index));
            }
            return Ok(index);
        }

        let file = self.load(path)?;
        let Some(decl) = file.targets.get(target) else {
            return Err(GraphError::UnknownTarget {
                path: path.to_owned(),
                target: target.to_owned(),
            });
        };

        let dir = path.parent().map(Utf8Path::to_owned).unwrap_or_default();
        let index = self.graph.add_node(Node {
            kind: NodeKind::Target {
                file: path.to_owned(),
                name: target.to_owned(),
            },
            dir: dir.clone(),
            globs: Vec::new(),
            commands: decl.cmds.clone(),
            priority: 0.0,
            clean: false,
            visiting: true,
        });
        self.nodes.insert(key, index);
        self.stack.push(index);

        for dep in &decl.deps {
            let child = match &dep.kind {
                DependencyKind::Target(name) => self.visit(path, name)?,
                DependencyKind::Imported { import, target } => {
                    // Classification guarantees the import exists.
                    let import = &file.imports[import];
                    let imported = resolve_import(&dir, &import.path)?;
                    self.visit(&imported, target)?
                }
                DependencyKind::Glob(glob) => {
                    self.graph[index].globs.push(glob.clone());
                    continue;
                }
            };
            self.graph.update_edge(child, index, ());
        }

        self.stack.pop();
        self.graph[index].visiting = false;
        Ok(index)
    }

    fn load(&mut self, path: &Utf8Path) -> Result<Arc<Kilnfile>, GraphError> {
        if let Some(file) = self.files.get(path) {
            return Ok(file.clone());
        }

        let source = fs::read_to_string(path).map_err(|source| GraphError::Read {
            path: path.to_owned(),
            source,
        })?;
        let file = conf::parse(&source).map_err(|source| GraphError::Parse {
            path: path.to_owned(),
            source,
        })?;

        tracing::debug!("loaded {path}: {} targets", file.targets.len());

        let file = Arc::new(file);
        self.files.insert(path.to_owned(), file.clone());
        Ok(file)
    }

    fn cycle(&self, index: NodeIndex) -> GraphError {
        let start = self.stack.iter().position(|&i| i == index).unwrap_or(0);
        let chain = self.stack[start..]
            .iter()
            .chain(std::iter::once(&index))
            .map(|&i| self.graph[i].to_string())
            .collect();

        GraphError::Cycle { chain }
    }
}

/// Resolves an import path relative to the importing file's directory. A
/// directory stands for the configuration file inside it.
fn resolve_import(dir: &Utf8Path, import: &str) -> Result<Utf8PathBuf, GraphError> {
    let mut path = dir.join(import);
    if path.is_dir() {
        path.push(CONFIG_FILE_NAME);
    }
    canonical(&path)
}

fn canonical(path: &Utf8Path) -> Result<Utf8PathBuf, GraphError> {
    let resolved = path.canonicalize().map_err(|source| GraphError::Read {
        path: path.to_owned(),
        source,
    })?;
    Ok(Utf8PathBuf::try_from(resolved)?)
}
