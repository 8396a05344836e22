//! The build graph: named nodes in ordered scheduling groups.
//!
//! Every node of a group completes before any node of the next group
//! starts. Within a group, nodes are ordered only by their declared
//! dependencies. Dependencies on nodes of earlier groups are satisfied by
//! the group barrier; a dependency on a later group is a graph error.
//!
//! The [`TEST_GROUP`] is always scheduled last, whenever it was created.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::env::ArtifactSource;
use crate::hook::TestProducer;
use crate::model::{BuildModel, TargetDef, TargetKind};
use crate::step::{InstallStep, LinkStep};
use crate::task::TestTask;

/// Name of the group holding every test task.
pub const TEST_GROUP: &str = "tests";

/// Index of a node in its [`BuildGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// What a node does when scheduled.
#[derive(Debug)]
pub enum NodeKind {
    /// Run a link command.
    Link(LinkStep),
    /// Copy another node's output.
    Install(InstallStep),
    /// Run a built test executable.
    Test(TestTask),
}

/// A schedulable unit of work.
#[derive(Debug)]
pub struct Node {
    /// Unique node name.
    pub name: String,
    /// The work itself.
    pub kind: NodeKind,
    /// Nodes that must complete first.
    pub deps: Vec<NodeId>,
    /// Index into [`BuildGraph::groups`].
    pub group: usize,
}

impl Node {
    /// The node's test capability, if it has one.
    pub fn as_test_producer(&self) -> Option<&dyn TestProducer> {
        match self.kind {
            NodeKind::Link(ref step) => Some(step as &dyn TestProducer),
            NodeKind::Install(_) | NodeKind::Test(_) => None,
        }
    }
}

/// An ordered scheduling barrier.
#[derive(Debug)]
pub struct Group {
    /// Group name.
    pub name: String,
    /// Member nodes, in insertion order.
    pub nodes: Vec<NodeId>,
}

/// Nodes, groups and the producer → test mapping.
#[derive(Debug, Default)]
pub struct BuildGraph {
    nodes: Vec<Node>,
    groups: Vec<Group>,
    by_name: HashMap<String, NodeId>,
    tests: HashMap<NodeId, NodeId>,
}

impl BuildGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the group called `name`, creating it if needed.
    pub fn add_group(&mut self, name: &str) -> usize {
        if let Some(idx) = self.group_index(name) {
            return idx;
        }
        self.groups.push(Group {
            name: name.to_string(),
            nodes: Vec::new(),
        });
        self.groups.len() - 1
    }

    /// Index of the group called `name`.
    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.name == name)
    }

    /// Index of the test group, creating it on first use.
    pub fn ensure_test_group(&mut self) -> usize {
        self.add_group(TEST_GROUP)
    }

    /// All groups, in creation order.
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Group indices in execution order: creation order, test group last.
    pub fn schedule_order(&self) -> Vec<usize> {
        let (tests, mut order): (Vec<usize>, Vec<usize>) =
            (0..self.groups.len()).partition(|&i| self.groups[i].name == TEST_GROUP);
        order.extend(tests);
        order
    }

    /// Add a node to `group`.
    pub fn add_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        deps: Vec<NodeId>,
        group: usize,
    ) -> Result<NodeId> {
        if self.by_name.contains_key(name) {
            bail!("duplicate node '{name}'");
        }
        let Some(members) = self.groups.get_mut(group) else {
            bail!("node '{name}' added to unknown group {group}");
        };
        let id = NodeId(self.nodes.len());
        members.nodes.push(id);
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
            deps,
            group,
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Record `test` as the test task of `producer`.
    pub fn set_test(&mut self, producer: NodeId, test: NodeId) {
        self.tests.insert(producer, test);
    }

    /// The test task attached to `producer`, if any.
    pub fn test_for(&self, producer: NodeId) -> Option<NodeId> {
        self.tests.get(&producer).copied()
    }

    /// Look up a node by name.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// The node with the given id.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this graph.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of every node, in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + use<> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Names of `id`'s dependencies.
    pub fn dep_names(&self, id: NodeId) -> Vec<String> {
        self.node(id)
            .deps
            .iter()
            .map(|&dep| self.node(dep).name.clone())
            .collect()
    }

    /// Lower a validated manifest into a graph rooted at `root`.
    ///
    /// Groups are created in the order targets first mention them.
    pub fn from_model(model: &BuildModel, root: &Path) -> Result<Self> {
        let mut graph = Self::new();
        for def in &model.targets {
            let kind = if def.kind.is_link() {
                NodeKind::Link(LinkStep::from_target(def, root)?)
            } else {
                NodeKind::Install(install_step(def, root, model)?)
            };
            if def.group_name() == TEST_GROUP {
                bail!("group '{TEST_GROUP}' is reserved for test tasks (target '{}')", def.name);
            }
            let group = graph.add_group(def.group_name());
            graph.add_node(&def.name, kind, Vec::new(), group)?;
        }

        let order = graph.schedule_order();
        let position = |group: usize| order.iter().position(|&g| g == group);
        for def in &model.targets {
            let id = graph
                .node_id(&def.name)
                .with_context(|| format!("target '{}' missing from graph", def.name))?;
            let mut names: Vec<&str> = def.deps.iter().map(String::as_str).collect();
            if let Some(ref source) = def.source {
                if !names.contains(&source.as_str()) {
                    names.push(source);
                }
            }

            let mut deps = Vec::with_capacity(names.len());
            for name in names {
                let dep = graph
                    .node_id(name)
                    .with_context(|| format!("target '{}' depends on unknown target '{name}'", def.name))?;
                let (own, theirs) = (graph.node(id).group, graph.node(dep).group);
                if position(theirs) > position(own) {
                    bail!(
                        "target '{}' in group '{}' depends on '{name}' in later group '{}'",
                        def.name,
                        graph.groups[own].name,
                        graph.groups[theirs].name
                    );
                }
                deps.push(dep);
            }
            graph.nodes[id.0].deps = deps;
        }

        Ok(graph)
    }
}

fn install_step(def: &TargetDef, root: &Path, model: &BuildModel) -> Result<InstallStep> {
    let source = def.source.as_deref().unwrap_or_default();
    let Some(declared) = model.targets.iter().find(|t| t.name == source) else {
        bail!("install target '{}' copies unknown target '{source}'", def.name);
    };
    if declared.kind == TargetKind::Install {
        bail!("install target '{}' copies '{source}', which is not a link target", def.name);
    }
    let Some(ref output) = declared.output else {
        bail!(
            "install target '{}' copies '{source}', which has no linked output",
            def.name
        );
    };
    Ok(InstallStep {
        target: def.name.clone(),
        source: source.to_string(),
        source_output: root.join(output),
        dest_dir: root.join(def.dest.as_deref().unwrap_or_default()),
    })
}

impl ArtifactSource for BuildGraph {
    fn linked_outputs(&self) -> Vec<PathBuf> {
        self.schedule_order()
            .into_iter()
            .flat_map(|g| self.groups[g].nodes.iter())
            .filter_map(|&id| self.node(id).as_test_producer())
            .filter_map(|producer| producer.link_output().map(Path::to_path_buf))
            .collect()
    }
}
