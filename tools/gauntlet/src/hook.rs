//! Test registration: attach a test task to every node that links a test
//! executable.

use std::path::Path;

use anyhow::Result;

use crate::graph::{BuildGraph, NodeId, NodeKind};
use crate::task::{TestArtifact, TestTask};

/// Capability of a build-graph node whose output may be run as a test.
pub trait TestProducer {
    /// Name of the producing node.
    fn producer_name(&self) -> &str;

    /// Path of the linked output, if the node links one.
    fn link_output(&self) -> Option<&Path>;

    /// The artifact to run, if the node is marked as a test.
    fn test_artifact(&self) -> Option<TestArtifact>;
}

/// Attach a test task to `producer`.
///
/// Returns the new test node, or `None` when nothing was attached: the
/// node is not a test producer, has no link output, is not marked as a test,
/// or already carries a test task.
pub fn attach_test(graph: &mut BuildGraph, producer: NodeId) -> Result<Option<NodeId>> {
    if graph.test_for(producer).is_some() {
        return Ok(None);
    }
    let Some(capability) = graph.node(producer).as_test_producer() else {
        return Ok(None);
    };
    if capability.link_output().is_none() {
        return Ok(None);
    }
    let Some(artifact) = capability.test_artifact() else {
        return Ok(None);
    };
    let name = format!("{}#test", capability.producer_name());

    let group = graph.ensure_test_group();
    let id = graph.add_node(&name, NodeKind::Test(TestTask::new(artifact)), vec![producer], group)?;
    graph.set_test(producer, id);
    crate::vprintln!("  registered test {name}");
    Ok(Some(id))
}

/// Attach test tasks to every eligible node. Returns how many were added.
pub fn register_tests(graph: &mut BuildGraph) -> Result<usize> {
    let mut attached = 0;
    for id in graph.node_ids() {
        if attach_test(graph, id)?.is_some() {
            attached += 1;
        }
    }
    Ok(attached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TEST_GROUP;
    use crate::model::parse_manifest;

    fn graph() -> BuildGraph {
        let model = parse_manifest(
            r#"
            [project]
            name = "demo"

            [[target]]
            name = "util"
            kind = "shlib"
            command = ["cc", "-shared", "-o", "{output}"]
            output = "build/lib/libutil.so"

            [[target]]
            name = "util_test"
            features = ["test"]
            command = ["cc", "-o", "{output}"]
            output = "build/tests/util_test"
            deps = ["util"]

            [[target]]
            name = "install-util"
            kind = "install"
            source = "util"
            dest = "dist"
            group = "install"
            "#,
        )
        .unwrap();
        BuildGraph::from_model(&model, Path::new("/proj")).unwrap()
    }

    #[test]
    fn only_tagged_link_outputs_get_tests() {
        let mut graph = graph();
        assert_eq!(register_tests(&mut graph).unwrap(), 1);

        let producer = graph.node_id("util_test").unwrap();
        let test = graph.test_for(producer).expect("test attached");
        let node = graph.node(test);
        assert_eq!(node.deps, vec![producer]);
        assert_eq!(graph.groups()[node.group].name, TEST_GROUP);
        let NodeKind::Test(ref task) = node.kind else {
            panic!("expected a test node");
        };
        assert_eq!(task.name(), "util_test");
        assert_eq!(task.artifact().path, Path::new("/proj/build/tests/util_test"));

        assert!(graph.test_for(graph.node_id("util").unwrap()).is_none());
        assert!(graph.test_for(graph.node_id("install-util").unwrap()).is_none());
    }

    #[test]
    fn registration_is_idempotent() {
        let mut graph = graph();
        register_tests(&mut graph).unwrap();
        let before = graph.len();

        assert_eq!(register_tests(&mut graph).unwrap(), 0);
        let producer = graph.node_id("util_test").unwrap();
        assert_eq!(attach_test(&mut graph, producer).unwrap(), None);
        assert_eq!(graph.len(), before);
        assert_eq!(
            graph.groups().iter().filter(|g| g.name == TEST_GROUP).count(),
            1
        );
    }

    #[test]
    fn tests_run_after_install_group() {
        let mut graph = graph();
        register_tests(&mut graph).unwrap();
        let last = *graph.schedule_order().last().unwrap();
        assert_eq!(graph.groups()[last].name, TEST_GROUP);
    }

    #[test]
    fn graph_without_tests_gets_no_test_group() {
        let model = parse_manifest(
            r#"
            [project]
            name = "demo"

            [[target]]
            name = "app"
            command = ["true"]
            output = "out/app"
            "#,
        )
        .unwrap();
        let mut graph = BuildGraph::from_model(&model, Path::new("/proj")).unwrap();
        assert_eq!(register_tests(&mut graph).unwrap(), 0);
        assert!(graph.group_index(TEST_GROUP).is_none());
    }
}
