//! Layering scheduler
//!
//! Groups graph nodes into layers that can run without synchronisation
//! among themselves. A node goes to the lowest layer above every node it
//! reads. Update nodes always form one trailing layer, so every right-hand
//! side observes the state from before the step.

use log::debug;
use serde::Serialize;

use crate::error::{CompileError, CompileResult};
use crate::graph::{Graph, NodeId};

/// Nodes with no dependencies among themselves
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layer {
    pub nodes: Vec<NodeId>,
}

/// Assign every node of `graph` to a layer
pub fn schedule(graph: &Graph) -> Vec<Layer> {
    let mut level_of = vec![0usize; graph.len()];
    let mut layers: Vec<Layer> = Vec::new();
    let mut updates = Vec::new();

    for (id, node) in graph.iter() {
        if node.op.is_update() {
            updates.push(id);
            continue;
        }
        let level = node
            .dependencies()
            .map(|dep| level_of[dep.0] + 1)
            .max()
            .unwrap_or(0);
        level_of[id.0] = level;
        if layers.len() <= level {
            layers.resize_with(level + 1, || Layer { nodes: Vec::new() });
        }
        layers[level].nodes.push(id);
    }

    layers.push(Layer { nodes: updates });
    layers.retain(|layer| !layer.nodes.is_empty());

    debug!(
        "scheduled {} node(s) into {} layer(s)",
        graph.len(),
        layers.len()
    );
    debug_assert!(verify_layers(graph, &layers).is_ok());
    layers
}

/// Check the layering invariant of a schedule
pub fn verify_layers(graph: &Graph, layers: &[Layer]) -> CompileResult<()> {
    let mut layer_of: Vec<Option<usize>> = vec![None; graph.len()];
    for (k, layer) in layers.iter().enumerate() {
        if layer.nodes.is_empty() {
            return Err(CompileError::value(format!("layer {} is empty", k)));
        }
        for id in &layer.nodes {
            match layer_of.get_mut(id.0) {
                Some(slot) if slot.is_some() => {
                    return Err(CompileError::value(format!(
                        "node {} is scheduled twice",
                        id.0
                    )))
                }
                Some(slot) => *slot = Some(k),
                None => {
                    return Err(CompileError::value(format!(
                        "node {} is not part of the graph",
                        id.0
                    )))
                }
            }
        }
    }

    let last = layers.len().saturating_sub(1);
    let has_updates = graph.updates().next().is_some();
    for (id, node) in graph.iter() {
        let k = layer_of[id.0].ok_or_else(|| {
            CompileError::value(format!("node {} is not scheduled", node.name))
        })?;
        for dep in node.dependencies() {
            if layer_of[dep.0].map_or(true, |d| d >= k) {
                return Err(CompileError::value(format!(
                    "node {} does not come after its dependency {}",
                    node.name,
                    graph.node(dep).name
                )));
            }
        }
        if has_updates && node.op.is_update() != (k == last) {
            return Err(CompileError::value(format!(
                "node {} is on the wrong side of the update barrier",
                node.name
            )));
        }
    }
    Ok(())
}
