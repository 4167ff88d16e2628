//! Left-to-right layered layout for parsed DOT graphs.
//!
//! Strongly connected groups share a layer; layers follow the longest path
//! through the condensed graph. Coordinates are in terminal cells with y
//! growing downwards.

use crate::dot::DotGraph;
use petgraph::algo::{condensation, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

const MAX_LABEL_CHARS: usize = 24;
const NODE_HEIGHT: f64 = 3.0;
const LAYER_GAP: f64 = 6.0;
const ROW_GAP: f64 = 1.0;
const CLUSTER_MARGIN: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct LaidOutNode {
    pub id: String,
    pub label: String,
    pub layer: usize,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaidOutCluster {
    pub name: String,
    pub depth: usize,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaidOutEdge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphLayout {
    pub nodes: Vec<LaidOutNode>,
    pub clusters: Vec<LaidOutCluster>,
    pub edges: Vec<LaidOutEdge>,
    pub width: f64,
    pub height: f64,
}

#[derive(Clone, Copy)]
struct Rect {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

impl Rect {
    fn union(self, other: Rect) -> Rect {
        Rect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    fn grow(self, by: f64) -> Rect {
        Rect {
            x0: self.x0 - by,
            y0: self.y0 - by,
            x1: self.x1 + by,
            y1: self.y1 + by,
        }
    }
}

fn truncate_label(label: &str) -> String {
    if label.chars().count() <= MAX_LABEL_CHARS {
        return label.to_string();
    }
    let mut out: String = label.chars().take(MAX_LABEL_CHARS - 1).collect();
    out.push('…');
    out
}

impl GraphLayout {
    pub fn compute(graph: &DotGraph) -> Self {
        let visible: Vec<usize> = graph
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| !node.is_invisible())
            .map(|(idx, _)| idx)
            .collect();
        if visible.is_empty() {
            return GraphLayout::default();
        }

        let mut dag: DiGraph<usize, ()> = DiGraph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
        for idx in &visible {
            let node_index = dag.add_node(*idx);
            index_of.insert(graph.nodes[*idx].id.as_str(), node_index);
        }
        for edge in &graph.edges {
            if let (Some(from), Some(to)) = (
                index_of.get(edge.from.as_str()),
                index_of.get(edge.to.as_str()),
            ) {
                dag.add_edge(*from, *to, ());
            }
        }

        let condensed = condensation(dag, true);
        let order = toposort(&condensed, None)
            .unwrap_or_else(|_| condensed.node_indices().collect());
        let mut group_layer = vec![0usize; condensed.node_count()];
        for group in &order {
            let layer = group_layer[group.index()];
            for next in condensed.neighbors_directed(*group, Direction::Outgoing) {
                if group_layer[next.index()] < layer + 1 {
                    group_layer[next.index()] = layer + 1;
                }
            }
        }

        let mut node_layer: HashMap<usize, usize> = HashMap::new();
        for group in condensed.node_indices() {
            for member in &condensed[group] {
                node_layer.insert(*member, group_layer[group.index()]);
            }
        }

        let layer_count = node_layer.values().copied().max().unwrap_or(0) + 1;
        let mut layers: Vec<Vec<usize>> = vec![Vec::new(); layer_count];
        for idx in &visible {
            let layer = node_layer.get(idx).copied().unwrap_or(0);
            layers[layer].push(*idx);
        }
        // Keep members of the same cluster next to each other within a layer.
        for layer in &mut layers {
            layer.sort_by_key(|idx| (cluster_path(graph, graph.nodes[*idx].cluster), *idx));
        }

        let labels: HashMap<usize, String> = visible
            .iter()
            .map(|idx| (*idx, truncate_label(&graph.nodes[*idx].display_label())))
            .collect();

        let mut nodes = Vec::with_capacity(visible.len());
        let mut rects: HashMap<usize, Rect> = HashMap::new();
        let mut x = 0.0;
        for (layer_idx, layer) in layers.iter().enumerate() {
            let column_width = layer
                .iter()
                .map(|idx| labels[idx].chars().count() as f64 + 4.0)
                .fold(0.0, f64::max);
            let mut y = 0.0;
            for idx in layer {
                let width = labels[idx].chars().count() as f64 + 4.0;
                rects.insert(
                    *idx,
                    Rect {
                        x0: x,
                        y0: y,
                        x1: x + width,
                        y1: y + NODE_HEIGHT,
                    },
                );
                nodes.push(LaidOutNode {
                    id: graph.nodes[*idx].id.clone(),
                    label: labels[idx].clone(),
                    layer: layer_idx,
                    x,
                    y,
                    width,
                    height: NODE_HEIGHT,
                });
                y += NODE_HEIGHT + ROW_GAP;
            }
            x += column_width + LAYER_GAP;
        }

        // Clusters are stored parent-first, so walking backwards sees every
        // child before its parent.
        let mut cluster_rects: Vec<Option<Rect>> = vec![None; graph.clusters.len()];
        for idx in (0..graph.clusters.len()).rev() {
            let mut bounds: Option<Rect> = None;
            for (node_idx, node) in graph.nodes.iter().enumerate() {
                if node.cluster != Some(idx) {
                    continue;
                }
                if let Some(rect) = rects.get(&node_idx) {
                    let grown = rect.grow(CLUSTER_MARGIN);
                    bounds = Some(bounds.map_or(grown, |b| b.union(grown)));
                }
            }
            for child in graph.cluster_children(Some(idx)) {
                if let Some(rect) = cluster_rects[child] {
                    let grown = rect.grow(CLUSTER_MARGIN);
                    bounds = Some(bounds.map_or(grown, |b| b.union(grown)));
                }
            }
            cluster_rects[idx] = bounds;
        }

        let mut clusters = Vec::new();
        for (idx, cluster) in graph.clusters.iter().enumerate() {
            let Some(rect) = cluster_rects[idx] else {
                continue;
            };
            if cluster.is_invisible() || !cluster.has_label() {
                continue;
            }
            clusters.push(LaidOutCluster {
                name: cluster.display_name(),
                depth: cluster_path(graph, Some(idx)).len(),
                x: rect.x0,
                y: rect.y0,
                width: rect.x1 - rect.x0,
                height: rect.y1 - rect.y0,
            });
        }

        let mut edges = Vec::new();
        for edge in &graph.edges {
            if edge.from == edge.to {
                continue;
            }
            let from = graph.nodes.iter().position(|node| node.id == edge.from);
            let to = graph.nodes.iter().position(|node| node.id == edge.to);
            let (Some(from_rect), Some(to_rect)) = (
                from.and_then(|idx| rects.get(&idx)),
                to.and_then(|idx| rects.get(&idx)),
            ) else {
                continue;
            };
            let (x1, x2) = if to_rect.x0 > from_rect.x1 {
                (from_rect.x1, to_rect.x0)
            } else {
                (
                    (from_rect.x0 + from_rect.x1) / 2.0,
                    (to_rect.x0 + to_rect.x1) / 2.0,
                )
            };
            edges.push(LaidOutEdge {
                from: edge.from.clone(),
                to: edge.to.clone(),
                label: edge.attrs.get("label").cloned(),
                x1,
                y1: (from_rect.y0 + from_rect.y1) / 2.0,
                x2,
                y2: (to_rect.y0 + to_rect.y1) / 2.0,
            });
        }

        let mut layout = GraphLayout {
            nodes,
            clusters,
            edges,
            width: 0.0,
            height: 0.0,
        };
        layout.normalize();
        layout
    }

    /// Shift everything so the top-left corner is the origin and record the
    /// overall extent.
    fn normalize(&mut self) {
        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        for node in &self.nodes {
            min_x = min_x.min(node.x);
            min_y = min_y.min(node.y);
            max_x = max_x.max(node.x + node.width);
            max_y = max_y.max(node.y + node.height);
        }
        for cluster in &self.clusters {
            min_x = min_x.min(cluster.x);
            min_y = min_y.min(cluster.y);
            max_x = max_x.max(cluster.x + cluster.width);
            max_y = max_y.max(cluster.y + cluster.height);
        }
        if !min_x.is_finite() {
            return;
        }
        for node in &mut self.nodes {
            node.x -= min_x;
            node.y -= min_y;
        }
        for cluster in &mut self.clusters {
            cluster.x -= min_x;
            cluster.y -= min_y;
        }
        for edge in &mut self.edges {
            edge.x1 -= min_x;
            edge.x2 -= min_x;
            edge.y1 -= min_y;
            edge.y2 -= min_y;
        }
        self.width = max_x - min_x;
        self.height = max_y - min_y;
    }

    pub fn node(&self, id: &str) -> Option<&LaidOutNode> {
        self.nodes.iter().find(|node| node.id == id)
    }
}

/// Cluster indices from the outermost cluster down to `cluster`.
fn cluster_path(graph: &DotGraph, cluster: Option<usize>) -> Vec<usize> {
    let mut path = Vec::new();
    let mut current = cluster;
    while let Some(idx) = current {
        path.push(idx);
        current = graph.clusters[idx].parent;
    }
    path.reverse();
    path
}
