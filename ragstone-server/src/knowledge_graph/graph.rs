// Copyright 2025 Ragstone (https://github.com/ragstone)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Knowledge graph storage: adjacency lists over concurrent maps, with
//! GraphML persistence. The writer emits one element per line, which is
//! also what the loader expects; the format round-trips through standard
//! graph tooling.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use ragstone_core::ServiceError;

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: u64,
    pub name: String,
    pub entity_type: String,
    pub occurrence_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub relation: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subgraph {
    pub center: String,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub truncated: bool,
}

pub struct KnowledgeGraph {
    entities: DashMap<String, GraphNode>,
    outgoing: DashMap<String, Vec<GraphEdge>>,
    incoming: DashMap<String, Vec<GraphEdge>>,
    next_id: AtomicU64,
    path: PathBuf,
}

impl KnowledgeGraph {
    /// Open the graph backing `path`, loading existing GraphML content.
    pub fn with_persistence(path: PathBuf) -> Result<Self, ServiceError> {
        let graph = Self {
            entities: DashMap::new(),
            outgoing: DashMap::new(),
            incoming: DashMap::new(),
            next_id: AtomicU64::new(1),
            path,
        };
        if graph.path.exists() {
            graph.load()?;
        } else {
            graph.save()?;
        }
        Ok(graph)
    }

    pub fn get_or_create_entity(&self, name: &str, entity_type: &str) -> String {
        let key = normalize_entity_name(name);
        self.entities
            .entry(key.clone())
            .and_modify(|node| node.occurrence_count += 1)
            .or_insert_with(|| GraphNode {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                name: key.clone(),
                entity_type: entity_type.to_string(),
                occurrence_count: 1,
            });
        key
    }

    /// Record a directed relation; re-observing an existing edge bumps
    /// its weight instead of duplicating it.
    pub fn add_relation(&self, source: &str, target: &str, relation: &str) {
        let source = self.get_or_create_entity(source, "concept");
        let target = self.get_or_create_entity(target, "concept");
        if source == target {
            return;
        }

        let mut out = self.outgoing.entry(source.clone()).or_default();
        if let Some(edge) = out
            .iter_mut()
            .find(|e| e.target == target && e.relation == relation)
        {
            edge.weight += 1.0;
        } else {
            let edge = GraphEdge {
                source: source.clone(),
                target: target.clone(),
                relation: relation.to_string(),
                weight: 1.0,
            };
            out.push(edge.clone());
            self.incoming.entry(target).or_default().push(edge);
        }
    }

    pub fn get_node(&self, name: &str) -> Option<GraphNode> {
        self.entities.get(&normalize_entity_name(name)).map(|n| n.clone())
    }

    /// 1-hop neighbor names, both directions.
    pub fn neighbors(&self, name: &str) -> Vec<String> {
        let key = normalize_entity_name(name);
        let mut seen = HashSet::new();
        if let Some(out) = self.outgoing.get(&key) {
            for edge in out.iter() {
                seen.insert(edge.target.clone());
            }
        }
        if let Some(inc) = self.incoming.get(&key) {
            for edge in inc.iter() {
                seen.insert(edge.source.clone());
            }
        }
        let mut neighbors: Vec<String> = seen.into_iter().collect();
        neighbors.sort();
        neighbors
    }

    /// BFS subgraph around a label, breadth-first up to `max_depth`,
    /// truncated at `max_nodes`.
    pub fn subgraph(&self, label: &str, max_depth: usize, max_nodes: usize) -> Result<Subgraph, ServiceError> {
        let center = normalize_entity_name(label);
        if !self.entities.contains_key(&center) {
            return Err(ServiceError::NotFound(format!("graph node '{label}'")));
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        let mut truncated = false;
        visited.insert(center.clone());
        queue.push_back((center.clone(), 0));

        while let Some((name, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for neighbor in self.neighbors(&name) {
                if visited.len() >= max_nodes {
                    truncated = true;
                    break;
                }
                if visited.insert(neighbor.clone()) {
                    queue.push_back((neighbor, depth + 1));
                }
            }
        }

        let mut nodes: Vec<GraphNode> = visited
            .iter()
            .filter_map(|name| self.entities.get(name).map(|n| n.clone()))
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        let mut edges = Vec::new();
        for name in &visited {
            if let Some(out) = self.outgoing.get(name) {
                for edge in out.iter() {
                    if visited.contains(&edge.target) {
                        edges.push(edge.clone());
                    }
                }
            }
        }
        edges.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));

        Ok(Subgraph {
            center,
            nodes,
            edges,
            truncated,
        })
    }

    /// Entities whose names share a token with the query text. Linear in
    /// the entity table, which stays small relative to the chunk index.
    pub fn match_entities(&self, text: &str, limit: usize) -> Vec<String> {
        let tokens: Vec<String> = text
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.len() > 2)
            .map(str::to_string)
            .collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut matched: Vec<(u32, String)> = self
            .entities
            .iter()
            .filter(|node| tokens.iter().any(|t| node.key().contains(t.as_str())))
            .map(|node| (node.occurrence_count, node.key().clone()))
            .collect();
        // Most-observed entities first.
        matched.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        matched.into_iter().take(limit).map(|(_, name)| name).collect()
    }

    /// Every edge touching an entity, both directions.
    pub fn edges_of(&self, name: &str) -> Vec<GraphEdge> {
        let key = normalize_entity_name(name);
        let mut edges = Vec::new();
        if let Some(out) = self.outgoing.get(&key) {
            edges.extend(out.iter().cloned());
        }
        if let Some(inc) = self.incoming.get(&key) {
            edges.extend(inc.iter().cloned());
        }
        edges
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            node_count: self.entities.len(),
            edge_count: self.outgoing.iter().map(|e| e.value().len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&self) -> Result<GraphStats, ServiceError> {
        let stats = self.stats();
        self.entities.clear();
        self.outgoing.clear();
        self.incoming.clear();
        self.save()?;
        Ok(stats)
    }

    /// Persist as GraphML, temp file + rename.
    pub fn save(&self) -> Result<(), ServiceError> {
        use std::io::Write;

        let tmp = self.path.with_extension("graphml.tmp");
        {
            let mut w = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
            writeln!(w, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
            writeln!(w, r#"<graphml xmlns="http://graphml.graphdrawing.org/xmlns">"#)?;
            writeln!(w, r#"  <key id="d0" for="node" attr.name="entity_type" attr.type="string"/>"#)?;
            writeln!(w, r#"  <key id="d1" for="node" attr.name="occurrence" attr.type="int"/>"#)?;
            writeln!(w, r#"  <key id="d2" for="edge" attr.name="relation" attr.type="string"/>"#)?;
            writeln!(w, r#"  <key id="d3" for="edge" attr.name="weight" attr.type="double"/>"#)?;
            writeln!(w, r#"  <graph id="G" edgedefault="directed">"#)?;

            let mut nodes: Vec<GraphNode> = self.entities.iter().map(|n| n.clone()).collect();
            nodes.sort_by(|a, b| a.name.cmp(&b.name));
            for node in &nodes {
                writeln!(
                    w,
                    r#"    <node id="{}"><data key="d0">{}</data><data key="d1">{}</data></node>"#,
                    xml_escape(&node.name),
                    xml_escape(&node.entity_type),
                    node.occurrence_count
                )?;
            }

            let mut edges: Vec<GraphEdge> = self
                .outgoing
                .iter()
                .flat_map(|e| e.value().clone())
                .collect();
            edges.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
            for edge in &edges {
                writeln!(
                    w,
                    r#"    <edge source="{}" target="{}"><data key="d2">{}</data><data key="d3">{}</data></edge>"#,
                    xml_escape(&edge.source),
                    xml_escape(&edge.target),
                    xml_escape(&edge.relation),
                    edge.weight
                )?;
            }

            writeln!(w, "  </graph>")?;
            writeln!(w, "</graphml>")?;
            w.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load the one-element-per-line GraphML this module writes.
    fn load(&self) -> Result<(), ServiceError> {
        let content = std::fs::read_to_string(&self.path)?;
        let mut max_id = 0u64;

        for line in content.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("<node id=\"") {
                let Some(name_end) = rest.find('"') else { continue };
                let name = xml_unescape(&rest[..name_end]);
                let entity_type = extract_data(rest, "d0").unwrap_or_else(|| "concept".to_string());
                let occurrence: u32 = extract_data(rest, "d1")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1);
                max_id += 1;
                self.entities.insert(
                    name.clone(),
                    GraphNode {
                        id: max_id,
                        name,
                        entity_type,
                        occurrence_count: occurrence,
                    },
                );
            } else if let Some(rest) = line.strip_prefix("<edge source=\"") {
                let Some(source_end) = rest.find('"') else { continue };
                let source = xml_unescape(&rest[..source_end]);
                let Some(target_part) = rest[source_end..].split("target=\"").nth(1) else {
                    continue;
                };
                let Some(target_end) = target_part.find('"') else { continue };
                let target = xml_unescape(&target_part[..target_end]);
                let relation = extract_data(rest, "d2").unwrap_or_else(|| "related_to".to_string());
                let weight: f64 = extract_data(rest, "d3")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1.0);

                let edge = GraphEdge {
                    source: source.clone(),
                    target: target.clone(),
                    relation,
                    weight,
                };
                self.outgoing.entry(source).or_default().push(edge.clone());
                self.incoming.entry(target).or_default().push(edge);
            }
        }

        self.next_id.store(max_id + 1, Ordering::SeqCst);
        Ok(())
    }
}

fn normalize_entity_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn extract_data(line: &str, key: &str) -> Option<String> {
    let marker = format!("<data key=\"{key}\">");
    let start = line.find(&marker)? + marker.len();
    let end = line[start..].find("</data>")? + start;
    Some(xml_unescape(&line[start..end]))
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn graph(dir: &Path) -> KnowledgeGraph {
        KnowledgeGraph::with_persistence(dir.join("graph_chunk_entity_relation.graphml")).unwrap()
    }

    #[test]
    fn test_relation_builds_nodes_and_edges() {
        let dir = TempDir::new().unwrap();
        let g = graph(dir.path());
        g.add_relation("Machine Learning", "Artificial Intelligence", "part_of");

        let stats = g.stats();
        assert_eq!(stats.node_count, 2);
        assert_eq!(stats.edge_count, 1);
        assert_eq!(
            g.neighbors("machine learning"),
            vec!["artificial intelligence"]
        );
    }

    #[test]
    fn test_repeated_relation_bumps_weight() {
        let dir = TempDir::new().unwrap();
        let g = graph(dir.path());
        g.add_relation("a", "b", "related_to");
        g.add_relation("a", "b", "related_to");
        assert_eq!(g.stats().edge_count, 1);
        let sub = g.subgraph("a", 1, 10).unwrap();
        assert_eq!(sub.edges[0].weight, 2.0);
    }

    #[test]
    fn test_graphml_round_trip() {
        let dir = TempDir::new().unwrap();
        {
            let g = graph(dir.path());
            g.add_relation("rust & c++", "systems \"programming\"", "used_for");
            g.save().unwrap();
        }
        let g = graph(dir.path());
        assert_eq!(g.stats().node_count, 2);
        assert!(g.get_node("rust & c++").is_some());
        assert_eq!(g.neighbors("rust & c++"), vec!["systems \"programming\""]);
    }

    #[test]
    fn test_subgraph_depth_and_truncation() {
        let dir = TempDir::new().unwrap();
        let g = graph(dir.path());
        g.add_relation("a", "b", "r");
        g.add_relation("b", "c", "r");
        g.add_relation("c", "d", "r");

        let sub = g.subgraph("a", 1, 100).unwrap();
        assert_eq!(sub.nodes.len(), 2);

        let sub = g.subgraph("a", 3, 100).unwrap();
        assert_eq!(sub.nodes.len(), 4);

        let sub = g.subgraph("a", 3, 2).unwrap();
        assert!(sub.truncated);
        assert_eq!(sub.nodes.len(), 2);
    }

    #[test]
    fn test_subgraph_unknown_label_is_not_found() {
        let dir = TempDir::new().unwrap();
        let g = graph(dir.path());
        assert!(matches!(
            g.subgraph("ghost", 1, 10),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn test_clear_persists_empty_graph() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph_chunk_entity_relation.graphml");
        {
            let g = graph(dir.path());
            g.add_relation("a", "b", "r");
            g.save().unwrap();
            let removed = g.clear().unwrap();
            assert_eq!(removed.node_count, 2);
        }
        let g = KnowledgeGraph::with_persistence(path).unwrap();
        assert!(g.is_empty());
    }
}
