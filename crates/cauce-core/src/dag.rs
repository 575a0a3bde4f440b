//! Grafo de ejecución tipado.
//!
//! Se construye una vez por run desde la configuración y es inmutable después.
//! La validación es fail-fast: cualquier ruta de gate sin destino resoluble o
//! rama de fork sin edge registrado levanta `RouteValidation` ANTES de
//! procesar la primera fila.
//!
//! Los ids acá son lógicos ("transform_0", "sink_default"); el orquestador
//! los liga a los node_id físicos que asigna el recorder al registrar.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::contracts::{GateSettings, NodeKind, RoutingMode};
use crate::errors::EngineError;

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub node_id: String,
    pub kind: NodeKind,
    pub plugin_name: String,
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub label: String,
    pub mode: RoutingMode,
}

/// DAG inmutable con los dos mapas de lookup que usan los executors:
/// `(node, label) → edge` y `(node, label) → sink name`.
#[derive(Debug)]
pub struct ExecutionGraph {
    nodes: IndexMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
    edge_lookup: HashMap<(String, String), usize>,
    route_resolution: HashMap<(String, String), String>,
    sink_ids: IndexMap<String, String>,
    transform_ids: Vec<String>,
    config_gate_ids: HashMap<String, String>,
    output_sink: String,
}

impl ExecutionGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn node(&self, node_id: &str) -> Option<&GraphNode> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Edge saliente de `node_id` con la etiqueta dada.
    pub fn edge(&self, node_id: &str, label: &str) -> Option<&GraphEdge> {
        self.edge_lookup
            .get(&(node_id.to_string(), label.to_string()))
            .map(|idx| &self.edges[*idx])
    }

    /// Resolución de etiqueta de ruta a nombre de sink (gates de config).
    pub fn route_resolution(&self, node_id: &str, label: &str) -> Option<&str> {
        self.route_resolution
            .get(&(node_id.to_string(), label.to_string()))
            .map(String::as_str)
    }

    /// `sink name → node_id` en orden de registro.
    pub fn sink_ids(&self) -> &IndexMap<String, String> {
        &self.sink_ids
    }

    /// Ids de nodos transform/gate en orden de paso.
    pub fn transform_ids(&self) -> &[String] {
        &self.transform_ids
    }

    pub fn config_gate_id(&self, gate_name: &str) -> Option<&str> {
        self.config_gate_ids.get(gate_name).map(String::as_str)
    }

    pub fn output_sink(&self) -> &str {
        &self.output_sink
    }
}

/// Builder mutable; `finish` valida y congela.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: IndexMap<String, GraphNode>,
    duplicate_nodes: Vec<String>,
    edges: Vec<GraphEdge>,
    route_resolution: HashMap<(String, String), String>,
    sink_ids: IndexMap<String, String>,
    transform_ids: Vec<String>,
    config_gate_ids: HashMap<String, String>,
    output_sink: Option<String>,
}

impl GraphBuilder {
    pub fn add_node(&mut self,
                    node_id: impl Into<String>,
                    kind: NodeKind,
                    plugin_name: impl Into<String>)
                    -> &mut Self {
        let node_id = node_id.into();
        let previous = self.nodes.insert(node_id.clone(),
                                         GraphNode { node_id: node_id.clone(),
                                                     kind,
                                                     plugin_name: plugin_name.into() });
        if previous.is_some() {
            self.duplicate_nodes.push(node_id);
        }
        self
    }

    pub fn add_edge(&mut self,
                    from: impl Into<String>,
                    to: impl Into<String>,
                    label: impl Into<String>,
                    mode: RoutingMode)
                    -> &mut Self {
        self.edges.push(GraphEdge { from: from.into(),
                                    to: to.into(),
                                    label: label.into(),
                                    mode });
        self
    }

    pub fn add_route_resolution(&mut self,
                                node_id: impl Into<String>,
                                label: impl Into<String>,
                                sink_name: impl Into<String>)
                                -> &mut Self {
        self.route_resolution
            .insert((node_id.into(), label.into()), sink_name.into());
        self
    }

    pub fn register_sink(&mut self,
                         sink_name: impl Into<String>,
                         node_id: impl Into<String>)
                         -> &mut Self {
        self.sink_ids.insert(sink_name.into(), node_id.into());
        self
    }

    pub fn push_transform_id(&mut self, node_id: impl Into<String>) -> &mut Self {
        self.transform_ids.push(node_id.into());
        self
    }

    pub fn register_config_gate(&mut self,
                                gate_name: impl Into<String>,
                                node_id: impl Into<String>)
                                -> &mut Self {
        self.config_gate_ids.insert(gate_name.into(), node_id.into());
        self
    }

    pub fn set_output_sink(&mut self, sink_name: impl Into<String>) -> &mut Self {
        self.output_sink = Some(sink_name.into());
        self
    }

    /// Valida y congela el grafo.
    ///
    /// Reglas:
    /// - al menos un source, ids de nodo únicos;
    /// - todo destino en `routes` de un gate resuelve a un sink registrado,
    ///   "continue" o "fork";
    /// - toda rama en `fork_to` tiene edge registrado desde el gate;
    /// - los edges referencian nodos existentes.
    pub fn finish(self, config_gates: &[GateSettings]) -> Result<ExecutionGraph, EngineError> {
        if !self.nodes.values().any(|n| n.kind == NodeKind::Source) {
            return Err(EngineError::RouteValidation(
                "graph needs at least one source node".to_string(),
            ));
        }
        if let Some(dup) = self.duplicate_nodes.first() {
            return Err(EngineError::RouteValidation(format!(
                "duplicate node id {dup:?}"
            )));
        }

        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.from) {
                return Err(EngineError::RouteValidation(format!(
                    "edge {}--{}-->{} references unknown from-node",
                    edge.from, edge.label, edge.to
                )));
            }
            if !self.nodes.contains_key(&edge.to) {
                return Err(EngineError::RouteValidation(format!(
                    "edge {}--{}-->{} references unknown to-node",
                    edge.from, edge.label, edge.to
                )));
            }
        }

        let mut edge_lookup = HashMap::new();
        for (idx, edge) in self.edges.iter().enumerate() {
            edge_lookup.insert((edge.from.clone(), edge.label.clone()), idx);
        }

        for gate in config_gates {
            let gate_node = self.config_gate_ids.get(&gate.name).ok_or_else(|| {
                EngineError::RouteValidation(format!(
                    "config gate {} has no node registered", gate.name
                ))
            })?;
            for (label, target) in &gate.routes {
                match target.as_str() {
                    "continue" => {}
                    "fork" => {
                        if gate.fork_to.is_empty() {
                            return Err(EngineError::RouteValidation(format!(
                                "gate {} routes {label:?} to fork but fork_to is empty",
                                gate.name
                            )));
                        }
                        for branch in &gate.fork_to {
                            let key = (gate_node.clone(), branch.clone());
                            if !edge_lookup.contains_key(&key) {
                                return Err(EngineError::RouteValidation(format!(
                                    "gate {} fork branch {branch:?} has no edge registered",
                                    gate.name
                                )));
                            }
                        }
                    }
                    sink => {
                        if !self.sink_ids.contains_key(sink) {
                            return Err(EngineError::RouteValidation(format!(
                                "gate {} route {label:?} targets unknown sink {sink:?}",
                                gate.name
                            )));
                        }
                    }
                }
            }
        }

        let output_sink = match self.output_sink {
            Some(name) => name,
            None => self.sink_ids
                        .keys()
                        .next()
                        .cloned()
                        .ok_or_else(|| EngineError::RouteValidation(
                            "graph has no sinks registered".to_string(),
                        ))?,
        };
        if !self.sink_ids.contains_key(&output_sink) {
            return Err(EngineError::RouteValidation(format!(
                "output sink {output_sink:?} is not a registered sink"
            )));
        }

        Ok(ExecutionGraph { nodes: self.nodes,
                            edges: self.edges,
                            edge_lookup,
                            route_resolution: self.route_resolution,
                            sink_ids: self.sink_ids,
                            transform_ids: self.transform_ids,
                            config_gate_ids: self.config_gate_ids,
                            output_sink })
    }
}
