//! Pipeline builder: named nodes, type-checked connections, one thread per node

use super::errors::{BuildError, ConnectionError};
use super::node::{InputPort, OutputPort, ProcessNode};
use super::ports::PortSchema;
use super::scheduler::Scheduler;
use super::type_registry::TYPE_REGISTRY;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use tracing::{debug, info};

pub const DEFAULT_BUFFER_SIZE: usize = 64;

struct NodeEntry {
    node: Box<dyn ProcessNode>,
    inputs: Vec<PortSchema>,
    outputs: Vec<PortSchema>,
}

struct PendingConnection {
    from_node: usize,
    from_port: usize,
    to_node: usize,
    to_port: usize,
    type_id: TypeId,
    buffer_size: usize,
}

/// Static dataflow graph, assembled once and then turned into a `Scheduler`.
pub struct Pipeline {
    nodes: Vec<NodeEntry>,
    node_names: HashMap<String, usize>,
    connections: Vec<PendingConnection>,
    default_buffer_size: usize,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            node_names: HashMap::new(),
            connections: Vec::new(),
            default_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Capacity (in items) of connections made with `connect()`
    pub fn with_default_buffer_size(mut self, size: usize) -> Self {
        self.default_buffer_size = size.max(1);
        self
    }

    pub fn add_process<N: ProcessNode + 'static>(
        &mut self,
        name: impl Into<String>,
        node: N,
    ) -> Result<(), BuildError> {
        let name = name.into();
        if self.node_names.contains_key(&name) {
            return Err(BuildError::DuplicateNode(name));
        }

        let entry = NodeEntry {
            inputs: node.input_schema(),
            outputs: node.output_schema(),
            node: Box::new(node),
        };
        self.node_names.insert(name, self.nodes.len());
        self.nodes.push(entry);
        Ok(())
    }

    pub fn connect(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> Result<(), ConnectionError> {
        self.connect_with_buffer(from_node, from_port, to_node, to_port, self.default_buffer_size)
    }

    pub fn connect_with_buffer(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
        buffer_size: usize,
    ) -> Result<(), ConnectionError> {
        let from_id = self.node_id(from_node)?;
        let to_id = self.node_id(to_node)?;

        let from_schema = find_port(&self.nodes[from_id].outputs, from_node, from_port)?;
        let to_schema = find_port(&self.nodes[to_id].inputs, to_node, to_port)?;

        if from_schema.type_id != to_schema.type_id {
            return Err(ConnectionError::TypeMismatch {
                from_node: from_node.to_string(),
                from_port: from_port.to_string(),
                from_type: from_schema.type_id,
                to_node: to_node.to_string(),
                to_port: to_port.to_string(),
                to_type: to_schema.type_id,
            });
        }

        if self
            .connections
            .iter()
            .any(|c| c.to_node == to_id && c.to_port == to_schema.index)
        {
            return Err(ConnectionError::AlreadyConnected {
                node: to_node.to_string(),
                port: to_port.to_string(),
            });
        }

        self.connections.push(PendingConnection {
            from_node: from_id,
            from_port: from_schema.index,
            to_node: to_id,
            to_port: to_schema.index,
            type_id: from_schema.type_id,
            buffer_size: buffer_size.max(1),
        });
        Ok(())
    }

    fn node_id(&self, name: &str) -> Result<usize, ConnectionError> {
        self.node_names
            .get(name)
            .copied()
            .ok_or_else(|| ConnectionError::NodeNotFound(name.to_string()))
    }

    pub fn list_nodes(&self) -> Vec<&str> {
        self.node_names.keys().map(|s| s.as_str()).collect()
    }

    /// Create the channels and start every node on its own thread.
    pub fn build(self) -> Result<Scheduler, BuildError> {
        info!(
            "Building pipeline with {} nodes and {} connections",
            self.nodes.len(),
            self.connections.len()
        );

        let registry = TYPE_REGISTRY.lock().unwrap_or_else(|e| e.into_inner());

        type PortKey = (usize, usize);
        let mut receivers: HashMap<PortKey, Box<dyn Any + Send>> = HashMap::new();
        let mut senders: HashMap<PortKey, (TypeId, Vec<Box<dyn Any + Send>>)> = HashMap::new();

        for conn in &self.connections {
            let (tx, rx) = registry.create_channel(conn.type_id, conn.buffer_size)?;
            receivers.insert((conn.to_node, conn.to_port), rx);
            senders
                .entry((conn.from_node, conn.from_port))
                .or_insert_with(|| (conn.type_id, Vec::new()))
                .1
                .push(tx);
        }

        // Wire every port before any thread starts so a fast node cannot
        // run into a half-built graph.
        let mut prepared = Vec::with_capacity(self.nodes.len());
        let scheduler_watchdog = super::watchdog::Watchdog::new();
        for (node_id, entry) in self.nodes.into_iter().enumerate() {
            let node_name = entry.node.name().to_string();
            debug!("Wiring node {}: {}", node_id, node_name);

            let inputs: Vec<InputPort> = (0..entry.node.num_inputs())
                .map(|i| {
                    let channel = receivers
                        .remove(&(node_id, i))
                        .unwrap_or_else(|| Box::new(()) as Box<dyn Any + Send>);
                    let port_name = port_name(&entry.inputs, i, "in");
                    InputPort::from_type_erased(channel).with_watchdog(
                        &scheduler_watchdog,
                        &node_name,
                        &port_name,
                    )
                })
                .collect();

            let mut outputs = Vec::with_capacity(entry.node.num_outputs());
            for i in 0..entry.node.num_outputs() {
                let port_name = port_name(&entry.outputs, i, "out");
                let channel = match senders.remove(&(node_id, i)) {
                    Some((type_id, list)) => {
                        registry
                            .wrap_output(type_id, list)
                            .ok_or_else(|| BuildError::OutputWiring {
                                node: node_name.clone(),
                                port: port_name.clone(),
                                reason: format!("no broadcast sender for {:?}", type_id),
                            })?
                    }
                    None => Box::new(()) as Box<dyn Any + Send>,
                };
                outputs.push(
                    OutputPort::from_type_erased(channel).with_watchdog(
                        &scheduler_watchdog,
                        &node_name,
                        &port_name,
                    ),
                );
            }

            prepared.push((entry.node, inputs, outputs));
        }
        drop(registry);

        let mut scheduler = Scheduler::with_watchdog(scheduler_watchdog);
        for (node, inputs, outputs) in prepared {
            scheduler.start_process(node, inputs, outputs);
        }

        info!("Pipeline running with {} threads", scheduler.num_threads());
        Ok(scheduler)
    }
}

fn find_port<'s>(ports: &'s [PortSchema], node: &str, port: &str) -> Result<&'s PortSchema, ConnectionError> {
    ports
        .iter()
        .find(|s| s.name == port)
        .ok_or_else(|| ConnectionError::PortNotFound {
            node: node.to_string(),
            port: port.to_string(),
        })
}

fn port_name(schemas: &[PortSchema], index: usize, prefix: &str) -> String {
    schemas
        .iter()
        .find(|s| s.index == index)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| format!("{}{}", prefix, index))
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::GateEvent;
    use crate::protocol::Burst;
    use crate::runtime::node::WorkResult;
    use crate::runtime::SampleBlock;

    struct Source;
    impl ProcessNode for Source {
        fn name(&self) -> &str {
            "source"
        }
        fn output_schema(&self) -> Vec<PortSchema> {
            vec![PortSchema::output::<SampleBlock>("samples", 0)]
        }
        fn work(&mut self, _: &[InputPort], _: &[OutputPort]) -> WorkResult<usize> {
            Ok(0)
        }
    }

    struct Stage;
    impl ProcessNode for Stage {
        fn name(&self) -> &str {
            "stage"
        }
        fn input_schema(&self) -> Vec<PortSchema> {
            vec![PortSchema::input::<SampleBlock>("samples", 0)]
        }
        fn output_schema(&self) -> Vec<PortSchema> {
            vec![PortSchema::output::<GateEvent>("events", 0)]
        }
        fn work(&mut self, _: &[InputPort], _: &[OutputPort]) -> WorkResult<usize> {
            Ok(0)
        }
    }

    struct BurstSink;
    impl ProcessNode for BurstSink {
        fn name(&self) -> &str {
            "burst_sink"
        }
        fn input_schema(&self) -> Vec<PortSchema> {
            vec![PortSchema::input::<Burst>("bursts", 0)]
        }
        fn work(&mut self, _: &[InputPort], _: &[OutputPort]) -> WorkResult<usize> {
            Ok(0)
        }
    }

    #[test]
    fn chain_and_fan_out_connect() {
        let mut p = Pipeline::new();
        p.add_process("source", Source).unwrap();
        p.add_process("a", Stage).unwrap();
        p.add_process("b", Stage).unwrap();
        assert!(p.connect("source", "samples", "a", "samples").is_ok());
        assert!(p.connect_with_buffer("source", "samples", "b", "samples", 4).is_ok());
        assert_eq!(p.list_nodes().len(), 3);
    }

    #[test]
    fn second_connection_to_an_input_is_rejected() {
        let mut p = Pipeline::new();
        p.add_process("s1", Source).unwrap();
        p.add_process("s2", Source).unwrap();
        p.add_process("stage", Stage).unwrap();
        p.connect("s1", "samples", "stage", "samples").unwrap();
        let err = p.connect("s2", "samples", "stage", "samples").unwrap_err();
        assert!(matches!(err, ConnectionError::AlreadyConnected { .. }));
    }

    #[test]
    fn mismatched_item_types_are_rejected() {
        let mut p = Pipeline::new();
        p.add_process("stage", Stage).unwrap();
        p.add_process("sink", BurstSink).unwrap();
        let err = p.connect("stage", "events", "sink", "bursts").unwrap_err();
        assert!(matches!(err, ConnectionError::TypeMismatch { .. }));
    }

    #[test]
    fn unknown_nodes_and_ports_are_rejected() {
        let mut p = Pipeline::new();
        p.add_process("source", Source).unwrap();
        p.add_process("stage", Stage).unwrap();
        assert!(matches!(
            p.connect("source", "samples", "nowhere", "samples"),
            Err(ConnectionError::NodeNotFound(_))
        ));
        assert!(matches!(
            p.connect("source", "iq", "stage", "samples"),
            Err(ConnectionError::PortNotFound { .. })
        ));
    }

    #[test]
    fn duplicate_node_name_is_rejected() {
        let mut p = Pipeline::new();
        p.add_process("gate", Stage).unwrap();
        assert!(matches!(
            p.add_process("gate", Stage),
            Err(BuildError::DuplicateNode(_))
        ));
    }
}
