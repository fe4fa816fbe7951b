//! Assembly of the intermediate graph into ONNX protos, and the optimizer seam.

use std::{collections::HashSet, path::Path};

use anyhow::{bail, Context};
use itertools::Itertools;
use tracing::debug;
use tract_onnx::pb::{
    tensor_proto::DataType,
    tensor_shape_proto::{dimension, Dimension},
    type_proto, GraphProto, ModelProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};

use crate::{
    error::{ConvertError, Result},
    ir::{ConstData, IrGraph},
    opset::OpsetRequest,
};

/// Rank given to graph inputs and outputs, whose dimensions are unknown.
const UNKNOWN_RANK: usize = 4;

fn value_info(name: &str, elem_type: DataType, dims: Vec<Dimension>) -> ValueInfoProto {
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type as i32,
                shape: Some(TensorShapeProto { dim: dims }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn known_dims(shape: &[usize]) -> Vec<Dimension> {
    shape
        .iter()
        .map(|&d| Dimension {
            value: Some(dimension::Value::DimValue(d as i64)),
            ..Default::default()
        })
        .collect()
}

fn unknown_dims() -> Vec<Dimension> {
    (0..UNKNOWN_RANK)
        .map(|_| Dimension {
            value: Some(dimension::Value::DimParam("?".to_string())),
            ..Default::default()
        })
        .collect()
}

impl ConstData {
    /// The initializer holding this constant, data flattened in row-major order.
    pub fn to_initializer(&self, name: &str) -> TensorProto {
        let mut tensor = TensorProto {
            name: name.to_string(),
            dims: self.shape().iter().map(|&d| d as i64).collect(),
            data_type: self.data_type() as i32,
            ..Default::default()
        };
        match self {
            ConstData::Float(array) => tensor.float_data = array.iter().copied().collect(),
            ConstData::Int64(array) => tensor.int64_data = array.iter().copied().collect(),
        }
        tensor
    }
}

impl IrGraph<'_> {
    /// Graph inputs: every constant with its exact shape, then the placeholders.
    pub fn input_protos(&self) -> Vec<ValueInfoProto> {
        let consts = self
            .consts()
            .iter()
            .map(|(name, value)| value_info(name, value.data_type(), known_dims(value.shape())));
        let placeholders = self
            .placeholders()
            .iter()
            .map(|name| value_info(name, DataType::Float, unknown_dims()));
        consts.chain(placeholders).collect()
    }

    pub fn output_protos(&self) -> Vec<ValueInfoProto> {
        self.outputs()
            .iter()
            .map(|name| value_info(name, DataType::Float, unknown_dims()))
            .collect()
    }

    pub fn initializer_protos(&self) -> Vec<TensorProto> {
        self.consts()
            .iter()
            .map(|(name, value)| value.to_initializer(name))
            .collect()
    }

    pub fn make_graph_proto(&self) -> Result<GraphProto> {
        if self.outputs().is_empty() {
            return Err(ConvertError::NoOutputs);
        }
        Ok(GraphProto {
            name: self.name().to_string(),
            node: self.node_protos().to_vec(),
            input: self.input_protos(),
            output: self.output_protos(),
            initializer: self.initializer_protos(),
            ..Default::default()
        })
    }
}

/// Wraps `graph` into a model importing the requested opsets.
pub fn make_model(graph: GraphProto, request: &OpsetRequest, producer_name: &str) -> ModelProto {
    ModelProto {
        ir_version: request.ir_version(),
        opset_import: request.opset_imports(),
        producer_name: producer_name.to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(graph),
        ..Default::default()
    }
}

pub fn encode_model(model: &ModelProto) -> Vec<u8> {
    prost_tract_compat::Message::encode_to_vec(model)
}

pub fn save_model(model: &ModelProto, path: impl AsRef<Path>) -> anyhow::Result<()> {
    let path = path.as_ref();
    std::fs::write(path, encode_model(model))
        .with_context(|| format!("Failed to write model to {}", path.display()))
}

/// Rewrites a model with a list of named passes.
pub trait Optimizer {
    fn optimize(&self, model: ModelProto, passes: &[String]) -> anyhow::Result<ModelProto>;
}

pub const ELIMINATE_UNUSED_INITIALIZER: &str = "eliminate_unused_initializer";
pub const ELIMINATE_DEADEND: &str = "eliminate_deadend";

/// Graph cleanups that need no shape or value information.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinOptimizer;

impl Optimizer for BuiltinOptimizer {
    fn optimize(&self, mut model: ModelProto, passes: &[String]) -> anyhow::Result<ModelProto> {
        let Some(graph) = model.graph.as_mut() else {
            bail!("model has no graph");
        };
        for pass in passes {
            match pass.as_str() {
                ELIMINATE_UNUSED_INITIALIZER => eliminate_unused_initializer(graph),
                ELIMINATE_DEADEND => eliminate_deadend(graph),
                unknown => bail!("unknown optimization pass `{unknown}`"),
            }
        }
        Ok(model)
    }
}

fn consumed_names(graph: &GraphProto) -> HashSet<String> {
    graph
        .node
        .iter()
        .flat_map(|n| n.input.iter())
        .chain(graph.output.iter().map(|o| &o.name))
        .cloned()
        .collect()
}

/// Drops initializers, and their graph inputs, that no node nor output reads.
fn eliminate_unused_initializer(graph: &mut GraphProto) {
    let used = consumed_names(graph);
    let unused = graph
        .initializer
        .iter()
        .filter(|t| !used.contains(&t.name))
        .map(|t| t.name.clone())
        .collect::<HashSet<_>>();
    if unused.is_empty() {
        return;
    }
    debug!("removing unused initializers {}", unused.iter().sorted().join(", "));
    graph.initializer.retain(|t| !unused.contains(&t.name));
    graph.input.retain(|i| !unused.contains(&i.name));
}

/// Drops nodes none of whose outputs are read, until none is left.
fn eliminate_deadend(graph: &mut GraphProto) {
    loop {
        let used = consumed_names(graph);
        let before = graph.node.len();
        graph
            .node
            .retain(|n| n.output.iter().any(|o| used.contains(o)));
        if graph.node.len() == before {
            break;
        }
        debug!("removed {} dead end node(s)", before - graph.node.len());
    }
}
