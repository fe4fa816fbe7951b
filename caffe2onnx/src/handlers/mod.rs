//! Conversion handlers, one per Caffe layer type.
//!
//! A handler is a plain record: the Caffe types it accepts, the ONNX operator it targets and
//! a conversion function. [`HANDLERS`] lists every handler the translator knows about; the
//! [`registry`](crate::registry) resolves them against the requested opset.

use std::fmt;

use itertools::Itertools;
use tracing::warn;
use tract_onnx::pb::{attribute_proto::AttributeType, AttributeProto, NodeProto};

use crate::{
    caffe::LayerParameter,
    error::{ConvertError, Result},
    ir::IrGraph,
    opset::DEFAULT_DOMAIN,
    registry::ResolvedHandler,
    schema::{check_node, SchemaLookup},
};

pub mod activation;
pub mod convolution;
pub mod inner_product;
pub mod pooling;
pub mod reshape;

/// Emits the ONNX nodes of one Caffe layer.
pub type ConvertFn = fn(&LayerParameter, &HandlerContext<'_, '_>) -> Result<Vec<NodeProto>>;

#[derive(Clone, Copy)]
pub struct Handler {
    /// Name used in diagnostics.
    pub name: &'static str,
    /// Caffe layer types handled.
    pub caffe_types: &'static [&'static str],
    /// Target ONNX operator. `None` means the handler is not backed by a known operator and
    /// its nodes are never schema checked.
    pub onnx_op: Option<&'static str>,
    pub domain: &'static str,
    /// Oldest since version the conversion is implemented for.
    pub min_version: i64,
    pub convert: ConvertFn,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("caffe_types", &self.caffe_types)
            .field("onnx_op", &self.onnx_op)
            .field("domain", &self.domain)
            .field("min_version", &self.min_version)
            .finish()
    }
}

/// Every handler of the translator.
pub const HANDLERS: &[Handler] = &[
    convolution::HANDLER,
    pooling::HANDLER,
    inner_product::HANDLER,
    activation::RELU,
    activation::SOFTMAX,
    reshape::HANDLER,
];

/// Explicit attribute set of one ONNX operator. Unset options produce no attribute.
pub trait NodeAttributes {
    fn into_attributes(self) -> Vec<AttributeProto>;
}

impl NodeAttributes for Vec<AttributeProto> {
    fn into_attributes(self) -> Vec<AttributeProto> {
        self
    }
}

/// For operators emitted without attributes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAttributes;

impl NodeAttributes for NoAttributes {
    fn into_attributes(self) -> Vec<AttributeProto> {
        Vec::new()
    }
}

pub fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Ints as i32,
        ints: values.to_vec(),
        ..Default::default()
    }
}

pub fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        ..Default::default()
    }
}

pub fn attr_float(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Float as i32,
        f: value,
        ..Default::default()
    }
}

/// What a handler sees while converting a layer: its resolved versions, the schema service
/// and the graph built so far.
pub struct HandlerContext<'a, 'l> {
    resolved: &'a ResolvedHandler,
    schemas: &'a dyn SchemaLookup,
    graph: &'a IrGraph<'l>,
}

impl<'a, 'l> HandlerContext<'a, 'l> {
    pub fn new(
        resolved: &'a ResolvedHandler,
        schemas: &'a dyn SchemaLookup,
        graph: &'a IrGraph<'l>,
    ) -> Self {
        Self {
            resolved,
            schemas,
            graph,
        }
    }

    /// Requested opset version of the handler's domain.
    pub fn version(&self) -> i64 {
        self.resolved.version
    }

    pub fn since_version(&self) -> i64 {
        self.resolved.since_version
    }

    pub fn domain(&self) -> &'static str {
        self.resolved.handler.domain
    }

    /// Since version of another operator of the handler's domain at the requested version.
    pub fn since_version_of(&self, op_type: &str) -> Option<i64> {
        self.schemas
            .get(op_type, self.domain(), self.version())
            .map(|s| s.since_version)
    }

    /// Returns `name` if the graph holds a constant of that name.
    pub fn require_const(&self, name: String) -> Result<String> {
        if self.graph.has_const(&name) {
            Ok(name)
        } else {
            Err(ConvertError::UnknownVariable(name))
        }
    }

    /// Builds a node and checks it against its schema, unless the handler is unchecked.
    pub fn make_node(
        &self,
        op_type: &str,
        inputs: Vec<String>,
        outputs: Vec<String>,
        name: String,
        attributes: impl NodeAttributes,
    ) -> Result<NodeProto> {
        let node = NodeProto {
            name,
            op_type: op_type.to_string(),
            domain: self.domain().to_string(),
            input: inputs,
            output: outputs,
            attribute: attributes.into_attributes(),
            ..Default::default()
        };
        if self.resolved.checked {
            check_node(self.schemas, &node, self.domain(), self.version())?;
        } else {
            warn!("Skipped check for {}.", node.op_type);
        }
        Ok(node)
    }

    /// Builds the node of the handler's own operator for `layer`, named after the layer and
    /// writing to its tops.
    pub fn node_from_layer(
        &self,
        layer: &LayerParameter,
        inputs: Vec<String>,
        attributes: impl NodeAttributes,
    ) -> Result<NodeProto> {
        let op_type = self.resolved.handler.onnx_op.unwrap_or(layer.r#type.as_str());
        self.make_node(
            op_type,
            inputs,
            layer.top.clone(),
            layer.name.clone(),
            attributes,
        )
    }
}

/// Pass-through node for a layer nobody knows how to convert: the Caffe type is used verbatim
/// as the operator, inputs are the bottoms followed by the layer's constants. The node is not
/// checked and is not guaranteed to be valid ONNX.
pub fn unchecked_node(layer: &LayerParameter, graph: &IrGraph<'_>) -> NodeProto {
    warn!(
        "Layer {} of type {} is not supported, emitting it unchecked.",
        layer.name, layer.r#type
    );
    let input = layer
        .bottom
        .iter()
        .cloned()
        .chain(graph.layer_consts(layer))
        .collect_vec();
    NodeProto {
        name: layer.name.clone(),
        op_type: layer.r#type.clone(),
        domain: DEFAULT_DOMAIN.to_string(),
        input,
        output: layer.top.clone(),
        ..Default::default()
    }
}

/// First bottom of a layer, which every handled layer type consumes.
pub(crate) fn first_bottom(layer: &LayerParameter) -> Result<String> {
    layer.bottom.first().cloned().ok_or_else(|| {
        ConvertError::invalid(format!("layer `{}` has no bottom", layer.name))
    })
}

pub(crate) fn first_top(layer: &LayerParameter) -> Result<String> {
    layer
        .top
        .first()
        .cloned()
        .ok_or_else(|| ConvertError::invalid(format!("layer `{}` has no top", layer.name)))
}

/// Name of the `index`-th constant of a layer.
pub fn const_name(layer_name: &str, index: usize) -> String {
    format!("{layer_name}_{index}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ir::IrGraph, testing::layer};

    #[test]
    fn test_handler_table_is_consistent() {
        for handler in HANDLERS {
            assert!(!handler.caffe_types.is_empty(), "{handler:?}");
            assert!(handler.onnx_op.is_some(), "{handler:?}");
            assert_eq!(handler.domain, DEFAULT_DOMAIN);
            assert!(handler.min_version >= 1);
        }
    }

    #[test]
    fn test_unchecked_node_carries_caffe_type() {
        let mut l = layer("lrn1", "LRN", &["pool1"], &["norm1"]);
        l.blobs = vec![crate::testing::blob(&[1], vec![0.0])];
        let mut graph = IrGraph::new("g");
        graph.add_layer(&l).unwrap();
        let node = unchecked_node(&l, &graph);
        assert_eq!(node.op_type, "LRN");
        assert_eq!(node.input, vec!["pool1", "lrn1_0"]);
        assert_eq!(node.output, vec!["norm1"]);
    }
}
