//! Intermediate graph built from the Caffe layer list.
//!
//! [`IrGraph`] tracks what every layer contributes to the ONNX graph (variables, constants,
//! placeholders and the emitted nodes), while [`GraphBuilder`] walks the layers in file order
//! and dispatches each one to its conversion handler.

use std::collections::{HashMap, HashSet};

use ndarray::{ArrayD, Axis, IxDyn};
use tracing::{debug, info, trace};
use tract_onnx::pb::{tensor_proto::DataType, NodeProto};

use crate::{
    caffe::{BlobProto, LayerParameter, NetParameter, Phase},
    error::{ConvertError, Result},
    handlers::{const_name, unchecked_node},
    opset::DEFAULT_DOMAIN,
    registry::HandlerRegistry,
    schema::SchemaLookup,
};

/// Layers only meaningful while training, dropped from the converted graph.
pub const TRAINING_LAYERS: &[&str] = &["Dropout", "Accuracy"];
/// Layers feeding the network, converted to graph inputs.
pub const DATA_LAYERS: &[&str] = &["Input", "Data", "ImageData", "MemoryData", "HDF5Data"];
pub const INNER_PRODUCT: &str = "InnerProduct";
pub const RESHAPE: &str = "Reshape";

/// Value of a graph constant.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstData {
    Float(ArrayD<f32>),
    Int64(ArrayD<i64>),
}

impl ConstData {
    pub fn shape(&self) -> &[usize] {
        match self {
            ConstData::Float(array) => array.shape(),
            ConstData::Int64(array) => array.shape(),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            ConstData::Float(_) => DataType::Float,
            ConstData::Int64(_) => DataType::Int64,
        }
    }
}

/// What a layer turned into when added to the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    /// Dropped, nothing was recorded.
    Skipped,
    /// Tops became graph inputs.
    Placeholder,
    /// Only a constant was recorded, no IR node.
    Constant,
    Node,
}

/// A layer that becomes one or more ONNX nodes.
#[derive(Clone, Debug)]
pub struct IrNode<'l> {
    pub layer: &'l LayerParameter,
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub domain: String,
}

impl<'l> IrNode<'l> {
    fn new(layer: &'l LayerParameter) -> Self {
        Self {
            layer,
            name: layer.name.clone(),
            op_type: layer.r#type.clone(),
            inputs: layer.bottom.clone(),
            outputs: layer.top.clone(),
            domain: DEFAULT_DOMAIN.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IrGraph<'l> {
    name: String,
    nodes: Vec<IrNode<'l>>,
    vars: HashSet<String>,
    consts: Vec<(String, ConstData)>,
    const_index: HashMap<String, usize>,
    placeholders: Vec<String>,
    outputs: Vec<String>,
    node_protos: Vec<NodeProto>,
}

impl<'l> IrGraph<'l> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            vars: HashSet::new(),
            consts: Vec::new(),
            const_index: HashMap::new(),
            placeholders: Vec::new(),
            outputs: Vec::new(),
            node_protos: Vec::new(),
        }
    }

    /// Records what `layer` contributes to the graph. Handlers are not invoked here.
    pub fn add_layer(&mut self, layer: &'l LayerParameter) -> Result<LayerKind> {
        if !layer.in_phase(Phase::Test) {
            info!("Removing layer {} excluded from the test phase", layer.name);
            return Ok(LayerKind::Skipped);
        }
        let layer_type = layer.r#type.as_str();
        if TRAINING_LAYERS.contains(&layer_type) {
            info!("Removing {} layer {}", layer_type, layer.name);
            return Ok(LayerKind::Skipped);
        }
        if DATA_LAYERS.contains(&layer_type) {
            for top in &layer.top {
                self.add_placeholder(top.clone());
            }
            return Ok(LayerKind::Placeholder);
        }
        if layer_type == RESHAPE {
            self.add_reshape_target(layer)?;
            self.add_layer_vars(layer);
            return Ok(LayerKind::Constant);
        }

        let inner_product = layer_type == INNER_PRODUCT;
        let transpose = inner_product
            && !layer
                .inner_product_param
                .as_ref()
                .and_then(|p| p.transpose)
                .unwrap_or(false);
        for (index, blob) in layer.blobs.iter().enumerate() {
            let mut array = blob_array(&layer.name, blob)?;
            if inner_product {
                // Legacy blobs pad weights to [1, 1, out, in] and bias to [1, 1, 1, out].
                let rank = if index == 0 { 2 } else { 1 };
                array = squeeze_leading(&layer.name, array, rank)?;
            }
            if transpose && array.ndim() == 2 {
                array = array.reversed_axes().as_standard_layout().into_owned();
            }
            self.add_const(const_name(&layer.name, index), ConstData::Float(array));
        }
        self.add_layer_vars(layer);
        self.nodes.push(IrNode::new(layer));
        Ok(LayerKind::Node)
    }

    fn add_reshape_target(&mut self, layer: &LayerParameter) -> Result<()> {
        let param = layer.reshape_param.clone().unwrap_or_default();
        if param.axis.unwrap_or(0) != 0 || param.num_axes.unwrap_or(-1) != -1 {
            return Err(ConvertError::invalid(format!(
                "reshape `{}` uses axis / num_axes, which is not supported",
                layer.name
            )));
        }
        let dims = param
            .shape
            .map(|s| s.dim)
            .ok_or_else(|| ConvertError::invalid(format!("reshape `{}` has no shape", layer.name)))?;
        let target = ArrayD::from_shape_vec(IxDyn(&[dims.len()]), dims)
            .map_err(|e| ConvertError::invalid(format!("reshape `{}`: {e}", layer.name)))?;
        self.add_const(const_name(&layer.name, 0), ConstData::Int64(target));
        Ok(())
    }

    fn add_layer_vars(&mut self, layer: &LayerParameter) {
        for name in layer.bottom.iter().chain(&layer.top) {
            self.add_var(name.clone());
        }
    }

    pub fn add_var(&mut self, name: String) {
        self.vars.insert(name);
    }

    /// Registers a constant, replacing any previous value of the same name.
    pub fn add_const(&mut self, name: String, value: ConstData) {
        trace!("constant {name} with shape {:?}", value.shape());
        match self.const_index.get(&name) {
            Some(&index) => self.consts[index].1 = value,
            None => {
                self.const_index.insert(name.clone(), self.consts.len());
                self.consts.push((name, value));
            }
        }
    }

    pub fn add_placeholder(&mut self, name: String) {
        if !self.placeholders.contains(&name) {
            self.placeholders.push(name.clone());
        }
        self.add_var(name);
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.contains(name)
    }

    pub fn has_const(&self, name: &str) -> bool {
        self.const_index.contains_key(name)
    }

    pub fn get_const(&self, name: &str) -> Option<&ConstData> {
        self.const_index.get(name).map(|&i| &self.consts[i].1)
    }

    /// Names of the constants registered for `layer`, in blob order.
    pub fn layer_consts(&self, layer: &LayerParameter) -> Vec<String> {
        (0..)
            .map(|index| const_name(&layer.name, index))
            .take_while(|name| self.has_const(name))
            .collect()
    }

    pub fn add_node_protos(&mut self, nodes: impl IntoIterator<Item = NodeProto>) {
        self.node_protos.extend(nodes);
    }

    /// Declares the graph outputs. Every name must be a known variable.
    pub fn set_output<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        let names = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                if self.has_var(name) {
                    Ok(name.to_string())
                } else {
                    Err(ConvertError::UnknownVariable(name.to_string()))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        self.outputs = names;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[IrNode<'l>] {
        &self.nodes
    }

    pub fn consts(&self) -> &[(String, ConstData)] {
        &self.consts
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn node_protos(&self) -> &[NodeProto] {
        &self.node_protos
    }
}

/// Reshapes the flat data of a blob to its declared dimensions.
fn blob_array(layer_name: &str, blob: &BlobProto) -> Result<ArrayD<f32>> {
    let shape = blob
        .dims()
        .into_iter()
        .map(usize::try_from)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| {
            ConvertError::invalid(format!("blob of layer `{layer_name}` has a negative dimension"))
        })?;
    ArrayD::from_shape_vec(IxDyn(&shape), blob.values()).map_err(|e| {
        ConvertError::invalid(format!(
            "blob of layer `{layer_name}` does not match its shape {shape:?}: {e}"
        ))
    })
}

/// Drops leading axes of size one until `array` has `rank` axes.
fn squeeze_leading(
    layer_name: &str,
    mut array: ArrayD<f32>,
    rank: usize,
) -> Result<ArrayD<f32>> {
    while array.ndim() > rank && array.shape()[0] == 1 {
        array = array.index_axis_move(Axis(0), 0);
    }
    if array.ndim() != rank {
        return Err(ConvertError::invalid(format!(
            "blob of inner product `{layer_name}` has shape {:?}, expected {rank} axes",
            array.shape()
        )));
    }
    Ok(array)
}

/// Walks a Caffe network in file order and converts every layer.
pub struct GraphBuilder<'a, 'l> {
    graph: IrGraph<'l>,
    registry: &'a HandlerRegistry,
    schemas: &'a dyn SchemaLookup,
    /// Emit unchecked pass-through nodes instead of failing on unsupported layers.
    ignore_unimplemented: bool,
}

impl<'a, 'l> GraphBuilder<'a, 'l> {
    pub fn new(
        name: impl Into<String>,
        registry: &'a HandlerRegistry,
        schemas: &'a dyn SchemaLookup,
        ignore_unimplemented: bool,
    ) -> Self {
        Self {
            graph: IrGraph::new(name),
            registry,
            schemas,
            ignore_unimplemented,
        }
    }

    /// Adds the net-level inputs then every layer of `net`.
    pub fn add_net(&mut self, net: &'l NetParameter) -> Result<()> {
        for input in &net.input {
            self.graph.add_placeholder(input.clone());
        }
        for layer in &net.layer {
            self.add_layer(layer)?;
        }
        Ok(())
    }

    pub fn add_layer(&mut self, layer: &'l LayerParameter) -> Result<()> {
        debug!("converting layer {} of type {}", layer.name, layer.r#type);
        match self.graph.add_layer(layer)? {
            LayerKind::Skipped | LayerKind::Placeholder => return Ok(()),
            LayerKind::Constant | LayerKind::Node => {}
        }

        let converted = match self.registry.get(DEFAULT_DOMAIN, &layer.r#type) {
            Some(handler) => handler.convert(layer, &self.graph, self.schemas),
            None => Err(ConvertError::OperatorUnimplemented {
                op_type: layer.r#type.clone(),
                reason: "no handler is registered for this layer type".to_string(),
            }),
        };
        let nodes = match converted {
            Err(ConvertError::OperatorUnimplemented { .. }) if self.ignore_unimplemented => {
                vec![unchecked_node(layer, &self.graph)]
            }
            result => result?,
        };
        self.graph.add_node_protos(nodes);
        Ok(())
    }

    pub fn graph(&self) -> &IrGraph<'l> {
        &self.graph
    }

    /// Declares the graph outputs and hands the graph over.
    pub fn finish<S: AsRef<str>>(mut self, outputs: &[S]) -> Result<IrGraph<'l>> {
        self.graph.set_output(outputs)?;
        Ok(self.graph)
    }
}
