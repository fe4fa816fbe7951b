//! Element-wise activations and `Softmax`.

use tract_onnx::pb::{AttributeProto, NodeProto};

use super::{
    attr_float, attr_int, first_bottom, Handler, HandlerContext, NoAttributes, NodeAttributes,
};
use crate::{caffe::LayerParameter, error::Result, opset::DEFAULT_DOMAIN};

pub const RELU: Handler = Handler {
    name: "ReLU",
    caffe_types: &["ReLU"],
    onnx_op: Some("Relu"),
    domain: DEFAULT_DOMAIN,
    min_version: 1,
    convert: convert_relu,
};

pub const SOFTMAX: Handler = Handler {
    name: "Softmax",
    caffe_types: &["Softmax"],
    onnx_op: Some("Softmax"),
    domain: DEFAULT_DOMAIN,
    min_version: 1,
    convert: convert_softmax,
};

/// A Caffe ReLU with a non zero negative slope is a leaky ReLU.
fn convert_relu(layer: &LayerParameter, ctx: &HandlerContext<'_, '_>) -> Result<Vec<NodeProto>> {
    let slope = layer
        .relu_param
        .as_ref()
        .and_then(|p| p.negative_slope)
        .unwrap_or(0.0);
    let inputs = vec![first_bottom(layer)?];
    let node = if slope == 0.0 {
        ctx.node_from_layer(layer, inputs, NoAttributes)?
    } else {
        ctx.make_node(
            "LeakyRelu",
            inputs,
            layer.top.clone(),
            layer.name.clone(),
            vec![attr_float("alpha", slope)],
        )?
    };
    Ok(vec![node])
}

/// Caffe normalizes over the channel axis; the axis is always emitted so the node means the
/// same under every `Softmax` version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SoftmaxAttributes {
    pub axis: i64,
}

impl Default for SoftmaxAttributes {
    fn default() -> Self {
        Self { axis: 1 }
    }
}

impl NodeAttributes for SoftmaxAttributes {
    fn into_attributes(self) -> Vec<AttributeProto> {
        vec![attr_int("axis", self.axis)]
    }
}

fn convert_softmax(
    layer: &LayerParameter,
    ctx: &HandlerContext<'_, '_>,
) -> Result<Vec<NodeProto>> {
    let node = ctx.node_from_layer(
        layer,
        vec![first_bottom(layer)?],
        SoftmaxAttributes::default(),
    )?;
    Ok(vec![node])
}
