//! `Reshape` layers. The target shape is registered by the graph as an `int64` constant and
//! fed as the second input, which requires `Reshape` version 5 or later.

use tract_onnx::pb::NodeProto;

use super::{const_name, first_bottom, Handler, HandlerContext, NoAttributes};
use crate::{caffe::LayerParameter, error::Result, ir::RESHAPE, opset::DEFAULT_DOMAIN};

pub const HANDLER: Handler = Handler {
    name: "Reshape",
    caffe_types: &[RESHAPE],
    onnx_op: Some("Reshape"),
    domain: DEFAULT_DOMAIN,
    min_version: 5,
    convert,
};

fn convert(layer: &LayerParameter, ctx: &HandlerContext<'_, '_>) -> Result<Vec<NodeProto>> {
    let inputs = vec![
        first_bottom(layer)?,
        ctx.require_const(const_name(&layer.name, 0))?,
    ];
    Ok(vec![ctx.node_from_layer(layer, inputs, NoAttributes)?])
}
