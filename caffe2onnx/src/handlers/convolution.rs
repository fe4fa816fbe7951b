//! `Convolution` layers to ONNX `Conv`.
//!
//! Depthwise convolutions have no dedicated ONNX operator; they come out as grouped
//! convolutions with as many groups as channels, which is semantically the same.

use tract_onnx::pb::{AttributeProto, NodeProto};

use super::{
    attr_int, attr_ints, const_name, first_bottom, Handler, HandlerContext, NodeAttributes,
};
use crate::{
    caffe::LayerParameter,
    error::{ConvertError, Result},
    opset::DEFAULT_DOMAIN,
    params::{expand_axes, expand_spatial, with_hw},
};

pub const HANDLER: Handler = Handler {
    name: "Convolution",
    caffe_types: &["Convolution"],
    onnx_op: Some("Conv"),
    domain: DEFAULT_DOMAIN,
    min_version: 1,
    convert,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvAttributes {
    pub pads: Vec<i64>,
    pub strides: Vec<i64>,
    pub kernel_shape: Vec<i64>,
    pub group: i64,
    pub dilations: Vec<i64>,
}

impl NodeAttributes for ConvAttributes {
    fn into_attributes(self) -> Vec<AttributeProto> {
        vec![
            attr_ints("pads", &self.pads),
            attr_int("group", self.group),
            attr_ints("kernel_shape", &self.kernel_shape),
            attr_ints("strides", &self.strides),
            attr_ints("dilations", &self.dilations),
        ]
    }
}

impl ConvAttributes {
    pub fn from_layer(layer: &LayerParameter) -> Result<Self> {
        let param = layer.convolution_param.clone().unwrap_or_default();
        let kernel = with_hw(&param.kernel_size, param.kernel_h, param.kernel_w);
        if kernel.is_empty() {
            return Err(ConvertError::invalid(format!(
                "convolution `{}` has no kernel size",
                layer.name
            )));
        }
        Ok(Self {
            pads: expand_spatial(&with_hw(&param.pad, param.pad_h, param.pad_w), 0)?.to_vec(),
            strides: expand_axes(&with_hw(&param.stride, param.stride_h, param.stride_w), 1)?,
            kernel_shape: expand_axes(&kernel, 1)?,
            group: i64::from(param.group.unwrap_or(1)),
            dilations: expand_axes(&param.dilation, 1)?,
        })
    }
}

fn convert(layer: &LayerParameter, ctx: &HandlerContext<'_, '_>) -> Result<Vec<NodeProto>> {
    let attributes = ConvAttributes::from_layer(layer)?;
    let bias_term = layer
        .convolution_param
        .as_ref()
        .and_then(|p| p.bias_term)
        .unwrap_or(true);

    let mut inputs = vec![
        first_bottom(layer)?,
        ctx.require_const(const_name(&layer.name, 0))?,
    ];
    if bias_term {
        inputs.push(ctx.require_const(const_name(&layer.name, 1))?);
    }
    Ok(vec![ctx.node_from_layer(layer, inputs, attributes)?])
}
