//! `Pooling` layers to ONNX `MaxPool` (or `AveragePool` for Caffe `AVE` pooling).

use tract_onnx::pb::{AttributeProto, NodeProto};

use super::{attr_int, attr_ints, first_bottom, Handler, HandlerContext, NodeAttributes};
use crate::{
    caffe::{LayerParameter, PoolMethod},
    error::{ConvertError, Result},
    opset::DEFAULT_DOMAIN,
    params::{expand_axes, expand_spatial, with_hw},
};

pub const HANDLER: Handler = Handler {
    name: "MaxPool",
    caffe_types: &["Pooling"],
    onnx_op: Some(MAX_POOL),
    domain: DEFAULT_DOMAIN,
    min_version: 1,
    convert,
};

const MAX_POOL: &str = "MaxPool";
const AVERAGE_POOL: &str = "AveragePool";
/// First `AveragePool` version with the `count_include_pad` attribute.
const COUNT_INCLUDE_PAD_SINCE: i64 = 7;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolAttributes {
    pub pads: Vec<i64>,
    pub strides: Vec<i64>,
    pub kernel_shape: Vec<i64>,
    pub count_include_pad: Option<bool>,
}

impl NodeAttributes for PoolAttributes {
    fn into_attributes(self) -> Vec<AttributeProto> {
        let mut attributes = vec![
            attr_ints("pads", &self.pads),
            attr_ints("kernel_shape", &self.kernel_shape),
            attr_ints("strides", &self.strides),
        ];
        if let Some(include) = self.count_include_pad {
            attributes.push(attr_int("count_include_pad", i64::from(include)));
        }
        attributes
    }
}

impl PoolAttributes {
    pub fn from_layer(layer: &LayerParameter) -> Result<Self> {
        let param = layer.pooling_param.clone().unwrap_or_default();
        if param.global_pooling.unwrap_or(false) {
            return Err(ConvertError::invalid(format!(
                "global pooling of layer `{}` is not supported",
                layer.name
            )));
        }
        let kernel = with_hw(&Vec::from_iter(param.kernel_size), param.kernel_h, param.kernel_w);
        if kernel.is_empty() {
            return Err(ConvertError::invalid(format!(
                "pooling `{}` has no kernel size",
                layer.name
            )));
        }
        let stride = with_hw(&[param.stride.unwrap_or(1)], param.stride_h, param.stride_w);
        let pad = with_hw(&[param.pad.unwrap_or(0)], param.pad_h, param.pad_w);
        Ok(Self {
            pads: expand_spatial(&pad, 0)?.to_vec(),
            strides: expand_axes(&stride, 1)?,
            kernel_shape: expand_axes(&kernel, 1)?,
            count_include_pad: None,
        })
    }

    /// Validates the options against the operator they end up on: `count_include_pad` only
    /// exists on `AveragePool`, from version 7.
    pub fn check(&self, op_type: &str, since_version: i64) -> Result<()> {
        if self.count_include_pad.is_some() {
            if op_type != AVERAGE_POOL {
                return Err(ConvertError::invalid(
                    "count_include_pad is only for AveragePool",
                ));
            }
            if since_version < COUNT_INCLUDE_PAD_SINCE {
                return Err(ConvertError::invalid(format!(
                    "count_include_pad is added since version {COUNT_INCLUDE_PAD_SINCE}, resolved version is {since_version}"
                )));
            }
        }
        Ok(())
    }
}

fn convert(layer: &LayerParameter, ctx: &HandlerContext<'_, '_>) -> Result<Vec<NodeProto>> {
    let mut attributes = PoolAttributes::from_layer(layer)?;
    let method = layer
        .pooling_param
        .as_ref()
        .and_then(|p| p.pool)
        .unwrap_or(PoolMethod::Max as i32);
    let (op_type, since_version) = match PoolMethod::try_from(method) {
        Ok(PoolMethod::Max) => (MAX_POOL, ctx.since_version()),
        Ok(PoolMethod::Ave) => {
            // Caffe averages over the padded window.
            attributes.count_include_pad = Some(true);
            (AVERAGE_POOL, ctx.since_version_of(AVERAGE_POOL).unwrap_or(1))
        }
        _ => {
            return Err(ConvertError::invalid(format!(
                "pooling method {method} of layer `{}` is not supported",
                layer.name
            )));
        }
    };
    attributes.check(op_type, since_version)?;

    let node = ctx.make_node(
        op_type,
        vec![first_bottom(layer)?],
        layer.top.clone(),
        layer.name.clone(),
        attributes,
    )?;
    Ok(vec![node])
}
