//! `InnerProduct` layers to `MatMul`, followed by an `Add` of the bias.
//!
//! Weights are registered already transposed to `[inputs, outputs]` by the graph, so the
//! product is `bottom x weights`.

use tract_onnx::pb::NodeProto;

use super::{const_name, first_bottom, first_top, Handler, HandlerContext, NoAttributes};
use crate::{
    caffe::LayerParameter,
    error::{ConvertError, Result},
    ir::INNER_PRODUCT,
    opset::DEFAULT_DOMAIN,
};

pub const HANDLER: Handler = Handler {
    name: "InnerProduct",
    caffe_types: &[INNER_PRODUCT],
    onnx_op: Some("MatMul"),
    domain: DEFAULT_DOMAIN,
    min_version: 1,
    convert,
};

fn convert(layer: &LayerParameter, ctx: &HandlerContext<'_, '_>) -> Result<Vec<NodeProto>> {
    let param = layer.inner_product_param.clone().unwrap_or_default();
    // Only the default flattening axis maps onto MatMul.
    if param.axis.unwrap_or(1) != 1 {
        return Err(ConvertError::invalid(format!(
            "inner product `{}` flattens from axis {}, only axis 1 is supported",
            layer.name,
            param.axis.unwrap_or(1)
        )));
    }
    let bias_term = param.bias_term.unwrap_or(true);
    let inputs = vec![
        first_bottom(layer)?,
        ctx.require_const(const_name(&layer.name, 0))?,
    ];
    if !bias_term {
        return Ok(vec![ctx.node_from_layer(layer, inputs, NoAttributes)?]);
    }

    let top = first_top(layer)?;
    let product = format!("{top}_mul");
    let matmul = ctx.make_node(
        "MatMul",
        inputs,
        vec![product.clone()],
        layer.name.clone(),
        NoAttributes,
    )?;
    let add = ctx.make_node(
        "Add",
        vec![product, ctx.require_const(const_name(&layer.name, 1))?],
        vec![top],
        format!("{}_bias", layer.name),
        NoAttributes,
    )?;
    Ok(vec![matmul, add])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        caffe::InnerProductParameter,
        testing::{blob, layer, TestGraph},
    };

    fn fc_layer(bias_term: bool) -> LayerParameter {
        let mut l = layer("fc1", INNER_PRODUCT, &["pool1"], &["fc1"]);
        l.inner_product_param = Some(InnerProductParameter {
            bias_term: Some(bias_term),
            ..Default::default()
        });
        l.blobs = vec![blob(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])];
        if bias_term {
            l.blobs.push(blob(&[2], vec![0.1, 0.2]));
        }
        l
    }

    #[test]
    fn test_convert_with_bias() {
        let l = fc_layer(true);
        let graph = TestGraph::new(9).with_layer(&l);
        let nodes = graph.convert(&l).unwrap();
        assert_eq!(nodes.len(), 2);

        let (matmul, add) = (&nodes[0], &nodes[1]);
        assert_eq!(matmul.op_type, "MatMul");
        assert_eq!(matmul.name, "fc1");
        assert_eq!(matmul.input, vec!["pool1", "fc1_0"]);
        assert_eq!(matmul.output, vec!["fc1_mul"]);

        assert_eq!(add.op_type, "Add");
        assert_eq!(add.name, "fc1_bias");
        assert_eq!(add.input, vec!["fc1_mul", "fc1_1"]);
        assert_eq!(add.output, vec!["fc1"]);
    }

    #[test]
    fn test_convert_without_bias() {
        let l = fc_layer(false);
        let graph = TestGraph::new(9).with_layer(&l);
        let nodes = graph.convert(&l).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].op_type, "MatMul");
        assert_eq!(nodes[0].input, vec!["pool1", "fc1_0"]);
        assert_eq!(nodes[0].output, vec!["fc1"]);
    }

    #[test]
    fn test_convert_missing_bias() {
        let mut l = fc_layer(true);
        l.blobs.truncate(1);
        let graph = TestGraph::new(9).with_layer(&l);
        assert!(matches!(
            graph.convert(&l),
            Err(ConvertError::UnknownVariable(name)) if name == "fc1_1"
        ));
    }

    #[test]
    fn test_convert_rejects_other_axis() {
        let mut l = fc_layer(false);
        l.inner_product_param = Some(InnerProductParameter {
            bias_term: Some(false),
            axis: Some(2),
            ..Default::default()
        });
        let graph = TestGraph::new(9).with_layer(&l);
        assert!(matches!(
            graph.convert(&l),
            Err(ConvertError::InvalidParameter(_))
        ));

        l.inner_product_param = Some(InnerProductParameter {
            bias_term: Some(false),
            axis: Some(1),
            ..Default::default()
        });
        let graph = TestGraph::new(9).with_layer(&l);
        assert_eq!(graph.convert(&l).unwrap().len(), 1);
    }
}
