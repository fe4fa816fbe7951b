//! Builders shared by the unit tests.

use tract_onnx::pb::{attribute_proto::AttributeType, NodeProto};
use tracing_subscriber::EnvFilter;

use crate::{
    caffe::{
        BlobProto, BlobShape, ConvolutionParameter, LayerParameter, PoolMethod, PoolingParameter,
    },
    error::Result,
    ir::IrGraph,
    opset::{Opset, OpsetRequest, DEFAULT_DOMAIN},
    registry::HandlerRegistry,
    schema::StandardSchemas,
};

/// Installs a subscriber honouring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

pub fn layer(name: &str, layer_type: &str, bottoms: &[&str], tops: &[&str]) -> LayerParameter {
    LayerParameter {
        name: name.to_string(),
        r#type: layer_type.to_string(),
        bottom: strings(bottoms),
        top: strings(tops),
        ..Default::default()
    }
}

pub fn blob(dims: &[i64], data: Vec<f32>) -> BlobProto {
    BlobProto {
        shape: Some(BlobShape { dim: dims.to_vec() }),
        data,
        ..Default::default()
    }
}

pub fn conv_layer(
    name: &str,
    bottom: &str,
    top: &str,
    kernel: &[u32],
    pad: &[u32],
    stride: &[u32],
    bias_term: bool,
) -> LayerParameter {
    let mut l = layer(name, "Convolution", &[bottom], &[top]);
    l.convolution_param = Some(ConvolutionParameter {
        kernel_size: kernel.to_vec(),
        pad: pad.to_vec(),
        stride: stride.to_vec(),
        bias_term: Some(bias_term),
        ..Default::default()
    });
    l
}

pub fn pool_layer(
    name: &str,
    bottom: &str,
    top: &str,
    method: PoolMethod,
    kernel: u32,
    stride: u32,
    pad: u32,
) -> LayerParameter {
    let mut l = layer(name, "Pooling", &[bottom], &[top]);
    l.pooling_param = Some(PoolingParameter {
        pool: Some(method as i32),
        kernel_size: Some(kernel),
        stride: Some(stride),
        pad: Some(pad),
        ..Default::default()
    });
    l
}

/// Values of the `ints` attribute `name`, empty when absent.
pub fn int_list(node: &NodeProto, name: &str) -> Vec<i64> {
    node.attribute
        .iter()
        .find(|a| a.name == name && a.r#type == AttributeType::Ints as i32)
        .map(|a| a.ints.clone())
        .unwrap_or_default()
}

pub fn int_attr(node: &NodeProto, name: &str) -> Option<i64> {
    node.attribute
        .iter()
        .find(|a| a.name == name && a.r#type == AttributeType::Int as i32)
        .map(|a| a.i)
}

/// A graph and the standard handlers resolved at one default-domain version, to convert
/// single layers.
pub struct TestGraph<'l> {
    pub graph: IrGraph<'l>,
    pub registry: HandlerRegistry,
}

impl<'l> TestGraph<'l> {
    pub fn new(version: i64) -> Self {
        init_tracing();
        let request = OpsetRequest::new(&Opset::Version(version)).unwrap();
        Self {
            graph: IrGraph::new("test"),
            registry: HandlerRegistry::standard(&request, &StandardSchemas).unwrap(),
        }
    }

    pub fn with_layer(mut self, layer: &'l LayerParameter) -> Self {
        self.graph.add_layer(layer).unwrap();
        self
    }

    pub fn convert(&self, layer: &LayerParameter) -> Result<Vec<NodeProto>> {
        self.registry
            .get(DEFAULT_DOMAIN, &layer.r#type)
            .unwrap_or_else(|| panic!("no handler for {}", layer.r#type))
            .convert(layer, &self.graph, &StandardSchemas)
    }
}
