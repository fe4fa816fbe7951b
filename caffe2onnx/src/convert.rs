//! Conversion entry points.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use tract_onnx::pb::{GraphProto, ModelProto};

use crate::{
    assemble::{make_model, BuiltinOptimizer, Optimizer},
    caffe::{merge_weights, NetParameter},
    error::{ConvertError, Result},
    ir::GraphBuilder,
    opset::{Opset, OpsetRequest},
    registry::HandlerRegistry,
    schema::{SchemaLookup, StandardSchemas},
};

pub const DEFAULT_GRAPH_NAME: &str = "graph";
pub const DEFAULT_PRODUCER_NAME: &str = "caffe2onnx";

/// Options of a model conversion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertOptions {
    pub opset: Opset,
    pub graph_name: String,
    pub producer_name: String,
    /// Emit unchecked pass-through nodes for unsupported layers instead of failing. The
    /// resulting model is not guaranteed to be valid ONNX.
    pub ignore_unimplemented: bool,
    /// Optimizer passes run on the model, if any.
    pub optimizer_passes: Option<Vec<String>>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            opset: Opset::default(),
            graph_name: DEFAULT_GRAPH_NAME.to_string(),
            producer_name: DEFAULT_PRODUCER_NAME.to_string(),
            ignore_unimplemented: false,
            optimizer_passes: None,
        }
    }
}

/// Drives a conversion with a given schema service and optimizer.
#[derive(Clone, Copy)]
pub struct Converter<'a> {
    pub schemas: &'a dyn SchemaLookup,
    pub optimizer: &'a dyn Optimizer,
}

impl Default for Converter<'_> {
    fn default() -> Self {
        Self {
            schemas: &StandardSchemas,
            optimizer: &BuiltinOptimizer,
        }
    }
}

impl Converter<'_> {
    /// Converts a network, whose layers already carry their weights, into an ONNX graph
    /// producing `outputs`.
    #[instrument(skip_all, fields(net = %model.name, graph = name))]
    pub fn caffe_model_to_onnx_graph<S: AsRef<str>>(
        &self,
        model: &NetParameter,
        outputs: &[S],
        request: &OpsetRequest,
        name: &str,
        ignore_unimplemented: bool,
    ) -> Result<GraphProto> {
        if ignore_unimplemented {
            warn!("Unsupported layers will be emitted unchecked, the graph may not be valid ONNX.");
        }
        let registry = HandlerRegistry::standard(request, self.schemas)?;
        let mut builder = GraphBuilder::new(name, &registry, self.schemas, ignore_unimplemented);
        builder.add_net(model)?;
        let graph = builder.finish(outputs)?;
        info!(
            "converted {} layer(s) into {} node(s)",
            model.layer.len(),
            graph.node_protos().len()
        );
        graph.make_graph_proto()
    }

    /// Merges `weights` into `model` and converts the result into an ONNX model.
    #[instrument(skip_all, fields(net = %model.name))]
    pub fn caffe_model_to_onnx_model<S: AsRef<str>>(
        &self,
        weights: &NetParameter,
        model: &mut NetParameter,
        outputs: &[S],
        options: &ConvertOptions,
    ) -> Result<ModelProto> {
        let request = OpsetRequest::new(&options.opset)?;
        merge_weights(model, weights);
        let graph = self.caffe_model_to_onnx_graph(
            model,
            outputs,
            &request,
            &options.graph_name,
            options.ignore_unimplemented,
        )?;
        let model = make_model(graph, &request, &options.producer_name);
        match options.optimizer_passes.as_deref() {
            Some(passes) if !passes.is_empty() => self
                .optimizer
                .optimize(model, passes)
                .map_err(ConvertError::Optimizer),
            _ => Ok(model),
        }
    }
}

/// [`Converter::caffe_model_to_onnx_graph`] with the built-in schemas.
pub fn caffe_model_to_onnx_graph<S: AsRef<str>>(
    model: &NetParameter,
    outputs: &[S],
    opset: &Opset,
    name: &str,
    ignore_unimplemented: bool,
) -> Result<GraphProto> {
    let request = OpsetRequest::new(opset)?;
    Converter::default().caffe_model_to_onnx_graph(
        model,
        outputs,
        &request,
        name,
        ignore_unimplemented,
    )
}

/// [`Converter::caffe_model_to_onnx_model`] with the built-in schemas and optimizer.
pub fn caffe_model_to_onnx_model<S: AsRef<str>>(
    weights: &NetParameter,
    model: &mut NetParameter,
    outputs: &[S],
    options: &ConvertOptions,
) -> Result<ModelProto> {
    Converter::default().caffe_model_to_onnx_model(weights, model, outputs, options)
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use itertools::Itertools;
    use tract_onnx::pb::tensor_proto::DataType;

    use super::*;
    use crate::{
        assemble::ELIMINATE_UNUSED_INITIALIZER,
        caffe::InnerProductParameter,
        testing::{blob, conv_layer, init_tracing, int_list, layer},
    };

    fn lenet_head() -> (NetParameter, NetParameter) {
        let model = NetParameter {
            name: "tiny".to_string(),
            layer: vec![
                layer("input", "Input", &[], &["x"]),
                conv_layer("c1", "x", "y", &[3], &[], &[1], false),
                layer("relu", "ReLU", &["y"], &["z"]),
            ],
            ..Default::default()
        };
        let mut trained = layer("c1", "Convolution", &["x"], &["y"]);
        trained.blobs = vec![blob(&[4, 1, 3, 3], (0..36).map(|v| v as f32).collect())];
        let weights = NetParameter {
            layer: vec![trained],
            ..Default::default()
        };
        (weights, model)
    }

    fn fc_net(bias_term: bool) -> NetParameter {
        let mut fc = layer("fc", "InnerProduct", &["x"], &["y"]);
        fc.inner_product_param = Some(InnerProductParameter {
            bias_term: Some(bias_term),
            ..Default::default()
        });
        fc.blobs = vec![blob(&[2, 3], vec![0.0; 6])];
        if bias_term {
            fc.blobs.push(blob(&[2], vec![0.0; 2]));
        }
        NetParameter {
            layer: vec![layer("input", "Input", &[], &["x"]), fc],
            ..Default::default()
        }
    }

    #[test]
    fn test_conv_relu_end_to_end() {
        init_tracing();
        let (weights, mut model) = lenet_head();
        let options = ConvertOptions {
            opset: Opset::Version(7),
            ..Default::default()
        };
        let onnx = caffe_model_to_onnx_model(&weights, &mut model, &["z"], &options).unwrap();
        assert_eq!(onnx.ir_version, 3);
        assert_eq!(onnx.producer_name, DEFAULT_PRODUCER_NAME);
        let graph = onnx.graph.unwrap();
        assert_eq!(graph.name, DEFAULT_GRAPH_NAME);

        let inputs = graph.input.iter().map(|i| i.name.as_str()).collect_vec();
        assert_eq!(inputs, ["c1_0", "x"]);
        assert_eq!(graph.initializer.len(), 1);
        assert_eq!(graph.initializer[0].name, "c1_0");
        assert_eq!(graph.initializer[0].dims, vec![4, 1, 3, 3]);
        assert_eq!(graph.initializer[0].data_type, DataType::Float as i32);

        assert_eq!(graph.node.len(), 2);
        let conv = &graph.node[0];
        assert_eq!(conv.op_type, "Conv");
        assert_eq!(conv.input, vec!["x", "c1_0"]);
        assert_eq!(int_list(conv, "pads"), vec![0, 0, 0, 0]);
        assert_eq!(int_list(conv, "strides"), vec![1, 1]);
        assert_eq!(int_list(conv, "kernel_shape"), vec![3, 3]);
        assert_eq!(graph.node[1].op_type, "Relu");
        assert_eq!(graph.node[1].output, vec!["z"]);

        assert_eq!(graph.output.len(), 1);
        assert_eq!(graph.output[0].name, "z");
    }

    #[test]
    fn test_inner_product_bias_path() {
        let graph = caffe_model_to_onnx_graph(&fc_net(true), &["y"], &Opset::Version(9), "g", false)
            .unwrap();
        let ops = graph.node.iter().map(|n| n.op_type.as_str()).collect_vec();
        assert_eq!(ops, ["MatMul", "Add"]);
        assert_eq!(graph.node[1].output, vec!["y"]);

        let graph =
            caffe_model_to_onnx_graph(&fc_net(false), &["y"], &Opset::Version(9), "g", false)
                .unwrap();
        assert_eq!(graph.node.len(), 1);
        assert_eq!(graph.node[0].op_type, "MatMul");
        assert_eq!(graph.node[0].output, vec!["y"]);
    }

    #[test]
    fn test_unimplemented_layer() {
        let net = NetParameter {
            layer: vec![
                layer("input", "Input", &[], &["x"]),
                layer("norm", "LRN", &["x"], &["y"]),
            ],
            ..Default::default()
        };
        assert!(matches!(
            caffe_model_to_onnx_graph(&net, &["y"], &Opset::Version(9), "g", false),
            Err(ConvertError::OperatorUnimplemented { op_type, .. }) if op_type == "LRN"
        ));

        let graph = caffe_model_to_onnx_graph(&net, &["y"], &Opset::Version(9), "g", true).unwrap();
        assert_eq!(graph.node.len(), 1);
        assert_eq!(graph.node[0].op_type, "LRN");
        assert_eq!(graph.node[0].input, vec!["x"]);
    }

    /// Log sink shared with a test subscriber.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_best_effort_warning_from_model_conversion() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || writer.clone())
            .finish();
        let net = NetParameter {
            layer: vec![
                layer("input", "Input", &[], &["x"]),
                layer("norm", "LRN", &["x"], &["y"]),
            ],
            ..Default::default()
        };

        tracing::subscriber::with_default(subscriber, || {
            let mut model = net.clone();
            let options = ConvertOptions {
                ignore_unimplemented: true,
                ..Default::default()
            };
            let onnx =
                caffe_model_to_onnx_model(&NetParameter::default(), &mut model, &["y"], &options)
                    .unwrap();
            assert_eq!(onnx.graph.unwrap().node[0].op_type, "LRN");
        });

        let logs = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("may not be valid ONNX"), "{logs}");
    }

    #[test]
    fn test_missing_output_and_weights() {
        let (_, model) = lenet_head();
        // No weights were merged, the convolution has nothing to read.
        assert!(matches!(
            caffe_model_to_onnx_graph(&model, &["z"], &Opset::Version(7), "g", false),
            Err(ConvertError::UnknownVariable(name)) if name == "c1_0"
        ));

        let (weights, mut model) = lenet_head();
        assert!(matches!(
            caffe_model_to_onnx_model(&weights, &mut model, &["nope"], &ConvertOptions::default()),
            Err(ConvertError::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_optimizer_passes() {
        let (weights, mut model) = lenet_head();
        let options = ConvertOptions {
            optimizer_passes: Some(vec![ELIMINATE_UNUSED_INITIALIZER.to_string()]),
            ..Default::default()
        };
        let onnx = caffe_model_to_onnx_model(&weights, &mut model, &["z"], &options).unwrap();
        assert_eq!(onnx.graph.unwrap().initializer.len(), 1);

        let options = ConvertOptions {
            optimizer_passes: Some(vec!["unknown_pass".to_string()]),
            ..Default::default()
        };
        assert!(matches!(
            caffe_model_to_onnx_model(&weights, &mut model, &["z"], &options),
            Err(ConvertError::Optimizer(_))
        ));
    }

    #[test]
    fn test_options_from_json() {
        let options: ConvertOptions = serde_json::from_str(
            r#"{"opset": [["ai.onnx", 9]], "ignore_unimplemented": true}"#,
        )
        .unwrap();
        assert_eq!(options.opset, Opset::Imports(vec![("ai.onnx".to_string(), 9)]));
        assert!(options.ignore_unimplemented);
        assert_eq!(options.graph_name, DEFAULT_GRAPH_NAME);
        assert_eq!(options.optimizer_passes, None);

        let json = serde_json::to_string(&ConvertOptions::default()).unwrap();
        let back: ConvertOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ConvertOptions::default());
    }
}
