//! Caffe network definitions.
//!
//! Only the subset of `caffe.proto` the translator reads is declared here; prost skips every
//! other field when decoding, so full `.caffemodel` files decode without loss of the parts we
//! need. Field tags follow upstream `caffe.proto`.

use std::path::Path;

use anyhow::Context;
use prost::Message;
use tracing::debug;

/// A whole network: either the layer list of a model definition or the trained weights.
#[derive(Clone, PartialEq, Message)]
pub struct NetParameter {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Net-level inputs of older model definitions, declared without an `Input` layer.
    #[prost(string, repeated, tag = "3")]
    pub input: Vec<String>,
    #[prost(message, repeated, tag = "100")]
    pub layer: Vec<LayerParameter>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LayerParameter {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(string, repeated, tag = "3")]
    pub bottom: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub top: Vec<String>,
    #[prost(message, repeated, tag = "7")]
    pub blobs: Vec<BlobProto>,
    #[prost(message, repeated, tag = "8")]
    pub include: Vec<NetStateRule>,
    #[prost(message, repeated, tag = "9")]
    pub exclude: Vec<NetStateRule>,
    #[prost(message, optional, tag = "106")]
    pub convolution_param: Option<ConvolutionParameter>,
    #[prost(message, optional, tag = "117")]
    pub inner_product_param: Option<InnerProductParameter>,
    #[prost(message, optional, tag = "121")]
    pub pooling_param: Option<PoolingParameter>,
    #[prost(message, optional, tag = "123")]
    pub relu_param: Option<ReluParameter>,
    #[prost(message, optional, tag = "125")]
    pub softmax_param: Option<SoftmaxParameter>,
    #[prost(message, optional, tag = "133")]
    pub reshape_param: Option<ReshapeParameter>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Phase {
    Train = 0,
    Test = 1,
}

/// Include / exclude rule of a layer. Levels and stages are not evaluated.
#[derive(Clone, PartialEq, Message)]
pub struct NetStateRule {
    #[prost(enumeration = "Phase", optional, tag = "1")]
    pub phase: Option<i32>,
}

impl NetStateRule {
    fn matches(&self, phase: Phase) -> bool {
        self.phase.map_or(true, |p| p == phase as i32)
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct BlobShape {
    #[prost(int64, repeated, tag = "1")]
    pub dim: Vec<i64>,
}

/// A weight blob. Data is stored flat in row-major order.
#[derive(Clone, PartialEq, Message)]
pub struct BlobProto {
    #[prost(message, optional, tag = "7")]
    pub shape: Option<BlobShape>,
    #[prost(float, repeated, tag = "5")]
    pub data: Vec<f32>,
    #[prost(double, repeated, tag = "8")]
    pub double_data: Vec<f64>,
    // Legacy 4-D dimensions, used when `shape` is absent.
    #[prost(int32, optional, tag = "1")]
    pub num: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub channels: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub height: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub width: Option<i32>,
}

impl BlobProto {
    /// The declared dimensions, falling back to the legacy num/channels/height/width fields.
    pub fn dims(&self) -> Vec<i64> {
        match &self.shape {
            Some(shape) => shape.dim.clone(),
            None => [self.num, self.channels, self.height, self.width]
                .iter()
                .map(|d| i64::from(d.unwrap_or(0)))
                .collect(),
        }
    }

    /// Blob values as `f32`, read from the double precision field when the single precision
    /// one is empty.
    pub fn values(&self) -> Vec<f32> {
        if self.data.is_empty() && !self.double_data.is_empty() {
            self.double_data.iter().map(|&v| v as f32).collect()
        } else {
            self.data.clone()
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ConvolutionParameter {
    /// Defaults to `true` when absent.
    #[prost(bool, optional, tag = "2")]
    pub bias_term: Option<bool>,
    #[prost(uint32, repeated, tag = "3")]
    pub pad: Vec<u32>,
    #[prost(uint32, repeated, tag = "4")]
    pub kernel_size: Vec<u32>,
    /// Defaults to `1` when absent.
    #[prost(uint32, optional, tag = "5")]
    pub group: Option<u32>,
    #[prost(uint32, repeated, tag = "6")]
    pub stride: Vec<u32>,
    #[prost(uint32, optional, tag = "9")]
    pub pad_h: Option<u32>,
    #[prost(uint32, optional, tag = "10")]
    pub pad_w: Option<u32>,
    #[prost(uint32, optional, tag = "11")]
    pub kernel_h: Option<u32>,
    #[prost(uint32, optional, tag = "12")]
    pub kernel_w: Option<u32>,
    #[prost(uint32, optional, tag = "13")]
    pub stride_h: Option<u32>,
    #[prost(uint32, optional, tag = "14")]
    pub stride_w: Option<u32>,
    #[prost(uint32, repeated, tag = "18")]
    pub dilation: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PoolMethod {
    Max = 0,
    Ave = 1,
    Stochastic = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct PoolingParameter {
    /// Defaults to [`PoolMethod::Max`] when absent.
    #[prost(enumeration = "PoolMethod", optional, tag = "1")]
    pub pool: Option<i32>,
    #[prost(uint32, optional, tag = "2")]
    pub kernel_size: Option<u32>,
    /// Defaults to `1` when absent.
    #[prost(uint32, optional, tag = "3")]
    pub stride: Option<u32>,
    /// Defaults to `0` when absent.
    #[prost(uint32, optional, tag = "4")]
    pub pad: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub kernel_h: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub kernel_w: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub stride_h: Option<u32>,
    #[prost(uint32, optional, tag = "8")]
    pub stride_w: Option<u32>,
    #[prost(uint32, optional, tag = "9")]
    pub pad_h: Option<u32>,
    #[prost(uint32, optional, tag = "10")]
    pub pad_w: Option<u32>,
    #[prost(bool, optional, tag = "12")]
    pub global_pooling: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct InnerProductParameter {
    /// Defaults to `true` when absent.
    #[prost(bool, optional, tag = "2")]
    pub bias_term: Option<bool>,
    /// First axis flattened into the product. Defaults to `1` when absent.
    #[prost(int32, optional, tag = "5")]
    pub axis: Option<i32>,
    /// Set when the weights are already stored as `[inputs, outputs]`.
    #[prost(bool, optional, tag = "6")]
    pub transpose: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReluParameter {
    #[prost(float, optional, tag = "1")]
    pub negative_slope: Option<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SoftmaxParameter {
    #[prost(int32, optional, tag = "2")]
    pub axis: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReshapeParameter {
    #[prost(message, optional, tag = "1")]
    pub shape: Option<BlobShape>,
    #[prost(int32, optional, tag = "2")]
    pub axis: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub num_axes: Option<i32>,
}

impl LayerParameter {
    /// Whether the layer takes part in a network instantiated for `phase`, following Caffe's
    /// net filtering: include rules win when present, otherwise any matching exclude rule
    /// drops the layer.
    pub fn in_phase(&self, phase: Phase) -> bool {
        if !self.include.is_empty() {
            self.include.iter().any(|rule| rule.matches(phase))
        } else {
            !self.exclude.iter().any(|rule| rule.matches(phase))
        }
    }
}

/// Copies the weight blobs of `weights` into the layers of `model` sharing the exact same
/// name. Layers without a match are left untouched. Blobs are replaced, never appended, so
/// merging the same weights twice is the same as merging them once.
pub fn merge_weights(model: &mut NetParameter, weights: &NetParameter) {
    for layer in model.layer.iter_mut() {
        if let Some(trained) = weights.layer.iter().find(|w| w.name == layer.name) {
            debug!(
                "merging {} blob(s) into layer {}",
                trained.blobs.len(),
                layer.name
            );
            layer.blobs = trained.blobs.clone();
        }
    }
}

/// Decodes a binary serialized `NetParameter`, e.g. the content of a `.caffemodel` file.
pub fn decode_net(bytes: &[u8]) -> anyhow::Result<NetParameter> {
    NetParameter::decode(bytes).context("can't decode caffe NetParameter")
}

/// Reads and decodes a binary `NetParameter` from `path`.
pub fn load_net(path: impl AsRef<Path>) -> anyhow::Result<NetParameter> {
    let path = path.as_ref();
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    decode_net(&bytes).with_context(|| format!("Failed to load model {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::testing::{blob, layer};

    #[test]
    fn test_merge_weights_copies_by_name() {
        let mut model = NetParameter {
            layer: vec![
                layer("conv1", "Convolution", &["data"], &["conv1"]),
                layer("relu1", "ReLU", &["conv1"], &["conv1"]),
            ],
            ..Default::default()
        };
        let mut trained = layer("conv1", "Convolution", &["data"], &["conv1"]);
        trained.blobs = vec![blob(&[2, 1, 1, 1], vec![0.5, -0.5]), blob(&[2], vec![1.0, 2.0])];
        let weights = NetParameter {
            layer: vec![trained, layer("unrelated", "ReLU", &[], &[])],
            ..Default::default()
        };

        merge_weights(&mut model, &weights);
        assert_eq!(model.layer[0].blobs.len(), 2);
        assert_eq!(model.layer[0].blobs[0].data, vec![0.5, -0.5]);
        assert!(model.layer[1].blobs.is_empty());
    }

    #[test]
    fn test_merge_weights_is_idempotent() {
        let mut trained = layer("fc", "InnerProduct", &["x"], &["y"]);
        trained.blobs = vec![blob(&[1, 2], vec![3.0, 4.0])];
        let weights = NetParameter {
            layer: vec![trained],
            ..Default::default()
        };
        let mut once = NetParameter {
            layer: vec![layer("fc", "InnerProduct", &["x"], &["y"])],
            ..Default::default()
        };
        merge_weights(&mut once, &weights);
        let mut twice = once.clone();
        merge_weights(&mut twice, &weights);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_blob_dims_and_values() {
        let b = blob(&[2, 3], vec![0.0; 6]);
        assert_eq!(b.dims(), vec![2, 3]);

        let legacy = BlobProto {
            num: Some(1),
            channels: Some(2),
            height: Some(1),
            width: Some(1),
            double_data: vec![1.5, 2.5],
            ..Default::default()
        };
        assert_eq!(legacy.dims(), vec![1, 2, 1, 1]);
        assert_eq!(legacy.values(), vec![1.5, 2.5]);
    }

    #[test]
    fn test_in_phase() {
        let mut l = layer("data", "Data", &[], &["data"]);
        assert!(l.in_phase(Phase::Test));

        l.include = vec![NetStateRule {
            phase: Some(Phase::Train as i32),
        }];
        assert!(!l.in_phase(Phase::Test));
        assert!(l.in_phase(Phase::Train));

        l.include.clear();
        l.exclude = vec![NetStateRule {
            phase: Some(Phase::Test as i32),
        }];
        assert!(!l.in_phase(Phase::Test));
    }

    #[test]
    fn test_load_net_from_file() -> anyhow::Result<()> {
        let mut conv = layer("conv1", "Convolution", &["data"], &["conv1"]);
        conv.convolution_param = Some(ConvolutionParameter {
            kernel_size: vec![3],
            bias_term: Some(false),
            ..Default::default()
        });
        conv.blobs = vec![blob(&[1, 1, 3, 3], vec![0.25; 9])];
        let net = NetParameter {
            name: "lenet".to_string(),
            layer: vec![conv],
            ..Default::default()
        };

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&net.encode_to_vec())?;
        let loaded = load_net(file.path())?;
        assert_eq!(loaded, net);
        assert_eq!(
            loaded.layer[0]
                .convolution_param
                .as_ref()
                .and_then(|p| p.bias_term),
            Some(false)
        );
        Ok(())
    }

    #[test]
    fn test_load_net_missing_file() {
        assert!(load_net("/definitely/not/here.caffemodel").is_err());
    }
}
