//! Conversion of trained Caffe networks into ONNX models.
//!
//! A conversion merges the `.caffemodel` weights into the network definition, walks its layers
//! in file order and hands each one to the handler registered for its type. Handlers are
//! resolved against the requested opset through a [`SchemaLookup`], and every node they emit is
//! checked against the operator schema before it lands in the graph.
//!
//! ```no_run
//! use caffe2onnx::{caffe, caffe_model_to_onnx_model, save_model, ConvertOptions, Opset};
//!
//! # fn main() -> anyhow::Result<()> {
//! let weights = caffe::load_net("lenet.caffemodel")?;
//! let mut model = caffe::load_net("lenet_deploy.binaryproto")?;
//! let options = ConvertOptions {
//!     opset: Opset::Version(9),
//!     ..Default::default()
//! };
//! let onnx = caffe_model_to_onnx_model(&weights, &mut model, &["prob"], &options)?;
//! save_model(&onnx, "lenet.onnx")?;
//! # Ok(())
//! # }
//! ```

pub mod assemble;
pub mod caffe;
pub mod convert;
pub mod error;
pub mod handlers;
pub mod ir;
pub mod opset;
pub mod params;
pub mod registry;
pub mod schema;

#[cfg(test)]
mod testing;

pub use assemble::{encode_model, make_model, save_model, BuiltinOptimizer, Optimizer};
pub use convert::{caffe_model_to_onnx_graph, caffe_model_to_onnx_model, ConvertOptions, Converter};
pub use error::{ConvertError, Result};
pub use opset::{Opset, OpsetRequest};
pub use schema::{SchemaLookup, StandardSchemas};
