//! Module containing the [`ConvertError`] type returned by every conversion step.

/// Errors relating to the translation of a Caffe network into an ONNX graph.
#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    /// A layer parameter has an unsupported arity or an option is used outside of the
    /// operator / opset window where it is valid.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// The schema service has no definition for the operator at the requested version.
    #[error("Unknown schema: operator `{op_type}` in domain `{domain}` at opset version {version}")]
    UnknownSchema {
        op_type: String,
        domain: String,
        version: i64,
    },
    /// Two handlers claim the same Caffe layer type in the same domain.
    #[error("Ambiguous handler: layer type `{layer_type}` in domain `{domain}` is claimed by both `{first}` and `{second}`")]
    AmbiguousHandler {
        layer_type: String,
        domain: String,
        first: String,
        second: String,
    },
    /// No handler converts the layer type, or not at the resolved opset version.
    #[error("Operator `{op_type}` is not implemented: {reason}")]
    OperatorUnimplemented { op_type: String, reason: String },
    /// A requested output, or a name referenced by a node, is not defined in the graph.
    #[error("No such variable: `{0}`")]
    UnknownVariable(String),
    /// The graph was assembled before any output was declared.
    #[error("Graph outputs must be set before the graph is assembled")]
    NoOutputs,
    /// The schema checker rejected a node.
    #[error("Node `{node}` ({op_type}) failed the schema check: {reason}")]
    NodeCheck {
        node: String,
        op_type: String,
        reason: String,
    },
    /// An optimizer pass failed or is unknown.
    #[error("Optimizer failed: {0:#}")]
    Optimizer(anyhow::Error),
}

impl ConvertError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ConvertError::InvalidParameter(msg.into())
    }
}

pub type Result<T, E = ConvertError> = std::result::Result<T, E>;
