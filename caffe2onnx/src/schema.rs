//! ONNX operator schemas and the node checker.
//!
//! The [`SchemaLookup`] trait is the seam to whatever knows the ONNX operator definitions.
//! [`StandardSchemas`] ships the definitions of the operators the translator emits, which is
//! enough to resolve handler versions and to structurally check every node we produce.

use itertools::Itertools;
use tract_onnx::pb::NodeProto;

use crate::error::{ConvertError, Result};
use crate::opset::DEFAULT_DOMAIN;

/// Signature of one version of an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpSchema {
    pub name: &'static str,
    pub domain: &'static str,
    /// Oldest opset version this signature is valid for.
    pub since_version: i64,
    /// Inclusive range of accepted input counts.
    pub inputs: (usize, usize),
    /// Inclusive range of accepted output counts.
    pub outputs: (usize, usize),
    pub attributes: &'static [&'static str],
    pub required: &'static [&'static str],
}

pub trait SchemaLookup {
    /// Whether `op_type` is declared in `domain` at any version.
    fn has(&self, op_type: &str, domain: &str) -> bool;

    /// The newest schema of `op_type` whose since version is at most `max_inclusive_version`.
    fn get(&self, op_type: &str, domain: &str, max_inclusive_version: i64) -> Option<OpSchema>;
}

const fn op(
    name: &'static str,
    since_version: i64,
    inputs: (usize, usize),
    outputs: (usize, usize),
    attributes: &'static [&'static str],
    required: &'static [&'static str],
) -> OpSchema {
    OpSchema {
        name,
        domain: DEFAULT_DOMAIN,
        since_version,
        inputs,
        outputs,
        attributes,
        required,
    }
}

const CONV_ATTRS: &[&str] = &["auto_pad", "dilations", "group", "kernel_shape", "pads", "strides"];
const POOL_ATTRS: &[&str] = &["auto_pad", "kernel_shape", "pads", "strides"];
const MAXPOOL_V8_ATTRS: &[&str] = &["auto_pad", "kernel_shape", "pads", "storage_order", "strides"];
const MAXPOOL_V10_ATTRS: &[&str] = &[
    "auto_pad",
    "ceil_mode",
    "dilations",
    "kernel_shape",
    "pads",
    "storage_order",
    "strides",
];
const AVGPOOL_V7_ATTRS: &[&str] = &["auto_pad", "count_include_pad", "kernel_shape", "pads", "strides"];
const AVGPOOL_V10_ATTRS: &[&str] = &[
    "auto_pad",
    "ceil_mode",
    "count_include_pad",
    "kernel_shape",
    "pads",
    "strides",
];
const AVGPOOL_V19_ATTRS: &[&str] = &[
    "auto_pad",
    "ceil_mode",
    "count_include_pad",
    "dilations",
    "kernel_shape",
    "pads",
    "strides",
];
const KERNEL: &[&str] = &["kernel_shape"];
const NONE: &[&str] = &[];

/// Operator definitions of the default domain, up to opset 21.
const CATALOG: &[OpSchema] = &[
    op("Conv", 1, (2, 3), (1, 1), CONV_ATTRS, NONE),
    op("Conv", 11, (2, 3), (1, 1), CONV_ATTRS, NONE),
    op("MaxPool", 1, (1, 1), (1, 1), POOL_ATTRS, KERNEL),
    op("MaxPool", 8, (1, 1), (1, 2), MAXPOOL_V8_ATTRS, KERNEL),
    op("MaxPool", 10, (1, 1), (1, 2), MAXPOOL_V10_ATTRS, KERNEL),
    op("MaxPool", 11, (1, 1), (1, 2), MAXPOOL_V10_ATTRS, KERNEL),
    op("MaxPool", 12, (1, 1), (1, 2), MAXPOOL_V10_ATTRS, KERNEL),
    op("AveragePool", 1, (1, 1), (1, 1), POOL_ATTRS, KERNEL),
    op("AveragePool", 7, (1, 1), (1, 1), AVGPOOL_V7_ATTRS, KERNEL),
    op("AveragePool", 10, (1, 1), (1, 1), AVGPOOL_V10_ATTRS, KERNEL),
    op("AveragePool", 11, (1, 1), (1, 1), AVGPOOL_V10_ATTRS, KERNEL),
    op("AveragePool", 19, (1, 1), (1, 1), AVGPOOL_V19_ATTRS, KERNEL),
    op("MatMul", 1, (2, 2), (1, 1), NONE, NONE),
    op("MatMul", 9, (2, 2), (1, 1), NONE, NONE),
    op("MatMul", 13, (2, 2), (1, 1), NONE, NONE),
    op("Add", 1, (2, 2), (1, 1), &["axis", "broadcast", "consumed_inputs"], NONE),
    op("Add", 6, (2, 2), (1, 1), &["axis", "broadcast"], NONE),
    op("Add", 7, (2, 2), (1, 1), NONE, NONE),
    op("Add", 13, (2, 2), (1, 1), NONE, NONE),
    op("Add", 14, (2, 2), (1, 1), NONE, NONE),
    op("Relu", 1, (1, 1), (1, 1), &["consumed_inputs"], NONE),
    op("Relu", 6, (1, 1), (1, 1), NONE, NONE),
    op("Relu", 13, (1, 1), (1, 1), NONE, NONE),
    op("Relu", 14, (1, 1), (1, 1), NONE, NONE),
    op("LeakyRelu", 1, (1, 1), (1, 1), &["alpha", "consumed_inputs"], NONE),
    op("LeakyRelu", 6, (1, 1), (1, 1), &["alpha"], NONE),
    op("LeakyRelu", 16, (1, 1), (1, 1), &["alpha"], NONE),
    op("Softmax", 1, (1, 1), (1, 1), &["axis"], NONE),
    op("Softmax", 11, (1, 1), (1, 1), &["axis"], NONE),
    op("Softmax", 13, (1, 1), (1, 1), &["axis"], NONE),
    op("Reshape", 1, (1, 1), (1, 1), &["consumed_inputs", "shape"], NONE),
    op("Reshape", 5, (2, 2), (1, 1), NONE, NONE),
    op("Reshape", 13, (2, 2), (1, 1), NONE, NONE),
    op("Reshape", 14, (2, 2), (1, 1), &["allowzero"], NONE),
    op("Reshape", 19, (2, 2), (1, 1), &["allowzero"], NONE),
    op("Reshape", 21, (2, 2), (1, 1), &["allowzero"], NONE),
];

/// The built-in schema catalog.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardSchemas;

impl SchemaLookup for StandardSchemas {
    fn has(&self, op_type: &str, domain: &str) -> bool {
        CATALOG
            .iter()
            .any(|s| s.name == op_type && s.domain == domain)
    }

    fn get(&self, op_type: &str, domain: &str, max_inclusive_version: i64) -> Option<OpSchema> {
        CATALOG
            .iter()
            .filter(|s| {
                s.name == op_type && s.domain == domain && s.since_version <= max_inclusive_version
            })
            .max_by_key(|s| s.since_version)
            .copied()
    }
}

/// Checks `node` against the schema of its operator at opset `version` of `domain`.
pub fn check_node(
    schemas: &dyn SchemaLookup,
    node: &NodeProto,
    domain: &str,
    version: i64,
) -> Result<()> {
    let schema = schemas
        .get(&node.op_type, domain, version)
        .ok_or_else(|| ConvertError::UnknownSchema {
            op_type: node.op_type.clone(),
            domain: domain.to_string(),
            version,
        })?;
    let fail = |reason: String| ConvertError::NodeCheck {
        node: node.name.clone(),
        op_type: node.op_type.clone(),
        reason,
    };

    let (min_in, max_in) = schema.inputs;
    if node.input.len() < min_in || node.input.len() > max_in {
        return Err(fail(format!(
            "expects {min_in} to {max_in} inputs at version {}, got {}",
            schema.since_version,
            node.input.len()
        )));
    }
    let (min_out, max_out) = schema.outputs;
    if node.output.len() < min_out || node.output.len() > max_out {
        return Err(fail(format!(
            "expects {min_out} to {max_out} outputs at version {}, got {}",
            schema.since_version,
            node.output.len()
        )));
    }
    if node.output.iter().any(|o| o.is_empty()) {
        return Err(fail("output names must not be empty".to_string()));
    }
    if let Some(dup) = node.attribute.iter().map(|a| a.name.as_str()).duplicates().next() {
        return Err(fail(format!("attribute `{dup}` is set more than once")));
    }
    if let Some(unknown) = node
        .attribute
        .iter()
        .find(|a| !schema.attributes.contains(&a.name.as_str()))
    {
        return Err(fail(format!(
            "unrecognized attribute `{}` for version {}",
            unknown.name, schema.since_version
        )));
    }
    if let Some(missing) = schema
        .required
        .iter()
        .find(|req| !node.attribute.iter().any(|a| a.name == **req))
    {
        return Err(fail(format!("required attribute `{missing}` is missing")));
    }
    Ok(())
}
