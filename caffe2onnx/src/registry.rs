//! Resolution of the handler table against an opset request.

use std::{collections::HashMap, fmt};

use tracing::{debug, warn};
use tract_onnx::pb::NodeProto;

use crate::{
    caffe::LayerParameter,
    error::{ConvertError, Result},
    handlers::{Handler, HandlerContext, HANDLERS},
    ir::IrGraph,
    opset::OpsetRequest,
    schema::SchemaLookup,
};

/// A handler bound to the opset version of its domain.
#[derive(Clone, Copy, Debug)]
pub struct ResolvedHandler {
    pub handler: &'static Handler,
    /// Requested version of the handler's domain.
    pub version: i64,
    /// Since version of the handler's operator at `version`.
    pub since_version: i64,
    /// Whether emitted nodes are checked against their schema.
    pub checked: bool,
}

impl ResolvedHandler {
    /// Converts `layer` against the graph built so far.
    pub fn convert(
        &self,
        layer: &LayerParameter,
        graph: &IrGraph<'_>,
        schemas: &dyn SchemaLookup,
    ) -> Result<Vec<NodeProto>> {
        if self.checked && self.since_version < self.handler.min_version {
            return Err(ConvertError::OperatorUnimplemented {
                op_type: layer.r#type.clone(),
                reason: format!(
                    "{} is implemented from version {}, resolved version is {}",
                    self.handler.name, self.handler.min_version, self.since_version
                ),
            });
        }
        let ctx = HandlerContext::new(self, schemas, graph);
        (self.handler.convert)(layer, &ctx)
    }
}

/// Non fatal problem found while resolving a handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaAdvisory {
    pub handler: &'static str,
    pub op_type: Option<&'static str>,
    pub domain: String,
    pub version: i64,
}

impl fmt::Display for SchemaAdvisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op_type {
            Some(op) => write!(
                f,
                "operator {op} of handler {} is not declared in domain `{}` at version {}, \
                 its nodes will not be checked",
                self.handler, self.domain, self.version
            ),
            None => write!(
                f,
                "handler {} declares no operator, its nodes will not be checked",
                self.handler
            ),
        }
    }
}

/// Handlers available for a conversion, by domain then Caffe layer type.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    by_domain: HashMap<String, HashMap<&'static str, ResolvedHandler>>,
    advisories: Vec<SchemaAdvisory>,
}

impl HandlerRegistry {
    /// Resolves the since version of every handler whose domain is requested. Only two
    /// handlers claiming the same layer type in a domain is an error.
    pub fn resolve(
        request: &OpsetRequest,
        schemas: &dyn SchemaLookup,
        handlers: &'static [Handler],
    ) -> Result<Self> {
        let mut registry = Self::default();
        for handler in handlers {
            let Some(version) = request.version(handler.domain) else {
                debug!(
                    "domain `{}` of handler {} is not requested, skipping",
                    handler.domain, handler.name
                );
                continue;
            };
            let schema = handler
                .onnx_op
                .filter(|op| schemas.has(op, handler.domain))
                .and_then(|op| schemas.get(op, handler.domain, version));
            let resolved = match schema {
                Some(schema) => ResolvedHandler {
                    handler,
                    version,
                    since_version: schema.since_version,
                    checked: true,
                },
                None => {
                    let advisory = SchemaAdvisory {
                        handler: handler.name,
                        op_type: handler.onnx_op,
                        domain: handler.domain.to_string(),
                        version,
                    };
                    warn!("{advisory}");
                    registry.advisories.push(advisory);
                    ResolvedHandler {
                        handler,
                        version,
                        since_version: 1,
                        checked: false,
                    }
                }
            };

            let domain = registry
                .by_domain
                .entry(handler.domain.to_string())
                .or_default();
            for caffe_type in handler.caffe_types {
                if let Some(existing) = domain.insert(*caffe_type, resolved) {
                    return Err(ConvertError::AmbiguousHandler {
                        layer_type: caffe_type.to_string(),
                        domain: handler.domain.to_string(),
                        first: existing.handler.name.to_string(),
                        second: handler.name.to_string(),
                    });
                }
            }
        }
        Ok(registry)
    }

    /// Resolves the built-in handler table.
    pub fn standard(request: &OpsetRequest, schemas: &dyn SchemaLookup) -> Result<Self> {
        Self::resolve(request, schemas, HANDLERS)
    }

    pub fn get(&self, domain: &str, layer_type: &str) -> Option<&ResolvedHandler> {
        self.by_domain.get(domain)?.get(layer_type)
    }

    pub fn advisories(&self) -> &[SchemaAdvisory] {
        &self.advisories
    }
}
