//! Opset requests: which version of each operator domain the converted model targets.

use std::collections::BTreeMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tract_onnx::pb::OperatorSetIdProto;

use crate::error::{ConvertError, Result};

/// The default ONNX operator domain.
pub const DEFAULT_DOMAIN: &str = "";
/// Alias of [`DEFAULT_DOMAIN`] accepted in requests.
pub const DEFAULT_DOMAIN_ALIAS: &str = "ai.onnx";
/// Newest default-domain opset version known to the built-in schema catalog.
pub const LATEST_OPSET_VERSION: i64 = 21;

/// Opset requested by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::From)]
#[serde(untagged)]
pub enum Opset {
    /// A version of the default domain, `0` meaning the latest one.
    Version(i64),
    /// Explicit `(domain, version)` pairs.
    Imports(Vec<(String, i64)>),
}

impl Default for Opset {
    fn default() -> Self {
        Opset::Version(0)
    }
}

fn normalize_domain(domain: &str) -> &str {
    if domain == DEFAULT_DOMAIN_ALIAS {
        DEFAULT_DOMAIN
    } else {
        domain
    }
}

/// A validated opset request, mapping each domain to the version it targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpsetRequest {
    versions: BTreeMap<String, i64>,
}

impl OpsetRequest {
    pub fn new(opset: &Opset) -> Result<Self> {
        let pairs = match opset {
            Opset::Version(0) => vec![(DEFAULT_DOMAIN.to_string(), LATEST_OPSET_VERSION)],
            Opset::Version(v) => vec![(DEFAULT_DOMAIN.to_string(), *v)],
            Opset::Imports(pairs) => pairs.clone(),
        };
        if pairs.is_empty() {
            return Err(ConvertError::invalid("opset request is empty"));
        }
        let mut versions = BTreeMap::new();
        for (domain, version) in pairs {
            if version <= 0 {
                return Err(ConvertError::invalid(format!(
                    "opset version for domain `{domain}` must be positive, got {version}"
                )));
            }
            let domain = normalize_domain(&domain).to_string();
            if versions.insert(domain.clone(), version).is_some() {
                return Err(ConvertError::invalid(format!(
                    "domain `{domain}` is requested more than once"
                )));
            }
        }
        Ok(Self { versions })
    }

    /// Requested version of `domain`, if the domain is part of the request.
    pub fn version(&self, domain: &str) -> Option<i64> {
        self.versions.get(normalize_domain(domain)).copied()
    }

    /// Requested version of the default domain.
    pub fn default_version(&self) -> Option<i64> {
        self.version(DEFAULT_DOMAIN)
    }

    pub fn domains(&self) -> impl Iterator<Item = (&str, i64)> {
        self.versions.iter().map(|(d, v)| (d.as_str(), *v))
    }

    /// Opset import declarations for the model proto.
    pub fn opset_imports(&self) -> Vec<OperatorSetIdProto> {
        self.domains()
            .map(|(domain, version)| OperatorSetIdProto {
                domain: domain.to_string(),
                version,
            })
            .collect_vec()
    }

    /// The IR version matching the default-domain opset, following the ONNX release table.
    pub fn ir_version(&self) -> i64 {
        match self.default_version().unwrap_or(LATEST_OPSET_VERSION) {
            v if v <= 8 => 3,
            9 => 4,
            10 => 5,
            11 => 6,
            12..=14 => 7,
            15..=18 => 8,
            19..=20 => 9,
            _ => 10,
        }
    }
}
