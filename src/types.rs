//! Logging configuration and parameter mapping types.
//!
//! These are the immutable per-endpoint settings: which bodies are captured,
//! how they are logged, and which request parameters become diagnostic fields.

use serde::Deserialize;
use std::collections::BTreeSet;

/// How a captured body is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogMode {
    /// Appends the body to the "received" or "processed" log line.
    Log,
    /// Publishes the body as a diagnostic field of the "processed" log line.
    Context,
}

/// Which side of the exchange a [`BodyDeclaration`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Target {
    Request,
    Response,
}

/// Body logging settings for one direction.
///
/// An empty `modes` set means the body stream is never wrapped at all.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BodyLogging {
    /// How the body must be logged
    pub modes: BTreeSet<LogMode>,
    /// Maximum number of bytes kept for logging, negative for no limit
    pub limit: i64,
    /// Identifiers of the redaction filters applied before logging, in order
    pub filters: Vec<String>,
}

impl Default for BodyLogging {
    fn default() -> Self {
        Self {
            modes: BTreeSet::new(),
            limit: -1,
            filters: Vec::new(),
        }
    }
}

impl BodyLogging {
    pub fn new(modes: impl IntoIterator<Item = LogMode>) -> Self {
        Self {
            modes: modes.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    /// Whether any mode is set, i.e. whether the body must be captured.
    pub fn is_active(&self) -> bool {
        !self.modes.is_empty()
    }

    pub fn logs(&self) -> bool {
        self.modes.contains(&LogMode::Log)
    }

    pub fn publishes(&self) -> bool {
        self.modes.contains(&LogMode::Context)
    }

    /// The capture cap, `None` when unlimited.
    pub fn capture_limit(&self) -> Option<usize> {
        usize::try_from(self.limit).ok()
    }
}

/// One body logging declaration, applied to the request, the response or both.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BodyDeclaration {
    #[serde(default)]
    pub modes: BTreeSet<LogMode>,
    #[serde(default = "unlimited")]
    pub limit: i64,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default = "both_targets")]
    pub targets: Vec<Target>,
}

fn unlimited() -> i64 {
    -1
}

fn both_targets() -> Vec<Target> {
    vec![Target::Request, Target::Response]
}

impl BodyDeclaration {
    pub fn new(modes: impl IntoIterator<Item = LogMode>) -> Self {
        Self {
            modes: modes.into_iter().collect(),
            limit: unlimited(),
            filters: Vec::new(),
            targets: both_targets(),
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    /// Restricts the declaration to the given targets.
    pub fn targeting(mut self, targets: impl IntoIterator<Item = Target>) -> Self {
        self.targets = targets.into_iter().collect();
        self
    }

    fn applies_to(&self, target: Target) -> bool {
        self.targets.contains(&target)
    }

    fn to_body_logging(&self) -> BodyLogging {
        BodyLogging {
            modes: self.modes.clone(),
            limit: self.limit,
            filters: self.filters.clone(),
        }
    }
}

/// The effective logging configuration of one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfiguration {
    pub request: BodyLogging,
    pub response: BodyLogging,
}

impl LoggingConfiguration {
    pub fn new(request: BodyLogging, response: BodyLogging) -> Self {
        Self { request, response }
    }

    /// Folds body declarations into one configuration: for each direction the
    /// first declaration targeting it wins.
    pub fn from_bodies(bodies: &[BodyDeclaration]) -> Self {
        let pick = |target| {
            bodies
                .iter()
                .find(|body| body.applies_to(target))
                .map(BodyDeclaration::to_body_logging)
                .unwrap_or_default()
        };

        Self {
            request: pick(Target::Request),
            response: pick(Target::Response),
        }
    }
}

/// Where a mapped request parameter is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamKind {
    Query,
    Path,
    Header,
}

/// Declares how request parameters of one kind become diagnostic fields.
///
/// An `auto` mapping copies every parameter of its kind under its own name
/// (with `field_prefix`). An explicit mapping copies the first present entry
/// of `param_names` to `field_prefix + field_key`; with a blank `field_key` it
/// only excludes those names from any other mapping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ParameterMapping {
    pub kind: ParamKind,
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub field_prefix: String,
    #[serde(default)]
    pub field_key: String,
    #[serde(default)]
    pub param_names: Vec<String>,
}

impl ParameterMapping {
    /// Maps every parameter of `kind` one to one.
    pub fn auto(kind: ParamKind) -> Self {
        Self {
            kind,
            auto: true,
            field_prefix: String::new(),
            field_key: String::new(),
            param_names: Vec::new(),
        }
    }

    /// Maps the first present parameter among `param_names` to `field_key`.
    pub fn explicit<I, S>(kind: ParamKind, field_key: impl Into<String>, param_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            auto: false,
            field_prefix: String::new(),
            field_key: field_key.into(),
            param_names: param_names.into_iter().map(Into::into).collect(),
        }
    }

    /// Keeps `param_names` away from every other mapping of `kind`.
    pub fn exclude<I, S>(kind: ParamKind, param_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::explicit(kind, "", param_names)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.field_prefix = prefix.into();
        self
    }

    /// Whether this mapping only populates exclusions.
    pub fn is_exclusion(&self) -> bool {
        !self.auto && self.field_key.trim().is_empty()
    }

    /// Same kind and at least one parameter name in common.
    pub fn overlaps(&self, other: &ParameterMapping) -> bool {
        self.kind == other.kind
            && self
                .param_names
                .iter()
                .any(|name| other.param_names.iter().any(|o| same_name(self.kind, name, o)))
    }
}

/// Parameter name equality, case-insensitive for headers.
pub(crate) fn same_name(kind: ParamKind, a: &str, b: &str) -> bool {
    match kind {
        ParamKind::Header => a.eq_ignore_ascii_case(b),
        ParamKind::Query | ParamKind::Path => a == b,
    }
}
