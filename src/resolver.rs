//! Effective logging configuration per endpoint.
//!
//! Logging is declared on a resource (the type handling a group of routes),
//! on the contracts it implements, and on its operations. Resolution runs once
//! per route, when the router is built, and yields a [`ResolvedEndpoint`].
//!
//! Precedence is operation, then contract, then resource. For the body
//! configuration the first scope carrying a [`Logged`] declaration wins as a
//! whole. Parameter mappings are merged across all scopes instead, see
//! [`merge_mappings`].

use crate::config::ConfigError;
use crate::mapping::merge_mappings;
use crate::types::{BodyDeclaration, LoggingConfiguration, ParameterMapping};
use serde::Deserialize;
use std::sync::Arc;

/// Activates logging at one scope, with optional body declarations.
///
/// A `Logged` without bodies still produces the "received"/"processed" audit
/// lines, without any capture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Logged {
    #[serde(default)]
    pub body: Vec<BodyDeclaration>,
}

impl Logged {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, body: BodyDeclaration) -> Self {
        self.body.push(body);
        self
    }

    pub fn configuration(&self) -> LoggingConfiguration {
        LoggingConfiguration::from_bodies(&self.body)
    }
}

/// An operation of a resource or of a contract.
///
/// Operations are matched between a resource and its contracts by name and
/// parameter types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OperationDeclarations {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub logged: Option<Logged>,
    #[serde(default)]
    pub mappings: Vec<ParameterMapping>,
}

impl OperationDeclarations {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    pub fn logged(mut self, logged: Logged) -> Self {
        self.logged = Some(logged);
        self
    }

    pub fn with_mapping(mut self, mapping: ParameterMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Same name and same parameter types.
    pub fn same_signature(&self, other: &OperationDeclarations) -> bool {
        self.name == other.name && self.parameters == other.parameters
    }
}

/// A contract implemented by a resource, with its own declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContractDeclarations {
    pub name: String,
    #[serde(default)]
    pub logged: Option<Logged>,
    #[serde(default)]
    pub mappings: Vec<ParameterMapping>,
    #[serde(default)]
    pub operations: Vec<OperationDeclarations>,
}

impl ContractDeclarations {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn logged(mut self, logged: Logged) -> Self {
        self.logged = Some(logged);
        self
    }

    pub fn with_mapping(mut self, mapping: ParameterMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    pub fn with_operation(mut self, operation: OperationDeclarations) -> Self {
        self.operations.push(operation);
        self
    }

    fn matching(&self, operation: &OperationDeclarations) -> Option<&OperationDeclarations> {
        self.operations
            .iter()
            .find(|candidate| candidate.same_signature(operation))
    }
}

/// A resource with its operations and the contracts it implements.
///
/// # Examples
///
/// ```rust
/// use logged_http::{BodyDeclaration, LogMode, Logged, OperationDeclarations, ResourceDeclarations};
///
/// let resource = ResourceDeclarations::new("ArticleResource")
///     .logged(Logged::new())
///     .with_operation(
///         OperationDeclarations::new("create")
///             .logged(Logged::new().with_body(BodyDeclaration::new([LogMode::Log]))),
///     )
///     .with_operation(OperationDeclarations::new("list"));
///
/// let create = resource.resolve("create").unwrap();
/// assert!(create.configuration().request.logs());
///
/// let list = resource.resolve("list").unwrap();
/// assert!(!list.configuration().request.is_active());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResourceDeclarations {
    pub name: String,
    #[serde(default)]
    pub logged: Option<Logged>,
    #[serde(default)]
    pub mappings: Vec<ParameterMapping>,
    #[serde(default)]
    pub contracts: Vec<ContractDeclarations>,
    #[serde(default)]
    pub operations: Vec<OperationDeclarations>,
}

impl ResourceDeclarations {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parses declarations written in TOML.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn logged(mut self, logged: Logged) -> Self {
        self.logged = Some(logged);
        self
    }

    pub fn with_mapping(mut self, mapping: ParameterMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    pub fn with_contract(mut self, contract: ContractDeclarations) -> Self {
        self.contracts.push(contract);
        self
    }

    pub fn with_operation(mut self, operation: OperationDeclarations) -> Self {
        self.operations.push(operation);
        self
    }

    /// Resolves the first operation named `operation`.
    pub fn resolve(&self, operation: &str) -> Option<ResolvedEndpoint> {
        self.operations
            .iter()
            .find(|candidate| candidate.name == operation)
            .map(|found| self.resolve_operation(found))
    }

    /// Resolves `operation` against this resource and its contracts.
    pub fn resolve_operation(&self, operation: &OperationDeclarations) -> ResolvedEndpoint {
        let configuration = self
            .effective_logged(operation)
            .map(Logged::configuration)
            .unwrap_or_default();

        let contract_mappings: Vec<ParameterMapping> = self
            .contracts
            .iter()
            .flat_map(|contract| {
                contract
                    .matching(operation)
                    .into_iter()
                    .flat_map(|method| method.mappings.iter())
                    .chain(contract.mappings.iter())
            })
            .cloned()
            .collect();
        let mappings = merge_mappings(&operation.mappings, &contract_mappings, &self.mappings);

        ResolvedEndpoint::new(self.name.clone(), operation.name.clone())
            .with_configuration(configuration)
            .with_mappings(mappings)
    }

    /// The first declaration found: operation, contract operations and
    /// contracts in declaration order, then the resource.
    fn effective_logged<'a>(&'a self, operation: &'a OperationDeclarations) -> Option<&'a Logged> {
        operation
            .logged
            .as_ref()
            .or_else(|| {
                self.contracts.iter().find_map(|contract| {
                    contract
                        .matching(operation)
                        .and_then(|method| method.logged.as_ref())
                        .or(contract.logged.as_ref())
                })
            })
            .or(self.logged.as_ref())
    }
}

/// What the request logger needs to know about the route being served.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEndpoint {
    resource: String,
    operation: String,
    configuration: Arc<LoggingConfiguration>,
    mappings: Vec<ParameterMapping>,
}

impl ResolvedEndpoint {
    /// An endpoint without body logging nor mappings.
    pub fn new(resource: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_configuration(mut self, configuration: LoggingConfiguration) -> Self {
        self.configuration = Arc::new(configuration);
        self
    }

    /// Sets already merged mappings.
    pub fn with_mappings(mut self, mappings: Vec<ParameterMapping>) -> Self {
        self.mappings = mappings;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn configuration(&self) -> &LoggingConfiguration {
        &self.configuration
    }

    pub(crate) fn shared_configuration(&self) -> Arc<LoggingConfiguration> {
        self.configuration.clone()
    }

    pub fn mappings(&self) -> &[ParameterMapping] {
        &self.mappings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogMode, ParamKind, Target};

    fn logged(mode: LogMode, limit: i64) -> Logged {
        Logged::new().with_body(BodyDeclaration::new([mode]).with_limit(limit))
    }

    #[test]
    fn test_operation_wins_over_contract_and_resource() {
        let resource = ResourceDeclarations::new("ArticleResource")
            .logged(logged(LogMode::Log, 3))
            .with_contract(
                ContractDeclarations::new("ArticleApi")
                    .logged(logged(LogMode::Log, 2))
                    .with_operation(OperationDeclarations::new("create").logged(logged(LogMode::Log, 2))),
            )
            .with_operation(OperationDeclarations::new("create").logged(logged(LogMode::Context, 1)));

        let endpoint = resource.resolve("create").unwrap();

        assert_eq!(endpoint.configuration().request.limit, 1);
        assert!(endpoint.configuration().request.publishes());
        assert!(!endpoint.configuration().request.logs());
        assert_eq!(endpoint.resource(), "ArticleResource");
        assert_eq!(endpoint.operation(), "create");
    }

    #[test]
    fn test_contract_method_then_contract_then_resource() {
        let contract = ContractDeclarations::new("ArticleApi")
            .logged(logged(LogMode::Log, 20))
            .with_operation(
                OperationDeclarations::new("update")
                    .with_parameters(["Article"])
                    .logged(logged(LogMode::Log, 10)),
            );
        let resource = ResourceDeclarations::new("ArticleResource")
            .logged(logged(LogMode::Log, 30))
            .with_contract(contract)
            .with_operation(OperationDeclarations::new("update").with_parameters(["Article"]))
            .with_operation(OperationDeclarations::new("update").with_parameters(["String"]))
            .with_operation(OperationDeclarations::new("delete"));

        let matched = resource.resolve_operation(&resource.operations[0]);
        let other_signature = resource.resolve_operation(&resource.operations[1]);
        let delete = resource.resolve("delete").unwrap();

        assert_eq!(matched.configuration().request.limit, 10);
        assert_eq!(other_signature.configuration().request.limit, 20);
        assert_eq!(delete.configuration().request.limit, 20);

        let bare = ResourceDeclarations::new("Bare")
            .logged(logged(LogMode::Log, 30))
            .with_operation(OperationDeclarations::new("get"));
        assert_eq!(bare.resolve("get").unwrap().configuration().request.limit, 30);
    }

    #[test]
    fn test_no_declaration_means_no_capture() {
        let resource = ResourceDeclarations::new("Plain").with_operation(OperationDeclarations::new("get"));
        let endpoint = resource.resolve("get").unwrap();

        assert_eq!(endpoint.configuration(), &LoggingConfiguration::default());
        assert!(resource.resolve("missing").is_none());
    }

    #[test]
    fn test_winning_scope_is_not_merged_field_by_field() {
        let resource = ResourceDeclarations::new("ArticleResource")
            .logged(Logged::new().with_body(
                BodyDeclaration::new([LogMode::Log]).targeting([Target::Response]),
            ))
            .with_operation(OperationDeclarations::new("create").logged(Logged::new().with_body(
                BodyDeclaration::new([LogMode::Log]).targeting([Target::Request]),
            )));

        let endpoint = resource.resolve("create").unwrap();

        assert!(endpoint.configuration().request.logs());
        assert!(!endpoint.configuration().response.is_active());
    }

    #[test]
    fn test_mappings_merged_across_scopes() {
        let resource = ResourceDeclarations::new("ArticleResource")
            .with_mapping(ParameterMapping::explicit(ParamKind::Path, "resource-field", ["id"]))
            .with_mapping(ParameterMapping::auto(ParamKind::Header))
            .with_contract(
                ContractDeclarations::new("ArticleApi")
                    .with_mapping(ParameterMapping::explicit(ParamKind::Path, "contract-type-field", ["id"]))
                    .with_operation(
                        OperationDeclarations::new("get")
                            .with_mapping(ParameterMapping::explicit(ParamKind::Path, "contract-field", ["id"])),
                    ),
            )
            .with_operation(
                OperationDeclarations::new("get")
                    .with_mapping(ParameterMapping::explicit(ParamKind::Path, "operation-field", ["id"]))
                    .with_mapping(ParameterMapping::explicit(ParamKind::Query, "page", ["page"])),
            )
            .with_operation(OperationDeclarations::new("list"));

        let get = resource.resolve("get").unwrap();
        let keys: Vec<&str> = get.mappings().iter().map(|m| m.field_key.as_str()).collect();
        assert_eq!(keys, vec!["operation-field", "page", ""]);

        let list = resource.resolve("list").unwrap();
        let keys: Vec<&str> = list.mappings().iter().map(|m| m.field_key.as_str()).collect();
        assert_eq!(keys, vec!["contract-type-field", ""]);
    }

    #[test]
    fn test_declarations_from_toml() {
        let resource = ResourceDeclarations::from_toml_str(
            r#"
            name = "ArticleResource"

            [logged]

            [[mappings]]
            kind = "header"
            field_key = "case-id"
            param_names = ["X-Case-ID"]

            [[operations]]
            name = "create"
            parameters = ["Article"]

            [[operations.logged.body]]
            modes = ["log", "context"]
            limit = 1024
            filters = ["secret"]
            targets = ["request"]

            [[contracts]]
            name = "ArticleApi"
            "#,
        )
        .unwrap();

        let endpoint = resource.resolve("create").unwrap();
        let request = &endpoint.configuration().request;
        assert!(request.logs() && request.publishes());
        assert_eq!(request.capture_limit(), Some(1024));
        assert_eq!(request.filters, vec!["secret".to_string()]);
        assert!(!endpoint.configuration().response.is_active());
        assert_eq!(endpoint.mappings()[0].kind, ParamKind::Header);

        assert!(ResourceDeclarations::from_toml_str("name = 3").is_err());
    }
}
