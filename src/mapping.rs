//! Request parameters to diagnostic fields.
//!
//! Mappings declared at several scopes are merged once, when the endpoint is
//! resolved, and applied to every request of that endpoint.

use crate::context::ContextFields;
use crate::types::{same_name, ParamKind, ParameterMapping};
use axum::http::HeaderMap;
use std::collections::HashMap;

/// Merges mappings from the operation, contract and resource scopes, in that
/// priority order.
///
/// A mapping is dropped when an already accepted mapping of the same kind
/// shares one of its parameter names, so for an overlapping name the highest
/// scope wins. Mappings that do not overlap are all kept.
pub fn merge_mappings(
    operation: &[ParameterMapping],
    contract: &[ParameterMapping],
    resource: &[ParameterMapping],
) -> Vec<ParameterMapping> {
    let mut merged: Vec<ParameterMapping> = Vec::new();
    for candidate in operation.iter().chain(contract).chain(resource) {
        if merged.iter().all(|accepted| !accepted.overlaps(candidate)) {
            merged.push(candidate.clone());
        }
    }
    merged
}

/// Parameters of one request, grouped by kind.
#[derive(Debug, Clone, Copy)]
pub struct RequestParameters<'a> {
    /// Query parameters in order of first appearance
    pub query: &'a [(String, Vec<String>)],
    /// Path parameters captured by the router
    pub path: &'a [(String, String)],
    pub headers: &'a HeaderMap,
}

impl RequestParameters<'_> {
    /// Every parameter of `kind` with all its values.
    fn entries(&self, kind: ParamKind) -> Vec<(String, Vec<String>)> {
        match kind {
            ParamKind::Query => self.query.to_vec(),
            ParamKind::Path => self
                .path
                .iter()
                .map(|(name, value)| (name.clone(), vec![value.clone()]))
                .collect(),
            ParamKind::Header => self
                .headers
                .keys()
                .map(|name| {
                    let values = self
                        .headers
                        .get_all(name)
                        .iter()
                        .filter_map(|value| value.to_str().ok())
                        .map(str::to_string)
                        .collect();
                    (name.as_str().to_string(), values)
                })
                .collect(),
        }
    }
}

/// Applies the mappings to the request parameters, writing the produced fields.
///
/// Explicit mappings run before automatic ones, exclusion-only mappings first
/// among them, so an automatic mapping never overwrites a field set explicitly
/// from the same parameter. Each explicit mapping claims its parameter names
/// for the rest of the request.
pub fn apply_mappings(
    mappings: &[ParameterMapping],
    parameters: &RequestParameters<'_>,
    fields: &mut ContextFields,
) {
    let mut ordered: Vec<&ParameterMapping> = mappings.iter().collect();
    ordered.sort_by_key(|mapping| (mapping.auto, !mapping.is_exclusion()));

    let mut entries: HashMap<ParamKind, Vec<(String, Vec<String>)>> = HashMap::new();
    let mut claimed: HashMap<ParamKind, Vec<String>> = HashMap::new();

    for mapping in ordered {
        let entries = entries
            .entry(mapping.kind)
            .or_insert_with(|| parameters.entries(mapping.kind));
        let claimed = claimed.entry(mapping.kind).or_default();
        map_parameters(entries, mapping, claimed, fields);
    }
}

fn map_parameters(
    entries: &[(String, Vec<String>)],
    mapping: &ParameterMapping,
    claimed: &mut Vec<String>,
    fields: &mut ContextFields,
) {
    let kind = mapping.kind;
    let is_claimed =
        |claimed: &[String], name: &str| claimed.iter().any(|c| same_name(kind, c, name));

    if mapping.auto {
        for (name, values) in entries {
            if is_claimed(claimed, name) {
                continue;
            }
            if let Some(value) = values.first() {
                fields.put(&format!("{}{}", mapping.field_prefix, name), value.clone());
            }
        }
        return;
    }

    if mapping
        .param_names
        .iter()
        .any(|name| is_claimed(claimed, name))
    {
        return;
    }
    claimed.extend(mapping.param_names.iter().cloned());

    if mapping.is_exclusion() {
        return;
    }
    let value = mapping.param_names.iter().find_map(|wanted| {
        entries
            .iter()
            .find(|(name, _)| same_name(kind, name, wanted))
            .and_then(|(_, values)| values.first())
    });
    if let Some(value) = value {
        fields.put(
            &format!("{}{}", mapping.field_prefix, mapping.field_key),
            value.clone(),
        );
    }
}

/// Query pairs grouped by name, in order of first appearance.
pub fn parse_query(query: Option<&str>) -> Vec<(String, Vec<String>)> {
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (name, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match grouped.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, values)) => values.push(value.into_owned()),
            None => grouped.push((name.into_owned(), vec![value.into_owned()])),
        }
    }
    grouped
}

/// `a=1,2&b=3`, sorted by name.
pub fn summarize_query(query: &[(String, Vec<String>)]) -> String {
    let mut sorted: Vec<&(String, Vec<String>)> = query.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted
        .iter()
        .map(|(name, values)| format!("{}={}", name, values.join(",")))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DiagnosticContext, FieldNames, MdcMap};
    use axum::http::HeaderValue;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn run(mappings: &[ParameterMapping], query: &str, path: &[(&str, &str)], headers: &[(&'static str, &str)]) -> BTreeMap<String, String> {
        let store = MdcMap::new();
        let query = parse_query(Some(query));
        let path: Vec<(String, String)> = path
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            header_map.append(*name, HeaderValue::from_str(value).unwrap());
        }

        let mut fields = ContextFields::new(Arc::new(store.clone()), Arc::new(FieldNames::default()));
        apply_mappings(
            mappings,
            &RequestParameters {
                query: &query,
                path: &path,
                headers: &header_map,
            },
            &mut fields,
        );
        let snapshot = store.snapshot();
        drop(fields);
        snapshot
    }

    #[test]
    fn test_merge_operation_wins_over_contract_and_resource() {
        let operation = [ParameterMapping::explicit(ParamKind::Query, "op-field", ["id"])];
        let contract = [ParameterMapping::explicit(ParamKind::Query, "contract-field", ["id", "other"])];
        let resource = [
            ParameterMapping::explicit(ParamKind::Query, "resource-field", ["id"]),
            ParameterMapping::explicit(ParamKind::Path, "resource-path", ["id"]),
        ];

        let merged = merge_mappings(&operation, &contract, &resource);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].field_key, "op-field");
        assert_eq!(merged[1].field_key, "resource-path");
    }

    #[test]
    fn test_merge_keeps_all_auto_mappings() {
        let merged = merge_mappings(
            &[ParameterMapping::auto(ParamKind::Query)],
            &[ParameterMapping::auto(ParamKind::Query).with_prefix("q-")],
            &[ParameterMapping::explicit(ParamKind::Header, "case", ["X-Case-ID"])],
        );
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_merge_dedupes_within_a_scope() {
        let merged = merge_mappings(
            &[
                ParameterMapping::explicit(ParamKind::Header, "first", ["X-Tenant"]),
                ParameterMapping::explicit(ParamKind::Header, "second", ["x-tenant"]),
            ],
            &[],
            &[],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].field_key, "first");
    }

    #[test]
    fn test_auto_mapping() {
        let fields = run(&[ParameterMapping::auto(ParamKind::Query).with_prefix("q-")], "a=1&b=2&a=3", &[], &[]);
        assert_eq!(fields.get("q-a"), Some(&"1".to_string()));
        assert_eq!(fields.get("q-b"), Some(&"2".to_string()));
    }

    #[test]
    fn test_explicit_mapping_takes_first_present_name() {
        let mapping = ParameterMapping::explicit(ParamKind::Path, "article", ["article-id", "id"]);
        let fields = run(&[mapping], "", &[("id", "7")], &[]);
        assert_eq!(fields, BTreeMap::from([("article".to_string(), "7".to_string())]));
    }

    #[test]
    fn test_auto_never_overwrites_explicit_field() {
        // Auto declared first, still applied after the explicit mapping
        let mappings = [
            ParameterMapping::auto(ParamKind::Query),
            ParameterMapping::explicit(ParamKind::Query, "user", ["login"]),
        ];
        let fields = run(&mappings, "login=doe&page=2", &[], &[]);

        assert_eq!(fields.get("user"), Some(&"doe".to_string()));
        assert_eq!(fields.get("login"), None);
        assert_eq!(fields.get("page"), Some(&"2".to_string()));
    }

    #[test]
    fn test_explicit_claims_names_from_auto() {
        let mappings = [
            ParameterMapping::auto(ParamKind::Header).with_prefix("h-"),
            ParameterMapping::explicit(ParamKind::Header, "case-id", ["X-Case-ID"]),
        ];
        let fields = run(&mappings, "", &[], &[("x-case-id", "C-1"), ("accept", "text/plain")]);

        assert_eq!(fields.get("case-id"), Some(&"C-1".to_string()));
        assert_eq!(fields.get("h-x-case-id"), None);
        assert_eq!(fields.get("h-accept"), Some(&"text/plain".to_string()));
    }

    #[test]
    fn test_exclusion_runs_first_and_emits_nothing() {
        let mappings = [
            ParameterMapping::explicit(ParamKind::Query, "token-field", ["token"]),
            ParameterMapping::exclude(ParamKind::Query, ["token"]),
            ParameterMapping::auto(ParamKind::Query),
        ];
        let fields = run(&mappings, "token=secret&page=1", &[], &[]);

        assert_eq!(fields, BTreeMap::from([("page".to_string(), "1".to_string())]));
    }

    #[test]
    fn test_kinds_are_independent() {
        let mappings = [
            ParameterMapping::explicit(ParamKind::Path, "article", ["id"]),
            ParameterMapping::auto(ParamKind::Query),
        ];
        let fields = run(&mappings, "id=q", &[("id", "p")], &[]);

        assert_eq!(fields.get("article"), Some(&"p".to_string()));
        assert_eq!(fields.get("id"), Some(&"q".to_string()));
    }

    #[test]
    fn test_parse_and_summarize_query() {
        let query = parse_query(Some("b=2&a=1&b=3&c=x%20y"));
        assert_eq!(query[0], ("b".to_string(), vec!["2".to_string(), "3".to_string()]));
        assert_eq!(summarize_query(&query), "a=1&b=2,3&c=x y");
        assert!(parse_query(None).is_empty());
        assert_eq!(summarize_query(&[]), "");
    }
}
