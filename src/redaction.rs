//! Body redaction filters.
//!
//! Filters are registered under stable identifiers at startup and referenced
//! by identifier from the logging configuration. Instances are built on first
//! use and shared by every request afterwards, so they must be stateless.

use dashmap::DashMap;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// Rewrites a captured body before it is logged.
///
/// Implementations must be stateless and safe to call from concurrent requests.
/// Plain closures `Fn(String) -> String` are filters too.
pub trait BodyFilter: Send + Sync + 'static {
    fn filter(&self, body: String) -> String;
}

impl<F> BodyFilter for F
where
    F: Fn(String) -> String + Send + Sync + 'static,
{
    fn filter(&self, body: String) -> String {
        self(body)
    }
}

/// Error raised when a filter identifier cannot be turned into an instance.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("no body filter registered under '{0}'")]
    Unknown(String),
    #[error("invalid redaction pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("unable to build body filter: {0}")]
    Construction(String),
}

type Constructor = Arc<dyn Fn() -> Result<Arc<dyn BodyFilter>, FilterError> + Send + Sync>;

/// Identifier to filter lookup, with a cache of built instances.
///
/// Lookups are safe from concurrent requests. When two requests race to build
/// the same filter the first stored instance wins; the other is dropped.
/// A filter that fails to build is logged once and skipped from then on.
///
/// # Examples
///
/// ```rust
/// use logged_http::{BodyFilter, FieldMask, FilterRegistry};
/// use std::sync::Arc;
///
/// let registry = FilterRegistry::new()
///     .register("secret", || {
///         Ok(Arc::new(FieldMask::new(["secret-code"])?) as Arc<dyn BodyFilter>)
///     })
///     .register_instance("trim", |body: String| body.trim().to_string());
///
/// let chain = registry.chain(&["secret".to_string(), "trim".to_string()]);
/// assert_eq!(
///     chain.apply(r#" {"secret-code":"1234"} "#.to_string()),
///     r#"{"secret-code":"masked"}"#
/// );
/// ```
#[derive(Default)]
pub struct FilterRegistry {
    constructors: HashMap<String, Constructor>,
    instances: DashMap<String, Option<Arc<dyn BodyFilter>>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor, called the first time `id` is used.
    pub fn register<F>(mut self, id: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn BodyFilter>, FilterError> + Send + Sync + 'static,
    {
        let id = id.into();
        self.instances.remove(&id);
        self.constructors.insert(id, Arc::new(constructor));
        self
    }

    /// Registers a ready-made filter.
    pub fn register_instance(mut self, id: impl Into<String>, filter: impl BodyFilter) -> Self {
        let id = id.into();
        self.constructors.remove(&id);
        self.instances.insert(id, Some(Arc::new(filter)));
        self
    }

    /// Resolves `id` to a shared instance, `None` if it is unknown or failed to build.
    pub fn resolve(&self, id: &str) -> Option<Arc<dyn BodyFilter>> {
        if let Some(cached) = self.instances.get(id) {
            return cached.value().clone();
        }

        let built = match self.constructors.get(id) {
            Some(constructor) => constructor(),
            None => Err(FilterError::Unknown(id.to_string())),
        };
        let instance = match built {
            Ok(filter) => Some(filter),
            Err(e) => {
                error!(filter = %id, error = %e, "Unable to instantiate body filter, it will be skipped");
                None
            }
        };

        self.instances
            .entry(id.to_string())
            .or_insert(instance)
            .value()
            .clone()
    }

    /// Builds the chain for the given identifiers, skipping the ones that do not resolve.
    pub fn chain(&self, ids: &[String]) -> RedactionChain {
        RedactionChain::new(ids.iter().filter_map(|id| self.resolve(id)))
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.constructors.keys().cloned().collect();
        ids.extend(self.instances.iter().map(|entry| entry.key().clone()));
        ids.sort();
        ids.dedup();
        f.debug_struct("FilterRegistry").field("filters", &ids).finish()
    }
}

/// Ordered filters, each one receiving the output of the previous one.
#[derive(Clone, Default)]
pub struct RedactionChain {
    filters: Vec<Arc<dyn BodyFilter>>,
}

impl RedactionChain {
    pub fn new(filters: impl IntoIterator<Item = Arc<dyn BodyFilter>>) -> Self {
        Self {
            filters: filters.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn apply(&self, payload: String) -> String {
        self.filters
            .iter()
            .fold(payload, |body, filter| filter.filter(body))
    }
}

impl fmt::Debug for RedactionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedactionChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Masks the string values of the named JSON fields, leaving the rest of the
/// payload byte for byte untouched.
#[derive(Debug, Clone)]
pub struct FieldMask {
    pattern: Regex,
    replacement: String,
}

impl FieldMask {
    /// Masks `fields` with `"masked"`.
    pub fn new<I, S>(fields: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = fields
            .into_iter()
            .map(|field| regex::escape(field.as_ref()))
            .collect();
        if names.is_empty() {
            return Err(FilterError::Construction("no field to mask".to_string()));
        }
        let pattern = Regex::new(&format!(
            r#"(?P<key>"(?:{})"\s*:\s*)"(?:[^"\\]|\\.)*(?:"|$)"#,
            names.join("|")
        ))?;

        Ok(Self {
            pattern,
            replacement: "masked".to_string(),
        })
    }

    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = replacement.into();
        self
    }
}

impl BodyFilter for FieldMask {
    fn filter(&self, body: String) -> String {
        let replacement = format!("${{key}}\"{}\"", self.replacement.replace('$', "$$"));
        self.pattern
            .replace_all(&body, replacement.as_str())
            .into_owned()
    }
}

/// Replaces every match of a regular expression.
#[derive(Debug, Clone)]
pub struct PatternMask {
    pattern: Regex,
    replacement: String,
}

impl PatternMask {
    /// `replacement` may reference capture groups (`$1`, `${name}`).
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, FilterError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }
}

impl BodyFilter for PatternMask {
    fn filter(&self, body: String) -> String {
        self.pattern
            .replace_all(&body, self.replacement.as_str())
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_field_mask_keeps_layout() {
        let mask = FieldMask::new(["secret-code"]).unwrap();

        let compact = mask.filter(r#"{"content":"My Article","secret-code":"1234-ABCD"}"#.to_string());
        assert_eq!(compact, r#"{"content":"My Article","secret-code":"masked"}"#);

        let spaced = mask.filter(r#"{ "secret-code": "1234-ABCD", "content": "x" }"#.to_string());
        assert_eq!(spaced, r#"{ "secret-code": "masked", "content": "x" }"#);
    }

    #[test]
    fn test_field_mask_escaped_quotes_and_replacement() {
        let mask = FieldMask::new(["password", "token"])
            .unwrap()
            .with_replacement("***");

        let body = r#"{"password":"a\"b","token":"t","user":"u"}"#.to_string();
        assert_eq!(mask.filter(body), r#"{"password":"***","token":"***","user":"u"}"#);
    }

    #[test]
    fn test_field_mask_covers_value_cut_by_capture_limit() {
        let mask = FieldMask::new(["secret-code"]).unwrap();

        let truncated = r#"{"content":"My Article","secret-code":"1234"#.to_string();
        assert_eq!(mask.filter(truncated), r#"{"content":"My Article","secret-code":"masked""#);
    }

    #[test]
    fn test_field_mask_requires_a_field() {
        let fields: [&str; 0] = [];
        assert!(matches!(FieldMask::new(fields), Err(FilterError::Construction(_))));
    }

    #[test]
    fn test_pattern_mask() {
        let mask = PatternMask::new(r"\d{4}-\d{4}-\d{4}-(\d{4})", "****-$1").unwrap();
        assert_eq!(mask.filter("card 1111-2222-3333-4444".to_string()), "card ****-4444");
        assert!(PatternMask::new("(", "").is_err());
    }

    #[test]
    fn test_chain_applies_in_order() {
        let chain = RedactionChain::new([
            Arc::new(|body: String| body.replace('a', "b")) as Arc<dyn BodyFilter>,
            Arc::new(|body: String| body.replace('b', "c")) as Arc<dyn BodyFilter>,
        ]);

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.apply("aab".to_string()), "ccc");
        assert_eq!(RedactionChain::default().apply("same".to_string()), "same");
    }

    #[test]
    fn test_registry_caches_instances() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let registry = FilterRegistry::new().register("upper", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(|body: String| body.to_uppercase()) as Arc<dyn BodyFilter>)
        });

        let first = registry.resolve("upper").unwrap();
        let second = registry.resolve("upper").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_skips_failing_and_unknown_filters() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let registry = FilterRegistry::new()
            .register("broken", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(FilterError::Construction("missing key".to_string()))
            })
            .register_instance("upper", |body: String| body.to_uppercase());

        let ids = ["broken", "missing", "upper"].map(String::from);
        let chain = registry.chain(&ids);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.apply("body".to_string()), "BODY");

        registry.chain(&ids);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_concurrent_lookup() {
        let registry = Arc::new(
            FilterRegistry::new()
                .register("secret", || Ok(Arc::new(FieldMask::new(["secret-code"])?) as Arc<dyn BodyFilter>)),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.resolve("secret").is_some())
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
