//! Diagnostic context fields.
//!
//! A request publishes its fields (request id, method, status, bodies...) into
//! a [`DiagnosticContext`], the key/value store the log sink attaches to every
//! line. [`ContextFields`] remembers what it wrote and removes all of it when
//! the request ends, on every exit path.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The fixed catalogue of fields published for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoggedField {
    RequestId,
    RequestMethod,
    RequestUri,
    RequestParameters,
    RequestBody,
    ResponseBody,
    ResponseStatus,
    Resource,
    Operation,
    Duration,
}

impl LoggedField {
    pub const ALL: [LoggedField; 10] = [
        LoggedField::RequestId,
        LoggedField::RequestMethod,
        LoggedField::RequestUri,
        LoggedField::RequestParameters,
        LoggedField::RequestBody,
        LoggedField::ResponseBody,
        LoggedField::ResponseStatus,
        LoggedField::Resource,
        LoggedField::Operation,
        LoggedField::Duration,
    ];

    /// The slot name used unless renamed.
    pub fn default_name(self) -> &'static str {
        match self {
            LoggedField::RequestId => "request-id",
            LoggedField::RequestMethod => "request-method",
            LoggedField::RequestUri => "request-uri",
            LoggedField::RequestParameters => "request-parameters",
            LoggedField::RequestBody => "request-body",
            LoggedField::ResponseBody => "response-body",
            LoggedField::ResponseStatus => "response-status",
            LoggedField::Resource => "resource",
            LoggedField::Operation => "operation",
            LoggedField::Duration => "duration",
        }
    }

    /// Looks a field up by its default slot name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.default_name() == name)
    }
}

impl fmt::Display for LoggedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_name())
    }
}

/// Slot names of the logged fields, plus extra slots owned by extensions.
///
/// # Examples
///
/// ```rust
/// use logged_http::{FieldNames, LoggedField};
///
/// let names = FieldNames::default()
///     .rename(LoggedField::RequestId, "request-identifier")
///     .with_extra("user-id");
///
/// assert_eq!(names.slot(LoggedField::RequestId), "request-identifier");
/// assert!(names.all_slots().any(|slot| slot == "user-id"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNames {
    names: BTreeMap<LoggedField, String>,
    extra: BTreeSet<String>,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            names: LoggedField::ALL
                .into_iter()
                .map(|field| (field, field.default_name().to_string()))
                .collect(),
            extra: BTreeSet::new(),
        }
    }
}

impl FieldNames {
    /// Publishes `field` under `name` instead of its default slot.
    pub fn rename(mut self, field: LoggedField, name: impl Into<String>) -> Self {
        self.names.insert(field, name.into());
        self
    }

    /// Registers a slot written by an extension so it is cleared with the rest.
    pub fn with_extra(mut self, name: impl Into<String>) -> Self {
        self.extra.insert(name.into());
        self
    }

    pub fn slot(&self, field: LoggedField) -> &str {
        self.names
            .get(&field)
            .map(String::as_str)
            .unwrap_or_else(|| field.default_name())
    }

    /// Every slot this crate is responsible for clearing.
    pub fn all_slots(&self) -> impl Iterator<Item = &str> {
        self.names
            .values()
            .chain(self.extra.iter())
            .map(String::as_str)
    }
}

/// Key/value store attached to the log lines of the current request.
pub trait DiagnosticContext: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: String);
    fn remove(&self, key: &str);
    /// Copy of every entry, handed to the log sink with each line.
    fn snapshot(&self) -> BTreeMap<String, String>;
}

/// In-memory [`DiagnosticContext`]. Cloning shares the same entries.
#[derive(Debug, Clone, Default)]
pub struct MdcMap {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MdcMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DiagnosticContext for MdcMap {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: String) {
        self.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }
}

/// The fields one request wrote into a [`DiagnosticContext`].
///
/// Every slot written through this type is tracked. [`ContextFields::clear`]
/// removes the tracked slots together with every known slot name, and runs
/// again on drop if anything was published since.
pub struct ContextFields {
    store: Arc<dyn DiagnosticContext>,
    names: Arc<FieldNames>,
    written: BTreeSet<String>,
    cleared: bool,
}

impl ContextFields {
    pub fn new(store: Arc<dyn DiagnosticContext>, names: Arc<FieldNames>) -> Self {
        Self {
            store,
            names,
            written: BTreeSet::new(),
            cleared: false,
        }
    }

    pub fn names(&self) -> &FieldNames {
        &self.names
    }

    /// Publishes a catalogue field.
    pub fn publish(&mut self, field: LoggedField, value: impl Into<String>) {
        let slot = self.names.slot(field).to_string();
        self.put(&slot, value);
    }

    /// Publishes a catalogue field when there is a value, does nothing otherwise.
    pub fn publish_opt(&mut self, field: LoggedField, value: Option<String>) {
        if let Some(value) = value {
            self.publish(field, value);
        }
    }

    /// Writes an arbitrary slot, e.g. one produced by a parameter mapping.
    pub fn put(&mut self, slot: &str, value: impl Into<String>) {
        self.store.put(slot, value.into());
        self.written.insert(slot.to_string());
        self.cleared = false;
    }

    pub fn read(&self, field: LoggedField) -> Option<String> {
        self.store.get(self.names.slot(field))
    }

    pub fn get(&self, slot: &str) -> Option<String> {
        self.store.get(slot)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.store.snapshot()
    }

    /// Slots written since the last clear.
    pub fn written(&self) -> impl Iterator<Item = &str> {
        self.written.iter().map(String::as_str)
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    /// Removes every known and written slot. Calling it again is a no-op.
    pub fn clear(&mut self) {
        if self.cleared {
            return;
        }
        for slot in self.names.all_slots() {
            self.store.remove(slot);
        }
        for slot in std::mem::take(&mut self.written) {
            self.store.remove(&slot);
        }
        self.cleared = true;
    }
}

impl Drop for ContextFields {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for ContextFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextFields")
            .field("names", &self.names)
            .field("written", &self.written)
            .field("cleared", &self.cleared)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(store: &MdcMap, names: FieldNames) -> ContextFields {
        ContextFields::new(Arc::new(store.clone()), Arc::new(names))
    }

    #[test]
    fn test_default_slot_names() {
        let names = FieldNames::default();
        assert_eq!(names.slot(LoggedField::RequestId), "request-id");
        assert_eq!(names.slot(LoggedField::RequestBody), "request-body");
        assert_eq!(names.all_slots().count(), LoggedField::ALL.len());
    }

    #[test]
    fn test_from_name() {
        assert_eq!(LoggedField::from_name("duration"), Some(LoggedField::Duration));
        assert_eq!(LoggedField::from_name("unknown"), None);
    }

    #[test]
    fn test_publish_uses_renamed_slot() {
        let store = MdcMap::new();
        let mut fields = fields(
            &store,
            FieldNames::default().rename(LoggedField::RequestId, "request-identifier"),
        );

        fields.publish(LoggedField::RequestId, "abc");

        assert_eq!(store.get("request-identifier"), Some("abc".to_string()));
        assert_eq!(store.get("request-id"), None);
        assert_eq!(fields.read(LoggedField::RequestId), Some("abc".to_string()));
    }

    #[test]
    fn test_publish_opt_skips_none() {
        let store = MdcMap::new();
        let mut fields = fields(&store, FieldNames::default());

        fields.publish_opt(LoggedField::RequestBody, None);

        assert!(store.is_empty());
        assert_eq!(fields.written().count(), 0);
    }

    #[test]
    fn test_clear_removes_known_and_dynamic_slots() {
        let store = MdcMap::new();
        store.put("unrelated", "kept".to_string());
        let mut fields = fields(&store, FieldNames::default().with_extra("user-id"));

        fields.publish(LoggedField::RequestMethod, "GET");
        fields.put("order-id", "42");
        // Written by someone else under a slot this request owns
        store.put("user-id", "Doe".to_string());

        fields.clear();

        assert_eq!(store.snapshot(), BTreeMap::from([("unrelated".to_string(), "kept".to_string())]));
        assert!(fields.is_cleared());

        fields.clear();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_drop_clears() {
        let store = MdcMap::new();
        {
            let mut fields = fields(&store, FieldNames::default());
            fields.publish(LoggedField::ResponseStatus, "200");
            fields.put("tenant", "acme");
        }
        assert!(store.is_empty());
    }
}
