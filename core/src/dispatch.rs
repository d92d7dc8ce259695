use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::TransferBackend;
use crate::error::{CoreError, CoreResult};
use crate::registry::Registry;

pub const WILDCARD: &str = "*";

/// Effective transfer type after remapping. Order: exact entry in `remap`,
/// exact entry in the registry default table, `*` in `remap`, `*` in the
/// default table, then `transfer_type` itself.
pub fn effective_type<'a>(
    registry: &'a Registry,
    transfer_type: &'a str,
    remap: &'a HashMap<String, String>,
) -> &'a str {
    let defaults = registry.default_remap();
    remap
        .get(transfer_type)
        .or_else(|| defaults.get(transfer_type))
        .or_else(|| remap.get(WILDCARD))
        .or_else(|| defaults.get(WILDCARD))
        .map(String::as_str)
        .unwrap_or(transfer_type)
}

pub fn get_backend(
    registry: &Registry,
    transfer_type: &str,
    remap: &HashMap<String, String>,
) -> CoreResult<Arc<dyn TransferBackend>> {
    let target = effective_type(registry, transfer_type, remap);
    registry
        .backend(target)
        .ok_or_else(|| CoreError::UnsupportedTransferType(target.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TransferContext;
    use serde_json::Value;
    use std::path::Path;

    struct Named(&'static str);

    impl TransferBackend for Named {
        fn transfer_type(&self) -> &str {
            self.0
        }

        fn download(&self, _: &str, _: &Path, _: Option<&Value>, _: &TransferContext) -> CoreResult<()> {
            Ok(())
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        for name in ["http", "aria2", "tool", "fallback"] {
            registry.register_backend(Arc::new(Named(name)));
        }
        registry
    }

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn raw_type_when_nothing_maps() {
        let registry = registry();
        let backend = get_backend(&registry, "http", &HashMap::new()).unwrap();
        assert_eq!(backend.transfer_type(), "http");
    }

    #[test]
    fn caller_table_wins_over_defaults() {
        let mut registry = registry();
        registry.set_default_remap("http", "tool");
        let caller = map(&[("http", "aria2")]);
        assert_eq!(get_backend(&registry, "http", &caller).unwrap().transfer_type(), "aria2");
        assert_eq!(
            get_backend(&registry, "http", &HashMap::new()).unwrap().transfer_type(),
            "tool"
        );
    }

    #[test]
    fn exact_default_beats_caller_wildcard() {
        let mut registry = registry();
        registry.set_default_remap("http", "tool");
        let caller = map(&[("*", "aria2")]);
        assert_eq!(get_backend(&registry, "http", &caller).unwrap().transfer_type(), "tool");
        assert_eq!(get_backend(&registry, "ftp", &caller).unwrap().transfer_type(), "aria2");
    }

    #[test]
    fn default_wildcard_is_last_remap() {
        let mut registry = registry();
        registry.set_default_remap("*", "fallback");
        assert_eq!(
            get_backend(&registry, "anything", &HashMap::new()).unwrap().transfer_type(),
            "fallback"
        );
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let registry = registry();
        let err = get_backend(&registry, "torrent", &HashMap::new()).err().unwrap();
        assert!(matches!(err, CoreError::UnsupportedTransferType(ref t) if t == "torrent"));
        assert_eq!(err.to_string(), "not support transfer type [torrent]");

        let caller = map(&[("http", "missing")]);
        assert!(matches!(
            get_backend(&registry, "http", &caller),
            Err(CoreError::UnsupportedTransferType(_))
        ));
    }
}
