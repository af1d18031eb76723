//! Namespaced key/value annotations
//!
//! An annotation under the service namespace is the authoritative witness
//! that an image has been handled. Its presence alone decides; the values are
//! informational.

use crate::config::HashMode;
use biocode_core::ContentIdentifier;
use serde::{Deserialize, Serialize};

/// Default annotation namespace
pub const DEFAULT_NAMESPACE: &str = "org.iscc.omero.sum";

/// Composite content code
pub const KEY_SUM: &str = "iscc:sum";
/// First reported unit (Data-Code)
pub const KEY_DATA: &str = "iscc:data";
/// Multihash of the hashed stream
pub const KEY_DATAHASH: &str = "iscc:datahash";
/// External id from the registry
pub const KEY_ID: &str = "iscc:id";
/// Hash mode used
pub const KEY_MODE: &str = "iscc:mode";
/// Name of the original file hashed in file mode
pub const KEY_SOURCE_FILE: &str = "iscc:source_file";
/// Writer of the annotation
pub const KEY_PROCESSOR: &str = "iscc:processor";

/// Processor tag written into every annotation
pub const PROCESSOR: &str = concat!("biocode/", env!("CARGO_PKG_VERSION"));

/// Map annotation attached to an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Namespace the pairs belong to
    pub namespace: String,
    /// Ordered key/value pairs
    pub pairs: Vec<(String, String)>,
}

impl Annotation {
    /// Empty annotation in `namespace`
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pairs: Vec::new(),
        }
    }

    /// With one more pair
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    /// Annotation recording an identifier and, if known, its external id
    #[must_use]
    pub fn for_identifier(
        namespace: &str,
        id: &ContentIdentifier,
        iscc_id: Option<&str>,
        mode: HashMode,
        source_file: Option<&str>,
    ) -> Self {
        let mut ann = Self::new(namespace).with(KEY_SUM, &id.content_code);
        if let Some(unit) = id.reported_units().first() {
            ann = ann.with(KEY_DATA, unit);
        }
        ann = ann.with(KEY_DATAHASH, &id.data_hash);
        if let Some(iscc_id) = iscc_id {
            ann = ann.with(KEY_ID, iscc_id);
        }
        ann = ann.with(KEY_MODE, mode.to_string());
        if let Some(name) = source_file {
            ann = ann.with(KEY_SOURCE_FILE, name);
        }
        ann.with(KEY_PROCESSOR, PROCESSOR)
    }

    /// First value stored under `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the annotation belongs to `namespace`
    #[inline]
    #[must_use]
    pub fn is_in(&self, namespace: &str) -> bool {
        self.namespace == namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn identifier_annotation_carries_codes() {
        let id = biocode_core::identify_chunks([[0u8, 1, 2, 3]]);
        let ann = Annotation::for_identifier(DEFAULT_NAMESPACE, &id, Some("ISCC:MAIW"), HashMode::Pixels, None);

        assert!(ann.is_in(DEFAULT_NAMESPACE));
        assert_eq!(ann.get(KEY_SUM), Some(id.content_code.as_str()));
        assert_eq!(ann.get(KEY_DATA), Some(id.unit_codes[0].as_str()));
        assert_eq!(ann.get(KEY_DATAHASH), Some(id.data_hash.as_str()));
        assert_eq!(ann.get(KEY_ID), Some("ISCC:MAIW"));
        assert_eq!(ann.get(KEY_MODE), Some("pixels"));
        assert_eq!(ann.get(KEY_SOURCE_FILE), None);
        assert_eq!(ann.get(KEY_PROCESSOR), Some(PROCESSOR));
    }

    #[test]
    fn missing_external_id_is_omitted() {
        let id = biocode_core::identify_chunks([b"abc"]);
        let ann = Annotation::for_identifier("ns", &id, None, HashMode::File, Some("a.tif"));
        assert_eq!(ann.get(KEY_ID), None);
        assert_eq!(ann.get(KEY_SOURCE_FILE), Some("a.tif"));
        assert_eq!(ann.get(KEY_MODE), Some("file"));
        assert!(!ann.pairs.iter().any(|(k, _)| k == KEY_ID));
    }
}
