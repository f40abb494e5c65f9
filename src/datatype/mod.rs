//! Data type codec contract
//!
//! Every wire format a channel speaks implements [`DataType`]: raw to
//! transformable form and back, metadata extraction for routing, and
//! up-front validation. Protocol-heavy codecs (HL7 v2, X12, NCPDP) are
//! external collaborators registered at startup; the crate ships the three
//! reference codecs the engine itself needs: `RAW`, `JSON` and `DELIMITED`.

use crate::error::{EngineError, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Codec between a wire format and the transformable form scripts operate on
pub trait DataType: Send + Sync {
    fn name(&self) -> &str;

    /// Parse the raw wire form into the transformable form
    fn to_transformable(&self, raw: &str) -> Result<String>;

    /// Serialize the transformable form back to the wire form
    fn from_transformable(&self, transformable: &str) -> Result<String>;

    /// Routing facts extracted from the raw form (message type, version, ...)
    fn metadata(&self, raw: &str) -> HashMap<String, String>;

    /// Reject input the codec cannot represent; called before parsing
    fn validate(&self, raw: &str) -> Result<()>;
}

/// Pass-through codec; the transformable form is the raw text itself
pub struct RawDataType;

impl DataType for RawDataType {
    fn name(&self) -> &str {
        "RAW"
    }

    fn to_transformable(&self, raw: &str) -> Result<String> {
        self.validate(raw)?;
        Ok(raw.to_string())
    }

    fn from_transformable(&self, transformable: &str) -> Result<String> {
        Ok(transformable.to_string())
    }

    fn metadata(&self, _raw: &str) -> HashMap<String, String> {
        HashMap::new()
    }

    fn validate(&self, raw: &str) -> Result<()> {
        if raw.is_empty() {
            return Err(EngineError::Serialization("empty message".to_string()));
        }
        Ok(())
    }
}

/// JSON codec; the transformable form is canonicalized JSON
pub struct JsonDataType;

impl DataType for JsonDataType {
    fn name(&self) -> &str {
        "JSON"
    }

    fn to_transformable(&self, raw: &str) -> Result<String> {
        self.validate(raw)?;
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Ok(value.to_string())
    }

    fn from_transformable(&self, transformable: &str) -> Result<String> {
        // the transformable form is already JSON; re-parse to catch script damage
        let value: serde_json::Value = serde_json::from_str(transformable)?;
        Ok(value.to_string())
    }

    fn metadata(&self, raw: &str) -> HashMap<String, String> {
        let mut meta = HashMap::new();
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
            let kind = match value {
                serde_json::Value::Object(_) => "object",
                serde_json::Value::Array(_) => "array",
                _ => "scalar",
            };
            meta.insert("jsonType".to_string(), kind.to_string());
        }
        meta
    }

    fn validate(&self, raw: &str) -> Result<()> {
        if raw.trim().is_empty() {
            return Err(EngineError::Serialization("empty message".to_string()));
        }
        serde_json::from_str::<serde_json::Value>(raw)
            .map_err(|e| EngineError::Serialization(format!("invalid JSON: {}", e)))?;
        Ok(())
    }
}

/// Delimited text codec. The transformable form is a JSON array of record
/// arrays, so scripts address cells as `msg[record][column]`.
pub struct DelimitedDataType {
    column_delimiter: char,
    record_delimiter: char,
}

impl DelimitedDataType {
    pub fn new(column_delimiter: char, record_delimiter: char) -> Self {
        Self {
            column_delimiter,
            record_delimiter,
        }
    }
}

impl Default for DelimitedDataType {
    fn default() -> Self {
        Self::new(',', '\n')
    }
}

impl DataType for DelimitedDataType {
    fn name(&self) -> &str {
        "DELIMITED"
    }

    fn to_transformable(&self, raw: &str) -> Result<String> {
        self.validate(raw)?;
        let records: Vec<Vec<String>> = raw
            .split(self.record_delimiter)
            .filter(|record| !record.is_empty())
            .map(|record| {
                record
                    .split(self.column_delimiter)
                    .map(|column| column.to_string())
                    .collect()
            })
            .collect();
        Ok(serde_json::to_string(&records)?)
    }

    fn from_transformable(&self, transformable: &str) -> Result<String> {
        let records: Vec<Vec<String>> = serde_json::from_str(transformable)?;
        let lines: Vec<String> = records
            .iter()
            .map(|record| record.join(&self.column_delimiter.to_string()))
            .collect();
        Ok(lines.join(&self.record_delimiter.to_string()))
    }

    fn metadata(&self, raw: &str) -> HashMap<String, String> {
        let mut meta = HashMap::new();
        let records = raw
            .split(self.record_delimiter)
            .filter(|r| !r.is_empty())
            .count();
        meta.insert("recordCount".to_string(), records.to_string());
        meta
    }

    fn validate(&self, raw: &str) -> Result<()> {
        if raw.is_empty() {
            return Err(EngineError::Serialization("empty message".to_string()));
        }
        Ok(())
    }
}

/// Registry of codecs available to channels, keyed by data type name
pub struct DataTypeRegistry {
    codecs: DashMap<String, Arc<dyn DataType>>,
}

impl DataTypeRegistry {
    /// Registry pre-loaded with the reference codecs
    pub fn with_defaults() -> Self {
        let registry = Self {
            codecs: DashMap::new(),
        };
        registry.register(Arc::new(RawDataType));
        registry.register(Arc::new(JsonDataType));
        registry.register(Arc::new(DelimitedDataType::default()));
        registry
    }

    pub fn register(&self, codec: Arc<dyn DataType>) {
        self.codecs.insert(codec.name().to_string(), codec);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DataType>> {
        self.codecs.get(name).map(|c| c.clone()).ok_or_else(|| {
            EngineError::Configuration(format!("unknown data type '{}'", name))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.codecs.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_input_is_a_validation_error_not_a_panic() {
        for codec in [
            Box::new(RawDataType) as Box<dyn DataType>,
            Box::new(JsonDataType),
            Box::new(DelimitedDataType::default()),
        ] {
            let err = codec.to_transformable("").unwrap_err();
            assert!(matches!(err, EngineError::Serialization(_)), "{}", codec.name());
        }
    }

    #[test]
    fn json_round_trip_is_stable_for_canonical_input() {
        let codec = JsonDataType;
        let canonical = codec.to_transformable(r#"{ "a": 1, "b": [true, null] }"#).unwrap();
        let back = codec.from_transformable(&canonical).unwrap();
        assert_eq!(back, canonical);
    }

    #[test]
    fn delimited_round_trip() {
        let codec = DelimitedDataType::new('|', '\n');
        let raw = "PID|123|DOE^JOHN\nOBX|1|98.6";
        let transformable = codec.to_transformable(raw).unwrap();
        assert_eq!(codec.from_transformable(&transformable).unwrap(), raw);
        assert_eq!(codec.metadata(raw).get("recordCount").unwrap(), "2");
    }

    #[test]
    fn registry_rejects_unknown_types() {
        let registry = DataTypeRegistry::with_defaults();
        assert!(registry.get("RAW").is_ok());
        assert!(matches!(
            registry.get("HL7V2"),
            Err(EngineError::Configuration(_))
        ));
    }
}
