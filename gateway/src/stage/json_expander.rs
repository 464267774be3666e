//! Projects sub-fields of a JSON string field into top-level fields.

use async_trait::async_trait;
use serde_json::Value as Json;

use modelgate_common::{FieldSpec, Record, Schema, Value, ValueKind};

use crate::codec::json::value_from_json;
use crate::config::{JsonExpanderStepConfig, JsonMapping};
use crate::error::{GatewayError, Result};
use crate::stage::{RequestContext, Stage};

pub struct JsonExpanderStage {
    config: JsonExpanderStepConfig,
    /// One pointer per mapping, in mapping order.
    pointers: Vec<String>,
    schema_in: Schema,
    schema_out: Schema,
}

impl JsonExpanderStage {
    pub fn new(config: JsonExpanderStepConfig) -> Self {
        let pointers = config.mappings.iter().map(|m| to_pointer(&m.path)).collect();
        // optional mappings may be absent, so only required ones are promised
        let schema_out = config
            .mappings
            .iter()
            .filter(|m| m.required)
            .map(mapping_spec)
            .collect::<Vec<_>>();
        Self {
            schema_in: Schema::new(vec![FieldSpec::new(config.input.clone(), ValueKind::String)]),
            schema_out: Schema::new(schema_out),
            pointers,
            config,
        }
    }
}

fn mapping_spec(mapping: &JsonMapping) -> FieldSpec {
    let spec = FieldSpec::new(mapping.output.clone(), mapping.kind);
    match mapping.dtype {
        Some(dtype) => spec.with_dtype(dtype),
        None => spec,
    }
}

/// Turn a dotted path into a JSON pointer. Paths starting with `/` already
/// are pointers.
pub fn to_pointer(path: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        return path.to_string();
    }
    path.split('.')
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}

#[async_trait]
impl Stage for JsonExpanderStage {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> &'static str {
        "json-expander"
    }

    fn schema_in(&self) -> &Schema {
        &self.schema_in
    }

    fn schema_out(&self) -> &Schema {
        &self.schema_out
    }

    async fn apply(&self, input: &Record, _ctx: &RequestContext) -> Result<Record> {
        let text = input
            .get(&self.config.input)
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::BadRequest(format!("missing string field '{}'", self.config.input)))?;
        let document: Json = serde_json::from_str(text).map_err(|e| {
            GatewayError::BadRequest(format!("field '{}' is not valid JSON: {}", self.config.input, e))
        })?;

        let mut output = Record::new();
        for (mapping, pointer) in self.config.mappings.iter().zip(&self.pointers) {
            let found = match document.pointer(pointer) {
                Some(Json::Null) | None if mapping.required => {
                    return Err(GatewayError::BadRequest(format!(
                        "field '{}': path '{}' not found",
                        self.config.input, mapping.path
                    )))
                }
                Some(Json::Null) | None => continue,
                Some(found) => found,
            };
            let spec = mapping_spec(mapping);
            let value = value_from_json(&mapping.output, found, Some(&spec))?;
            spec.check(&value)?;
            output.insert(mapping.output.clone(), value)?;
        }
        Ok(output)
    }
}
