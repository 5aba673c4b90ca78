use maxx_protocol::JsonValue;

/// JSON-schema meta-fields the v1internal endpoint rejects.
const DROPPED_FIELDS: [&str; 18] = [
    "const",
    "$schema",
    "additionalProperties",
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "pattern",
    "format",
    "default",
    "examples",
    "title",
    "$id",
    "$ref",
    "$defs",
    "definitions",
];

/// Recursively strip schema meta-fields, normalise `[T, "null"]` unions and
/// lowercase type names.
pub fn clean_schema(schema: JsonValue) -> JsonValue {
    match schema {
        JsonValue::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                if DROPPED_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                match key.as_str() {
                    "type" => out.insert(key, clean_type(value)),
                    "properties" => {
                        if let JsonValue::Object(props) = value {
                            let cleaned = props
                                .into_iter()
                                .map(|(name, prop)| (name, clean_schema(prop)))
                                .collect();
                            out.insert(key, JsonValue::Object(cleaned))
                        } else {
                            out.insert(key, value)
                        }
                    }
                    "items" => out.insert(key, clean_schema(value)),
                    _ => out.insert(key, value),
                };
            }
            JsonValue::Object(out)
        }
        other => other,
    }
}

fn clean_type(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::String(name) => JsonValue::String(name.to_ascii_lowercase()),
        JsonValue::Array(types) => {
            let non_null: Vec<JsonValue> = types
                .into_iter()
                .filter(|t| !matches!(t, JsonValue::String(s) if s.eq_ignore_ascii_case("null")))
                .map(clean_type)
                .collect();
            match non_null.len() {
                1 => non_null.into_iter().next().unwrap_or(JsonValue::Null),
                _ => JsonValue::Array(non_null),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn meta_fields_removed_recursively() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "q": {"type": "string", "minLength": 1, "pattern": "^a"},
                "nested": {
                    "type": "object",
                    "properties": {"n": {"type": "integer", "maximum": 5}}
                }
            }
        });
        let cleaned = clean_schema(schema);
        assert_eq!(
            cleaned,
            json!({
                "type": "object",
                "properties": {
                    "q": {"type": "string"},
                    "nested": {"type": "object", "properties": {"n": {"type": "integer"}}}
                }
            })
        );
    }

    #[test]
    fn nullable_union_collapses() {
        let cleaned = clean_schema(json!({"type": ["String", "null"]}));
        assert_eq!(cleaned, json!({"type": "string"}));
    }

    #[test]
    fn items_cleaned() {
        let cleaned = clean_schema(json!({
            "type": "array",
            "items": {"type": "STRING", "format": "uri"}
        }));
        assert_eq!(cleaned, json!({"type": "array", "items": {"type": "string"}}));
    }
}
