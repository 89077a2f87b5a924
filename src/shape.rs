//! JSON Schema to typed shape conversion.
//!
//! The registry needs to decide whether an upstream's schema for a tool has
//! actually changed, and raw schema JSON is full of noise (key order,
//! annotations we ignore). The conversion is a recursive walk producing a
//! typed value; its canonical serialization is what registrations compare.
//! Nothing here ever evaluates schema strings.

use serde_json::{json, Map, Value};

/// Typed shape of a tool input, as the downstream server understands it.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    String,
    Number,
    Integer,
    Boolean,
    /// Homogeneous array of one element shape.
    Array(Box<Shape>),
    /// Object with named properties; each is optional unless required.
    Object(Vec<ObjectProperty>),
    /// Anything the converter does not model.
    Opaque,
}

/// One property of an object shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectProperty {
    pub name: String,
    pub shape: Shape,
    pub required: bool,
    pub description: Option<String>,
}

impl Shape {
    /// Convert a JSON Schema value into a shape.
    ///
    /// Supports `string`, `number`, `integer`, `boolean`, homogeneous
    /// arrays of those four plus `object`, and recursive objects. Anything
    /// else (unions, enums, missing type) becomes [`Shape::Opaque`].
    pub fn from_schema(schema: &Value) -> Shape {
        let Some(obj) = schema.as_object() else {
            return Shape::Opaque;
        };

        match obj.get("type").and_then(Value::as_str) {
            Some("string") => Shape::String,
            Some("number") => Shape::Number,
            Some("integer") => Shape::Integer,
            Some("boolean") => Shape::Boolean,
            Some("array") => match obj.get("items") {
                Some(items) => match Shape::from_schema(items) {
                    Shape::Opaque => Shape::Opaque,
                    element => Shape::Array(Box::new(element)),
                },
                None => Shape::Opaque,
            },
            Some("object") => {
                let required: Vec<&str> = obj
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|r| r.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();

                let mut properties: Vec<ObjectProperty> = obj
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| {
                        props
                            .iter()
                            .map(|(name, prop_schema)| ObjectProperty {
                                name: name.clone(),
                                shape: Shape::from_schema(prop_schema),
                                required: required.contains(&name.as_str()),
                                description: prop_schema
                                    .get("description")
                                    .and_then(Value::as_str)
                                    .map(String::from),
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                // Key order in the source schema is not meaningful.
                properties.sort_by(|a, b| a.name.cmp(&b.name));
                Shape::Object(properties)
            }
            _ => Shape::Opaque,
        }
    }

    /// Canonical serialized form used for schema equality.
    pub fn canonical(&self) -> String {
        self.canonical_value().to_string()
    }

    fn canonical_value(&self) -> Value {
        match self {
            Shape::String => json!("string"),
            Shape::Number => json!("number"),
            Shape::Integer => json!("integer"),
            Shape::Boolean => json!("boolean"),
            Shape::Array(element) => json!({ "array": element.canonical_value() }),
            Shape::Object(properties) => {
                let mut map = Map::new();
                for prop in properties {
                    let mut entry = Map::new();
                    entry.insert("shape".to_string(), prop.shape.canonical_value());
                    entry.insert("required".to_string(), json!(prop.required));
                    if let Some(desc) = &prop.description {
                        entry.insert("description".to_string(), json!(desc));
                    }
                    map.insert(prop.name.clone(), Value::Object(entry));
                }
                json!({ "object": map })
            }
            Shape::Opaque => json!("opaque"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_types() {
        assert_eq!(Shape::from_schema(&json!({"type": "string"})), Shape::String);
        assert_eq!(Shape::from_schema(&json!({"type": "number"})), Shape::Number);
        assert_eq!(
            Shape::from_schema(&json!({"type": "integer"})),
            Shape::Integer
        );
        assert_eq!(
            Shape::from_schema(&json!({"type": "boolean"})),
            Shape::Boolean
        );
    }

    #[test]
    fn test_unsupported_becomes_opaque() {
        assert_eq!(Shape::from_schema(&json!({"type": "null"})), Shape::Opaque);
        assert_eq!(Shape::from_schema(&json!({"oneOf": []})), Shape::Opaque);
        assert_eq!(Shape::from_schema(&json!(true)), Shape::Opaque);
        assert_eq!(
            Shape::from_schema(&json!({"type": "array"})),
            Shape::Opaque
        );
    }

    #[test]
    fn test_array_of_scalars() {
        let shape = Shape::from_schema(&json!({
            "type": "array",
            "items": {"type": "integer"}
        }));
        assert_eq!(shape, Shape::Array(Box::new(Shape::Integer)));
    }

    #[test]
    fn test_recursive_object_with_required() {
        let shape = Shape::from_schema(&json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Server name"},
                "limits": {
                    "type": "object",
                    "properties": {
                        "daily": {"type": "integer"}
                    }
                }
            },
            "required": ["name"]
        }));

        let Shape::Object(props) = shape else {
            panic!("expected object shape");
        };
        assert_eq!(props.len(), 2);
        // Sorted by name.
        assert_eq!(props[0].name, "limits");
        assert!(!props[0].required);
        assert_eq!(props[1].name, "name");
        assert!(props[1].required);
        assert_eq!(props[1].description.as_deref(), Some("Server name"));
    }

    #[test]
    fn test_canonical_ignores_key_order() {
        let a = Shape::from_schema(&json!({
            "type": "object",
            "properties": {
                "a": {"type": "string"},
                "b": {"type": "number"}
            }
        }));
        let b = Shape::from_schema(&json!({
            "type": "object",
            "properties": {
                "b": {"type": "number"},
                "a": {"type": "string"}
            }
        }));
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_canonical_detects_type_change() {
        let a = Shape::from_schema(&json!({
            "type": "object",
            "properties": {"x": {"type": "string"}}
        }));
        let b = Shape::from_schema(&json!({
            "type": "object",
            "properties": {"x": {"type": "integer"}}
        }));
        assert_ne!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_canonical_detects_required_change() {
        let a = Shape::from_schema(&json!({
            "type": "object",
            "properties": {"x": {"type": "string"}}
        }));
        let b = Shape::from_schema(&json!({
            "type": "object",
            "properties": {"x": {"type": "string"}},
            "required": ["x"]
        }));
        assert_ne!(a.canonical(), b.canonical());
    }
}
