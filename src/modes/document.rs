use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record flowing between modes.
///
/// Serialized flat: `{"link": "...", "<field>": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub link: String,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a field.
    ///
    /// `"link"` always targets [`Document::link`]: a string is stored as is,
    /// any other value as its JSON text. Use [`Document::set_link`] to set it
    /// from a string directly.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        if name == "link" {
            self.link = match value.into() {
                Value::String(link) => link,
                other => other.to_string(),
            };
            return;
        }
        self.fields.insert(name, value.into());
    }

    pub fn set_link(&mut self, link: impl Into<String>) {
        self.link = link.into();
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Convert a typed record with a flat `link` field into a document
    pub fn from_record<T: Serialize>(record: &T) -> Result<Self, SchemaError> {
        let value = serde_json::to_value(record).map_err(|e| SchemaError::Decode(e.to_string()))?;
        Schema::document().validate(value)
    }

    /// Decode into a typed record
    pub fn to_record<T: DeserializeOwned>(&self) -> Result<T, SchemaError> {
        let value = serde_json::to_value(self).map_err(|e| SchemaError::Decode(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| SchemaError::Decode(e.to_string()))
    }
}

/// Record failed validation against a [`Schema`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("{schema}: expected a JSON object")]
    NotAnObject { schema: String },

    #[error("{schema}: missing or empty 'link'")]
    MissingLink { schema: String },

    #[error("{schema}: missing required field '{field}'")]
    MissingField { schema: String, field: String },

    #[error("{schema}: field '{field}' should be {expected}")]
    WrongKind {
        schema: String,
        field: String,
        expected: FieldKind,
    },

    #[error("{schema}: undeclared field '{field}'")]
    UnknownField { schema: String, field: String },

    #[error("cannot decode record: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldKind::String => "a string",
            FieldKind::Number => "a number",
            FieldKind::Bool => "a boolean",
            FieldKind::Array => "an array",
            FieldKind::Object => "an object",
            FieldKind::Any => "any value",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Declared shape of a record type
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    name: String,
    fields: Vec<FieldSpec>,
    allow_extra: bool,
}

impl Default for Schema {
    fn default() -> Self {
        Self::document()
    }
}

impl Schema {
    /// Base record type: only `link` is required, any extra field is kept
    pub fn document() -> Self {
        Self {
            name: "Document".to_string(),
            fields: Vec::new(),
            allow_extra: true,
        }
    }

    /// Closed schema: undeclared fields are rejected
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            allow_extra: false,
        }
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn allow_extra(mut self, allow: bool) -> Self {
        self.allow_extra = allow;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Check `value` against the declared fields and build the document
    pub fn validate(&self, value: Value) -> Result<Document, SchemaError> {
        let Value::Object(mut object) = value else {
            return Err(SchemaError::NotAnObject {
                schema: self.name.clone(),
            });
        };

        let link = match object.remove("link") {
            Some(Value::String(link)) if !link.trim().is_empty() => link,
            _ => {
                return Err(SchemaError::MissingLink {
                    schema: self.name.clone(),
                })
            }
        };

        for spec in &self.fields {
            match object.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(SchemaError::MissingField {
                        schema: self.name.clone(),
                        field: spec.name.clone(),
                    });
                }
                Some(value) if !value.is_null() && !spec.kind.accepts(value) => {
                    return Err(SchemaError::WrongKind {
                        schema: self.name.clone(),
                        field: spec.name.clone(),
                        expected: spec.kind,
                    });
                }
                _ => {}
            }
        }

        if !self.allow_extra {
            if let Some(field) = object
                .keys()
                .find(|key| !self.fields.iter().any(|spec| &spec.name == *key))
            {
                return Err(SchemaError::UnknownField {
                    schema: self.name.clone(),
                    field: field.clone(),
                });
            }
        }

        Ok(Document { link, fields: object })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_link_field_is_never_dropped() {
        let mut doc = Document::new("https://a.example").with("link", "https://b.example");
        assert_eq!(doc.link, "https://b.example");
        assert!(doc.get("link").is_none());

        doc.set("link", 42);
        assert_eq!(doc.link, "42");

        doc.set_link(String::from("https://c.example"));
        assert_eq!(doc.link, "https://c.example");
        assert!(doc.fields.is_empty());
    }

    fn listing() -> Schema {
        Schema::new("Listing")
            .required("title", FieldKind::String)
            .optional("price", FieldKind::Number)
    }

    #[test]
    fn test_document_serializes_flat() {
        let doc = Document::new("https://example.com/a").with("title", "A");

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value, json!({"link": "https://example.com/a", "title": "A"}));
    }

    #[test]
    fn test_base_schema_keeps_extra_fields() {
        let doc = Schema::document()
            .validate(json!({"link": "https://example.com", "city": "Lyon"}))
            .unwrap();

        assert_eq!(doc.get_str("city"), Some("Lyon"));
    }

    #[test]
    fn test_closed_schema_validation() {
        let schema = listing();

        assert!(schema
            .validate(json!({"link": "https://example.com/1", "title": "Flat", "price": 900}))
            .is_ok());

        assert_eq!(
            schema.validate(json!({"link": "https://example.com/1"})),
            Err(SchemaError::MissingField {
                schema: "Listing".into(),
                field: "title".into()
            })
        );

        assert!(matches!(
            schema.validate(json!({"link": "https://example.com/1", "title": "Flat", "price": "cheap"})),
            Err(SchemaError::WrongKind { .. })
        ));

        assert!(matches!(
            schema.validate(json!({"link": "https://example.com/1", "title": "Flat", "floor": 2})),
            Err(SchemaError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_rejects_missing_link_and_non_objects() {
        assert!(matches!(
            Schema::document().validate(json!({"link": "  "})),
            Err(SchemaError::MissingLink { .. })
        ));
        assert!(matches!(
            Schema::document().validate(json!(["https://example.com"])),
            Err(SchemaError::NotAnObject { .. })
        ));
    }

    #[test]
    fn test_typed_record_conversion() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct City {
            link: String,
            name: String,
        }

        let city = City {
            link: "https://example.com/lyon".into(),
            name: "Lyon".into(),
        };

        let doc = Document::from_record(&city).unwrap();
        assert_eq!(doc.get_str("name"), Some("Lyon"));
        assert_eq!(doc.to_record::<City>().unwrap(), city);
    }
}
