//! Core schema types shared by the cache, the transports and the facade.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Schema format (Avro, Protobuf, JSON Schema)
///
/// Registries omit `schemaType` for Avro, so it is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaFormat {
    #[default]
    Avro,
    Protobuf,
    Json,
}

impl SchemaFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaFormat::Avro => "AVRO",
            SchemaFormat::Protobuf => "PROTOBUF",
            SchemaFormat::Json => "JSON",
        }
    }
}

/// Reference to another registered schema (for nested types)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaReference {
    pub name: String,
    pub subject: String,
    pub version: i32,
}

/// A schema as submitted to or returned by the registry.
///
/// Equality here is textual. The cache compares schemas through
/// [`Canonicalizer`] keys instead, so formatting differences do not cause
/// misses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema definition text
    pub schema: String,

    #[serde(rename = "schemaType", default)]
    pub schema_type: SchemaFormat,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<SchemaReference>,
}

impl Schema {
    pub fn new(schema: impl Into<String>, schema_type: SchemaFormat) -> Self {
        Self {
            schema: schema.into(),
            schema_type,
            references: Vec::new(),
        }
    }

    pub fn avro(schema: impl Into<String>) -> Self {
        Self::new(schema, SchemaFormat::Avro)
    }

    pub fn json(schema: impl Into<String>) -> Self {
        Self::new(schema, SchemaFormat::Json)
    }

    pub fn protobuf(schema: impl Into<String>) -> Self {
        Self::new(schema, SchemaFormat::Protobuf)
    }

    pub fn with_references(mut self, references: Vec<SchemaReference>) -> Self {
        self.references = references;
        self
    }

    /// Fully-qualified record name, used by the `Record` and `TopicRecord`
    /// subject name strategies.
    ///
    /// - Avro: `namespace.name` (or `name` alone when it already contains a dot
    ///   or no namespace is declared)
    /// - JSON Schema: `title`
    /// - Protobuf: `package.FirstMessage`
    ///
    /// Returns `None` when no name can be derived.
    pub fn record_name(&self) -> Option<String> {
        match self.schema_type {
            SchemaFormat::Avro => {
                let value: serde_json::Value = serde_json::from_str(&self.schema).ok()?;
                let name = value.get("name")?.as_str()?;
                if name.contains('.') {
                    return Some(name.to_string());
                }
                match value
                    .get("namespace")
                    .and_then(|ns| ns.as_str())
                    .filter(|ns| !ns.is_empty())
                {
                    Some(ns) => Some(format!("{}.{}", ns, name)),
                    None => Some(name.to_string()),
                }
            }
            SchemaFormat::Json => {
                let value: serde_json::Value = serde_json::from_str(&self.schema).ok()?;
                value.get("title")?.as_str().map(str::to_string)
            }
            SchemaFormat::Protobuf => protobuf_record_name(&self.schema),
        }
    }
}

fn protobuf_record_name(text: &str) -> Option<String> {
    let mut package: Option<String> = None;
    let mut tokens = text
        .split(|c: char| c.is_whitespace() || c == ';' || c == '{')
        .filter(|t| !t.is_empty());

    while let Some(token) = tokens.next() {
        match token {
            "package" if package.is_none() => package = tokens.next().map(str::to_string),
            "message" => {
                let message = tokens.next()?;
                return Some(match package {
                    Some(pkg) => format!("{}.{}", pkg, message),
                    None => message.to_string(),
                });
            }
            _ => {}
        }
    }
    None
}

/// A schema registered under a subject at a specific version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSchema {
    pub subject: String,
    /// Registry-global schema ID
    pub id: i32,
    /// Subject-local version (starts at 1)
    pub version: i32,
    pub schema: Schema,
}

/// Version selector for version-scoped registry calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaVersion {
    Latest,
    Number(i32),
}

impl From<i32> for SchemaVersion {
    fn from(version: i32) -> Self {
        SchemaVersion::Number(version)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::Latest => f.write_str("latest"),
            SchemaVersion::Number(v) => write!(f, "{}", v),
        }
    }
}

/// Cache key identifying a schema up to canonical equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaKey {
    pub format: SchemaFormat,
    pub canonical: String,
    pub references: Vec<SchemaReference>,
}

/// Produces canonical forms of schema text.
///
/// Two schemas with equal canonical keys are treated as the same schema by the
/// cache. Implementations belong to whatever owns the schema format; the
/// default [`JsonCanonicalizer`] covers the common cases.
pub trait Canonicalizer: Send + Sync {
    fn canonical_form(&self, schema: &Schema) -> String;

    fn key(&self, schema: &Schema) -> SchemaKey {
        SchemaKey {
            format: schema.schema_type,
            canonical: self.canonical_form(schema),
            references: schema.references.clone(),
        }
    }
}

/// Default canonicalizer.
///
/// JSON text (Avro, JSON Schema) is re-serialized compactly with object keys
/// sorted. Anything that does not parse as JSON has whitespace runs collapsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCanonicalizer;

impl Canonicalizer for JsonCanonicalizer {
    fn canonical_form(&self, schema: &Schema) -> String {
        if schema.schema_type != SchemaFormat::Protobuf {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&schema.schema) {
                // serde_json::Map is a BTreeMap without `preserve_order`
                return value.to_string();
            }
        }
        schema.schema.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_format_as_str() {
        assert_eq!(SchemaFormat::Avro.as_str(), "AVRO");
        assert_eq!(SchemaFormat::Protobuf.as_str(), "PROTOBUF");
        assert_eq!(SchemaFormat::Json.as_str(), "JSON");
    }

    #[test]
    fn test_schema_type_defaults_to_avro() {
        let schema: Schema = serde_json::from_str(r#"{"schema": "\"string\""}"#).unwrap();
        assert_eq!(schema.schema_type, SchemaFormat::Avro);
        assert!(schema.references.is_empty());
    }

    #[test]
    fn test_canonical_form_ignores_formatting_and_key_order() {
        let canon = JsonCanonicalizer;
        let a = Schema::avro(
            r#"{"type": "record", "name": "User", "fields": [{"name": "id", "type": "int"}]}"#,
        );
        let b = Schema::avro(
            "{\n  \"name\":\"User\",\n  \"fields\":[{\"type\":\"int\",\"name\":\"id\"}],\n  \"type\":\"record\"\n}",
        );
        assert_eq!(canon.key(&a), canon.key(&b));
    }

    #[test]
    fn test_canonical_key_distinguishes_format() {
        let canon = JsonCanonicalizer;
        let avro = Schema::avro(r#"{"type": "string"}"#);
        let json = Schema::json(r#"{"type": "string"}"#);
        assert_ne!(canon.key(&avro), canon.key(&json));
    }

    #[test]
    fn test_canonical_form_protobuf_whitespace() {
        let canon = JsonCanonicalizer;
        let a = Schema::protobuf("syntax = \"proto3\";\nmessage Foo {\n  int32 id = 1;\n}");
        let b = Schema::protobuf("syntax = \"proto3\"; message Foo { int32 id = 1; }");
        assert_eq!(canon.canonical_form(&a), canon.canonical_form(&b));
    }

    #[test]
    fn test_avro_record_name() {
        let schema = Schema::avro(
            r#"{"type": "record", "name": "Order", "namespace": "com.acme", "fields": []}"#,
        );
        assert_eq!(schema.record_name().as_deref(), Some("com.acme.Order"));

        let dotted = Schema::avro(r#"{"type": "record", "name": "a.b.C", "namespace": "x", "fields": []}"#);
        assert_eq!(dotted.record_name().as_deref(), Some("a.b.C"));

        let bare = Schema::avro(r#"{"type": "record", "name": "Order", "fields": []}"#);
        assert_eq!(bare.record_name().as_deref(), Some("Order"));

        assert_eq!(Schema::avro(r#""string""#).record_name(), None);
    }

    #[test]
    fn test_json_and_protobuf_record_name() {
        let json = Schema::json(r#"{"title": "Invoice", "type": "object"}"#);
        assert_eq!(json.record_name().as_deref(), Some("Invoice"));

        let proto = Schema::protobuf(
            "syntax = \"proto3\";\npackage shop.v1;\n\nmessage Cart {\n  string id = 1;\n}\n",
        );
        assert_eq!(proto.record_name().as_deref(), Some("shop.v1.Cart"));
    }

    #[test]
    fn test_schema_version_display() {
        assert_eq!(SchemaVersion::Latest.to_string(), "latest");
        assert_eq!(SchemaVersion::from(3).to_string(), "3");
    }
}
