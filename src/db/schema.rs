//! Schema definitions that drive type conversion and table creation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Logical primary key present on every table.
pub const PRIMARY_KEY: &str = "id";

pub const PROVIDERS_TABLE: &str = "providers";
pub const FAVORITES_TABLE: &str = "favorites";
pub const PERSONALITIES_TABLE: &str = "personalities";
pub const CHATS_TABLE: &str = "chats";

/// Logical type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

/// Table/collection name plus logical field types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    pub table_name: String,
    pub fields: BTreeMap<String, FieldDef>,
}

impl SchemaDefinition {
    /// New schema with the string primary key already declared.
    pub fn new(table_name: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            PRIMARY_KEY.to_string(),
            FieldDef {
                field_type: FieldType::String,
                required: true,
            },
        );
        Self {
            table_name: table_name.into(),
            fields,
        }
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldDef {
                field_type,
                required: false,
            },
        );
        self
    }

    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldDef {
                field_type,
                required: true,
            },
        );
        self
    }

    /// Adds `createdAt` / `updatedAt` date fields.
    pub fn timestamps(self) -> Self {
        self.field("createdAt", FieldType::Date)
            .field("updatedAt", FieldType::Date)
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).map(|def| def.field_type)
    }

    pub fn has_timestamps(&self) -> bool {
        self.field_type("createdAt") == Some(FieldType::Date)
            && self.field_type("updatedAt") == Some(FieldType::Date)
    }

    /// Non-key fields in deterministic order, for DDL generation.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &FieldDef)> {
        self.fields
            .iter()
            .filter(|(name, _)| name.as_str() != PRIMARY_KEY)
            .map(|(name, def)| (name.as_str(), def))
    }
}

/// Field type lookup that tolerates a missing schema.
pub(crate) fn lookup(schema: Option<&SchemaDefinition>, field: &str) -> Option<FieldType> {
    schema.and_then(|s| s.field_type(field))
}

pub fn providers_schema() -> SchemaDefinition {
    SchemaDefinition::new(PROVIDERS_TABLE)
        .required("userId", FieldType::String)
        .required("providerType", FieldType::String)
        .required("name", FieldType::String)
        .required("apiKey", FieldType::String)
        .field("baseUrl", FieldType::String)
        .field("isActive", FieldType::Boolean)
        .field("status", FieldType::String)
        .field("lastTestedAt", FieldType::Date)
        .field("settings", FieldType::Json)
        .timestamps()
}

pub fn favorites_schema() -> SchemaDefinition {
    SchemaDefinition::new(FAVORITES_TABLE)
        .required("userId", FieldType::String)
        .required("itemType", FieldType::String)
        .required("itemId", FieldType::String)
        .field("label", FieldType::String)
        .field("position", FieldType::Integer)
        .field("metadata", FieldType::Json)
        .timestamps()
}

pub fn personalities_schema() -> SchemaDefinition {
    SchemaDefinition::new(PERSONALITIES_TABLE)
        .required("userId", FieldType::String)
        .required("name", FieldType::String)
        .field("description", FieldType::String)
        .field("systemPrompt", FieldType::String)
        .field("avatar", FieldType::String)
        .field("temperature", FieldType::Number)
        .field("isDefault", FieldType::Boolean)
        .field("settings", FieldType::Json)
        .timestamps()
}

pub fn chats_schema() -> SchemaDefinition {
    SchemaDefinition::new(CHATS_TABLE)
        .required("userId", FieldType::String)
        .field("title", FieldType::String)
        .field("providerId", FieldType::String)
        .field("personalityId", FieldType::String)
        .field("model", FieldType::String)
        .field("isPinned", FieldType::Boolean)
        .field("messageCount", FieldType::Integer)
        .field("lastMessageAt", FieldType::Date)
        .field("metadata", FieldType::Json)
        .timestamps()
}

/// Every table the application expects to exist.
pub fn all_schemas() -> Vec<SchemaDefinition> {
    vec![
        providers_schema(),
        favorites_schema(),
        personalities_schema(),
        chats_schema(),
    ]
}
