// ABOUTME: Table schema as reported by the source dictionary
// ABOUTME: Column selection (include/exclude) always keeps the key field

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::record::KEY_FIELD;

/// Storage class of a source field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Key,
    String,
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
}

impl FieldKind {
    /// Map a dictionary `internal_type` to a field kind.
    pub fn from_internal_type(internal_type: &str) -> FieldKind {
        match internal_type {
            "GUID" | "reference" | "document_id" | "sys_class_name" => FieldKind::Key,
            "integer" | "longint" | "count" => FieldKind::Integer,
            "decimal" | "float" | "currency" | "price" | "percent_complete" => FieldKind::Decimal,
            "boolean" => FieldKind::Boolean,
            "glide_date" => FieldKind::Date,
            "glide_date_time" | "due_date" | "date_time" | "calendar_date_time" => {
                FieldKind::DateTime
            }
            _ => FieldKind::String,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub max_length: Option<u32>,
}

impl FieldDef {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            max_length: None,
        }
    }

    pub fn with_max_length(mut self, max_length: Option<u32>) -> Self {
        self.max_length = max_length;
        self
    }
}

/// Ordered field list for one table. The key field is always first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    table: String,
    fields: Vec<FieldDef>,
}

impl TableSchema {
    pub fn new(table: &str, fields: Vec<FieldDef>) -> Self {
        let mut ordered = vec![FieldDef::new(KEY_FIELD, FieldKind::Key)];
        for field in fields {
            if field.name != KEY_FIELD && !ordered.iter().any(|f| f.name == field.name) {
                ordered.push(field);
            }
        }
        Self {
            table: table.to_string(),
            fields: ordered,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Restrict to `include` (if given) or drop `exclude` (if given).
    ///
    /// Unknown names in `include` are an error: a typo would otherwise
    /// silently produce an empty column.
    pub fn select(
        &self,
        include: Option<&[String]>,
        exclude: Option<&[String]>,
    ) -> Result<TableSchema> {
        let fields = match (include, exclude) {
            (Some(_), Some(_)) => bail!("Cannot use both include and exclude column lists"),
            (Some(include), None) => {
                for name in include {
                    if self.field(name).is_none() {
                        bail!("Column {} is not defined in {}", name, self.table);
                    }
                }
                self.fields
                    .iter()
                    .filter(|f| f.name == KEY_FIELD || include.contains(&f.name))
                    .cloned()
                    .collect()
            }
            (None, Some(exclude)) => self
                .fields
                .iter()
                .filter(|f| f.name == KEY_FIELD || !exclude.contains(&f.name))
                .cloned()
                .collect(),
            (None, None) => self.fields.clone(),
        };
        Ok(TableSchema {
            table: self.table.clone(),
            fields,
        })
    }
}
