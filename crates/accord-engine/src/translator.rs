//! Declarative JSON-to-table translators.
//!
//! A translator describes how one JSON document becomes rows in one or more
//! tables:
//!
//! - `hdict`: an object becomes one row; each field picks a value by dotted
//!   path. With `in_list`, an array of such objects becomes one row each.
//! - `vdict`: an object becomes one `(key, value)` row per entry.
//! - `list`: an array becomes one row per element.
//!
//! A field may carry a nested translator writing into a child table. The
//! child links back to its parent either through `parent_key` (a field of
//! the parent object copied into the child's first column, in which case the
//! parent row gets no cell for that field) or through `id_column` (a UUID v5
//! derived from the child document, stored both in the child rows and in the
//! parent cell).

use std::collections::BTreeMap;

use accord_datalog::{Row, TableSchema, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;
use uuid::Uuid;

static NULL: Json = Json::Null;

/// Errors from translating a document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("table {table}: expected an object, found {found}")]
    ExpectedObject { table: String, found: &'static str },

    #[error("table {table}: expected an array, found {found}")]
    ExpectedArray { table: String, found: &'static str },

    #[error("table {table}: parent has no field {key:?}")]
    MissingParentKey { table: String, key: String },

    #[error("invalid translator: {0}")]
    InvalidTranslator(String),
}

/// How a JSON value becomes cells and rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Translator {
    /// The value itself, normalized to a cell.
    #[default]
    Value,
    /// The ingestion time, ignoring the input.
    ReceivedAt,
    Hdict(HdictTranslator),
    Vdict(VdictTranslator),
    List(ListTranslator),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdictTranslator {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_column: Option<String>,
    /// The input is an array of objects, one row each.
    #[serde(default)]
    pub in_list: bool,
    pub fields: Vec<FieldTranslator>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTranslator {
    /// Dotted path into the object; empty for translators that ignore input.
    #[serde(default)]
    pub path: String,
    /// Column name; defaults to the path with dots replaced by underscores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default)]
    pub translator: Translator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdictTranslator {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_column: Option<String>,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    #[serde(default = "default_value_column")]
    pub value_column: String,
    #[serde(default)]
    pub value: Box<Translator>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTranslator {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_column: Option<String>,
    #[serde(default = "default_value_column")]
    pub value_column: String,
    #[serde(default)]
    pub value: Box<Translator>,
}

fn default_key_column() -> String {
    "key".to_string()
}

fn default_value_column() -> String {
    "value".to_string()
}

impl FieldTranslator {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            column: None,
            translator: Translator::Value,
        }
    }

    pub fn column_name(&self) -> String {
        self.column
            .clone()
            .unwrap_or_else(|| self.path.replace('.', "_"))
    }
}

/// Rows produced by one translation, per table.
///
/// Every table the translator declares is present, possibly empty.
pub type Translated = BTreeMap<String, Vec<Row>>;

impl Translator {
    /// Table name for compound translators.
    pub fn table(&self) -> Option<&str> {
        match self {
            Translator::Hdict(t) => Some(&t.table),
            Translator::Vdict(t) => Some(&t.table),
            Translator::List(t) => Some(&t.table),
            Translator::Value | Translator::ReceivedAt => None,
        }
    }

    fn links(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Translator::Hdict(t) => (t.parent_key.as_deref(), t.id_column.as_deref()),
            Translator::Vdict(t) => (t.parent_key.as_deref(), t.id_column.as_deref()),
            Translator::List(t) => (t.parent_key.as_deref(), t.id_column.as_deref()),
            Translator::Value | Translator::ReceivedAt => (None, None),
        }
    }

    /// Columns identifying the rows of one parent document, used to replace
    /// them on a later update.
    pub fn key_columns(&self) -> Option<Vec<String>> {
        match self.links() {
            (Some(parent), _) => Some(vec![parent.to_string()]),
            (None, Some(id)) => Some(vec![id.to_string()]),
            (None, None) => None,
        }
    }

    /// Whether the parent row gets no cell for this translator.
    fn links_by_parent_key(&self) -> bool {
        self.links().0.is_some()
    }

    /// Check the translator tree is well-formed for use at the top level.
    pub fn validate(&self) -> Result<(), TranslateError> {
        if self.table().is_none() {
            return Err(TranslateError::InvalidTranslator(
                "top-level translator must write a table".to_string(),
            ));
        }
        if let (Some(key), _) = self.links() {
            return Err(TranslateError::InvalidTranslator(format!(
                "top-level table cannot take parent key {:?}",
                key
            )));
        }
        let mut seen = Vec::new();
        self.validate_tree(&mut seen)?;
        for (table, schema) in self.schemas() {
            for (i, column) in schema.columns.iter().enumerate() {
                if schema.index_of(&column.name) != Some(i) {
                    return Err(TranslateError::InvalidTranslator(format!(
                        "table {} has two columns named {}",
                        table, column.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every table-writing translator in the tree, parents first.
    pub fn tables(&self) -> Vec<&Translator> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(current) = stack.pop() {
            if current.table().is_none() {
                continue;
            }
            out.push(current);
            let children: Vec<&Translator> = match current {
                Translator::Hdict(t) => t.fields.iter().map(|f| &f.translator).collect(),
                Translator::Vdict(t) => vec![t.value.as_ref()],
                Translator::List(t) => vec![t.value.as_ref()],
                Translator::Value | Translator::ReceivedAt => Vec::new(),
            };
            stack.extend(children.into_iter().rev());
        }
        out
    }

    fn validate_tree(&self, seen: &mut Vec<String>) -> Result<(), TranslateError> {
        let Some(table) = self.table() else {
            return Ok(());
        };
        if seen.iter().any(|t| t == table) {
            return Err(TranslateError::InvalidTranslator(format!(
                "table {} is written twice",
                table
            )));
        }
        seen.push(table.to_string());

        let children: Vec<&Translator> = match self {
            Translator::Hdict(t) => t.fields.iter().map(|f| &f.translator).collect(),
            Translator::Vdict(t) => vec![t.value.as_ref()],
            Translator::List(t) => vec![t.value.as_ref()],
            Translator::Value | Translator::ReceivedAt => Vec::new(),
        };
        for child in children {
            let Some(child_table) = child.table() else {
                continue;
            };
            match (child.links(), self) {
                ((None, None), _) => {
                    return Err(TranslateError::InvalidTranslator(format!(
                        "nested table {} needs a parent_key or id_column",
                        child_table
                    )));
                }
                ((Some(_), _), Translator::Vdict(_) | Translator::List(_)) => {
                    return Err(TranslateError::InvalidTranslator(format!(
                        "nested table {} takes a parent key but its parent is not an object",
                        child_table
                    )));
                }
                _ => {}
            }
            child.validate_tree(seen)?;
        }
        Ok(())
    }

    /// Schemas of every table this translator writes, parents first.
    pub fn schemas(&self) -> Vec<(String, TableSchema)> {
        let mut out = Vec::new();
        self.collect_schemas(&mut out);
        out
    }

    fn collect_schemas(&self, out: &mut Vec<(String, TableSchema)>) {
        let Some(table) = self.table() else {
            return;
        };
        let (parent_key, id_column) = self.links();
        let mut columns: Vec<String> = parent_key
            .into_iter()
            .chain(id_column)
            .map(str::to_string)
            .collect();
        let mut children = Vec::new();
        match self {
            Translator::Hdict(t) => {
                for field in &t.fields {
                    if !field.translator.links_by_parent_key() {
                        columns.push(field.column_name());
                    }
                    children.push(&field.translator);
                }
            }
            Translator::Vdict(t) => {
                columns.push(t.key_column.clone());
                columns.push(t.value_column.clone());
                children.push(t.value.as_ref());
            }
            Translator::List(t) => {
                columns.push(t.value_column.clone());
                children.push(t.value.as_ref());
            }
            Translator::Value | Translator::ReceivedAt => {}
        }
        out.push((table.to_string(), TableSchema::from_names(columns)));
        for child in children {
            child.collect_schemas(out);
        }
    }

    /// Translate one document.
    pub fn translate(&self, doc: &Json, received_at: &str) -> Result<Translated, TranslateError> {
        let mut out: Translated = self
            .schemas()
            .into_iter()
            .map(|(table, _)| (table, Vec::new()))
            .collect();
        let mut ctx = Context {
            received_at,
            out: &mut out,
        };
        match self {
            Translator::Value | Translator::ReceivedAt => {
                return Err(TranslateError::InvalidTranslator(
                    "top-level translator must write a table".to_string(),
                ));
            }
            compound => {
                compound.cell(doc, None, &mut ctx)?;
            }
        }
        Ok(out)
    }

    /// Cell for the parent row, or `None` when the child links by parent key.
    fn cell(
        &self,
        doc: &Json,
        parent: Option<&serde_json::Map<String, Json>>,
        ctx: &mut Context<'_>,
    ) -> Result<Option<Value>, TranslateError> {
        let id = match self {
            Translator::Value => return Ok(Some(Value::from_json(doc))),
            Translator::ReceivedAt => return Ok(Some(Value::from(ctx.received_at))),
            _ if doc.is_null() => {
                return Ok((!self.links_by_parent_key()).then_some(Value::Null));
            }
            Translator::Hdict(t) => {
                let id = generated_id(&t.table, doc);
                let prefix = self.prefix(parent, &id)?;
                let items: Vec<&Json> = if t.in_list {
                    doc.as_array()
                        .ok_or_else(|| TranslateError::ExpectedArray {
                            table: t.table.clone(),
                            found: kind(doc),
                        })?
                        .iter()
                        .collect()
                } else {
                    vec![doc]
                };
                for item in items {
                    let object = item.as_object().ok_or_else(|| TranslateError::ExpectedObject {
                        table: t.table.clone(),
                        found: kind(item),
                    })?;
                    let mut row = prefix.clone();
                    for field in &t.fields {
                        let value = lookup(item, &field.path);
                        if let Some(cell) = field.translator.cell(value, Some(object), ctx)? {
                            row.push(cell);
                        }
                    }
                    ctx.push(&t.table, row);
                }
                id
            }
            Translator::Vdict(t) => {
                let object = doc.as_object().ok_or_else(|| TranslateError::ExpectedObject {
                    table: t.table.clone(),
                    found: kind(doc),
                })?;
                let id = generated_id(&t.table, doc);
                let prefix = self.prefix(parent, &id)?;
                for (key, value) in object {
                    let mut row = prefix.clone();
                    row.push(Value::from(key.as_str()));
                    row.push(t.value.cell(value, None, ctx)?.unwrap_or(Value::Null));
                    ctx.push(&t.table, row);
                }
                id
            }
            Translator::List(t) => {
                let items = doc.as_array().ok_or_else(|| TranslateError::ExpectedArray {
                    table: t.table.clone(),
                    found: kind(doc),
                })?;
                let id = generated_id(&t.table, doc);
                let prefix = self.prefix(parent, &id)?;
                for item in items {
                    let mut row = prefix.clone();
                    row.push(t.value.cell(item, None, ctx)?.unwrap_or(Value::Null));
                    ctx.push(&t.table, row);
                }
                id
            }
        };

        Ok((!self.links_by_parent_key()).then(|| Value::Str(id)))
    }

    /// Leading link columns of a child row.
    fn prefix(
        &self,
        parent: Option<&serde_json::Map<String, Json>>,
        id: &str,
    ) -> Result<Vec<Value>, TranslateError> {
        let (parent_key, id_column) = self.links();
        let mut prefix = Vec::new();
        if let Some(key) = parent_key {
            let value = parent.and_then(|p| p.get(key)).ok_or_else(|| {
                TranslateError::MissingParentKey {
                    table: self.table().unwrap_or_default().to_string(),
                    key: key.to_string(),
                }
            })?;
            prefix.push(Value::from_json(value));
        }
        if id_column.is_some() {
            prefix.push(Value::from(id));
        }
        Ok(prefix)
    }
}

struct Context<'a> {
    received_at: &'a str,
    out: &'a mut Translated,
}

impl Context<'_> {
    fn push(&mut self, table: &str, values: Vec<Value>) {
        self.out
            .entry(table.to_string())
            .or_default()
            .push(Row::new(values));
    }
}

/// Deterministic id of a sub-document, identical on every replica.
fn generated_id(table: &str, doc: &Json) -> String {
    let name = format!("{}:{}", table, doc);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

pub(crate) fn lookup<'a>(doc: &'a Json, path: &str) -> &'a Json {
    if path.is_empty() {
        return doc;
    }
    path.split('.')
        .try_fold(doc, |current, segment| current.get(segment))
        .unwrap_or(&NULL)
}

fn kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "an array",
        Json::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_datalog::row;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn servers() -> Translator {
        Translator::Hdict(HdictTranslator {
            table: "servers".to_string(),
            parent_key: None,
            id_column: None,
            in_list: true,
            fields: vec![
                FieldTranslator::new("id"),
                FieldTranslator::new("flavor.name"),
                FieldTranslator {
                    path: "metadata".to_string(),
                    column: None,
                    translator: Translator::Vdict(VdictTranslator {
                        table: "servers.metadata".to_string(),
                        parent_key: Some("id".to_string()),
                        id_column: None,
                        key_column: default_key_column(),
                        value_column: default_value_column(),
                        value: Box::default(),
                    }),
                },
                FieldTranslator {
                    path: "addresses".to_string(),
                    column: None,
                    translator: Translator::List(ListTranslator {
                        table: "servers.addresses".to_string(),
                        parent_key: None,
                        id_column: Some("addresses_id".to_string()),
                        value_column: "address".to_string(),
                        value: Box::default(),
                    }),
                },
            ],
        })
    }

    #[test]
    fn test_schemas() {
        let schemas = servers().schemas();
        let names: Vec<_> = schemas
            .iter()
            .map(|(t, s)| {
                let cols: Vec<_> = s.columns.iter().map(|c| c.name.as_str()).collect();
                format!("{}({})", t, cols.join(","))
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "servers(id,flavor_name,addresses)",
                "servers.metadata(id,key,value)",
                "servers.addresses(addresses_id,address)",
            ]
        );
    }

    #[test]
    fn test_nested_translation() {
        let doc = json!([
            {
                "id": "s1",
                "flavor": {"name": "m1.small"},
                "metadata": {"tier": "web", "owner": "ops"},
                "addresses": ["10.0.0.1", "10.0.0.2"]
            },
            {"id": "s2", "flavor": {"name": "m1.large"}, "metadata": {}, "addresses": []}
        ]);
        let out = servers().translate(&doc, "now").unwrap();

        let addresses_id = out["servers"][0].get(2).cloned().unwrap();
        assert_eq!(out["servers"][0], Row::new(vec!["s1".into(), "m1.small".into(), addresses_id.clone()]));
        assert_eq!(out["servers"].len(), 2);
        assert_eq!(
            out["servers.metadata"],
            vec![row!["s1", "owner", "ops"], row!["s1", "tier", "web"]]
        );
        assert_eq!(
            out["servers.addresses"],
            vec![
                Row::new(vec![addresses_id.clone(), "10.0.0.1".into()]),
                Row::new(vec![addresses_id, "10.0.0.2".into()]),
            ]
        );
    }

    #[test]
    fn test_generated_ids_are_deterministic() {
        let doc = json!([{"id": "s1", "flavor": null, "metadata": null, "addresses": ["a"]}]);
        let first = servers().translate(&doc, "t1").unwrap();
        let second = servers().translate(&doc, "t2").unwrap();
        assert_eq!(first, second);
        assert_eq!(first["servers"][0].get(1), Some(&Value::Null));
        assert!(first["servers.metadata"].is_empty());
    }

    #[test]
    fn test_received_at_and_missing_paths() {
        let translator = Translator::Hdict(HdictTranslator {
            table: "events".to_string(),
            parent_key: None,
            id_column: None,
            in_list: false,
            fields: vec![
                FieldTranslator::new("name"),
                FieldTranslator {
                    path: String::new(),
                    column: Some("received".to_string()),
                    translator: Translator::ReceivedAt,
                },
                FieldTranslator::new("missing.deeply"),
            ],
        });
        let out = translator
            .translate(&json!({"name": "boot", "ok": true}), "2024-01-01T00:00:00Z")
            .unwrap();
        assert_eq!(
            out["events"],
            vec![row!["boot", "2024-01-01T00:00:00Z", Value::Null]]
        );
    }

    #[test]
    fn test_shape_errors() {
        let err = servers().translate(&json!({"id": "s1"}), "t").unwrap_err();
        assert_eq!(
            err,
            TranslateError::ExpectedArray {
                table: "servers".to_string(),
                found: "an object"
            }
        );
        let err = servers().translate(&json!([1]), "t").unwrap_err();
        assert!(matches!(err, TranslateError::ExpectedObject { found: "a number", .. }));
    }

    #[test]
    fn test_validate() {
        assert!(servers().validate().is_ok());
        assert!(Translator::Value.validate().is_err());

        let unlinked = Translator::Hdict(HdictTranslator {
            table: "a".to_string(),
            parent_key: None,
            id_column: None,
            in_list: false,
            fields: vec![FieldTranslator {
                path: "b".to_string(),
                column: None,
                translator: Translator::List(ListTranslator {
                    table: "a.b".to_string(),
                    parent_key: None,
                    id_column: None,
                    value_column: default_value_column(),
                    value: Box::default(),
                }),
            }],
        });
        assert!(matches!(
            unlinked.validate(),
            Err(TranslateError::InvalidTranslator(_))
        ));
    }

    #[test]
    fn test_deserialize() {
        let translator: Translator = serde_json::from_value(json!({
            "type": "hdict",
            "table": "alarms",
            "fields": [
                {"path": "name"},
                {"path": "resource.id"},
                {"column": "received", "translator": {"type": "received_at"}},
                {"path": "tags", "translator": {"type": "list", "table": "alarms.tags", "id_column": "tags_id"}}
            ]
        }))
        .unwrap();
        assert!(translator.validate().is_ok());
        assert_eq!(translator.key_columns(), None);
        let (_, schema) = &translator.schemas()[0];
        assert_eq!(schema.index_of("resource_id"), Some(1));
        assert_eq!(schema.arity(), 4);
    }
}
