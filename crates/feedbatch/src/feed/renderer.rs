//! Column-based product renderer.

use std::fmt::Write;

use quick_xml::escape::escape;
use serde_json::Value;

use super::{FeedDefinition, FeedFormat, Product, RenderCache, Renderer};
use crate::error::RenderError;

/// Separator used when a list attribute (usually a category path) is flattened.
const PATH_SEPARATOR: &str = " > ";

/// Renders the feed's `columns` straight from product attributes.
///
/// `id` falls back to the product id. List attributes are flattened with
/// `" > "` and memoized in the render cache, since category paths repeat
/// across most of a catalog.
#[derive(Debug, Clone, Default)]
pub struct FieldRenderer {
    required: Vec<String>,
}

impl FieldRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Products missing any of these columns are rejected.
    pub fn with_required<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = columns.into_iter().map(Into::into).collect();
        self
    }

    fn value_of(
        &self,
        product: &Product,
        column: &str,
        cache: &mut RenderCache,
    ) -> Result<Option<Value>, RenderError> {
        let value = match product.attributes.get(column) {
            Some(v) => v.clone(),
            None if column == "id" => Value::String(product.id.clone()),
            None => Value::Null,
        };

        let value = match value {
            Value::Null => None,
            Value::Array(items) => {
                let key = Value::Array(items.clone()).to_string();
                let flattened = cache.get_or_insert_with(&key, || {
                    items
                        .iter()
                        .map(scalar_text)
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                        .join(PATH_SEPARATOR)
                });
                Some(Value::String(flattened.to_string()))
            }
            Value::Object(_) => {
                return Err(RenderError::InvalidValue {
                    field: column.to_string(),
                    reason: "nested objects are not supported".to_string(),
                })
            }
            scalar => Some(scalar),
        };

        match value {
            None if self.required.iter().any(|r| r == column) => {
                Err(RenderError::MissingField(column.to_string()))
            }
            Some(Value::String(s)) if s.trim().is_empty() && self.required.iter().any(|r| r == column) => {
                Err(RenderError::MissingField(column.to_string()))
            }
            other => Ok(other),
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Quotes a CSV field when it contains a delimiter, quote or line break.
pub fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

impl Renderer for FieldRenderer {
    fn render(
        &self,
        product: &Product,
        feed: &FeedDefinition,
        cache: &mut RenderCache,
    ) -> Result<String, RenderError> {
        if feed.columns.is_empty() {
            return Err(RenderError::Template(format!(
                "feed '{}' has no columns",
                feed.feed_id
            )));
        }

        let mut values = Vec::with_capacity(feed.columns.len());
        for column in &feed.columns {
            values.push((column.as_str(), self.value_of(product, column, cache)?));
        }

        match feed.format {
            FeedFormat::Xml => {
                let mut out = String::new();
                let _ = write!(out, "<{}>", feed.xml_item);
                for (column, value) in values {
                    if !is_xml_name(column) {
                        return Err(RenderError::InvalidValue {
                            field: column.to_string(),
                            reason: "not a valid XML element name".to_string(),
                        });
                    }
                    let text = value.as_ref().map(scalar_text).unwrap_or_default();
                    let _ = write!(out, "<{0}>{1}</{0}>", column, escape(text.as_str()));
                }
                let _ = write!(out, "</{}>", feed.xml_item);
                Ok(out)
            }
            FeedFormat::Csv => Ok(values
                .iter()
                .map(|(_, v)| csv_field(&v.as_ref().map(scalar_text).unwrap_or_default()))
                .collect::<Vec<_>>()
                .join(",")),
            FeedFormat::Json | FeedFormat::Jsonl => {
                let map: serde_json::Map<String, Value> = values
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.unwrap_or(Value::Null)))
                    .collect();
                serde_json::to_string(&map).map_err(|e| RenderError::Template(e.to_string()))
            }
        }
    }
}
