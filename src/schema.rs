use once_cell::sync::Lazy;
use rand::Rng;
use rand::distr::Alphanumeric;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Form keys owned by the assignment submission itself. A custom field is
/// never allowed to shadow one of these.
pub const RESERVED_KEYS: [&str; 13] = [
    "sd_action",
    "sd_assignment_nonce",
    "sd_assignment_id",
    "sd_a_title",
    "sd_a_content",
    "sd_a_teacher",
    "sd_a_student",
    "sd_a_status",
    "sd_a_categories",
    "sd_a_tags",
    "sd_a_featured_image",
    "sd_cf",
    "sd_cf_schema_json",
];

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
static NUMBER_STRIP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9.\-]").unwrap());
static EMAIL_STRIP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9.!#$%&'*+/=?^_`{|}~@\-]").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Textarea,
    Number,
    Email,
    Date,
    Select,
    Radio,
    Checkbox,
    CheckboxGroup,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Textarea => "textarea",
            FieldType::Number => "number",
            FieldType::Email => "email",
            FieldType::Date => "date",
            FieldType::Select => "select",
            FieldType::Radio => "radio",
            FieldType::Checkbox => "checkbox",
            FieldType::CheckboxGroup => "checkbox_group",
        }
    }

    /// Unknown type strings downgrade to `text` for compatibility with
    /// schemas authored elsewhere, but are logged so they don't pass silently.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "text" => FieldType::Text,
            "textarea" => FieldType::Textarea,
            "number" => FieldType::Number,
            "email" => FieldType::Email,
            "date" => FieldType::Date,
            "select" => FieldType::Select,
            "radio" => FieldType::Radio,
            "checkbox" => FieldType::Checkbox,
            "checkbox_group" => FieldType::CheckboxGroup,
            other => {
                if !other.is_empty() {
                    warn!(field_type = %other, "Unknown custom field type, downgrading to text");
                }
                FieldType::Text
            }
        }
    }

    pub fn has_options(&self) -> bool {
        matches!(
            self,
            FieldType::Select | FieldType::Radio | FieldType::CheckboxGroup
        )
    }
}

/// One normalized field definition inside a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: String,
    pub label: String,
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub placeholder: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Loosely-shaped field record as submitted by the schema builder UI.
/// Everything is optional; normalization decides what survives.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFieldDef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(rename = "type", default)]
    pub field_type: Option<String>,
    #[serde(default)]
    pub required: Option<Value>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
}

/// Single-line plain-text sanitize: strips tags, drops control characters,
/// collapses whitespace runs.
pub fn sanitize_text(input: &str) -> String {
    let stripped = TAG_RE.replace_all(input, "");
    let cleaned: String = stripped.chars().filter(|c| !c.is_control()).collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Multiline-safe variant: newlines and tabs survive, tags and other control
/// characters do not.
pub fn sanitize_multiline(input: &str) -> String {
    let stripped = TAG_RE.replace_all(input, "");
    stripped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Storage-key sanitize: lowercase, keeps `[a-z0-9_-]` only.
pub fn sanitize_key(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}

/// Strips characters illegal in an address; anything left without an `@` is
/// discarded entirely.
pub fn sanitize_email(input: &str) -> String {
    let cleaned = EMAIL_STRIP_RE.replace_all(input.trim(), "").to_string();
    if cleaned.contains('@') {
        cleaned
    } else {
        String::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "0" && s != "false",
        _ => false,
    }
}

fn generated_field_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("cf_{}", suffix.to_lowercase())
}

fn normalize_options(raw: Option<&Value>) -> Vec<String> {
    let opts: Vec<String> = match raw {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(sanitize_text))
            .collect(),
        // The builder UI also submits options as one comma-separated string.
        Some(Value::String(s)) => s.split(',').map(sanitize_text).collect(),
        _ => Vec::new(),
    };
    opts.into_iter().filter(|o| !o.is_empty()).collect()
}

/// Normalizes a submitted list of field records into a clean schema.
///
/// Entries missing a label or key are dropped, as are keys colliding with
/// [`RESERVED_KEYS`] and later duplicates of an already-seen key. Unknown
/// types downgrade to `text`. Entries without an id get a generated `cf_` id,
/// which is what makes the snapshot stable across later edits. Normalizing an
/// already-normalized schema returns it unchanged.
pub fn normalize_fields(raw: &[RawFieldDef]) -> Vec<FieldDef> {
    let mut seen_keys: Vec<String> = Vec::new();
    let mut out = Vec::new();

    for field in raw {
        let label = sanitize_text(field.label.as_deref().unwrap_or(""));
        let key = sanitize_key(field.key.as_deref().unwrap_or(""));

        if label.is_empty() || key.is_empty() {
            continue;
        }
        if RESERVED_KEYS.contains(&key.as_str()) {
            warn!(key = %key, "Dropping custom field with reserved key");
            continue;
        }
        if seen_keys.iter().any(|k| k == &key) {
            continue;
        }

        let field_type =
            FieldType::from_str_lossy(&sanitize_key(field.field_type.as_deref().unwrap_or("text")));

        let id = match field.id.as_deref().map(sanitize_key) {
            Some(id) if !id.is_empty() => id,
            _ => generated_field_id(),
        };

        let options = if field_type.has_options() {
            normalize_options(field.options.as_ref())
        } else {
            Vec::new()
        };

        seen_keys.push(key.clone());
        out.push(FieldDef {
            id,
            label,
            key,
            field_type,
            required: field.required.as_ref().map(truthy).unwrap_or(false),
            placeholder: sanitize_text(field.placeholder.as_deref().unwrap_or("")),
            options,
        });
    }

    out
}

/// Parses a schema out of its stored JSON form. Stored snapshots are already
/// normalized; running them back through [`normalize_fields`] keeps garbage
/// out even if the column was written by hand.
pub fn parse_schema_json(json: &str) -> Vec<FieldDef> {
    match serde_json::from_str::<Vec<RawFieldDef>>(json) {
        Ok(raw) => normalize_fields(&raw),
        Err(e) => {
            warn!(error = %e, "Failed to parse stored field schema, treating as empty");
            Vec::new()
        }
    }
}

/// Sanitizes one submitted value according to its field's type. Scalar types
/// produce a JSON string, `checkbox_group` a JSON array of strings. A missing
/// submission comes through as `Value::Null`; for checkboxes that means an
/// explicit `"0"` so the unchecked state is stored rather than left unset.
pub fn sanitize_value(field_type: FieldType, value: &Value) -> Value {
    match field_type {
        FieldType::Checkbox => {
            let checked = match value {
                Value::Null => false,
                v => truthy(v),
            };
            let stored = if checked { "1" } else { "0" };
            Value::String(stored.to_string())
        }
        FieldType::CheckboxGroup => {
            let items: Vec<Value> = match value {
                Value::Array(vals) => vals
                    .iter()
                    .filter_map(|v| v.as_str().map(sanitize_text))
                    .filter(|s| !s.is_empty())
                    .map(Value::String)
                    .collect(),
                _ => Vec::new(),
            };
            Value::Array(items)
        }
        FieldType::Number => {
            let s = value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.as_f64().map(|f| f.to_string()).unwrap_or_default());
            Value::String(NUMBER_STRIP_RE.replace_all(&s, "").to_string())
        }
        FieldType::Email => Value::String(sanitize_email(value.as_str().unwrap_or(""))),
        FieldType::Textarea => Value::String(sanitize_multiline(value.as_str().unwrap_or(""))),
        // date, text, select, radio: single-line plain text. An array where a
        // scalar was expected sanitizes to empty.
        FieldType::Date | FieldType::Text | FieldType::Select | FieldType::Radio => {
            Value::String(sanitize_text(value.as_str().unwrap_or("")))
        }
    }
}

/// Walks the assignment's frozen schema and produces the (key, value) pairs
/// to store, pulling submissions out of the given map. Every schema field
/// yields exactly one pair; keys not present in the schema are ignored.
pub fn collect_values(
    schema: &[FieldDef],
    submitted: &serde_json::Map<String, Value>,
) -> Vec<(String, Value)> {
    schema
        .iter()
        .map(|field| {
            let raw = submitted.get(&field.key).cloned().unwrap_or(Value::Null);
            (field.key.clone(), sanitize_value(field.field_type, &raw))
        })
        .collect()
}
