//! A compositional SQL fragment builder with typed interpolation.
//!
//! Four interpolation modes are supported: an ordinary bind (`?` plus a
//! positional value), an identifier-quoting mode, a verbatim SQL-literal
//! mode, and a JSON-encode-then-bind mode. Rather than picking a mode by
//! sniffing trailing literal text off a template string, each mode is its
//! own builder method (`bind`/`id`/`lit`/`json`), so the mode a value is
//! rendered in is visible at the call site. See `DESIGN.md` for the
//! recorded design decision.
//!
//! ```
//! use esdb::sql::SqlBuilder;
//!
//! let (sql, binds) = SqlBuilder::new()
//!     .raw("values ")
//!     .bind(1)
//!     .raw(", ")
//!     .bind("a")
//!     .raw(" bop")
//!     .finish();
//! assert_eq!(sql, "values ?, ? bop");
//! assert_eq!(binds, vec![serde_json::json!(1), serde_json::json!("a")]);
//! ```

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

/// A rendered SQL fragment: parameterized text plus its positional binds.
pub type SqlFragment = (String, Vec<JsonValue>);

/// Renders a scalar to its SQL literal form, for `LIT`-mode interpolation
/// and debugging.
///
/// - `true`/`false` render as `1`/`0`.
/// - Numbers render as decimal text.
/// - Strings render single-quoted, with embedded `'` doubled.
/// - `null` (and anything else JSON can't express as a scalar) renders as
///   `NULL`.
#[must_use]
pub fn val_to_sql(v: &JsonValue) -> String {
    match v {
        JsonValue::Bool(true) => "1".to_string(),
        JsonValue::Bool(false) => "0".to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => format!("'{}'", s.replace('\'', "''")),
        JsonValue::Null => "NULL".to_string(),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Renders a scalar to the plain text `LIT`-mode interpolation inserts:
/// unlike [`val_to_sql`], strings are inserted exactly as given, with no
/// quoting or escaping — the caller is trusted to only use `lit` with
/// values that are already valid (or intentionally raw) SQL text.
fn lit_to_sql(v: &JsonValue) -> String {
    match v {
        JsonValue::Bool(true) => "true".to_string(),
        JsonValue::Bool(false) => "false".to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Double-quotes a SQL identifier, escaping any embedded `"`.
///
/// Numeric-looking identifiers are still quoted — `quote_id("1")` is
/// `"1"`, not the bare (and syntactically invalid as an identifier) `1`.
#[must_use]
pub fn quote_id(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// A fluent accumulator for building parameterized SQL, in the manner of
/// `sqlx::QueryBuilder`. Each method appends one contribution to the SQL
/// text and, for bind-producing modes, one value to the positional bind
/// list.
#[derive(Debug, Default, Clone)]
pub struct SqlBuilder {
    sql: String,
    binds: Vec<JsonValue>,
}

impl SqlBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends literal SQL text verbatim. Use this for the fixed text
    /// between interpolations, not for values coming from outside the
    /// query itself.
    pub fn raw(mut self, text: impl AsRef<str>) -> Self {
        self.sql.push_str(text.as_ref());
        self
    }

    /// Ordinary bind: emits a `?` placeholder and appends `value` to the
    /// bind list.
    pub fn bind(mut self, value: impl Into<JsonValue>) -> Self {
        self.sql.push('?');
        self.binds.push(value.into());
        self
    }

    /// Identifier-quote interpolation: emits `value` as a double-quoted,
    /// escaped SQL identifier. Contributes nothing to the bind list.
    pub fn id(mut self, value: impl AsRef<str>) -> Self {
        self.sql.push_str(&quote_id(value.as_ref()));
        self
    }

    /// Literal-fragment interpolation: emits `value`'s plain string form
    /// verbatim — numbers as decimal text, strings inserted unquoted and
    /// unescaped. Contributes nothing to the bind list; the caller is
    /// responsible for only using this with trusted values, since it
    /// bypasses parameter binding entirely.
    pub fn lit(mut self, value: impl Into<JsonValue>) -> Self {
        self.sql.push_str(&lit_to_sql(&value.into()));
        self
    }

    /// JSON-bind interpolation: JSON-encodes `value`, then emits a `?`
    /// placeholder bound to the encoded text.
    ///
    /// # Errors
    /// Returns [`Error::Serde`] if `value` cannot be serialized to JSON.
    pub fn json(mut self, value: impl Serialize) -> Result<Self> {
        let encoded = serde_json::to_string(&value)?;
        self.sql.push('?');
        self.binds.push(JsonValue::String(encoded));
        Ok(self)
    }

    /// Consumes the builder, returning the rendered SQL text and its bind
    /// values.
    #[must_use]
    pub fn finish(self) -> SqlFragment {
        (self.sql, self.binds)
    }
}

/// Free-function form of the builder for the common case of SQL text
/// already written with `?` placeholders plus a plain list of bind values.
///
/// ```
/// use esdb::sql::sql;
/// let (text, binds) = sql("SELECT * FROM foo WHERE id = ?", vec![serde_json::json!(5)]);
/// assert_eq!(text, "SELECT * FROM foo WHERE id = ?");
/// assert_eq!(binds, vec![serde_json::json!(5)]);
/// ```
#[must_use]
pub fn sql(text: impl Into<String>, binds: impl Into<Vec<JsonValue>>) -> SqlFragment {
    (text.into(), binds.into())
}

/// Errors that can surface while rendering a fragment that embeds a
/// callback-supplied row, reused by the `each` row-callback failure path.
pub(crate) fn callback_error(message: impl Into<String>) -> Error {
    Error::Callback(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// S1: ordinary binds with mixed literal text.
    #[test]
    fn ordinary_binds() {
        let (sql, binds) = SqlBuilder::new()
            .raw("values ")
            .bind(1)
            .raw(", ")
            .bind("a")
            .raw(" bop")
            .finish();
        assert_eq!(sql, "values ?, ? bop");
        assert_eq!(binds, vec![json!(1), json!("a")]);
    }

    /// S1: a single interpolation with no surrounding text at all.
    #[test]
    fn single_bind_no_surrounding_text() {
        let (sql, binds) = SqlBuilder::new().bind(5).finish();
        assert_eq!(sql, "?");
        assert_eq!(binds, vec![json!(5)]);
    }

    /// S2: JSON-mode interpolation JSON-encodes the value then binds it as
    /// text.
    #[test]
    fn json_mode_encodes_then_binds() {
        let (sql, binds) = SqlBuilder::new()
            .raw(" ")
            .json("meep")
            .unwrap()
            .raw(", ")
            .json(7)
            .unwrap()
            .finish();
        assert_eq!(sql, " ?, ?");
        assert_eq!(binds, vec![json!("\"meep\""), json!("7")]);
    }

    /// S2: ID-mode interpolation double-quotes the identifier and escapes
    /// embedded quotes; numeric-looking identifiers are still quoted.
    #[test]
    fn id_mode_quotes_identifiers() {
        let (sql, binds) = SqlBuilder::new()
            .raw("ids ")
            .id("1")
            .raw(", ")
            .bind(2)
            .raw(" ")
            .id("a\"meep\"whee")
            .finish();
        assert_eq!(sql, "ids \"1\", ? \"a\"\"meep\"\"whee\"");
        assert_eq!(binds, vec![json!(2)]);
    }

    /// S2: LIT-mode interpolation inserts the scalar's plain string form
    /// verbatim — unquoted, unescaped — contributing nothing to the bind
    /// list.
    #[test]
    fn lit_mode_inserts_verbatim() {
        let (sql, binds) = SqlBuilder::new()
            .lit(1)
            .raw(", ")
            .bind(2)
            .raw(" ")
            .lit("a\"meep\"whee")
            .finish();
        assert_eq!(sql, "1, ? a\"meep\"whee");
        assert_eq!(binds, vec![json!(2)]);
    }

    #[test]
    fn val_to_sql_covers_all_scalar_kinds() {
        assert_eq!(val_to_sql(&json!(true)), "1");
        assert_eq!(val_to_sql(&json!(false)), "0");
        assert_eq!(val_to_sql(&json!(42)), "42");
        assert_eq!(val_to_sql(&json!(4.5)), "4.5");
        assert_eq!(val_to_sql(&json!("it's")), "'it''s'");
        assert_eq!(val_to_sql(&JsonValue::Null), "NULL");
    }

    #[test]
    fn quote_id_escapes_embedded_quotes() {
        assert_eq!(quote_id("users"), "\"users\"");
        assert_eq!(quote_id("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn free_function_form() {
        let (text, binds) = sql("SELECT 1 WHERE a = ?", vec![json!(9)]);
        assert_eq!(text, "SELECT 1 WHERE a = ?");
        assert_eq!(binds, vec![json!(9)]);
    }
}
