//! MonetDB value encoding and decoding.
//!
//! Values travel as SQL literal text: commands carry them as literals and
//! result tuples carry them the same way. Every column is tagged with a
//! type name in the table header, which selects the decoder.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use uuid::Uuid;

use super::error::{MapiError, MapiResult};

/// Wire layout of timestamp literals.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const TIME_PARSE_FORMAT: &str = "%H:%M:%S%.f";

/// The unquoted literal for an absent value.
pub const NULL_LITERAL: &str = "NULL";

// ============================================================================
// Type Tags
// ============================================================================

/// Column type as declared in a table header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Serial,
    Oid,
    Wrd,
    Real,
    Double,
    Float,
    Decimal,
    Char,
    Varchar,
    Clob,
    Url,
    Inet,
    Blob,
    Date,
    Time,
    TimeTz,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    /// Any type this client has no dedicated decoder for; decoded as text.
    Other(String),
}

impl TypeTag {
    /// Parse a type name from a table header (case-insensitive).
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "boolean" => TypeTag::Boolean,
            "tinyint" => TypeTag::TinyInt,
            "smallint" => TypeTag::SmallInt,
            "int" => TypeTag::Int,
            "bigint" => TypeTag::BigInt,
            "serial" => TypeTag::Serial,
            "oid" => TypeTag::Oid,
            "wrd" => TypeTag::Wrd,
            "real" => TypeTag::Real,
            "double" => TypeTag::Double,
            "float" => TypeTag::Float,
            "decimal" => TypeTag::Decimal,
            "char" => TypeTag::Char,
            "varchar" => TypeTag::Varchar,
            "clob" => TypeTag::Clob,
            "url" => TypeTag::Url,
            "inet" => TypeTag::Inet,
            "blob" => TypeTag::Blob,
            "date" => TypeTag::Date,
            "time" => TypeTag::Time,
            "timetz" => TypeTag::TimeTz,
            "timestamp" => TypeTag::Timestamp,
            "timestamptz" => TypeTag::TimestampTz,
            "uuid" => TypeTag::Uuid,
            "json" => TypeTag::Json,
            other => TypeTag::Other(other.to_string()),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            TypeTag::TinyInt
                | TypeTag::SmallInt
                | TypeTag::Int
                | TypeTag::BigInt
                | TypeTag::Serial
                | TypeTag::Oid
                | TypeTag::Wrd
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            TypeTag::Real | TypeTag::Double | TypeTag::Float | TypeTag::Decimal
        )
    }

    pub fn is_text_like(&self) -> bool {
        matches!(
            self,
            TypeTag::Char
                | TypeTag::Varchar
                | TypeTag::Clob
                | TypeTag::Url
                | TypeTag::Inet
                | TypeTag::Other(_)
        )
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::Boolean => "boolean",
            TypeTag::TinyInt => "tinyint",
            TypeTag::SmallInt => "smallint",
            TypeTag::Int => "int",
            TypeTag::BigInt => "bigint",
            TypeTag::Serial => "serial",
            TypeTag::Oid => "oid",
            TypeTag::Wrd => "wrd",
            TypeTag::Real => "real",
            TypeTag::Double => "double",
            TypeTag::Float => "float",
            TypeTag::Decimal => "decimal",
            TypeTag::Char => "char",
            TypeTag::Varchar => "varchar",
            TypeTag::Clob => "clob",
            TypeTag::Url => "url",
            TypeTag::Inet => "inet",
            TypeTag::Blob => "blob",
            TypeTag::Date => "date",
            TypeTag::Time => "time",
            TypeTag::TimeTz => "timetz",
            TypeTag::Timestamp => "timestamp",
            TypeTag::TimestampTz => "timestamptz",
            TypeTag::Uuid => "uuid",
            TypeTag::Json => "json",
            TypeTag::Other(name) => name,
        };
        f.write_str(name)
    }
}

// ============================================================================
// MonetDB Values
// ============================================================================

/// A value exchanged with the server.
#[derive(Debug, Clone, PartialEq)]
pub enum MonetValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(Uuid),
    Json(serde_json::Value),
}

impl MonetValue {
    /// Render this value as a SQL literal.
    pub fn encode(&self) -> MapiResult<String> {
        match self {
            MonetValue::Null => Ok(NULL_LITERAL.to_string()),
            MonetValue::Bool(v) => Ok(v.to_string()),
            MonetValue::Int(v) => Ok(v.to_string()),
            MonetValue::Float(v) => {
                if !v.is_finite() {
                    return Err(MapiError::Value(format!(
                        "cannot encode non-finite float {}",
                        v
                    )));
                }
                Ok(format!("{:?}", v))
            }
            MonetValue::Text(v) => Ok(escape(v)),
            MonetValue::Blob(v) => Ok(escape_bytes(v)),
            MonetValue::Timestamp(v) if v.nanosecond() != 0 => Err(sub_second(v)),
            MonetValue::Time(v) if v.nanosecond() != 0 => Err(sub_second(v)),
            MonetValue::Timestamp(v) => Ok(quote(&v.format(TIMESTAMP_FORMAT).to_string())),
            MonetValue::Date(v) => Ok(quote(&v.format(DATE_FORMAT).to_string())),
            MonetValue::Time(v) => Ok(quote(&v.format(TIME_FORMAT).to_string())),
            MonetValue::Uuid(v) => Ok(quote(&v.hyphenated().to_string())),
            MonetValue::Json(v) => Ok(escape(&v.to_string())),
        }
    }

    /// Decode a literal received for a column of type `tag`.
    pub fn decode(text: &str, tag: &TypeTag) -> MapiResult<Self> {
        let text = text.trim();
        if text == NULL_LITERAL {
            return Ok(MonetValue::Null);
        }

        match tag {
            TypeTag::Boolean => match unquote(text).to_ascii_lowercase().as_str() {
                "true" | "t" => Ok(MonetValue::Bool(true)),
                "false" | "f" => Ok(MonetValue::Bool(false)),
                _ => Err(MapiError::Value(format!("invalid boolean: {}", text))),
            },

            _ if tag.is_integer() => text
                .parse::<i64>()
                .map(MonetValue::Int)
                .map_err(|e| MapiError::Value(format!("invalid {} {:?}: {}", tag, text, e))),

            _ if tag.is_float() => text
                .parse::<f64>()
                .map(MonetValue::Float)
                .map_err(|e| MapiError::Value(format!("invalid {} {:?}: {}", tag, text, e))),

            TypeTag::Blob => Ok(MonetValue::Blob(unescape_bytes(text))),

            TypeTag::Timestamp | TypeTag::TimestampTz => {
                NaiveDateTime::parse_from_str(unquote(text), TIMESTAMP_PARSE_FORMAT)
                    .map(MonetValue::Timestamp)
                    .map_err(|e| MapiError::Value(format!("invalid timestamp {:?}: {}", text, e)))
            }

            TypeTag::Date => NaiveDate::parse_from_str(unquote(text), DATE_FORMAT)
                .map(MonetValue::Date)
                .map_err(|e| MapiError::Value(format!("invalid date {:?}: {}", text, e))),

            TypeTag::Time | TypeTag::TimeTz => {
                NaiveTime::parse_from_str(unquote(text), TIME_PARSE_FORMAT)
                    .map(MonetValue::Time)
                    .map_err(|e| MapiError::Value(format!("invalid time {:?}: {}", text, e)))
            }

            TypeTag::Uuid => Uuid::parse_str(unquote(text))
                .map(MonetValue::Uuid)
                .map_err(|e| MapiError::Value(format!("invalid uuid {:?}: {}", text, e))),

            TypeTag::Json => serde_json::from_str(&unescape(text))
                .map(MonetValue::Json)
                .map_err(|e| MapiError::Value(format!("invalid json {:?}: {}", text, e))),

            _ => Ok(MonetValue::Text(unescape(text))),
        }
    }
}

fn sub_second(v: impl fmt::Display) -> MapiError {
    MapiError::Value(format!("{} has a sub-second part, literals carry whole seconds", v))
}

impl From<bool> for MonetValue {
    fn from(v: bool) -> Self {
        MonetValue::Bool(v)
    }
}

impl From<i32> for MonetValue {
    fn from(v: i32) -> Self {
        MonetValue::Int(i64::from(v))
    }
}

impl From<i64> for MonetValue {
    fn from(v: i64) -> Self {
        MonetValue::Int(v)
    }
}

impl From<f64> for MonetValue {
    fn from(v: f64) -> Self {
        MonetValue::Float(v)
    }
}

impl From<&str> for MonetValue {
    fn from(v: &str) -> Self {
        MonetValue::Text(v.to_string())
    }
}

impl From<String> for MonetValue {
    fn from(v: String) -> Self {
        MonetValue::Text(v)
    }
}

impl From<Vec<u8>> for MonetValue {
    fn from(v: Vec<u8>) -> Self {
        MonetValue::Blob(v)
    }
}

impl From<NaiveDateTime> for MonetValue {
    fn from(v: NaiveDateTime) -> Self {
        MonetValue::Timestamp(v)
    }
}

impl From<NaiveDate> for MonetValue {
    fn from(v: NaiveDate) -> Self {
        MonetValue::Date(v)
    }
}

impl From<Uuid> for MonetValue {
    fn from(v: Uuid) -> Self {
        MonetValue::Uuid(v)
    }
}

impl<T: Into<MonetValue>> From<Option<T>> for MonetValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(MonetValue::Null, Into::into)
    }
}

// ============================================================================
// String Escaping
// ============================================================================

/// Backslash-escape `\` and `'`, then wrap in single quotes.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\\' || c == '\'' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Backslash-escape raw bytes and wrap them in single quotes. Bytes outside
/// printable ASCII become `\ooo` octal escapes.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('\'');
    for &b in bytes {
        match b {
            b'\\' | b'\'' => {
                out.push('\\');
                out.push(char::from(b));
            }
            0x20..=0x7e => out.push(char::from(b)),
            _ => out.push_str(&format!("\\{:03o}", b)),
        }
    }
    out.push('\'');
    out
}

/// Strip one layer of quotes and undo backslash escaping.
///
/// Inverse of [`escape`]. Also accepts the double-quoted form servers use
/// in result tuples.
pub fn unescape(s: &str) -> String {
    String::from_utf8_lossy(&unescape_bytes(s)).into_owned()
}

/// Byte-level [`unescape`]; inverse of [`escape_bytes`].
pub fn unescape_bytes(s: &str) -> Vec<u8> {
    let inner = unquote(s).as_bytes();
    let mut out = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        let b = inner[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }
        if let Some(byte) = inner.get(i..i + 3).and_then(octal_byte) {
            out.push(byte);
            i += 3;
            continue;
        }
        match inner.get(i) {
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(b'r') => out.push(b'\r'),
            Some(&other) => out.push(other),
            // dangling backslash
            None => out.push(b'\\'),
        }
        i += 1;
    }
    out
}

/// `\ooo` with the first digit at most 3, so the value fits a byte.
fn octal_byte(digits: &[u8]) -> Option<u8> {
    match digits {
        &[a @ b'0'..=b'3', b @ b'0'..=b'7', c @ b'0'..=b'7'] => {
            Some(((a - b'0') << 6) | ((b - b'0') << 3) | (c - b'0'))
        }
        _ => None,
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s)
}

fn unquote(s: &str) -> &str {
    if s.len() >= 2 {
        for q in ['\'', '"'] {
            if s.starts_with(q) && s.ends_with(q) {
                return &s[1..s.len() - 1];
            }
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tag_classification() {
        assert!(TypeTag::parse("INT").is_integer());
        assert!(TypeTag::parse("bigint").is_integer());
        assert!(TypeTag::parse("double").is_float());
        assert!(TypeTag::parse("varchar").is_text_like());
        assert!(!TypeTag::parse("blob").is_text_like());
        assert_eq!(
            TypeTag::parse("month_interval"),
            TypeTag::Other("month_interval".to_string())
        );
        assert_eq!(TypeTag::parse("CLOB").to_string(), "clob");
    }

    #[test]
    fn test_float_encoding() {
        assert_eq!(MonetValue::Float(1.22).encode().unwrap(), "1.22");
        assert_eq!(
            MonetValue::decode("1.22", &TypeTag::Double).unwrap(),
            MonetValue::Float(1.22)
        );
        assert_eq!(
            MonetValue::decode("12e-200", &TypeTag::Float).unwrap(),
            MonetValue::Float(12e-200)
        );
        assert!(MonetValue::Float(f64::NAN).encode().is_err());
    }

    #[test]
    fn test_integer_and_bool_encoding() {
        assert_eq!(MonetValue::Int(12).encode().unwrap(), "12");
        assert_eq!(MonetValue::Int(-7).encode().unwrap(), "-7");
        assert_eq!(MonetValue::Bool(false).encode().unwrap(), "false");
        assert_eq!(MonetValue::Bool(true).encode().unwrap(), "true");
        assert_eq!(
            MonetValue::decode("12345", &TypeTag::Int).unwrap(),
            MonetValue::Int(12345)
        );
        assert_eq!(
            MonetValue::decode("false", &TypeTag::Boolean).unwrap(),
            MonetValue::Bool(false)
        );
    }

    #[test]
    fn test_string_encoding() {
        assert_eq!(MonetValue::from("string").encode().unwrap(), "'string'");
        assert_eq!(
            MonetValue::decode("'string'", &TypeTag::Char).unwrap(),
            MonetValue::from("string")
        );
    }

    #[test]
    fn test_blob_escaping() {
        let blob = MonetValue::Blob(b"a\\b'c".to_vec());
        let literal = blob.encode().unwrap();
        assert_eq!(literal, r"'a\\b\'c'");
        assert_eq!(MonetValue::decode(&literal, &TypeTag::Blob).unwrap(), blob);

        assert_eq!(
            MonetValue::decode(r"'a\\b\'c\''", &TypeTag::Clob).unwrap(),
            MonetValue::from("a\\b'c'")
        );
    }

    #[test]
    fn test_binary_blob_round_trip() {
        let blob = MonetValue::Blob(vec![0x00, 0xff]);
        let literal = blob.encode().unwrap();
        assert_eq!(literal, r"'\000\377'");
        assert_eq!(MonetValue::decode(&literal, &TypeTag::Blob).unwrap(), blob);

        let mixed = MonetValue::Blob(vec![b'a', 0x10, b'\'', 0xc3, 0x28, b'\\', 0x7f]);
        let literal = mixed.encode().unwrap();
        assert!(literal.is_ascii());
        assert_eq!(MonetValue::decode(&literal, &TypeTag::Blob).unwrap(), mixed);
    }

    #[test]
    fn test_sub_second_values_are_not_truncated() {
        let ts = NaiveDate::from_ymd_opt(2013, 2, 11)
            .unwrap()
            .and_hms_milli_opt(0, 0, 0, 500)
            .unwrap();
        assert!(matches!(
            MonetValue::Timestamp(ts).encode(),
            Err(MapiError::Value(_))
        ));
        let time = NaiveTime::from_hms_micro_opt(12, 30, 1, 250).unwrap();
        assert!(matches!(
            MonetValue::Time(time).encode(),
            Err(MapiError::Value(_))
        ));
    }

    #[test]
    fn test_timestamp_layout() {
        let ts = NaiveDate::from_ymd_opt(2006, 1, 2)
            .unwrap()
            .and_hms_opt(15, 4, 5)
            .unwrap();
        let literal = MonetValue::Timestamp(ts).encode().unwrap();
        assert_eq!(literal, "'2006-01-02 15:04:05'");
        assert_eq!(
            MonetValue::decode(&literal, &TypeTag::Timestamp).unwrap(),
            MonetValue::Timestamp(ts)
        );
        // servers may append fractional seconds
        assert_eq!(
            MonetValue::decode("2006-01-02 15:04:05.000000", &TypeTag::Timestamp).unwrap(),
            MonetValue::Timestamp(ts)
        );
    }

    #[test]
    fn test_null_for_any_type() {
        assert_eq!(MonetValue::Null.encode().unwrap(), "NULL");
        for tag in ["int", "clob", "timestamp", "ANYTYPECODE"] {
            assert_eq!(
                MonetValue::decode("NULL", &TypeTag::parse(tag)).unwrap(),
                MonetValue::Null
            );
        }
        assert_eq!(MonetValue::from(None::<i64>), MonetValue::Null);
    }

    #[test]
    fn test_malformed_values_are_value_errors() {
        for (text, tag) in [
            ("12x", TypeTag::Int),
            ("abc", TypeTag::Double),
            ("'2013-13-45 00:00:00'", TypeTag::Timestamp),
            ("maybe", TypeTag::Boolean),
            ("'not-a-uuid'", TypeTag::Uuid),
        ] {
            assert!(matches!(
                MonetValue::decode(text, &tag),
                Err(MapiError::Value(_))
            ));
        }
    }

    #[test]
    fn test_round_trips() {
        let values = [
            (MonetValue::Int(-9_223_372_036_854_775_808), TypeTag::BigInt),
            (MonetValue::Float(-13.33), TypeTag::Double),
            (MonetValue::from("it's a \\ test"), TypeTag::Varchar),
            (MonetValue::Blob(Vec::new()), TypeTag::Blob),
            (
                MonetValue::Date(NaiveDate::from_ymd_opt(2012, 1, 10).unwrap()),
                TypeTag::Date,
            ),
            (
                MonetValue::Time(NaiveTime::from_hms_opt(23, 59, 1).unwrap()),
                TypeTag::Time,
            ),
            (MonetValue::Uuid(Uuid::nil()), TypeTag::Uuid),
            (
                MonetValue::Json(serde_json::json!({"a": "it's", "b": [1, 2]})),
                TypeTag::Json,
            ),
        ];
        for (value, tag) in values {
            let literal = value.encode().unwrap();
            assert_eq!(MonetValue::decode(&literal, &tag).unwrap(), value);
        }
    }

    #[test]
    fn test_escape_unescape() {
        assert_eq!(escape("a\\b'c'"), r"'a\\b\'c\''");
        assert_eq!(unescape(r"'a\\b\'c\''"), "a\\b'c'");
        for s in ["", "'", "\\", "\\'", "plain", "tab\there", "\\n"] {
            assert_eq!(unescape(&escape(s)), s);
        }
        assert_eq!(unescape("\"double\\tquoted\""), "double\tquoted");
        assert_eq!(unescape(r"'caf\303\251'"), "café");
        assert_eq!(unescape(r"'\9'"), "9");
    }
}
