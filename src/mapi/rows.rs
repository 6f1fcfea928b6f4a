//! Response parsing and buffered result sets.
//!
//! A response is a block of lines, each starting with a marker. Info lines
//! are dropped first; the first remaining line decides what the response
//! is. Table responses look like:
//!
//! ```text
//! &1 0 2 2 2
//! % sys.t,	sys.t # table_name
//! % id,	name # name
//! % int,	varchar # type
//! % 1,	5 # length
//! [ 1,	'alice'	]
//! [ 2,	'bob'	]
//! ```

use super::connection::WeakState;
use super::error::{MapiError, MapiResult};
use super::protocol::marker;
use super::types::{MonetValue, TypeTag};

// ============================================================================
// Exec Result
// ============================================================================

/// Outcome of a command that produced no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    rows_affected: i64,
    last_insert_id: Option<i64>,
}

impl ExecResult {
    pub fn new(rows_affected: i64, last_insert_id: Option<i64>) -> Self {
        Self {
            rows_affected,
            last_insert_id,
        }
    }

    pub fn rows_affected(&self) -> i64 {
        self.rows_affected
    }

    /// Id generated by the last insert; an error when the server sent none.
    pub fn last_insert_id(&self) -> MapiResult<i64> {
        self.last_insert_id
            .ok_or_else(|| MapiError::usage("no last insert id for this result"))
    }
}

// ============================================================================
// Response
// ============================================================================

/// A decoded table response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableData {
    pub query_id: Option<i64>,
    pub columns: Vec<String>,
    pub types: Vec<TypeTag>,
    pub rows: Vec<Vec<MonetValue>>,
}

/// A parsed server response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Bare prompt: the command succeeded and said nothing.
    Empty,
    Update(ExecResult),
    Schema,
    Transaction,
    Table(TableData),
}

impl Response {
    pub fn into_exec_result(self) -> ExecResult {
        match self {
            Response::Update(result) => result,
            Response::Table(table) => ExecResult::new(table.rows.len() as i64, None),
            Response::Empty | Response::Schema | Response::Transaction => ExecResult::default(),
        }
    }

    pub(crate) fn into_rows(self, conn: WeakState) -> Rows {
        let table = match self {
            Response::Table(table) => table,
            _ => TableData::default(),
        };
        Rows::new(table, Some(conn))
    }
}

/// Drop info lines and empty prompt lines.
pub fn skip_info(raw: &str) -> Vec<&str> {
    raw.lines()
        .filter(|line| !line.starts_with(marker::INFO) && *line != marker::PROMPT)
        .collect()
}

/// Split header metadata on spaces, tabs, CR and LF, dropping empty tokens.
pub fn tokenize_metadata(s: &str) -> Vec<&str> {
    s.split([' ', '\t', '\r', '\n'])
        .filter(|token| !token.is_empty())
        .collect()
}

/// Classify and decode a raw server response.
pub fn parse_response(raw: &str) -> MapiResult<Response> {
    let lines = skip_info(raw);

    let errors: Vec<&str> = lines
        .iter()
        .filter_map(|line| line.strip_prefix(marker::ERROR))
        .collect();
    if !errors.is_empty() {
        return Err(server_error(&errors));
    }

    let Some((first, rest)) = lines.split_first() else {
        return Ok(Response::Empty);
    };

    if let Some(meta) = first.strip_prefix(marker::TABLE) {
        parse_table(meta, rest).map(Response::Table)
    } else if let Some(meta) = first.strip_prefix(marker::UPDATE) {
        parse_update(meta).map(Response::Update)
    } else if first.starts_with(marker::SCHEMA) {
        Ok(Response::Schema)
    } else if first.starts_with(marker::TRANSACTION) {
        Ok(Response::Transaction)
    } else if first.starts_with(marker::PREPARE) || first.starts_with(marker::BLOCK) {
        Err(MapiError::Protocol(format!(
            "unsupported response kind {:?}",
            &first[..2]
        )))
    } else {
        Err(MapiError::Protocol(format!(
            "unexpected response line {:?}",
            first
        )))
    }
}

fn server_error(lines: &[&str]) -> MapiError {
    // "!42000!message" carries a SQLSTATE before the message
    let (code, first) = match lines[0].split_once('!') {
        Some((code, msg)) if is_sqlstate(code) => (Some(code.to_string()), msg),
        _ => (None, lines[0]),
    };

    let mut message = first.to_string();
    for line in &lines[1..] {
        message.push('\n');
        message.push_str(line);
    }

    MapiError::Server { code, message }
}

fn is_sqlstate(code: &str) -> bool {
    code.len() == 5 && code.chars().all(|c| c.is_ascii_alphanumeric())
}

fn parse_update(meta: &str) -> MapiResult<ExecResult> {
    let tokens = tokenize_metadata(meta);
    let rows_affected = parse_count(tokens.first().copied(), "rows affected")?;
    let last_insert_id = match tokens.get(1).copied() {
        Some(token) => Some(parse_count(Some(token), "last insert id")?).filter(|id| *id >= 0),
        None => None,
    };
    Ok(ExecResult::new(rows_affected, last_insert_id))
}

fn parse_count(token: Option<&str>, what: &str) -> MapiResult<i64> {
    let token = token.ok_or_else(|| MapiError::Protocol(format!("missing {}", what)))?;
    token
        .parse::<i64>()
        .map_err(|_| MapiError::Protocol(format!("invalid {}: {:?}", what, token)))
}

fn parse_table(meta: &str, lines: &[&str]) -> MapiResult<TableData> {
    // &1 <query id> <row count> <column count> <tuple count>
    let tokens = tokenize_metadata(meta);
    let query_id = tokens
        .first()
        .copied()
        .map(|t| parse_count(Some(t), "query id"))
        .transpose()?;
    let row_count = tokens
        .get(1)
        .copied()
        .map(|t| parse_count(Some(t), "row count"))
        .transpose()?;
    let column_count = tokens
        .get(2)
        .copied()
        .map(|t| parse_count(Some(t), "column count"))
        .transpose()?;

    let mut table = TableData {
        query_id,
        ..TableData::default()
    };
    let mut names: Option<Vec<String>> = None;
    let mut types: Option<Vec<TypeTag>> = None;

    for line in lines {
        if let Some(header) = line.strip_prefix(marker::HEADER) {
            let (values, label) = parse_header(header)?;
            match label {
                "name" => names = Some(values.into_iter().map(str::to_string).collect()),
                "type" => types = Some(values.into_iter().map(TypeTag::parse).collect()),
                _ => {}
            }
        } else if line.starts_with(marker::TUPLE) {
            let types = types.as_ref().ok_or_else(|| {
                MapiError::Protocol("tuple received before the type header".to_string())
            })?;
            table.rows.push(parse_tuple(line, types)?);
        } else {
            return Err(MapiError::Protocol(format!(
                "unexpected line in table response {:?}",
                line
            )));
        }
    }

    table.types = types
        .ok_or_else(|| MapiError::Protocol("table response has no type header".to_string()))?;
    table.columns = names.unwrap_or_else(|| vec![String::new(); table.types.len()]);

    if table.columns.len() != table.types.len() {
        return Err(MapiError::Protocol(format!(
            "{} column names for {} column types",
            table.columns.len(),
            table.types.len()
        )));
    }
    if let Some(count) = column_count {
        if count != table.types.len() as i64 {
            return Err(MapiError::Protocol(format!(
                "header announces {} columns, got {} types",
                count,
                table.types.len()
            )));
        }
    }
    // Sessions run with an unlimited reply size, so the whole result set
    // arrives in this one reply.
    if let Some(count) = row_count {
        if count != table.rows.len() as i64 {
            return Err(MapiError::Protocol(format!(
                "header announces {} rows, got {}",
                count,
                table.rows.len()
            )));
        }
    }

    Ok(table)
}

/// Split `% v1,\tv2 # label` into its values and label.
fn parse_header(line: &str) -> MapiResult<(Vec<&str>, &str)> {
    let (values, label) = line
        .rsplit_once('#')
        .ok_or_else(|| MapiError::Protocol(format!("header line without label {:?}", line)))?;
    let values = values.split(',').map(str::trim).collect();
    Ok((values, label.trim()))
}

/// Decode `[ v1,\tv2\t]` using the column types.
fn parse_tuple(line: &str, types: &[TypeTag]) -> MapiResult<Vec<MonetValue>> {
    let body = line.strip_prefix(marker::TUPLE).unwrap_or(line);
    let body = body.trim_end_matches(['\r', '\n']);
    let body = body
        .strip_suffix("\t]")
        .or_else(|| body.strip_suffix(" ]"))
        .unwrap_or(body);

    let fields: Vec<&str> = body.split('\t').collect();
    if fields.len() != types.len() {
        return Err(MapiError::Protocol(format!(
            "tuple has {} values, expected {}",
            fields.len(),
            types.len()
        )));
    }

    fields
        .into_iter()
        .zip(types)
        .map(|(field, tag)| {
            let field = field.trim();
            let field = field.strip_suffix(',').unwrap_or(field);
            MonetValue::decode(field, tag)
        })
        .collect()
}

// ============================================================================
// Rows
// ============================================================================

/// A fully buffered result set.
///
/// All tuples are decoded when the response arrives; iterating never
/// touches the network.
#[derive(Debug)]
pub struct Rows {
    columns: Vec<String>,
    types: Vec<TypeTag>,
    rows: Vec<Vec<MonetValue>>,
    cursor: usize,
    conn: Option<WeakState>,
    closed: bool,
}

impl Rows {
    pub(crate) fn new(table: TableData, conn: Option<WeakState>) -> Self {
        Self {
            columns: table.columns,
            types: table.types,
            rows: table.rows,
            cursor: 0,
            conn,
            closed: false,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn types(&self) -> &[TypeTag] {
        &self.types
    }

    /// Number of buffered rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of rows already handed out by [`Rows::next`].
    pub fn consumed(&self) -> usize {
        self.cursor
    }

    /// Copy the next row into `dest`.
    ///
    /// Returns `Ok(false)` once every row has been read. `dest` must have
    /// exactly one slot per column.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self, dest: &mut [MonetValue]) -> MapiResult<bool> {
        if self.closed {
            return Err(MapiError::usage("rows are closed"));
        }
        if dest.len() != self.columns.len() {
            return Err(MapiError::usage(format!(
                "destination has {} slots, result has {} columns",
                dest.len(),
                self.columns.len()
            )));
        }

        let Some(row) = self.rows.get(self.cursor) else {
            return Ok(false);
        };
        dest.clone_from_slice(row);
        self.cursor += 1;
        Ok(true)
    }

    /// Release the buffered rows. Safe to call more than once.
    pub fn close(&mut self) {
        self.closed = true;
        self.conn = None;
        self.rows.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the originating connection is gone or this set was closed.
    pub fn is_detached(&self) -> bool {
        match &self.conn {
            Some(conn) => conn.upgrade().map_or(true, |state| state.lock().is_closed()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use pretty_assertions::assert_eq;

    fn detached(table: TableData) -> Rows {
        Rows::new(table, None)
    }

    #[test]
    fn test_skip_info() {
        let lines = skip_info("#any\nNO_MSG_INFOother\n");
        assert_eq!(lines, vec!["NO_MSG_INFOother"]);
    }

    #[test]
    fn test_tokenize_metadata() {
        let tokens = tokenize_metadata("a b\tc\rd\ne \t\r\nf");
        assert_eq!(tokens, vec!["a", "b", "c", "d", "e", "f"]);
        assert!(tokenize_metadata("").is_empty());
    }

    #[test]
    fn test_error_response() {
        match parse_response("!error message") {
            Err(err) => assert_eq!(err.to_string(), "error message"),
            Ok(other) => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_with_sqlstate() {
        match parse_response("#info\n!42000!syntax error\n!in statement\n") {
            Err(MapiError::Server { code, message }) => {
                assert_eq!(code.as_deref(), Some("42000"));
                assert_eq!(message, "syntax error\nin statement");
            }
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[test]
    fn test_update_response() {
        let result = parse_response("&2123456\t34").unwrap().into_exec_result();
        assert_eq!(result.rows_affected(), 123456);
        assert_eq!(result.last_insert_id().unwrap(), 34);

        let result = parse_response("&2 1 -1\n").unwrap().into_exec_result();
        assert_eq!(result.rows_affected(), 1);
        assert!(result.last_insert_id().is_err());
    }

    #[test]
    fn test_schema_and_transaction_have_no_rows() {
        for msg in ["&3MSG", "&4MSG", "&4 t\n"] {
            let result = parse_response(msg).unwrap().into_exec_result();
            assert_eq!(result, ExecResult::default());
            assert!(result.last_insert_id().is_err());
        }
    }

    #[test]
    fn test_prompt_is_empty_response() {
        assert_eq!(parse_response("").unwrap(), Response::Empty);
        assert_eq!(parse_response("#only info\n").unwrap(), Response::Empty);
    }

    #[test]
    fn test_unknown_markers_are_protocol_errors() {
        for msg in ["&5 1 2 3 4", "&6 0 1 0 0", "?what", "[ 1\t]"] {
            assert!(
                matches!(parse_response(msg), Err(MapiError::Protocol(_))),
                "{}",
                msg
            );
        }
    }

    #[test]
    fn test_table_response() {
        let raw = "&1 0 2 2 2\n\
                   % sys.t,\tsys.t # table_name\n\
                   % id,\tname # name\n\
                   % int,\tvarchar # type\n\
                   % 1,\t5 # length\n\
                   [ 1,\t'alice'\t]\n\
                   [ 2,\tNULL\t]\n";
        let table = match parse_response(raw).unwrap() {
            Response::Table(table) => table,
            other => panic!("expected table, got {:?}", other),
        };
        assert_eq!(table.query_id, Some(0));
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(table.types, vec![TypeTag::Int, TypeTag::Varchar]);
        assert_eq!(
            table.rows,
            vec![
                vec![MonetValue::Int(1), MonetValue::from("alice")],
                vec![MonetValue::Int(2), MonetValue::Null],
            ]
        );
    }

    #[test]
    fn test_table_without_types_is_protocol_error() {
        let raw = "&1 0 1 1 1\n% id # name\n[ 1\t]\n";
        assert!(matches!(parse_response(raw), Err(MapiError::Protocol(_))));
    }

    #[test]
    fn test_partial_result_set_is_protocol_error() {
        let raw = "&1 0 250 1 1\n% x # name\n% int # type\n[ 1\t]\n";
        match parse_response(raw) {
            Err(MapiError::Protocol(msg)) => assert!(msg.contains("250 rows"), "{}", msg),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_column_name_is_kept() {
        let raw = "&1 0 1 2 1\n% ,\tname # name\n% int,\tvarchar # type\n[ 1,\t'a'\t]\n";
        let table = match parse_response(raw).unwrap() {
            Response::Table(table) => table,
            other => panic!("expected table, got {:?}", other),
        };
        assert_eq!(table.columns, vec!["", "name"]);
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn test_tuple_width_mismatch_is_protocol_error() {
        let raw = "&1 0 1 2 1\n% id,\tname # name\n% int,\tvarchar # type\n[ 1\t]\n";
        assert!(matches!(parse_response(raw), Err(MapiError::Protocol(_))));
    }

    #[test]
    fn test_tuple_values_decode_by_column_type() {
        let ts = NaiveDate::from_ymd_opt(2012, 1, 10)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let values = vec![
            MonetValue::from("hallo"),
            MonetValue::from("hallo"),
            MonetValue::Blob(b"hallo".to_vec()),
            MonetValue::Timestamp(ts),
            MonetValue::Int(1334),
            MonetValue::Float(13.33),
        ];
        let types: Vec<TypeTag> = ["char", "clob", "blob", "timestamp", "int", "double"]
            .into_iter()
            .map(TypeTag::parse)
            .collect();

        let encoded: Vec<String> = values.iter().map(|v| v.encode().unwrap()).collect();
        let line = format!("[{}", encoded.join("\t"));

        assert_eq!(parse_tuple(&line, &types).unwrap(), values);
    }

    #[test]
    fn test_malformed_tuple_value_is_value_error() {
        let raw = "&1 0 1 1 1\n% n # name\n% int # type\n[ twelve\t]\n";
        assert!(matches!(parse_response(raw), Err(MapiError::Value(_))));
    }

    #[test]
    fn test_next_checks_destination_width() {
        let mut rows = detached(TableData {
            columns: vec!["col1".to_string()],
            types: vec![TypeTag::Int],
            ..TableData::default()
        });
        assert!(matches!(rows.next(&mut []), Err(MapiError::Usage(_))));
    }

    #[test]
    fn test_next_copies_rows_then_ends() {
        let row = vec![MonetValue::Int(1), MonetValue::Int(2)];
        let mut rows = detached(TableData {
            columns: vec!["col1".to_string(), "col2".to_string()],
            types: vec![TypeTag::Int, TypeTag::Int],
            rows: vec![row.clone()],
            ..TableData::default()
        });

        let mut dest = vec![MonetValue::Null; 2];
        assert!(rows.next(&mut dest).unwrap());
        assert_eq!(dest, row);
        assert_eq!(rows.consumed(), 1);
        assert!(!rows.next(&mut dest).unwrap());
        assert!(!rows.next(&mut dest).unwrap());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut rows = detached(TableData::default());
        rows.close();
        rows.close();
        assert!(rows.is_closed());
        assert!(rows.is_detached());
        assert!(matches!(rows.next(&mut []), Err(MapiError::Usage(_))));
    }
}
