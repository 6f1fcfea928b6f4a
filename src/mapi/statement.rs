//! Statements with `%s` placeholders.
//!
//! Arguments are rendered through [`MonetValue::encode`] and spliced into
//! the template in order. That is the only way arguments reach the command
//! text. `%%` stands for a literal `%`.

use tracing::debug;

use super::connection::WeakState;
use super::error::{MapiError, MapiResult};
use super::rows::{parse_response, ExecResult, Rows};
use super::types::MonetValue;

/// A statement bound to a connection.
#[derive(Debug)]
pub struct Statement {
    query: String,
    placeholders: usize,
    conn: Option<WeakState>,
    closed: bool,
}

impl Statement {
    pub(crate) fn new(conn: WeakState, template: &str) -> Self {
        Self {
            query: template.to_string(),
            placeholders: count_placeholders(template),
            conn: Some(conn),
            closed: false,
        }
    }

    /// The template this statement was prepared from.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Number of arguments [`Statement::bind`] expects.
    pub fn num_params(&self) -> usize {
        self.placeholders
    }

    /// Render the command text for `args`.
    pub fn bind(&self, args: &[MonetValue]) -> MapiResult<String> {
        if args.len() != self.placeholders {
            return Err(MapiError::usage(format!(
                "Wrong number of args. Expected {}, got {}",
                self.placeholders,
                args.len()
            )));
        }

        let mut out = String::with_capacity(self.query.len());
        let mut args = args.iter();
        let mut chars = self.query.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('s') => {
                    // count_placeholders guarantees one argument per %s
                    if let Some(arg) = args.next() {
                        out.push_str(&arg.encode()?);
                    }
                }
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        Ok(out)
    }

    /// Run the statement and report affected rows.
    pub fn exec(&self, args: &[MonetValue]) -> MapiResult<ExecResult> {
        let raw = self.run(args)?;
        Ok(parse_response(&raw)?.into_exec_result())
    }

    /// Run the statement and buffer the rows it returns.
    pub fn query_rows(&self, args: &[MonetValue]) -> MapiResult<Rows> {
        let raw = self.run(args)?;
        let conn = self.conn.clone().ok_or(MapiError::ConnectionClosed)?;
        Ok(parse_response(&raw)?.into_rows(conn))
    }

    fn run(&self, args: &[MonetValue]) -> MapiResult<String> {
        if self.closed {
            return Err(MapiError::usage("Stmt is closed."));
        }
        let conn = self
            .conn
            .as_ref()
            .and_then(|conn| conn.upgrade())
            .ok_or(MapiError::ConnectionClosed)?;

        let operation = self.bind(args)?;
        debug!(query = %self.query, params = args.len(), "executing statement");
        let mut state = conn.lock();
        state.run(&operation)
    }

    /// Close the statement. Safe to call more than once; sends nothing.
    pub fn close(&mut self) {
        self.closed = true;
        self.conn = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn count_placeholders(template: &str) -> usize {
    let mut count = 0;
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            if let Some('s') = chars.next() {
                count += 1;
            }
        }
    }
    count
}
