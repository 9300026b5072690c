//! Parser for the line-oriented transformation language.
//!
//! Every non-blank, non-comment line is one statement. Names are bare words
//! or double-quoted strings; expressions run to the end of the line, minus
//! an optional trailing `as "..."` / `else "..."` clause.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload is empty")]
    Empty,
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("payload has {count} statements; the limit is {limit}")]
    TooLong { count: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Scatter,
    Pie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureFn {
    Rows,
    Sum,
    Mean,
    Min,
    Max,
    Distinct,
    Nulls,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Print(String),
    Let {
        name: String,
        expr: String,
    },
    Measure {
        name: String,
        func: MeasureFn,
        dataset: String,
        column: Option<String>,
    },
    Drop {
        dataset: String,
        predicate: String,
        step: Option<String>,
    },
    Dedupe {
        dataset: String,
        columns: Vec<String>,
        step: Option<String>,
    },
    Derive {
        dataset: String,
        column: String,
        expr: String,
    },
    Fill {
        dataset: String,
        column: String,
        expr: String,
    },
    Rename {
        dataset: String,
        from: String,
        to: String,
    },
    Select {
        dataset: String,
        columns: Vec<String>,
    },
    Sort {
        dataset: String,
        keys: Vec<(String, bool)>,
    },
    Copy {
        source: String,
        target: String,
    },
    Aggregate {
        dataset: String,
        keys: Vec<String>,
        sums: Vec<String>,
        into: String,
    },
    Resolve {
        left: String,
        left_key: String,
        right: String,
        right_key: String,
        into: String,
    },
    Reconcile {
        left: String,
        left_key: String,
        left_amount: String,
        right: String,
        right_key: String,
        right_amount: String,
        tolerance: Option<f64>,
        into: String,
    },
    Reload(String),
    Chart {
        kind: ChartKind,
        dataset: String,
        x: String,
        y: String,
        title: Option<String>,
    },
    Result(String),
    Head {
        dataset: String,
        rows: Option<usize>,
    },
    Describe(String),
    Assert {
        expr: String,
        message: Option<String>,
    },
    Fail(String),
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// 1-based line in the cleaned payload.
    pub line: usize,
    pub text: String,
    pub kind: StatementKind,
}

/// Removes a surrounding Markdown code fence (with or without a language
/// tag) and trims the result.
pub fn clean_payload(raw: &str) -> String {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let fence = FENCE.get_or_init(|| Regex::new(r"(?s)^\s*```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)\r?\n?\s*```\s*$").ok());
    let trimmed = raw.trim();
    match fence.as_ref().and_then(|re| re.captures(trimmed)) {
        Some(captures) => captures
            .get(1)
            .map_or("", |m| m.as_str())
            .trim()
            .to_string(),
        None => trimmed.to_string(),
    }
}

pub fn parse(payload: &str) -> Result<Vec<Statement>, PayloadError> {
    let mut statements = Vec::new();
    for (idx, raw_line) in payload.lines().enumerate() {
        let line = idx + 1;
        let text = raw_line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let kind = parse_statement(text).map_err(|message| PayloadError::Syntax { line, message })?;
        statements.push(Statement {
            line,
            text: text.to_string(),
            kind,
        });
    }
    if statements.is_empty() {
        return Err(PayloadError::Empty);
    }
    Ok(statements)
}

type ParseResult<T> = Result<T, String>;

fn parse_statement(text: &str) -> ParseResult<StatementKind> {
    let mut cursor = Cursor::new(text);
    let keyword = cursor.word()?.to_ascii_lowercase();
    let kind = match keyword.as_str() {
        "print" => StatementKind::Print(cursor.expression()?),
        "let" => {
            let name = cursor.name()?;
            cursor.symbol('=')?;
            StatementKind::Let {
                name,
                expr: cursor.expression()?,
            }
        }
        "measure" => {
            let name = cursor.name()?;
            cursor.symbol('=')?;
            let func = match cursor.word()?.to_ascii_lowercase().as_str() {
                "rows" => MeasureFn::Rows,
                "sum" => MeasureFn::Sum,
                "mean" => MeasureFn::Mean,
                "min" => MeasureFn::Min,
                "max" => MeasureFn::Max,
                "distinct" => MeasureFn::Distinct,
                "nulls" => MeasureFn::Nulls,
                other => return Err(format!("unknown measure '{other}'")),
            };
            let dataset = cursor.name()?;
            let column = cursor.optional_name()?;
            if func != MeasureFn::Rows && column.is_none() {
                return Err("this measure needs a column".to_string());
            }
            StatementKind::Measure {
                name,
                func,
                dataset,
                column,
            }
        }
        "drop" => {
            let dataset = cursor.name()?;
            cursor.keyword("where")?;
            let (predicate, step) = split_trailing_label(&cursor.expression()?, "as");
            if predicate.is_empty() {
                return Err("missing predicate after 'where'".to_string());
            }
            StatementKind::Drop {
                dataset,
                predicate,
                step,
            }
        }
        "dedupe" => {
            let dataset = cursor.name()?;
            let columns = if cursor.eat_keyword("by") {
                cursor.name_list()?
            } else {
                Vec::new()
            };
            let step = if cursor.eat_keyword("as") {
                Some(cursor.name()?)
            } else {
                None
            };
            StatementKind::Dedupe {
                dataset,
                columns,
                step,
            }
        }
        "derive" => {
            let dataset = cursor.name()?;
            let column = cursor.name()?;
            cursor.symbol('=')?;
            StatementKind::Derive {
                dataset,
                column,
                expr: cursor.expression()?,
            }
        }
        "fill" => {
            let dataset = cursor.name()?;
            let column = cursor.name()?;
            cursor.keyword("with")?;
            StatementKind::Fill {
                dataset,
                column,
                expr: cursor.expression()?,
            }
        }
        "rename" => {
            let dataset = cursor.name()?;
            let from = cursor.name()?;
            cursor.keyword("to")?;
            StatementKind::Rename {
                dataset,
                from,
                to: cursor.name()?,
            }
        }
        "select" => StatementKind::Select {
            dataset: cursor.name()?,
            columns: cursor.name_list()?,
        },
        "sort" => {
            let dataset = cursor.name()?;
            cursor.keyword("by")?;
            StatementKind::Sort {
                dataset,
                keys: cursor.sort_keys()?,
            }
        }
        "copy" => {
            let source = cursor.name()?;
            cursor.keyword("to")?;
            StatementKind::Copy {
                source,
                target: cursor.name()?,
            }
        }
        "aggregate" => {
            let dataset = cursor.name()?;
            cursor.keyword("by")?;
            let keys = cursor.name_list()?;
            cursor.keyword("sum")?;
            let sums = cursor.name_list()?;
            cursor.keyword("into")?;
            StatementKind::Aggregate {
                dataset,
                keys,
                sums,
                into: cursor.name()?,
            }
        }
        "resolve" => {
            let left = cursor.name()?;
            cursor.keyword("on")?;
            let left_key = cursor.name()?;
            cursor.keyword("with")?;
            let right = cursor.name()?;
            cursor.keyword("on")?;
            let right_key = cursor.name()?;
            cursor.keyword("into")?;
            StatementKind::Resolve {
                left,
                left_key,
                right,
                right_key,
                into: cursor.name()?,
            }
        }
        "reconcile" => {
            let left = cursor.name()?;
            cursor.keyword("on")?;
            let left_key = cursor.name()?;
            cursor.keyword("amount")?;
            let left_amount = cursor.name()?;
            cursor.keyword("with")?;
            let right = cursor.name()?;
            cursor.keyword("on")?;
            let right_key = cursor.name()?;
            cursor.keyword("amount")?;
            let right_amount = cursor.name()?;
            let tolerance = if cursor.eat_keyword("tolerance") {
                let raw = cursor.word()?;
                Some(
                    raw.parse::<f64>()
                        .map_err(|_| format!("invalid tolerance '{raw}'"))?,
                )
            } else {
                None
            };
            cursor.keyword("into")?;
            StatementKind::Reconcile {
                left,
                left_key,
                left_amount,
                right,
                right_key,
                right_amount,
                tolerance,
                into: cursor.name()?,
            }
        }
        "reload" => StatementKind::Reload(cursor.name()?),
        "chart" => {
            let kind = match cursor.word()?.to_ascii_lowercase().as_str() {
                "bar" => ChartKind::Bar,
                "line" => ChartKind::Line,
                "scatter" => ChartKind::Scatter,
                "pie" => ChartKind::Pie,
                other => return Err(format!("unknown chart kind '{other}'")),
            };
            let dataset = cursor.name()?;
            cursor.keyword("x")?;
            let x = cursor.name()?;
            cursor.keyword("y")?;
            let y = cursor.name()?;
            let title = if cursor.eat_keyword("title") {
                Some(cursor.name()?)
            } else {
                None
            };
            StatementKind::Chart {
                kind,
                dataset,
                x,
                y,
                title,
            }
        }
        "result" => StatementKind::Result(cursor.name()?),
        "head" => {
            let dataset = cursor.name()?;
            let rows = match cursor.optional_name()? {
                Some(raw) => Some(
                    raw.parse::<usize>()
                        .map_err(|_| format!("invalid row count '{raw}'"))?,
                ),
                None => None,
            };
            StatementKind::Head { dataset, rows }
        }
        "describe" => StatementKind::Describe(cursor.name()?),
        "assert" => {
            let (expr, message) = split_trailing_label(&cursor.expression()?, "else");
            if expr.is_empty() {
                return Err("missing expression after 'assert'".to_string());
            }
            StatementKind::Assert { expr, message }
        }
        "fail" => StatementKind::Fail(cursor.name()?),
        "done" => StatementKind::Done,
        other => return Err(format!("unknown statement '{other}'")),
    };
    cursor.finish()?;
    Ok(kind)
}

/// Splits `expr as "label"` (or `else`) into its parts.
fn split_trailing_label(raw: &str, keyword: &str) -> (String, Option<String>) {
    let pattern = format!(r#"^(?s)(.*?)\s+{keyword}\s+"((?:[^"\\]|\\.)*)"\s*$"#);
    match Regex::new(&pattern).ok().and_then(|re| {
        re.captures(raw)
            .map(|c| (c[1].trim().to_string(), unescape(&c[2])))
    }) {
        Some((expr, label)) => (expr, Some(label)),
        None => (raw.trim().to_string(), None),
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Cursor { rest: text }
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn is_word_char(ch: char) -> bool {
        !ch.is_whitespace() && !matches!(ch, '=' | ',' | ':' | '"')
    }

    fn word(&mut self) -> ParseResult<String> {
        self.skip_ws();
        let end = self
            .rest
            .char_indices()
            .find(|(_, ch)| !Self::is_word_char(*ch))
            .map_or(self.rest.len(), |(idx, _)| idx);
        if end == 0 {
            return Err(match self.rest.chars().next() {
                Some(ch) => format!("unexpected '{ch}'"),
                None => "unexpected end of line".to_string(),
            });
        }
        let (word, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(word.to_string())
    }

    fn quoted(&mut self) -> ParseResult<String> {
        self.skip_ws();
        let body = self
            .rest
            .strip_prefix('"')
            .ok_or_else(|| "expected '\"'".to_string())?;
        let mut escaped = false;
        for (idx, ch) in body.char_indices() {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => {
                    let value = unescape(&body[..idx]);
                    self.rest = &body[idx + 1..];
                    return Ok(value);
                }
                _ => escaped = false,
            }
        }
        Err("unterminated string".to_string())
    }

    /// A bare word or a quoted string.
    fn name(&mut self) -> ParseResult<String> {
        self.skip_ws();
        if self.rest.starts_with('"') {
            self.quoted()
        } else {
            self.word()
        }
    }

    fn optional_name(&mut self) -> ParseResult<Option<String>> {
        self.skip_ws();
        if self.rest.is_empty() {
            Ok(None)
        } else {
            self.name().map(Some)
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        let rest = self.rest.trim_start();
        rest.get(..keyword.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(keyword))
            && rest[keyword.len()..]
                .chars()
                .next()
                .is_none_or(|ch| !Self::is_word_char(ch))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.rest = &self.rest.trim_start()[keyword.len()..];
            true
        } else {
            false
        }
    }

    fn keyword(&mut self, keyword: &str) -> ParseResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(format!("expected '{keyword}'"))
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        self.skip_ws();
        match self.rest.strip_prefix(symbol) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn symbol(&mut self, symbol: char) -> ParseResult<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(format!("expected '{symbol}'"))
        }
    }

    /// Comma-separated names.
    fn name_list(&mut self) -> ParseResult<Vec<String>> {
        let mut names = vec![self.name()?];
        while self.eat_symbol(',') {
            names.push(self.name()?);
        }
        Ok(names)
    }

    fn sort_keys(&mut self) -> ParseResult<Vec<(String, bool)>> {
        let mut keys = Vec::new();
        loop {
            let name = self.name()?;
            let ascending = if self.eat_symbol(':') {
                match self.word()?.to_ascii_lowercase().as_str() {
                    "asc" => true,
                    "desc" => false,
                    other => return Err(format!("unknown sort direction '{other}'")),
                }
            } else {
                true
            };
            keys.push((name, ascending));
            if !self.eat_symbol(',') {
                break;
            }
        }
        Ok(keys)
    }

    /// The rest of the line, verbatim.
    fn expression(&mut self) -> ParseResult<String> {
        let expr = self.rest.trim().to_string();
        self.rest = "";
        if expr.is_empty() {
            return Err("missing expression".to_string());
        }
        Ok(expr)
    }

    fn finish(&mut self) -> ParseResult<()> {
        self.skip_ws();
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(format!("unexpected trailing input '{}'", self.rest))
        }
    }
}
