//! Kubernetes-flavoured JSONPath, restricted to one query per expression.
//!
//! Accepted forms: `{.a.b}`, `.a.b`, `a.b`, `$.a`, `['a.b']`, `[0]`, `[-1]`, `[1:3]`, `[*]`,
//! `..name`, `[?(@.type=="Ready")]`; a literal dot inside a key is written `\.`.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JsonPathError {
    #[error("empty jsonpath not allowed")]
    Empty,
    #[error("failed to parse jsonpath '{expr}': {msg}")]
    Parse { expr: String, msg: String },
    #[error("jsonpath '{0}' must contain exactly one query")]
    MultipleQueries(String),
    #[error("jsonpath returned empty list: {0}")]
    NoValue(String),
    #[error("too many results for the query: {0}")]
    TooManyResults(String),
}

impl JsonPathError {
    /// Path parsed fine but the object has nothing there (yet).
    pub fn is_missing(&self) -> bool {
        matches!(self, JsonPathError::NoValue(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Wildcard,
    Index(i64),
    Slice(Option<i64>, Option<i64>),
    Recursive(Box<Segment>),
    Filter(Box<Filter>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
struct Filter {
    path: Vec<Segment>,
    cmp: Option<(CmpOp, Literal)>,
}

/// A parsed single-query path.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    expr: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(expr: &str) -> Result<Self, JsonPathError> {
        let inner = unwrap_query(expr)?;
        let chars: Vec<char> = inner.chars().collect();
        let mut p = Parser { expr, chars: &chars, pos: 0 };
        if p.peek() == Some('$') {
            p.pos += 1;
        }
        let segments = p.segments(true)?;
        Ok(Self { expr: expr.to_string(), segments })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// All matches; a missing key yields no match rather than an error.
    pub fn evaluate<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        walk(&self.segments, vec![root])
    }

    /// Exactly one match.
    pub fn evaluate_single<'a>(&self, root: &'a Value) -> Result<&'a Value, JsonPathError> {
        let mut found = self.evaluate(root);
        match found.len() {
            0 => Err(JsonPathError::NoValue(self.expr.clone())),
            1 => Ok(found.remove(0)),
            _ => Err(JsonPathError::TooManyResults(self.expr.clone())),
        }
    }
}

pub fn evaluate(expr: &str, root: &Value) -> Result<Vec<Value>, JsonPathError> {
    Ok(JsonPath::parse(expr)?.evaluate(root).into_iter().cloned().collect())
}

pub fn evaluate_single(expr: &str, root: &Value) -> Result<Value, JsonPathError> {
    JsonPath::parse(expr)?.evaluate_single(root).cloned()
}

/// Strip one `{...}` wrapper; text around or between queries is rejected.
fn unwrap_query(expr: &str) -> Result<&str, JsonPathError> {
    let t = expr.trim();
    if t.is_empty() {
        return Err(JsonPathError::Empty);
    }
    let mut quote: Option<char> = None;
    let mut opens = Vec::new();
    let mut closes = Vec::new();
    for (i, c) in t.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(c),
            (None, '{') => opens.push(i),
            (None, '}') => closes.push(i),
            _ => {}
        }
    }
    match (opens.as_slice(), closes.as_slice()) {
        ([], []) => Ok(t),
        ([0], [end]) if *end == t.len() - 1 => {
            let inner = t[1..*end].trim();
            if inner.is_empty() {
                Err(JsonPathError::Empty)
            } else {
                Ok(inner)
            }
        }
        _ => Err(JsonPathError::MultipleQueries(expr.to_string())),
    }
}

struct Parser<'a> {
    expr: &'a str,
    chars: &'a [char],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, msg: impl Into<String>) -> JsonPathError {
        JsonPathError::Parse { expr: self.expr.to_string(), msg: msg.into() }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<char> {
        self.chars.get(self.pos + off).copied()
    }

    fn segments(&mut self, allow_bare_head: bool) -> Result<Vec<Segment>, JsonPathError> {
        let mut out = Vec::new();
        if allow_bare_head {
            if let Some(c) = self.peek() {
                if c != '.' && c != '[' {
                    out.push(self.field_or_wildcard()?);
                }
            }
        }
        while let Some(c) = self.peek() {
            match c {
                '.' if self.peek_at(1) == Some('.') => {
                    self.pos += 2;
                    let inner = if self.peek() == Some('[') { self.bracket()? } else { self.field_or_wildcard()? };
                    out.push(Segment::Recursive(Box::new(inner)));
                }
                '.' => {
                    self.pos += 1;
                    match self.peek() {
                        None | Some('[') => {}
                        Some(_) => out.push(self.field_or_wildcard()?),
                    }
                }
                '[' => out.push(self.bracket()?),
                other => return Err(self.err(format!("unexpected character '{other}'"))),
            }
        }
        Ok(out)
    }

    fn field_or_wildcard(&mut self) -> Result<Segment, JsonPathError> {
        if self.peek() == Some('*') {
            self.pos += 1;
            return Ok(Segment::Wildcard);
        }
        let mut name = String::new();
        while let Some(c) = self.peek() {
            match c {
                '\\' => {
                    let next = self.peek_at(1).ok_or_else(|| self.err("dangling escape"))?;
                    name.push(next);
                    self.pos += 2;
                }
                '.' | '[' => break,
                _ => {
                    name.push(c);
                    self.pos += 1;
                }
            }
        }
        if name.is_empty() {
            return Err(self.err("empty field name"));
        }
        Ok(Segment::Field(name))
    }

    fn bracket(&mut self) -> Result<Segment, JsonPathError> {
        self.pos += 1; // '['
        let seg = match self.peek() {
            Some(q @ ('\'' | '"')) => {
                self.pos += 1;
                let mut name = String::new();
                loop {
                    match self.peek() {
                        None => return Err(self.err("unterminated quoted key")),
                        Some(c) if c == q => {
                            self.pos += 1;
                            break;
                        }
                        Some('\\') => {
                            let next = self.peek_at(1).ok_or_else(|| self.err("dangling escape"))?;
                            name.push(next);
                            self.pos += 2;
                        }
                        Some(c) => {
                            name.push(c);
                            self.pos += 1;
                        }
                    }
                }
                Segment::Field(name)
            }
            Some('*') => {
                self.pos += 1;
                Segment::Wildcard
            }
            Some('?') => {
                self.pos += 1;
                if self.peek() != Some('(') {
                    return Err(self.err("expected '(' after '?'"));
                }
                self.pos += 1;
                let body = self.until_close_paren()?;
                Segment::Filter(Box::new(self.filter(&body)?))
            }
            Some(_) => {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == ']' {
                        break;
                    }
                    self.pos += 1;
                }
                let content: String = self.chars[start..self.pos].iter().collect();
                self.index_or_slice(content.trim())?
            }
            None => return Err(self.err("unterminated array")),
        };
        if self.peek() != Some(']') {
            return Err(self.err("unterminated array"));
        }
        self.pos += 1;
        Ok(seg)
    }

    fn until_close_paren(&mut self) -> Result<String, JsonPathError> {
        let mut depth = 1usize;
        let mut quote: Option<char> = None;
        let mut body = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '\'' | '"') => quote = Some(c),
                (None, '(') => depth += 1,
                (None, ')') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(body);
                    }
                }
                _ => {}
            }
            body.push(c);
        }
        Err(self.err("unterminated filter"))
    }

    fn index_or_slice(&self, content: &str) -> Result<Segment, JsonPathError> {
        if content.contains(',') {
            return Err(self.err("unions are not supported"));
        }
        let parse = |s: &str| -> Result<Option<i64>, JsonPathError> {
            let s = s.trim();
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<i64>().map(Some).map_err(|_| self.err(format!("invalid array index '{s}'")))
            }
        };
        match content.split_once(':') {
            Some((a, b)) => {
                let b = b.split(':').next().unwrap_or_default();
                Ok(Segment::Slice(parse(a)?, parse(b)?))
            }
            None => parse(content)?.map(Segment::Index).ok_or_else(|| self.err("empty array index")),
        }
    }

    fn filter(&self, body: &str) -> Result<Filter, JsonPathError> {
        let (lhs, cmp) = match split_comparison(body) {
            Some((l, op, r)) => (l, Some((op, self.literal(r.trim())?))),
            None => (body, None),
        };
        let lhs = lhs.trim();
        let rel = lhs.strip_prefix('@').ok_or_else(|| self.err("filter must start with '@'"))?;
        let chars: Vec<char> = rel.chars().collect();
        let mut sub = Parser { expr: self.expr, chars: &chars, pos: 0 };
        let path = sub.segments(false)?;
        Ok(Filter { path, cmp })
    }

    fn literal(&self, s: &str) -> Result<Literal, JsonPathError> {
        let quoted = |q: char| s.len() >= 2 && s.starts_with(q) && s.ends_with(q);
        if quoted('"') || quoted('\'') {
            return Ok(Literal::Str(s[1..s.len() - 1].to_string()));
        }
        match s {
            "true" => Ok(Literal::Bool(true)),
            "false" => Ok(Literal::Bool(false)),
            "null" | "nil" => Ok(Literal::Null),
            _ => s.parse::<f64>().map(Literal::Num).map_err(|_| self.err(format!("invalid literal '{s}'"))),
        }
    }
}

fn split_comparison(body: &str) -> Option<(&str, CmpOp, &str)> {
    let bytes = body.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == b'"' || c == b'\'' => quote = Some(c),
            None => {
                let two = body.get(i..i + 2);
                let op = match (two, c) {
                    (Some("=="), _) => Some((CmpOp::Eq, 2)),
                    (Some("!="), _) => Some((CmpOp::Ne, 2)),
                    (Some("<="), _) => Some((CmpOp::Le, 2)),
                    (Some(">="), _) => Some((CmpOp::Ge, 2)),
                    (_, b'<') => Some((CmpOp::Lt, 1)),
                    (_, b'>') => Some((CmpOp::Gt, 1)),
                    _ => None,
                };
                if let Some((op, len)) = op {
                    return Some((&body[..i], op, &body[i + len..]));
                }
            }
        }
        i += 1;
    }
    None
}

fn walk<'a>(segments: &[Segment], mut current: Vec<&'a Value>) -> Vec<&'a Value> {
    for seg in segments {
        let mut next = Vec::new();
        for v in current {
            apply(seg, v, &mut next);
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }
    current
}

fn apply<'a>(seg: &Segment, v: &'a Value, out: &mut Vec<&'a Value>) {
    match seg {
        Segment::Field(name) => {
            if let Some(x) = v.as_object().and_then(|m| m.get(name)) {
                out.push(x);
            }
        }
        Segment::Wildcard => match v {
            Value::Object(m) => out.extend(m.values()),
            Value::Array(a) => out.extend(a.iter()),
            _ => {}
        },
        Segment::Index(i) => {
            if let Some(a) = v.as_array() {
                if let Some(idx) = resolve_index(*i, a.len()) {
                    out.push(&a[idx]);
                }
            }
        }
        Segment::Slice(start, end) => {
            if let Some(a) = v.as_array() {
                let len = a.len() as i64;
                let clamp = |x: i64| if x < 0 { (len + x).max(0) } else { x.min(len) };
                let s = clamp(start.unwrap_or(0)) as usize;
                let e = clamp(end.unwrap_or(len)) as usize;
                if s < e {
                    out.extend(a[s..e].iter());
                }
            }
        }
        Segment::Recursive(inner) => {
            let mut all = Vec::new();
            descendants(v, &mut all);
            for d in all {
                apply(inner, d, out);
            }
        }
        Segment::Filter(f) => {
            if let Some(a) = v.as_array() {
                out.extend(a.iter().filter(|e| filter_matches(f, e)));
            }
        }
    }
}

fn resolve_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if i < 0 { len + i } else { i };
    (0..len).contains(&idx).then_some(idx as usize)
}

fn descendants<'a>(v: &'a Value, out: &mut Vec<&'a Value>) {
    out.push(v);
    match v {
        Value::Object(m) => m.values().for_each(|c| descendants(c, out)),
        Value::Array(a) => a.iter().for_each(|c| descendants(c, out)),
        _ => {}
    }
}

fn filter_matches(f: &Filter, element: &Value) -> bool {
    let found = walk(&f.path, vec![element]);
    match &f.cmp {
        None => !found.is_empty(),
        Some((op, lit)) => found.iter().any(|v| compare(v, *op, lit)),
    }
}

fn compare(v: &Value, op: CmpOp, lit: &Literal) -> bool {
    use std::cmp::Ordering;
    let ord: Option<Ordering> = match (v, lit) {
        (Value::String(s), Literal::Str(l)) => Some(s.as_str().cmp(l.as_str())),
        (Value::Number(n), Literal::Num(l)) => n.as_f64().and_then(|x| x.partial_cmp(l)),
        (Value::Bool(b), Literal::Bool(l)) => Some(b.cmp(l)),
        (Value::Null, Literal::Null) => Some(Ordering::Equal),
        _ => None,
    };
    match (op, ord) {
        (CmpOp::Ne, None) => true,
        (_, None) => false,
        (CmpOp::Eq, Some(o)) => o == Ordering::Equal,
        (CmpOp::Ne, Some(o)) => o != Ordering::Equal,
        (CmpOp::Lt, Some(o)) => o == Ordering::Less,
        (CmpOp::Le, Some(o)) => o != Ordering::Greater,
        (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
        (CmpOp::Ge, Some(o)) => o != Ordering::Less,
    }
}
