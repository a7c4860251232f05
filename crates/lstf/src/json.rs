//! JSON value model with structural-pattern matching and cycle-safe sharing.
//!
//! This is C1's JSON half. A [`Json`] node is a reference-counted handle
//! (`Rc<RefCell<..>>`) rather than the floating-reference idiom the original
//! C implementation uses for this — Rust's ownership system already gives us
//! exactly the thing the C `floating` bit was emulating (see `DESIGN.md`),
//! so container insertion just moves/clones a `Json` handle instead of
//! converting a "floating" refcount.
//!
//! Cyclic object graphs (an object member pointing back to an ancestor) are
//! supported: each node carries a `visiting` flag used by both equality and
//! serialization to avoid unbounded recursion.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use crate::status::JsonError;

/// A member of a JSON object pattern: a value plus whether it may be absent
/// when matching (meaningless outside of a pattern).
#[derive(Debug, Clone)]
pub struct JsonMember {
    pub value: Json,
    pub optional: bool,
}

/// The tagged variant carried by a [`Json`] node.
#[derive(Debug, Clone)]
pub enum JsonValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Json>),
    /// Insertion-ordered; keys are canonicalized to camelCase on insertion.
    Object(Vec<(String, JsonMember)>),
    /// Pattern-only: matches (and is matched by) any run of array elements.
    Ellipsis,
}

#[derive(Debug)]
struct JsonData {
    value: JsonValue,
    is_pattern: bool,
    /// Object patterns only: extra members on the other side are tolerated.
    partial_match: bool,
    visiting: bool,
}

/// A reference-counted JSON node.
#[derive(Debug, Clone)]
pub struct Json(Rc<RefCell<JsonData>>);

impl Json {
    fn new(value: JsonValue, is_pattern: bool) -> Self {
        let json = Json(Rc::new(RefCell::new(JsonData {
            value,
            is_pattern,
            partial_match: false,
            visiting: false,
        })));
        json.promote_descendants_if_pattern();
        json
    }

    pub fn null() -> Self {
        Json::new(JsonValue::Null, false)
    }

    pub fn bool(b: bool) -> Self {
        Json::new(JsonValue::Bool(b), false)
    }

    pub fn int(i: i64) -> Self {
        Json::new(JsonValue::Int(i), false)
    }

    pub fn double(d: f64) -> Self {
        Json::new(JsonValue::Double(d), false)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Json::new(JsonValue::String(s.into()), false)
    }

    pub fn array(items: Vec<Json>) -> Self {
        Json::new(JsonValue::Array(items), false)
    }

    /// Build an object node, canonicalizing every key to camelCase so that
    /// `text-document` and `text_document` and `textDocument` all collide.
    pub fn object(members: Vec<(String, Json)>) -> Self {
        let members = members
            .into_iter()
            .map(|(k, v)| (canonicalize_key(&k), JsonMember { value: v, optional: false }))
            .collect();
        Json::new(JsonValue::Object(members), false)
    }

    pub fn ellipsis() -> Self {
        Json::new(JsonValue::Ellipsis, true)
    }

    /// Build a pattern node from a value, the whole graph promoted to
    /// pattern-ness (§3.1 invariant: a pattern container's descendants are
    /// implicitly patterns too).
    pub fn pattern_array(items: Vec<Json>) -> Self {
        Json::new(JsonValue::Array(items), true)
    }

    /// Build an object pattern. `partial_match` allows extra members on the
    /// value side; each member's `optional` flag allows it to be absent.
    pub fn pattern_object(members: Vec<(String, Json, bool)>, partial_match: bool) -> Self {
        let members = members
            .into_iter()
            .map(|(k, v, optional)| (canonicalize_key(&k), JsonMember { value: v, optional }))
            .collect();
        let json = Json(Rc::new(RefCell::new(JsonData {
            value: JsonValue::Object(members),
            is_pattern: true,
            partial_match,
            visiting: false,
        })));
        json.promote_descendants_if_pattern();
        json
    }

    pub fn is_pattern(&self) -> bool {
        self.0.borrow().is_pattern
    }

    pub fn partial_match(&self) -> bool {
        self.0.borrow().partial_match
    }

    pub fn ptr_eq(a: &Json, b: &Json) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// Run `f` with a borrow of the underlying value.
    pub fn with_value<R>(&self, f: impl FnOnce(&JsonValue) -> R) -> R {
        f(&self.0.borrow().value)
    }

    pub fn as_str(&self) -> Option<String> {
        match &self.0.borrow().value {
            JsonValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.0.borrow().value {
            JsonValue::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<Vec<Json>> {
        match &self.0.borrow().value {
            JsonValue::Array(items) => Some(items.clone()),
            _ => None,
        }
    }

    /// Object member lookup (post-canonicalization key).
    pub fn get_member(&self, key: &str) -> Option<Json> {
        let key = canonicalize_key(key);
        match &self.0.borrow().value {
            JsonValue::Object(members) => members.iter().find(|(k, _)| *k == key).map(|(_, m)| m.value.clone()),
            _ => None,
        }
    }

    /// Array element append, mutating this node in place (arrays are
    /// reference types in LSTF: `append` never needs to push a new value
    /// back onto the VM stack).
    pub fn array_push(&self, value: Json) -> Result<(), JsonError> {
        match &mut self.0.borrow_mut().value {
            JsonValue::Array(items) => {
                items.push(value);
                Ok(())
            }
            _ => Err(JsonError::UnexpectedChar('?', 0)),
        }
    }

    /// Element at `index`, for the `get` opcode.
    pub fn array_get(&self, index: usize) -> Option<Json> {
        match &self.0.borrow().value {
            JsonValue::Array(items) => items.get(index).cloned(),
            _ => None,
        }
    }

    /// Array element count, for the `set` opcode's bounds check.
    pub fn array_len(&self) -> Option<usize> {
        match &self.0.borrow().value {
            JsonValue::Array(items) => Some(items.len()),
            _ => None,
        }
    }

    /// Overwrite the element at `index` in place. `None` if out of bounds or
    /// this node isn't an array.
    pub fn array_set(&self, index: usize, value: Json) -> Option<()> {
        match &mut self.0.borrow_mut().value {
            JsonValue::Array(items) => {
                let slot = items.get_mut(index)?;
                *slot = value;
                Some(())
            }
            _ => None,
        }
    }

    /// Insert or overwrite a member in place, canonicalizing the key.
    pub fn object_set_member(&self, key: &str, value: Json) -> Option<()> {
        let key = canonicalize_key(key);
        match &mut self.0.borrow_mut().value {
            JsonValue::Object(members) => {
                if let Some((_, m)) = members.iter_mut().find(|(k, _)| *k == key) {
                    m.value = value;
                } else {
                    members.push((key, JsonMember { value, optional: false }));
                }
                Some(())
            }
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.0.borrow().value, JsonValue::Array(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self.0.borrow().value, JsonValue::Object(_))
    }

    fn promote_descendants_if_pattern(&self) {
        if !self.is_pattern() {
            return;
        }
        let children: Vec<Json> = match &self.0.borrow().value {
            JsonValue::Array(items) => items.clone(),
            JsonValue::Object(members) => members.iter().map(|(_, m)| m.value.clone()).collect(),
            _ => Vec::new(),
        };
        for child in children {
            if !child.is_pattern() {
                child.0.borrow_mut().is_pattern = true;
                child.promote_descendants_if_pattern();
            }
        }
    }

    /// Structural/pattern equality (§3.1). Commutative: `a == b` iff `b == a`,
    /// even when only one side is a pattern.
    pub fn json_eq(a: &Json, b: &Json) -> bool {
        json_eq_inner(a, b)
    }

    /// Canonical JSON text. `pretty` controls two-space indentation.
    pub fn to_json_string(&self, pretty: bool) -> String {
        let mut out = String::new();
        serialize_node(self, &mut out, pretty, 0, self);
        out
    }

    /// Parse a single JSON value from `src`, rejecting trailing characters.
    pub fn parse(src: &str) -> Result<Json, JsonError> {
        let mut p = Parser { bytes: src.as_bytes(), pos: 0 };
        p.skip_ws();
        let value = p.parse_value()?;
        p.skip_ws();
        if p.pos != p.bytes.len() {
            return Err(JsonError::TrailingCharacters);
        }
        Ok(value)
    }
}

/// Converts `kebab-case` or `snake_case` to `camelCase`.
fn canonicalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upcase_next = false;
    for ch in key.chars() {
        if ch == '-' || ch == '_' {
            upcase_next = true;
            continue;
        }
        if upcase_next {
            out.extend(ch.to_uppercase());
            upcase_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn json_eq_inner(a: &Json, b: &Json) -> bool {
    // Tolerate cycles: if we're already comparing this exact pair somewhere
    // up the call stack, treat it as equal rather than recursing forever.
    if a.0.borrow().visiting && b.0.borrow().visiting {
        return true;
    }

    let a_is_ellipsis = matches!(a.0.borrow().value, JsonValue::Ellipsis);
    let b_is_ellipsis = matches!(b.0.borrow().value, JsonValue::Ellipsis);
    if a_is_ellipsis || b_is_ellipsis {
        return true;
    }

    a.0.borrow_mut().visiting = true;
    b.0.borrow_mut().visiting = true;
    let result = json_eq_values(a, b);
    a.0.borrow_mut().visiting = false;
    b.0.borrow_mut().visiting = false;
    result
}

fn json_eq_values(a: &Json, b: &Json) -> bool {
    let a_ref = a.0.borrow();
    let b_ref = b.0.borrow();
    match (&a_ref.value, &b_ref.value) {
        (JsonValue::Null, JsonValue::Null) => true,
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x == y,
        (JsonValue::Int(x), JsonValue::Int(y)) => x == y,
        (JsonValue::Double(x), JsonValue::Double(y)) => x == y,
        (JsonValue::Int(x), JsonValue::Double(y)) | (JsonValue::Double(y), JsonValue::Int(x)) => *x as f64 == *y,
        (JsonValue::String(x), JsonValue::String(y)) => x == y,
        (JsonValue::Array(xs), JsonValue::Array(ys)) => {
            let xs = xs.clone();
            let ys = ys.clone();
            let pattern = a_ref.is_pattern || b_ref.is_pattern;
            drop(a_ref);
            drop(b_ref);
            if pattern {
                array_pattern_eq(&xs, &ys)
            } else {
                xs.len() == ys.len() && xs.iter().zip(&ys).all(|(x, y)| json_eq_inner(x, y))
            }
        }
        (JsonValue::Object(xs), JsonValue::Object(ys)) => {
            let xs = xs.clone();
            let ys = ys.clone();
            let a_is_pattern = a_ref.is_pattern;
            let a_partial = a_ref.partial_match;
            let b_is_pattern = b_ref.is_pattern;
            let b_partial = b_ref.partial_match;
            drop(a_ref);
            drop(b_ref);
            object_pattern_eq(&xs, a_is_pattern, a_partial, &ys, b_is_pattern, b_partial)
        }
        _ => false,
    }
}

/// Array pattern equality: `Ellipsis` sentinels absorb any run of elements
/// from the other side.
fn array_pattern_eq(xs: &[Json], ys: &[Json]) -> bool {
    fn has_ellipsis(items: &[Json]) -> Option<usize> {
        items.iter().position(|it| it.with_value(|v| matches!(v, JsonValue::Ellipsis)))
    }

    match (has_ellipsis(xs), has_ellipsis(ys)) {
        (None, None) => xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_eq_inner(x, y)),
        (Some(i), None) => match_with_ellipsis(xs, i, ys),
        (None, Some(j)) => match_with_ellipsis(ys, j, xs),
        (Some(i), Some(j)) => {
            // Both sides are patterns with an ellipsis: require identical
            // prefix/suffix around it.
            xs[..i].iter().zip(&ys[..j]).all(|(x, y)| json_eq_inner(x, y))
                && xs[i..].len() == ys[j..].len()
                && xs.len() - i == ys.len() - j
        }
    }
}

fn match_with_ellipsis(pattern: &[Json], ellipsis_pos: usize, value: &[Json]) -> bool {
    let prefix = &pattern[..ellipsis_pos];
    let suffix = &pattern[ellipsis_pos + 1..];
    if value.len() < prefix.len() + suffix.len() {
        return false;
    }
    let (v_prefix, rest) = value.split_at(prefix.len());
    let v_suffix = &rest[rest.len() - suffix.len()..];
    prefix.iter().zip(v_prefix).all(|(p, v)| json_eq_inner(p, v))
        && suffix.iter().zip(v_suffix).all(|(p, v)| json_eq_inner(p, v))
}

/// Object pattern equality, kept symmetric in `xs`/`ys`: either, both, or
/// neither side may be the pattern (the non-pattern side is an ordinary
/// `Json::object`, whose members are never `optional` and whose container
/// is never `partial_match`). A member declared only on a pattern side
/// excuses its own absence from the other side iff it is `optional`; a
/// member present only on the non-declaring side is excused only by the
/// declaring side's own `partial_match`. Neither flag on one side reaches
/// over to excuse the other side's members — that would let `partial` on
/// a value-shaped comparand silently swallow a genuinely missing required
/// pattern member.
fn object_pattern_eq(
    xs: &[(String, JsonMember)],
    xs_is_pattern: bool,
    xs_partial: bool,
    ys: &[(String, JsonMember)],
    ys_is_pattern: bool,
    ys_partial: bool,
) -> bool {
    if !xs_is_pattern && !ys_is_pattern {
        return xs.len() == ys.len()
            && xs.iter().all(|(k, m)| ys.iter().any(|(k2, m2)| k == k2 && json_eq_inner(&m.value, &m2.value)));
    }

    for (k, mx) in xs {
        match ys.iter().find(|(k2, _)| k2 == k) {
            Some((_, my)) => {
                if !json_eq_inner(&mx.value, &my.value) {
                    return false;
                }
            }
            None => {
                let excused = (xs_is_pattern && mx.optional) || (ys_is_pattern && ys_partial);
                if !excused {
                    return false;
                }
            }
        }
    }
    for (k, my) in ys {
        if xs.iter().any(|(k2, _)| k2 == k) {
            continue;
        }
        let excused = (ys_is_pattern && my.optional) || (xs_is_pattern && xs_partial);
        if !excused {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

fn serialize_node(node: &Json, out: &mut String, pretty: bool, indent: usize, root: &Json) {
    if node.0.borrow().visiting {
        if Json::ptr_eq(node, root) {
            out.push_str("[Circular *1]");
        } else {
            out.push_str("[Object]");
        }
        return;
    }

    node.0.borrow_mut().visiting = true;
    serialize_value(node, out, pretty, indent, root);
    node.0.borrow_mut().visiting = false;
}

fn serialize_value(node: &Json, out: &mut String, pretty: bool, indent: usize, root: &Json) {
    let value = node.0.borrow().value.clone_shallow();
    match value {
        ShallowValue::Null => out.push_str("null"),
        ShallowValue::Bool(b) => out.push_str(if b { "true" } else { "false" }),
        ShallowValue::Int(i) => {
            let _ = write!(out, "{i}");
        }
        ShallowValue::Double(d) => {
            let _ = write!(out, "{d}");
        }
        ShallowValue::String(s) => serialize_string(&s, out),
        ShallowValue::Ellipsis => out.push_str("\"...\""),
        ShallowValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                if pretty {
                    out.push('\n');
                    out.push_str(&"  ".repeat(indent + 1));
                }
                serialize_node(item, out, pretty, indent + 1, root);
            }
            if pretty && !items.is_empty() {
                out.push('\n');
                out.push_str(&"  ".repeat(indent));
            }
            out.push(']');
        }
        ShallowValue::Object(members) => {
            out.push('{');
            for (i, (key, member)) in members.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                if pretty {
                    out.push('\n');
                    out.push_str(&"  ".repeat(indent + 1));
                }
                serialize_string(key, out);
                out.push(':');
                if pretty {
                    out.push(' ');
                }
                serialize_node(&member.value, out, pretty, indent + 1, root);
            }
            if pretty && !members.is_empty() {
                out.push('\n');
                out.push_str(&"  ".repeat(indent));
            }
            out.push('}');
        }
    }
}

/// A one-level-deep clone of [`JsonValue`] (children stay shared `Json`
/// handles); used so `serialize_value` doesn't hold a `Ref` across its own
/// recursive calls (which would panic on a self-referential object).
enum ShallowValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Json>),
    Object(Vec<(String, JsonMember)>),
    Ellipsis,
}

impl JsonValue {
    fn clone_shallow(&self) -> ShallowValue {
        match self {
            JsonValue::Null => ShallowValue::Null,
            JsonValue::Bool(b) => ShallowValue::Bool(*b),
            JsonValue::Int(i) => ShallowValue::Int(*i),
            JsonValue::Double(d) => ShallowValue::Double(*d),
            JsonValue::String(s) => ShallowValue::String(s.clone()),
            JsonValue::Array(items) => ShallowValue::Array(items.clone()),
            JsonValue::Object(members) => ShallowValue::Object(members.clone()),
            JsonValue::Ellipsis => ShallowValue::Ellipsis,
        }
    }
}

fn serialize_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: u8) -> Result<(), JsonError> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(JsonError::UnexpectedChar(self.peek().unwrap_or(0) as char, self.pos))
        }
    }

    fn parse_value(&mut self) -> Result<Json, JsonError> {
        self.skip_ws();
        match self.peek().ok_or(JsonError::UnexpectedEof)? {
            b'n' => self.parse_literal("null", Json::null()),
            b't' => self.parse_literal("true", Json::bool(true)),
            b'f' => self.parse_literal("false", Json::bool(false)),
            b'"' => self.parse_string().map(|s| if s == "..." { Json::ellipsis() } else { Json::string(s) }),
            b'[' => self.parse_array(),
            b'{' => self.parse_object(),
            b'-' | b'0'..=b'9' => self.parse_number(),
            c => Err(JsonError::UnexpectedChar(c as char, self.pos)),
        }
    }

    fn parse_literal(&mut self, lit: &str, value: Json) -> Result<Json, JsonError> {
        if self.bytes[self.pos..].starts_with(lit.as_bytes()) {
            self.pos += lit.len();
            Ok(value)
        } else {
            Err(JsonError::UnexpectedChar(self.peek().unwrap_or(0) as char, self.pos))
        }
    }

    fn parse_number(&mut self) -> Result<Json, JsonError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let mut is_double = false;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') {
            is_double = true;
            self.pos += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            is_double = true;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).map_err(|_| JsonError::InvalidNumber)?;
        if is_double {
            text.parse::<f64>().map(Json::double).map_err(|_| JsonError::InvalidNumber)
        } else {
            text.parse::<i64>().map(Json::int).map_err(|_| JsonError::InvalidNumber)
        }
    }

    fn parse_string(&mut self) -> Result<String, JsonError> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            match self.peek().ok_or(JsonError::UnterminatedString)? {
                b'"' => {
                    self.pos += 1;
                    return Ok(out);
                }
                b'\\' => {
                    self.pos += 1;
                    let esc = self.peek().ok_or(JsonError::UnterminatedString)?;
                    self.pos += 1;
                    match esc {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'/' => out.push('/'),
                        b'n' => out.push('\n'),
                        b't' => out.push('\t'),
                        b'r' => out.push('\r'),
                        b'b' => out.push('\u{8}'),
                        b'f' => out.push('\u{c}'),
                        b'u' => {
                            if self.pos + 4 > self.bytes.len() {
                                return Err(JsonError::InvalidEscape);
                            }
                            let hex = std::str::from_utf8(&self.bytes[self.pos..self.pos + 4])
                                .map_err(|_| JsonError::InvalidEscape)?;
                            let code = u32::from_str_radix(hex, 16).map_err(|_| JsonError::InvalidEscape)?;
                            out.push(char::from_u32(code).ok_or(JsonError::InvalidEscape)?);
                            self.pos += 4;
                        }
                        _ => return Err(JsonError::InvalidEscape),
                    }
                }
                _ => {
                    let ch_start = self.pos;
                    let rest = std::str::from_utf8(&self.bytes[ch_start..]).map_err(|_| JsonError::InvalidEscape)?;
                    let ch = rest.chars().next().ok_or(JsonError::UnterminatedString)?;
                    out.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
    }

    fn parse_array(&mut self) -> Result<Json, JsonError> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Json::array(items));
        }
        loop {
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(JsonError::UnexpectedChar(self.peek().unwrap_or(0) as char, self.pos)),
            }
        }
        // An `Ellipsis` element only ever occurs inside a pattern (plain JSON
        // has no use for it), so its presence is what lets a pattern array
        // survive the text round trip: promote the container the same way
        // `pattern_array` does instead of requiring a syntax this grammar
        // doesn't have for "this array is a pattern".
        if items.iter().any(|item| item.is_pattern()) {
            return Ok(Json::pattern_array(items));
        }
        Ok(Json::array(items))
    }

    fn parse_object(&mut self) -> Result<Json, JsonError> {
        self.expect(b'{')?;
        let mut members = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Json::object(members));
        }
        loop {
            self.skip_ws();
            let key = self.parse_string()?;
            self.skip_ws();
            self.expect(b':')?;
            let value = self.parse_value()?;
            members.push((key, value));
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(JsonError::UnexpectedChar(self.peek().unwrap_or(0) as char, self.pos)),
            }
        }
        // Mirrors `parse_array`: a member value that is itself a pattern is
        // the only signal plain JSON grammar gives that this object is a
        // pattern too, since there's no syntax here for marking it directly.
        if members.iter().any(|(_, v)| v.is_pattern()) {
            return Ok(Json::pattern_object(members.into_iter().map(|(k, v)| (k, v, false)).collect(), false));
        }
        Ok(Json::object(members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_compact() {
        let parsed = Json::parse(r#"{"a":1,"b":[true,null,"x"]}"#).unwrap();
        assert_eq!(parsed.to_json_string(false), r#"{"a":1,"b":[true,null,"x"]}"#);
    }

    #[test]
    fn keys_canonicalize_to_camel_case() {
        let a = Json::object(vec![("text-document".into(), Json::int(1))]);
        let b = Json::object(vec![("textDocument".into(), Json::int(1))]);
        assert!(Json::json_eq(&a, &b));
        assert_eq!(a.to_json_string(false), r#"{"textDocument":1}"#);
    }

    #[test]
    fn pattern_array_with_ellipsis_matches_both_ways() {
        let ten: Vec<Json> = (1..=10).map(Json::int).collect();
        let pattern = Json::pattern_array(vec![Json::int(1), Json::int(2), Json::ellipsis()]);
        let value = Json::array(ten);
        assert!(Json::json_eq(&pattern, &value));
        assert!(Json::json_eq(&value, &pattern));
    }

    #[test]
    fn pattern_object_optional_and_partial() {
        let pattern = Json::pattern_object(
            vec![("id".into(), Json::int(1), false), ("name".into(), Json::string("x"), true)],
            true,
        );
        let value = Json::object(vec![("id".into(), Json::int(1)), ("extra".into(), Json::bool(true))]);
        assert!(Json::json_eq(&pattern, &value));
        assert!(Json::json_eq(&value, &pattern));
    }

    #[test]
    fn parsed_object_literal_with_ellipsis_member_is_promoted_to_a_pattern() {
        let pattern = Json::parse(r#"{"kind":"foo","params":"..."}"#).unwrap();
        let value = Json::object(vec![("kind".into(), Json::string("foo")), ("params".into(), Json::array(vec![Json::int(1), Json::int(2)]))]);
        assert!(Json::json_eq(&pattern, &value));
        assert!(Json::json_eq(&value, &pattern));
    }

    #[test]
    fn cyclic_graph_serializes_without_overflow() {
        let obj = Json::object(vec![("self".into(), Json::null())]);
        // Tie a cycle: obj.self -> obj.
        if let JsonValue::Object(members) = &mut obj.0.borrow_mut().value {
            members[0].1.value = obj.clone();
        }
        let text = obj.to_json_string(false);
        assert_eq!(text, r#"{"self":[Circular *1]}"#);
    }
}
