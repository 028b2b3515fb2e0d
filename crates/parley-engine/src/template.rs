//! Template resolver: variable interpolation, filters and conditionals over a
//! read-only data scope.
//!
//! Grammar:
//! ```text
//! Template  ::= ( Text | Output | IfBlock )*
//! Output    ::= '{{' Expr '}}'
//! Expr      ::= Operand ( '|' Filter )*
//! Operand   ::= Path | QuotedString
//! Filter    ::= name ( ':' Arg )*
//! IfBlock   ::= '{%' 'if' Test '%}' Template
//!               ( '{%' 'else' '%}' Template )? '{%' 'endif' '%}'
//! Test      ::= Path ( ( '==' | '!=' ) Literal )?
//! ```
//!
//! Paths only traverse maps and lists. There is nothing callable in scope.

use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use parley_types::{lookup_path, value_to_string, Contact, Context, ParleyError, Result};
use serde_json::{json, Value};
use winnow::ascii::{multispace0, multispace1};
use winnow::combinator::{alt, cut_err, delimited, not, opt, preceded, repeat, terminated};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{one_of, take_till, take_while};
use winnow::{ModalResult, Parser};

const DEFAULT_TRUNCATE: usize = 50;
const DEFAULT_DATE_FORMAT: &str = "%d/%m/%Y";
const ROW_TITLE_LIMIT: usize = 24;
const ROW_DESCRIPTION_LIMIT: usize = 72;

// --- Scope ---

/// Data visible to templates: the conversation context plus, optionally, the
/// contact (`contact.*`) and its profile (`profile.*`).
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    context: &'a Context,
    contact: Option<&'a Contact>,
}

impl<'a> Scope<'a> {
    pub fn new(context: &'a Context) -> Self {
        Self {
            context,
            contact: None,
        }
    }

    pub fn with_contact(mut self, contact: &'a Contact) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn context(&self) -> &Context {
        self.context
    }

    /// Resolve a dotted path. The first segment selects the root.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let path = path.trim();
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        let root = match (head, self.contact) {
            ("contact", Some(contact)) => contact.scope_value(),
            ("profile", Some(contact)) => Value::Object(contact.profile.clone()),
            ("context", _) => self.context.to_value(),
            _ => return self.context.get_path(path).cloned(),
        };

        match rest {
            None => Some(root),
            Some(rest) => lookup_path(&root, rest).cloned(),
        }
    }
}

// --- AST ---

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Output(Expr),
    If {
        test: Test,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Expr {
    operand: Operand,
    filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Path(String),
    Literal(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Filter {
    name: String,
    args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct Test {
    path: String,
    comparison: Option<(Comparison, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    NotEq,
}

// --- Parsing ---

fn template_error(message: impl Into<String>) -> ParleyError {
    ParleyError::Template(message.into())
}

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

fn expected(desc: &'static str) -> StrContext {
    StrContext::Expected(StrContextValue::Description(desc))
}

fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Literal text up to the next `{{` or `{%`. A lone `{` is text.
fn text(input: &mut &str) -> ModalResult<String> {
    let chunks: Vec<&str> = repeat(
        1..,
        alt((
            take_till(1.., '{'),
            terminated("{", not(one_of(['{', '%']))),
        )),
    )
    .parse_next(input)?;
    Ok(chunks.concat())
}

/// Dotted variable path: `order.items.0.sku`.
fn variable_path(input: &mut &str) -> ModalResult<String> {
    take_while(1.., |c: char| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .map(|s: &str| s.to_string())
        .parse_next(input)
}

/// Single- or double-quoted string. No escapes.
fn quoted(input: &mut &str) -> ModalResult<String> {
    alt((
        delimited('"', take_till(0.., '"'), '"'),
        delimited('\'', take_till(0.., '\''), '\''),
    ))
    .map(|s: &str| s.to_string())
    .parse_next(input)
}

fn filter_arg(input: &mut &str) -> ModalResult<String> {
    alt((
        quoted,
        take_while(1.., |c: char| {
            !c.is_whitespace() && !matches!(c, '|' | ':' | '}' | '"' | '\'')
        })
        .map(|s: &str| s.to_string()),
    ))
    .parse_next(input)
}

/// Filter ::= name ( ':' Arg )*
fn filter(input: &mut &str) -> ModalResult<Filter> {
    let name = take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_')
        .context(expected("filter name"))
        .parse_next(input)?;
    let args: Vec<String> = repeat(
        0..,
        preceded(
            (ws, ':', ws),
            cut_err(filter_arg).context(expected("filter argument")),
        ),
    )
    .parse_next(input)?;
    Ok(Filter {
        name: name.to_string(),
        args,
    })
}

/// Expr ::= Operand ( '|' Filter )*
fn expr(input: &mut &str) -> ModalResult<Expr> {
    let operand = alt((
        quoted.map(Operand::Literal),
        variable_path.map(Operand::Path),
    ))
    .context(expected("variable path or quoted string"))
    .parse_next(input)?;
    let filters: Vec<Filter> = repeat(0.., preceded((ws, '|', ws), cut_err(filter))).parse_next(input)?;
    Ok(Expr { operand, filters })
}

/// Output ::= '{{' Expr '}}'
fn output(input: &mut &str) -> ModalResult<Expr> {
    let _ = "{{".parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let expr = cut_err(expr).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = cut_err("}}").context(expected("'}}'")).parse_next(input)?;
    Ok(expr)
}

fn comparison_value(input: &mut &str) -> ModalResult<String> {
    alt((
        quoted,
        take_while(1.., |c: char| !c.is_whitespace() && c != '%').map(|s: &str| s.to_string()),
    ))
    .parse_next(input)
}

/// Test ::= Path ( ( '==' | '!=' ) Literal )?
fn if_test(input: &mut &str) -> ModalResult<Test> {
    let path = variable_path.parse_next(input)?;
    let comparison = opt(preceded(
        ws,
        (
            alt(("==".value(Comparison::Eq), "!=".value(Comparison::NotEq))),
            ws,
            cut_err(comparison_value).context(expected("comparison value")),
        ),
    ))
    .parse_next(input)?
    .map(|(op, _, value)| (op, value));
    Ok(Test { path, comparison })
}

fn else_tag(input: &mut &str) -> ModalResult<()> {
    ("{%", ws, "else", ws, "%}").void().parse_next(input)
}

fn endif_tag(input: &mut &str) -> ModalResult<()> {
    ("{%", ws, "endif", ws, "%}").void().parse_next(input)
}

fn if_block(input: &mut &str) -> ModalResult<Node> {
    let _ = ("{%", ws, "if", multispace1).parse_next(input)?;
    let test = cut_err(if_test).context(expected("condition")).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = cut_err("%}").context(expected("'%}'")).parse_next(input)?;
    let then = nodes.parse_next(input)?;
    let otherwise = opt(preceded(else_tag, nodes))
        .parse_next(input)?
        .unwrap_or_default();
    let _ = cut_err(endif_tag)
        .context(expected("'{% endif %}'"))
        .parse_next(input)?;
    Ok(Node::If {
        test,
        then,
        otherwise,
    })
}

fn node(input: &mut &str) -> ModalResult<Node> {
    alt((text.map(Node::Text), output.map(Node::Output), if_block)).parse_next(input)
}

/// Nodes up to the first tag that is not an `if` (`else`, `endif`, or
/// something unknown), or end of input.
fn nodes(input: &mut &str) -> ModalResult<Vec<Node>> {
    repeat(0.., node).parse_next(input)
}

fn template(input: &mut &str) -> ModalResult<Vec<Node>> {
    let nodes = nodes.parse_next(input)?;
    if !input.is_empty() {
        return Err(make_cut_error("text, '{{ … }}' or '{% if … %}'"));
    }
    Ok(nodes)
}

// --- Evaluation ---

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(m)) => !m.is_empty(),
        Some(Value::Bool(true)) => true,
    }
}

/// Keep the first `n` characters, appending `…` when something was cut.
fn truncate_chars(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        return s.to_string();
    }
    let mut out: String = s.chars().take(n).collect();
    out.push('…');
    out
}

/// Like [`truncate_chars`] but the result, ellipsis included, fits in `limit`.
fn fit(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        truncate_chars(s, limit.saturating_sub(1))
    }
}

fn format_date(value: Value, format: &str) -> Value {
    let Value::String(raw) = &value else {
        return value;
    };
    let mut out = String::new();
    let written = if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        write!(out, "{}", dt.format(format))
    } else if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        write!(out, "{}", dt.format(format))
    } else if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        write!(out, "{}", date.format(format))
    } else {
        return value;
    };
    match written {
        Ok(()) => Value::String(out),
        Err(_) => {
            tracing::warn!(format = %format, "Invalid date format in template");
            value
        }
    }
}

fn to_rows(items: &[Value], title_field: &str, description_field: Option<&str>) -> Value {
    let rows = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let id = item
                .get("id")
                .map(value_to_string)
                .unwrap_or_else(|| (i + 1).to_string());
            let title = match item {
                Value::Object(_) => item.get(title_field).map(value_to_string).unwrap_or_default(),
                other => value_to_string(other),
            };
            let mut row = json!({"id": id, "title": fit(&title, ROW_TITLE_LIMIT)});
            if let Some(description) = description_field
                .and_then(|f| item.get(f))
                .map(value_to_string)
                .filter(|d| !d.is_empty())
            {
                row["description"] = Value::String(fit(&description, ROW_DESCRIPTION_LIMIT));
            }
            row
        })
        .collect();
    Value::Array(rows)
}

fn map_string(value: Option<Value>, f: impl Fn(&str) -> String) -> Option<Value> {
    value.map(|v| match v {
        Value::Null => Value::Null,
        other => Value::String(f(&value_to_string(&other))),
    })
}

fn apply_filter(filter: &Filter, value: Option<Value>) -> Option<Value> {
    let arg = |i: usize| filter.args.get(i).map(String::as_str);
    match filter.name.as_str() {
        "default" => {
            if is_blank(value.as_ref()) {
                Some(Value::String(arg(0).unwrap_or_default().to_string()))
            } else {
                value
            }
        }
        "upper" => map_string(value, str::to_uppercase),
        "lower" => map_string(value, str::to_lowercase),
        "trim" => map_string(value, |s| s.trim().to_string()),
        "truncate" => {
            let n = arg(0)
                .and_then(|a| a.parse::<usize>().ok())
                .unwrap_or(DEFAULT_TRUNCATE);
            map_string(value, |s| truncate_chars(s, n))
        }
        "date" => value.map(|v| format_date(v, arg(0).unwrap_or(DEFAULT_DATE_FORMAT))),
        "length" => {
            let len = match &value {
                None | Some(Value::Null) => 0,
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(m)) => m.len(),
                Some(other) => value_to_string(other).chars().count(),
            };
            Some(Value::from(len))
        }
        "join" => match value {
            Some(Value::Array(items)) => {
                let parts: Vec<String> = items.iter().map(value_to_string).collect();
                Some(Value::String(parts.join(arg(0).unwrap_or(", "))))
            }
            other => other,
        },
        "json" => Some(Value::String(value.unwrap_or(Value::Null).to_string())),
        "rows" => match value {
            Some(Value::Array(items)) => Some(to_rows(&items, arg(0).unwrap_or("title"), arg(1))),
            other => other,
        },
        unknown => {
            tracing::warn!(filter = %unknown, "Unknown template filter ignored");
            value
        }
    }
}

fn eval_expr(expr: &Expr, scope: &Scope<'_>) -> Option<Value> {
    let mut value = match &expr.operand {
        Operand::Path(path) => scope.lookup(path),
        Operand::Literal(s) => Some(Value::String(s.clone())),
    };
    for filter in &expr.filters {
        value = apply_filter(filter, value);
    }
    value
}

fn eval_test(test: &Test, scope: &Scope<'_>) -> bool {
    let value = scope.lookup(&test.path);
    match &test.comparison {
        None => is_truthy(value.as_ref()),
        Some((op, literal)) => {
            let actual = value.as_ref().map(value_to_string).unwrap_or_default();
            match op {
                Comparison::Eq => actual == *literal,
                Comparison::NotEq => actual != *literal,
            }
        }
    }
}

fn render_nodes(nodes: &[Node], scope: &Scope<'_>, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Output(expr) => {
                if let Some(value) = eval_expr(expr, scope) {
                    out.push_str(&value_to_string(&value));
                }
            }
            Node::If {
                test,
                then,
                otherwise,
            } => {
                let branch = if eval_test(test, scope) { then } else { otherwise };
                render_nodes(branch, scope, out);
            }
        }
    }
}

// --- Public API ---

/// A parsed template, reusable across scopes.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(src: &str) -> Result<Self> {
        let mut remaining = src;
        template
            .parse_next(&mut remaining)
            .map(|nodes| Self { nodes })
            .map_err(|e| {
                let offset = src.len() - remaining.len();
                template_error(format!("at offset {offset}: {e}"))
            })
    }

    pub fn render(&self, scope: &Scope<'_>) -> String {
        let mut out = String::new();
        render_nodes(&self.nodes, scope, &mut out);
        out
    }
}

fn has_markup(src: &str) -> bool {
    src.contains("{{") || src.contains("{%")
}

/// Render a template string against a scope.
pub fn render(src: &str, scope: &Scope<'_>) -> Result<String> {
    if !has_markup(src) {
        return Ok(src.to_string());
    }
    Ok(Template::parse(src)?.render(scope))
}

/// Render, falling back to the raw string (with a warning) when it does not parse.
pub fn render_lossy(src: &str, scope: &Scope<'_>) -> String {
    render(src, scope).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Template left unrendered");
        src.to_string()
    })
}

/// The expression of a string made of exactly one `{{ … }}` block.
fn single_expression(src: &str) -> Option<Expr> {
    let mut input = src;
    let expr = delimited(ws, output, ws).parse_next(&mut input).ok()?;
    input.is_empty().then_some(expr)
}

/// Resolve every string inside a JSON value. A string holding a single
/// expression yields the raw value, so `"{{ items }}"` stays a list.
pub fn resolve_value(value: &Value, scope: &Scope<'_>) -> Value {
    match value {
        Value::String(s) => {
            match single_expression(s) {
                Some(expr) => eval_expr(&expr, scope).unwrap_or(Value::Null),
                None => Value::String(render_lossy(s, scope)),
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Check that every string inside a JSON value parses as a template.
pub fn check_value(value: &Value) -> Result<()> {
    match value {
        Value::String(s) if has_markup(s) => Template::parse(s).map(|_| ()),
        Value::Array(items) => items.iter().try_for_each(check_value),
        Value::Object(map) => map.values().try_for_each(check_value),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(value: Value) -> Context {
        match value {
            Value::Object(map) => Context::from_map(map),
            _ => panic!("context must be an object"),
        }
    }

    fn render_with(src: &str, context: &Context) -> String {
        render(src, &Scope::new(context)).unwrap()
    }

    #[test]
    fn plain_text_passes_through() {
        let c = Context::new();
        assert_eq!(render_with("no markup here", &c), "no markup here");
    }

    #[test]
    fn variable_inserted_verbatim() {
        let c = ctx(json!({"name": "Ana María"}));
        assert_eq!(render_with("Hello {{ name }}!", &c), "Hello Ana María!");
    }

    #[test]
    fn missing_variable_renders_empty() {
        let c = Context::new();
        assert_eq!(render_with("[{{ nothing.here }}]", &c), "[]");
    }

    #[test]
    fn dotted_paths_and_list_indexes() {
        let c = ctx(json!({"order": {"items": [{"sku": "A1"}, {"sku": "B2"}]}}));
        assert_eq!(render_with("{{ order.items.1.sku }}", &c), "B2");
        assert_eq!(render_with("{{ context.order.items.0.sku }}", &c), "A1");
    }

    #[test]
    fn contact_and_profile_scopes() {
        let c = ctx(json!({"contact": "shadowed"}));
        let contact = Contact::new("c-1")
            .with_attribute("city", json!("Lima"))
            .with_profile("first_name", json!("Rosa"));
        let scope = Scope::new(&c).with_contact(&contact);
        assert_eq!(render("{{ contact.city }}", &scope).unwrap(), "Lima");
        assert_eq!(render("{{ contact.id }}", &scope).unwrap(), "c-1");
        assert_eq!(render("{{ profile.first_name }}", &scope).unwrap(), "Rosa");

        // Without a contact the head segment falls back to the context.
        assert_eq!(render_with("{{ contact }}", &c), "shadowed");
    }

    #[test]
    fn string_filters() {
        let c = ctx(json!({"name": "  Rosa  ", "empty": ""}));
        assert_eq!(render_with("{{ name | trim | upper }}", &c), "ROSA");
        assert_eq!(render_with("{{ name | trim | lower }}", &c), "rosa");
        assert_eq!(render_with("{{ empty | default:\"friend\" }}", &c), "friend");
        assert_eq!(render_with("{{ missing | default:'n/a' }}", &c), "n/a");
        assert_eq!(render_with("{{ name | trim | default:\"x\" }}", &c), "Rosa");
    }

    #[test]
    fn truncate_appends_ellipsis_only_when_cut() {
        let c = ctx(json!({"s": "abcdefgh"}));
        assert_eq!(render_with("{{ s | truncate:3 }}", &c), "abc…");
        assert_eq!(render_with("{{ s | truncate:20 }}", &c), "abcdefgh");
    }

    #[test]
    fn date_filter_formats_known_inputs() {
        let c = ctx(json!({
            "d": "2024-03-09",
            "ts": "2024-03-09T14:30:00Z",
            "junk": "not a date"
        }));
        assert_eq!(render_with("{{ d | date }}", &c), "09/03/2024");
        assert_eq!(render_with("{{ ts | date:\"%H:%M\" }}", &c), "14:30");
        assert_eq!(render_with("{{ junk | date }}", &c), "not a date");
    }

    #[test]
    fn length_join_json() {
        let c = ctx(json!({"tags": ["a", "b", "c"], "word": "héllo"}));
        assert_eq!(render_with("{{ tags | length }}", &c), "3");
        assert_eq!(render_with("{{ word | length }}", &c), "5");
        assert_eq!(render_with("{{ tags | join:\" / \" }}", &c), "a / b / c");
        assert_eq!(render_with("{{ tags | join }}", &c), "a, b, c");
        assert_eq!(render_with("{{ tags | json }}", &c), r#"["a","b","c"]"#);
    }

    #[test]
    fn unknown_filter_is_ignored() {
        let c = ctx(json!({"x": "keep"}));
        assert_eq!(render_with("{{ x | shout }}", &c), "keep");
    }

    #[test]
    fn rows_filter_builds_interactive_rows() {
        let c = ctx(json!({"products": [
            {"id": "p1", "name": "Espresso", "price": "2.50"},
            {"name": "A very long product name that overflows", "price": ""}
        ]}));
        let scope = Scope::new(&c);
        let rows = resolve_value(&json!("{{ products | rows:\"name\":\"price\" }}"), &scope);
        let rows = rows.as_array().unwrap();
        assert_eq!(rows[0], json!({"id": "p1", "title": "Espresso", "description": "2.50"}));
        assert_eq!(rows[1]["id"], "2");
        assert_eq!(rows[1]["title"].as_str().unwrap().chars().count(), ROW_TITLE_LIMIT);
        assert!(rows[1].get("description").is_none());
    }

    #[test]
    fn conditionals_with_else_and_comparison() {
        let c = ctx(json!({"vip": true, "plan": "gold", "zero": 0}));
        assert_eq!(render_with("{% if vip %}VIP{% else %}std{% endif %}", &c), "VIP");
        assert_eq!(render_with("{% if zero %}yes{% else %}no{% endif %}", &c), "no");
        assert_eq!(render_with("{% if missing %}yes{% endif %}", &c), "");
        assert_eq!(render_with("{% if plan == \"gold\" %}G{% endif %}", &c), "G");
        assert_eq!(render_with("{% if plan != 'gold' %}G{% else %}X{% endif %}", &c), "X");
    }

    #[test]
    fn nested_conditionals() {
        let c = ctx(json!({"a": true, "b": false}));
        let src = "{% if a %}A{% if b %}B{% else %}!B{% endif %}{% endif %}";
        assert_eq!(render_with(src, &c), "A!B");
    }

    #[test]
    fn malformed_templates_are_errors() {
        let c = Context::new();
        let scope = Scope::new(&c);
        assert!(render("{{ open", &scope).is_err());
        assert!(render("{% if x %}no end", &scope).is_err());
        assert!(render("{% endif %}", &scope).is_err());
        assert!(render("{% for x in y %}{% endif %}", &scope).is_err());
        assert!(render("{{ a b }}", &scope).is_err());
        assert_eq!(render_lossy("{{ open", &scope), "{{ open");
    }

    #[test]
    fn lone_braces_are_text() {
        let c = ctx(json!({"n": 2}));
        assert_eq!(render_with("set {a, b} = {{ n }}", &c), "set {a, b} = 2");
        assert_eq!(render_with("{{ n }}{", &c), "2{");
    }

    #[test]
    fn parse_errors_carry_offset() {
        let err = Template::parse("Hi {{ name | }}").unwrap_err();
        assert!(matches!(err, ParleyError::Template(_)));
        assert!(err.to_string().contains("offset"), "{err}");
        assert!(Template::parse("{% iffy %}").is_err());
        assert!(Template::parse("{{ 'unterminated }}").is_err());
    }

    #[test]
    fn filter_arguments_tolerate_spacing() {
        let c = ctx(json!({"tags": ["a", "b"]}));
        assert_eq!(render_with("{{tags|join : '+'}}", &c), "a+b");
        assert_eq!(render_with("{{ tags | join: '-' | upper }}", &c), "A-B");
    }

    #[test]
    fn resolve_value_preserves_types() {
        let c = ctx(json!({"count": 7, "items": [1, 2], "name": "Rosa"}));
        let scope = Scope::new(&c);
        let resolved = resolve_value(
            &json!({
                "n": "{{ count }}",
                "list": "{{ items }}",
                "text": "Hi {{ name }}",
                "missing": "{{ nope }}",
                "nested": ["{{ name | upper }}", 3, null]
            }),
            &scope,
        );
        assert_eq!(
            resolved,
            json!({
                "n": 7,
                "list": [1, 2],
                "text": "Hi Rosa",
                "missing": null,
                "nested": ["ROSA", 3, null]
            })
        );
    }

    #[test]
    fn check_value_flags_bad_strings() {
        assert!(check_value(&json!({"a": ["{{ ok }}", "plain"]})).is_ok());
        assert!(check_value(&json!({"a": {"b": "{% if x %}"}})).is_err());
    }

    #[test]
    fn template_reusable_across_scopes() {
        let t = Template::parse("n={{ n }}").unwrap();
        let a = ctx(json!({"n": 1}));
        let b = ctx(json!({"n": 2}));
        assert_eq!(t.render(&Scope::new(&a)), "n=1");
        assert_eq!(t.render(&Scope::new(&b)), "n=2");
    }
}
