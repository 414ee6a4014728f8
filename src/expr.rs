//! Node expressions, constant values, and canonical serialization.
//!
//! Every node in the graph is identified by an expression of the form
//! `head(arg1,...,argn)`, where each argument is either a variable (an
//! unquoted identifier) or a constant (a quoted string or a natural-number
//! literal). The canonical serialization of an expression is the sole
//! identity used for storage keys — see [`render`] and [`canonicalize`].

use crate::error::{DepGraphError, Result};

/// A constant argument value: a UTF-8 string or a non-negative integer.
///
/// Floats, negatives, and leading-zero integers are rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstValue {
    /// A string constant, stored decoded (escapes already resolved).
    Str(String),
    /// A natural-number constant (no leading zeros, no sign).
    Int(u64),
}

impl ConstValue {
    /// Render this constant in canonical form (single-quoted strings, bare digits).
    pub fn render(&self) -> String {
        match self {
            ConstValue::Int(n) => n.to_string(),
            ConstValue::Str(s) => render_string_literal(s),
        }
    }
}

/// A single positional argument in an expression: a variable or a constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arg {
    /// An unquoted identifier, free to be bound by a concrete key.
    Var(String),
    /// A literal value fixed in the pattern.
    Const(ConstValue),
}

impl Arg {
    /// True if this argument carries a variable rather than a constant.
    pub fn is_var(&self) -> bool {
        matches!(self, Arg::Var(_))
    }
}

/// A parsed node expression: `head` plus an ordered argument list.
///
/// An expression with zero args is a *constant head*; otherwise it is a
/// *call*. An expression is *concrete* iff none of its arguments are
/// variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Expression {
    /// The expression's head identifier.
    pub head: String,
    /// Positional arguments, in source order.
    pub args: Vec<Arg>,
}

impl Expression {
    /// True iff every argument is a constant (no free variables).
    pub fn is_concrete(&self) -> bool {
        self.args.iter().all(|a| !a.is_var())
    }

    /// The set of variable names referenced by this expression's arguments, in order of first appearance.
    pub fn variables(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for arg in &self.args {
            if let Arg::Var(name) = arg {
                if seen.insert(name.as_str()) {
                    out.push(name.as_str());
                }
            }
        }
        out
    }
}

/// Parse an expression, failing with [`DepGraphError::InvalidExpression`] on
/// unbalanced parens, an empty argument list, a malformed argument, or
/// trailing garbage.
///
/// Double-quoted string constants are accepted on parse and normalized to
/// single-quoted form on render — canonical storage always uses single
/// quotes (see DESIGN.md).
pub fn parse(input: &str) -> Result<Expression> {
    let trimmed = input.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    let mut pos = 0usize;

    let head = parse_identifier(&chars, &mut pos).ok_or_else(|| invalid(input))?;
    skip_ws(&chars, &mut pos);

    let args = if chars.get(pos) == Some(&'(') {
        pos += 1;
        let args = parse_args(&chars, &mut pos, input)?;
        skip_ws(&chars, &mut pos);
        if chars.get(pos) != Some(&')') {
            return Err(invalid(input));
        }
        pos += 1;
        args
    } else {
        Vec::new()
    };

    skip_ws(&chars, &mut pos);
    if pos != chars.len() {
        return Err(invalid(input));
    }

    Ok(Expression { head, args })
}

/// Render an expression in canonical form: head, `(`, comma-separated args
/// with no surrounding whitespace, `)` — the parens are omitted entirely
/// when arity is 0.
pub fn render(expr: &Expression) -> String {
    if expr.args.is_empty() {
        return expr.head.clone();
    }
    let rendered_args: Vec<String> = expr
        .args
        .iter()
        .map(|a| match a {
            Arg::Var(name) => name.clone(),
            Arg::Const(c) => c.render(),
        })
        .collect();
    format!("{}({})", expr.head, rendered_args.join(","))
}

/// `canonicalize(s) == render(parse(s))`. Idempotent: re-canonicalizing a
/// canonical key returns it unchanged, since `render` always produces
/// whitespace-free, single-quoted output.
pub fn canonicalize(s: &str) -> Result<String> {
    Ok(render(&parse(s)?))
}

fn invalid(expression: &str) -> DepGraphError {
    DepGraphError::InvalidExpression {
        expression: expression.to_string(),
    }
}

fn skip_ws(chars: &[char], pos: &mut usize) {
    while matches!(chars.get(*pos), Some(c) if c.is_whitespace()) {
        *pos += 1;
    }
}

fn parse_identifier(chars: &[char], pos: &mut usize) -> Option<String> {
    let start = *pos;
    match chars.get(*pos) {
        Some(c) if c.is_ascii_alphabetic() || *c == '_' => *pos += 1,
        _ => return None,
    }
    while matches!(chars.get(*pos), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
        *pos += 1;
    }
    Some(chars[start..*pos].iter().collect())
}

fn parse_args(chars: &[char], pos: &mut usize, original: &str) -> Result<Vec<Arg>> {
    skip_ws(chars, pos);
    if chars.get(*pos) == Some(&')') {
        return Err(invalid(original));
    }
    let mut args = Vec::new();
    loop {
        skip_ws(chars, pos);
        args.push(parse_arg(chars, pos, original)?);
        skip_ws(chars, pos);
        match chars.get(*pos) {
            Some(',') => {
                *pos += 1;
            }
            Some(')') => break,
            _ => return Err(invalid(original)),
        }
    }
    Ok(args)
}

fn parse_arg(chars: &[char], pos: &mut usize, original: &str) -> Result<Arg> {
    match chars.get(*pos) {
        Some('\'') => parse_string_literal(chars, pos, original, '\'')
            .map(|s| Arg::Const(ConstValue::Str(s))),
        Some('"') => {
            parse_string_literal(chars, pos, original, '"').map(|s| Arg::Const(ConstValue::Str(s)))
        }
        Some(c) if c.is_ascii_digit() => {
            parse_number_literal(chars, pos, original).map(|n| Arg::Const(ConstValue::Int(n)))
        }
        Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
            parse_identifier(chars, pos).map(Arg::Var).ok_or_else(|| invalid(original))
        }
        _ => Err(invalid(original)),
    }
}

fn parse_string_literal(
    chars: &[char],
    pos: &mut usize,
    original: &str,
    quote: char,
) -> Result<String> {
    debug_assert_eq!(chars[*pos], quote);
    *pos += 1;
    let mut out = String::new();
    loop {
        match chars.get(*pos) {
            None => return Err(invalid(original)),
            Some(c) if *c == quote => {
                *pos += 1;
                return Ok(out);
            }
            Some('\\') => {
                *pos += 1;
                match chars.get(*pos) {
                    Some('\'') => out.push('\''),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    _ => return Err(invalid(original)),
                }
                *pos += 1;
            }
            // Raw control bytes (C0 and DEL/C1) are rejected outright rather
            // than passed through: the only control characters a string
            // constant may ever contain are \n, \r, \t, and only via the
            // escapes above. This keeps every control byte — in particular
            // the revdep separator — out of canonical keys unconditionally,
            // rather than relying on callers never typing one.
            Some(c) if c.is_control() => return Err(invalid(original)),
            Some(c) => {
                out.push(*c);
                *pos += 1;
            }
        }
    }
}

fn render_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

fn parse_number_literal(chars: &[char], pos: &mut usize, original: &str) -> Result<u64> {
    let start = *pos;
    while matches!(chars.get(*pos), Some(c) if c.is_ascii_digit()) {
        *pos += 1;
    }
    let digits = &chars[start..*pos];
    if digits.len() > 1 && digits[0] == '0' {
        return Err(invalid(original));
    }
    // Reject floats and trailing garbage glued onto the number (e.g. "12abc", "1.5").
    if matches!(chars.get(*pos), Some(c) if *c == '.' || c.is_ascii_alphabetic() || *c == '_') {
        return Err(invalid(original));
    }
    let text: String = digits.iter().collect();
    text.parse::<u64>().map_err(|_| invalid(original))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_constant_head() {
        let e = parse("all_events").unwrap();
        assert_eq!(e.head, "all_events");
        assert!(e.args.is_empty());
        assert_eq!(render(&e), "all_events");
    }

    #[test]
    fn parses_call_with_mixed_args() {
        let e = parse("event_context(e, 'id123')").unwrap();
        assert_eq!(e.head, "event_context");
        assert_eq!(e.args, vec![
            Arg::Var("e".to_string()),
            Arg::Const(ConstValue::Str("id123".to_string())),
        ]);
    }

    #[test]
    fn canonical_form_has_no_whitespace() {
        assert_eq!(canonicalize("f( x , 'a' , 10 )").unwrap(), "f(x,'a',10)");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let once = canonicalize("f(x,'a\\'b',10)").unwrap();
        let twice = canonicalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn whitespace_variants_produce_identical_keys() {
        let a = canonicalize("status('e1','active')").unwrap();
        let b = canonicalize("  status ( 'e1' , 'active' )  ").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_unbalanced_parens() {
        assert!(parse("f(x").is_err());
        assert!(parse("f x)").is_err());
    }

    #[test]
    fn rejects_empty_argument_list() {
        assert!(parse("f()").is_err());
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse("f(x) garbage").is_err());
    }

    #[test]
    fn rejects_negative_numbers() {
        assert!(parse("f(-1)").is_err());
    }

    #[test]
    fn rejects_float_literals() {
        assert!(parse("f(1.5)").is_err());
    }

    #[test]
    fn rejects_leading_zeros() {
        assert!(parse("f(007)").is_err());
        assert!(parse("f(0)").is_ok());
    }

    #[test]
    fn accepts_double_quotes_and_canonicalizes_to_single() {
        assert_eq!(canonicalize(r#"f("hi")"#).unwrap(), "f('hi')");
    }

    #[test]
    fn escapes_round_trip() {
        let e = parse(r"f('a\'b\\c\n\r\t')").unwrap();
        let Arg::Const(ConstValue::Str(s)) = &e.args[0] else {
            panic!("expected string constant")
        };
        assert_eq!(s, "a'b\\c\n\r\t");
        assert_eq!(render(&e), r"f('a\'b\\c\n\r\t')");
    }

    #[test]
    fn is_concrete_detects_variables() {
        assert!(parse("f('a',1)").unwrap().is_concrete());
        assert!(!parse("f(x,1)").unwrap().is_concrete());
    }

    #[test]
    fn equal_canonicalizations_imply_equal_expressions() {
        let a = parse("f(x,'a')").unwrap();
        let b = parse(" f ( x , 'a' ) ").unwrap();
        assert_eq!(render(&a), render(&b));
    }

    #[test]
    fn rejects_raw_control_characters_in_string_literal() {
        assert!(parse("f('a\u{1f}b')").is_err());
        assert!(parse("f('a\u{0}b')").is_err());
        // A literal, unescaped newline is rejected too: \n must be spelled
        // with the escape, never typed raw.
        assert!(parse("f('a\nb')").is_err());
    }

    #[test]
    fn no_canonical_key_can_ever_contain_the_revdep_separator() {
        // The revdep composite-key separator is U+001F. Since control
        // characters are rejected unescaped and no escape sequence produces
        // one, no canonicalized string constant can embed it.
        assert!(parse("f('x\u{1f}y')").is_err());
        let escaped_forms_only_produce = ['\'', '\\', '\n', '\r', '\t'];
        assert!(!escaped_forms_only_produce.contains(&'\u{1f}'));
    }
}
