//! Raw (unresolved) parse structures and winnow combinators for the generic
//! text form.
//!
//! This module is the first parser stage: text → `Raw*` structs. Names are
//! kept as borrowed slices; nothing touches an [`IrContext`](crate::IrContext)
//! until the builder in [`super`] resolves them.

use derive_more::{Display, Error};
use winnow::ascii;
use winnow::combinator::{alt, delimited, opt, preceded, separated};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::{any, one_of, take_while};

// ============================================================================
// Error type
// ============================================================================

/// Which parser stage rejected the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ParseErrorKind {
    /// The text does not follow the grammar.
    #[display("syntax")]
    Syntax,
    /// The text is well formed but names something undefined, defines a
    /// name twice, or builds an operation the context refuses.
    #[display("semantic")]
    Semantic,
}

/// Parse error for the IR text format.
#[derive(Clone, Debug, PartialEq, Eq, Display, Error)]
#[display("{kind} error at offset {offset}: {message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Byte offset into the parsed text.
    pub offset: usize,
}

impl ParseError {
    pub(crate) fn syntax(message: impl Into<String>, offset: usize) -> Self {
        Self {
            kind: ParseErrorKind::Syntax,
            message: message.into(),
            offset,
        }
    }

    pub(crate) fn semantic(message: impl Into<String>, offset: usize) -> Self {
        Self {
            kind: ParseErrorKind::Semantic,
            message: message.into(),
            offset,
        }
    }
}

// ============================================================================
// Raw (unresolved) AST structures
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct RawOperation<'a> {
    /// Length of the input that remained when the operation started.
    pub start_tail: usize,
    /// Length of the input that remained after the operation header.
    pub end_tail: usize,
    pub results: Vec<&'a str>,
    pub dialect: &'a str,
    pub op_name: &'a str,
    pub operands: Vec<&'a str>,
    pub successors: Vec<&'a str>,
    pub attributes: Vec<(&'a str, RawAttribute<'a>)>,
    pub result_types: Vec<RawType<'a>>,
    pub regions: Vec<RawRegion<'a>>,
}

#[derive(Debug, Clone)]
pub(crate) struct RawRegion<'a> {
    pub blocks: Vec<RawBlock<'a>>,
}

#[derive(Debug, Clone)]
pub(crate) struct RawBlock<'a> {
    /// `None` for the implicit entry block of an unlabelled region.
    pub label: Option<&'a str>,
    pub args: Vec<(&'a str, RawType<'a>)>,
    pub ops: Vec<RawOperation<'a>>,
}

#[derive(Debug, Clone)]
pub(crate) struct RawType<'a> {
    pub dialect: &'a str,
    pub name: &'a str,
    pub params: Vec<RawType<'a>>,
    pub attrs: Vec<(&'a str, RawAttribute<'a>)>,
}

#[derive(Debug, Clone)]
pub(crate) enum RawAttribute<'a> {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Symbol(String),
    Type(RawType<'a>),
    List(Vec<RawAttribute<'a>>),
    Location(String, usize, usize),
}

// ============================================================================
// Winnow parsers
// ============================================================================

fn backtrack() -> ErrMode<ContextError> {
    ErrMode::Backtrack(ContextError::new())
}

/// Skip whitespace, newlines included.
pub(crate) fn ws(input: &mut &str) -> ModalResult<()> {
    take_while(0.., |c: char| c.is_ascii_whitespace())
        .void()
        .parse_next(input)
}

/// Skip spaces and tabs only. Operation headers never span lines, so this is
/// what separates the pieces of one header.
fn hws(input: &mut &str) -> ModalResult<()> {
    take_while(0.., [' ', '\t']).void().parse_next(input)
}

/// Parse an identifier: [a-zA-Z_][a-zA-Z0-9_]*
pub(crate) fn ident<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    (
        one_of(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

fn name_chars<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_').parse_next(input)
}

/// Parse a value reference: %name or %number
pub(crate) fn value_ref<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    preceded('%', name_chars).parse_next(input)
}

/// Parse a block label: ^bbN or ^name
pub(crate) fn block_label<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    preceded('^', name_chars).parse_next(input)
}

/// Parse a symbol reference: @name or @"quoted name"
pub(crate) fn symbol_ref(input: &mut &str) -> ModalResult<String> {
    '@'.parse_next(input)?;
    if input.starts_with('"') {
        string_lit.parse_next(input)
    } else {
        take_while(1.., |c: char| c.is_alphanumeric() || c == '_')
            .map(|s: &str| s.to_owned())
            .parse_next(input)
    }
}

/// Parse a dialect-qualified name: dialect.name
pub(crate) fn qualified_name<'a>(input: &mut &'a str) -> ModalResult<(&'a str, &'a str)> {
    (ident, '.', ident)
        .map(|(d, _, n)| (d, n))
        .parse_next(input)
}

/// Parse a signed integer literal that fits in `i64`.
pub(crate) fn integer_lit(input: &mut &str) -> ModalResult<i64> {
    let negative = opt('-').parse_next(input)?.is_some();
    let magnitude: u64 = ascii::dec_uint(input)?;
    if negative {
        if magnitude == i64::MIN.unsigned_abs() {
            Ok(i64::MIN)
        } else {
            i64::try_from(magnitude).map(|v| -v).map_err(|_| backtrack())
        }
    } else {
        i64::try_from(magnitude).map_err(|_| backtrack())
    }
}

/// Parse a float literal. It must carry a decimal point or an exponent so
/// that `42` stays an integer: `3.25`, `-1.0e10`, `1e-7`.
pub(crate) fn float_lit(input: &mut &str) -> ModalResult<f64> {
    let (text, (_, _, fraction, exponent)) = (
        opt('-'),
        digits,
        opt(('.', digits)),
        opt((one_of(['e', 'E']), opt(one_of(['+', '-'])), digits)),
    )
        .with_taken()
        .map(|(parts, text)| (text, parts))
        .parse_next(input)?;
    if fraction.is_none() && exponent.is_none() {
        return Err(backtrack());
    }
    text.parse::<f64>().map_err(|_| backtrack())
}

fn digits(input: &mut &str) -> ModalResult<()> {
    take_while(1.., |c: char| c.is_ascii_digit())
        .void()
        .parse_next(input)
}

/// Parse one of the non-finite float keywords.
fn special_float(input: &mut &str) -> ModalResult<f64> {
    alt((
        "-inf".value(f64::NEG_INFINITY),
        "inf".value(f64::INFINITY),
        "nan".value(f64::NAN),
    ))
    .parse_next(input)
}

/// Parse a string literal: "content"
pub(crate) fn string_lit(input: &mut &str) -> ModalResult<String> {
    '"'.parse_next(input)?;
    let mut result = String::new();
    loop {
        let c = any.parse_next(input)?;
        match c {
            '"' => break,
            '\\' => {
                let escaped = any.parse_next(input)?;
                match escaped {
                    '"' => result.push('"'),
                    '\\' => result.push('\\'),
                    'n' => result.push('\n'),
                    't' => result.push('\t'),
                    'r' => result.push('\r'),
                    '0' => result.push('\0'),
                    'x' => {
                        let hex: &str = take_while(2, |c: char| c.is_ascii_hexdigit())
                            .parse_next(input)?;
                        let code = u8::from_str_radix(hex, 16).map_err(|_| backtrack())?;
                        result.push(char::from(code));
                    }
                    _ => return Err(backtrack()),
                }
            }
            _ => result.push(c),
        }
    }
    Ok(result)
}

/// Parse a type: `dialect.name`, `dialect.name(params)`, or
/// `dialect.name(params) {key = value, ...}`.
///
/// Type attributes are only read after explicit parentheses, so the `{` of a
/// region following a bare result type is never mistaken for them.
pub(crate) fn raw_type<'a>(input: &mut &'a str) -> ModalResult<RawType<'a>> {
    let (dialect, name) = qualified_name.parse_next(input)?;

    let opt_params = opt(delimited(
        ('(', ws),
        separated(0.., (ws, raw_type, ws).map(|(_, t, _)| t), ','),
        (ws, ')'),
    ))
    .parse_next(input)?;
    let has_parens = opt_params.is_some();
    let params = opt_params.unwrap_or_default();

    let attrs = if has_parens {
        opt(preceded(hws, raw_attr_dict))
            .parse_next(input)?
            .unwrap_or_default()
    } else {
        vec![]
    };

    Ok(RawType {
        dialect,
        name,
        params,
        attrs,
    })
}

/// Parse an attribute value.
pub(crate) fn raw_attr_value<'a>(input: &mut &'a str) -> ModalResult<RawAttribute<'a>> {
    alt((
        // Types first: a qualified name never collides with a keyword
        raw_type.map(RawAttribute::Type),
        "true".value(RawAttribute::Bool(true)),
        "false".value(RawAttribute::Bool(false)),
        "unit".value(RawAttribute::Unit),
        raw_location_attr,
        raw_bytes_attr,
        string_lit.map(RawAttribute::String),
        symbol_ref.map(RawAttribute::Symbol),
        delimited(
            ('[', ws),
            separated(0.., (ws, raw_attr_value, ws).map(|(_, a, _)| a), ','),
            (ws, ']'),
        )
        .map(RawAttribute::List),
        float_lit.map(RawAttribute::Float),
        integer_lit.map(RawAttribute::Int),
        special_float.map(RawAttribute::Float),
    ))
    .parse_next(input)
}

/// Parse loc("path" start:end)
fn raw_location_attr<'a>(input: &mut &'a str) -> ModalResult<RawAttribute<'a>> {
    ("loc", ws, '(', ws).parse_next(input)?;
    let path = string_lit.parse_next(input)?;
    ws.parse_next(input)?;
    let start: usize = ascii::dec_uint(input)?;
    ':'.parse_next(input)?;
    let end: usize = ascii::dec_uint(input)?;
    (ws, ')').parse_next(input)?;
    Ok(RawAttribute::Location(path, start, end))
}

/// Parse bytes(1, 2, 3)
fn raw_bytes_attr<'a>(input: &mut &'a str) -> ModalResult<RawAttribute<'a>> {
    ("bytes", ws).parse_next(input)?;
    let bytes: Vec<u8> = delimited(
        ('(', ws),
        separated(
            0..,
            (ws, ascii::dec_uint::<_, u8, _>, ws).map(|(_, b, _)| b),
            ',',
        ),
        (ws, ')'),
    )
    .parse_next(input)?;
    Ok(RawAttribute::Bytes(bytes))
}

/// Parse a non-empty attribute dict: {key = value, ...}
///
/// An empty `{}` is never printed as a dict, so requiring one entry keeps
/// dicts apart from empty regions.
pub(crate) fn raw_attr_dict<'a>(
    input: &mut &'a str,
) -> ModalResult<Vec<(&'a str, RawAttribute<'a>)>> {
    delimited(
        ('{', ws),
        separated(
            1..,
            (ws, ident, ws, '=', ws, raw_attr_value, ws).map(|(_, k, _, _, _, v, _)| (k, v)),
            ',',
        ),
        (ws, '}'),
    )
    .parse_next(input)
}

/// Parse result list: %0 = or %0, %1 =
fn result_list<'a>(input: &mut &'a str) -> ModalResult<Vec<&'a str>> {
    let results: Vec<&str> =
        separated(1.., (hws, value_ref, hws).map(|(_, v, _)| v), ',').parse_next(input)?;
    '='.parse_next(input)?;
    Ok(results)
}

/// Parse operand list: %a, %b, ...
fn operand_list<'a>(input: &mut &'a str) -> ModalResult<Vec<&'a str>> {
    separated(1.., (hws, value_ref, hws).map(|(_, v, _)| v), ',').parse_next(input)
}

/// Parse a successor list: [^bb0, ^bb1]
fn successor_list<'a>(input: &mut &'a str) -> ModalResult<Vec<&'a str>> {
    delimited(
        ('[', ws),
        separated(1.., (ws, block_label, ws).map(|(_, l, _)| l), ','),
        (ws, ']'),
    )
    .parse_next(input)
}

/// Parse type annotation: : type1, type2
fn type_annotation<'a>(input: &mut &'a str) -> ModalResult<Vec<RawType<'a>>> {
    preceded(
        (hws, ':', hws),
        separated(1.., (hws, raw_type, hws).map(|(_, t, _)| t), ','),
    )
    .parse_next(input)
}

/// Parse a single operation in generic form.
///
/// ```text
/// [results =] dialect.op [operands] [[successors]] [{attrs}] [: types] [regions]
/// ```
pub(crate) fn raw_operation<'a>(input: &mut &'a str) -> ModalResult<RawOperation<'a>> {
    ws.parse_next(input)?;
    let start_tail = input.len();

    let results = opt(result_list).parse_next(input)?.unwrap_or_default();
    hws.parse_next(input)?;

    let (dialect, op_name) = qualified_name.parse_next(input)?;

    let operands = opt(operand_list).parse_next(input)?.unwrap_or_default();

    let successors = opt(preceded(hws, successor_list))
        .parse_next(input)?
        .unwrap_or_default();

    let attributes = opt(preceded(hws, raw_attr_dict))
        .parse_next(input)?
        .unwrap_or_default();

    let result_types = opt(type_annotation).parse_next(input)?.unwrap_or_default();
    let end_tail = input.len();

    let mut regions = Vec::new();
    loop {
        hws.parse_next(input)?;
        if input.starts_with('{') {
            regions.push(raw_region.parse_next(input)?);
        } else {
            break;
        }
    }

    Ok(RawOperation {
        start_tail,
        end_tail,
        results,
        dialect,
        op_name,
        operands,
        successors,
        attributes,
        result_types,
        regions,
    })
}

/// Parse operations until a block label, a closing brace or the end.
fn raw_ops<'a>(input: &mut &'a str) -> ModalResult<Vec<RawOperation<'a>>> {
    let mut ops = Vec::new();
    loop {
        ws.parse_next(input)?;
        if input.starts_with('^') || input.starts_with('}') || input.is_empty() {
            break;
        }
        ops.push(raw_operation.parse_next(input)?);
    }
    Ok(ops)
}

/// Parse a labelled block: ^label(args): ops...
pub(crate) fn raw_block<'a>(input: &mut &'a str) -> ModalResult<RawBlock<'a>> {
    ws.parse_next(input)?;
    let label = block_label.parse_next(input)?;

    let args = opt(delimited(
        ('(', ws),
        separated(
            0..,
            (ws, value_ref, ws, ':', ws, raw_type, ws).map(|(_, name, _, _, _, ty, _)| (name, ty)),
            ',',
        ),
        (ws, ')'),
    ))
    .parse_next(input)?
    .unwrap_or_default();

    (hws, ':').parse_next(input)?;
    let ops = raw_ops.parse_next(input)?;

    Ok(RawBlock {
        label: Some(label),
        args,
        ops,
    })
}

/// Parse a region: `{ ^blocks... }`, `{ ops... }` (one unlabelled block) or
/// `{ }` (no blocks).
pub(crate) fn raw_region<'a>(input: &mut &'a str) -> ModalResult<RawRegion<'a>> {
    ('{', ws).parse_next(input)?;

    let mut blocks = Vec::new();
    if input.starts_with('^') {
        loop {
            ws.parse_next(input)?;
            if !input.starts_with('^') {
                break;
            }
            blocks.push(raw_block.parse_next(input)?);
        }
    } else if !input.starts_with('}') {
        let ops = raw_ops.parse_next(input)?;
        blocks.push(RawBlock {
            label: None,
            args: vec![],
            ops,
        });
    }

    (ws, '}').parse_next(input)?;
    Ok(RawRegion { blocks })
}

// ============================================================================
// Tests (pure combinator tests)
// ============================================================================
