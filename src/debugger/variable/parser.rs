//! Expression parser: the Go expression subset, parsed with nom into
//! [`Expr`] trees.

use crate::debugger::error::Error;
use crate::debugger::variable::expr::{BinOp, Expr, UnOp};
use nom::branch::alt;
use nom::bytes::complete::{is_not, take_while, take_while1};
use nom::character::complete::{char as nom_char, digit1, hex_digit1, multispace0, oct_digit1};
use nom::combinator::{cut, map, opt, recognize, verify};
use nom::error::ParseError;
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;
use nom_supreme::error::ErrorTree;
use nom_supreme::tag::complete::tag;
use num_bigint::BigInt;

type PResult<'a, T> = IResult<&'a str, T, ErrorTree<&'a str>>;

fn ws<'a, T>(
    mut parser: impl FnMut(&'a str) -> PResult<'a, T>,
) -> impl FnMut(&'a str) -> PResult<'a, T> {
    move |i: &'a str| {
        let (i, _) = multispace0(i)?;
        let (i, v) = parser(i)?;
        let (i, _) = multispace0(i)?;
        Ok((i, v))
    }
}

fn go_identifier(i: &str) -> PResult<&str> {
    verify(
        recognize(pair(
            take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
            take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        )),
        |s: &str| !s.is_empty(),
    )(i)
}

fn int_lit(i: &str) -> PResult<Expr> {
    alt((
        map(preceded(tag("0x"), cut(hex_digit1)), |digits: &str| {
            Expr::IntLit(BigInt::parse_bytes(digits.as_bytes(), 16).expect("hex digits"))
        }),
        map(
            verify(preceded(nom_char('0'), oct_digit1), |s: &str| !s.is_empty()),
            |digits: &str| {
                Expr::IntLit(BigInt::parse_bytes(digits.as_bytes(), 8).expect("oct digits"))
            },
        ),
        map(digit1, |digits: &str| {
            Expr::IntLit(BigInt::parse_bytes(digits.as_bytes(), 10).expect("digits"))
        }),
    ))(i)
}

fn float_lit(i: &str) -> PResult<Expr> {
    map(
        verify(
            recognize(tuple((
                digit1,
                opt(preceded(nom_char('.'), opt(digit1))),
                opt(tuple((
                    alt((nom_char('e'), nom_char('E'))),
                    opt(alt((nom_char('+'), nom_char('-')))),
                    digit1,
                ))),
            ))),
            // without a dot or an exponent this is an integer literal
            |s: &str| s.contains('.') || s.contains('e') || s.contains('E'),
        ),
        |s: &str| Expr::FloatLit(s.parse().expect("float literal")),
    )(i)
}

fn string_lit(i: &str) -> PResult<Expr> {
    map(
        delimited(
            nom_char('"'),
            opt(is_not("\"")),
            cut(nom_char('"')),
        ),
        |s: Option<&str>| Expr::StringLit(unescape(s.unwrap_or_default())),
    )(i)
}

fn char_lit(i: &str) -> PResult<Expr> {
    map(
        delimited(nom_char('\''), cut(is_not("'")), cut(nom_char('\''))),
        |s: &str| {
            let s = unescape(s);
            Expr::CharLit(s.chars().next().unwrap_or('\0'))
        },
    )(i)
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn parens(i: &str) -> PResult<Expr> {
    map(
        delimited(ws(tag("(")), expr_inner, cut(ws(tag(")")))),
        |e| Expr::Paren(e.boxed()),
    )(i)
}

fn primary(i: &str) -> PResult<Expr> {
    alt((
        float_lit,
        int_lit,
        string_lit,
        char_lit,
        map(go_identifier, |id| Expr::Ident(id.to_string())),
        parens,
    ))(i)
}

enum PostfixOp {
    Field(String),
    Index(Expr),
    Slice(Option<Expr>, Option<Expr>),
    Call(Vec<Expr>),
}

fn postfix_op(i: &str) -> PResult<PostfixOp> {
    alt((
        map(preceded(ws(tag(".")), cut(go_identifier)), |field| {
            PostfixOp::Field(field.to_string())
        }),
        subscript,
        map(
            delimited(
                ws(tag("(")),
                separated_list0(ws(tag(",")), expr_inner),
                cut(ws(tag(")"))),
            ),
            PostfixOp::Call,
        ),
    ))(i)
}

/// `[i]`, `[a:b]`, `[:b]`, `[a:]` and `[:]`.
fn subscript(i: &str) -> PResult<PostfixOp> {
    let (i, _) = ws(tag("["))(i)?;
    let (i, low) = opt(expr_inner)(i)?;
    let (i, colon) = opt(ws(tag(":")))(i)?;
    match colon {
        None => {
            let low = low.ok_or_else(|| {
                nom::Err::Error(ErrorTree::from_error_kind(i, nom::error::ErrorKind::Fail))
            })?;
            let (i, _) = cut(ws(tag("]")))(i)?;
            Ok((i, PostfixOp::Index(low)))
        }
        Some(_) => {
            let (i, high) = opt(expr_inner)(i)?;
            let (i, _) = cut(ws(tag("]")))(i)?;
            Ok((i, PostfixOp::Slice(low, high)))
        }
    }
}

fn postfix(i: &str) -> PResult<Expr> {
    let (i, initial) = primary(i)?;
    let (i, ops) = many0(postfix_op)(i)?;
    let folded = ops.into_iter().fold(initial, |acc, op| match op {
        PostfixOp::Field(field) => Expr::Selector(acc.boxed(), field),
        PostfixOp::Index(idx) => Expr::Index(acc.boxed(), idx.boxed()),
        PostfixOp::Slice(low, high) => {
            Expr::Slice(acc.boxed(), low.map(Expr::boxed), high.map(Expr::boxed))
        }
        PostfixOp::Call(args) => Expr::Call(acc.boxed(), args),
    });
    Ok((i, folded))
}

fn unary(i: &str) -> PResult<Expr> {
    alt((
        map(preceded(ws(tag("*")), unary), |e| Expr::Deref(e.boxed())),
        map(preceded(ws(tag("&")), cut(unary)), |e| {
            Expr::Unary(UnOp::AddrOf, e.boxed())
        }),
        map(preceded(ws(tag("-")), cut(unary)), |e| {
            Expr::Unary(UnOp::Minus, e.boxed())
        }),
        map(preceded(ws(tag("+")), cut(unary)), |e| {
            Expr::Unary(UnOp::Plus, e.boxed())
        }),
        postfix,
    ))(i)
}

fn term_op(i: &str) -> PResult<BinOp> {
    alt((
        map(tag("<<"), |_| BinOp::Shl),
        map(tag(">>"), |_| BinOp::Shr),
        map(tag("*"), |_| BinOp::Mul),
        map(tag("/"), |_| BinOp::Div),
        map(tag("%"), |_| BinOp::Rem),
    ))(i)
}

fn term(i: &str) -> PResult<Expr> {
    let (i, initial) = unary(i)?;
    let (i, rest) = many0(pair(ws(term_op), unary))(i)?;
    Ok((i, fold_binary(initial, rest)))
}

fn additive_op(i: &str) -> PResult<BinOp> {
    alt((
        map(tag("+"), |_| BinOp::Add),
        map(tag("-"), |_| BinOp::Sub),
    ))(i)
}

fn additive(i: &str) -> PResult<Expr> {
    let (i, initial) = term(i)?;
    let (i, rest) = many0(pair(ws(additive_op), term))(i)?;
    Ok((i, fold_binary(initial, rest)))
}

fn comparison_op(i: &str) -> PResult<BinOp> {
    alt((
        map(tag("=="), |_| BinOp::Eq),
        map(tag("!="), |_| BinOp::NotEq),
        map(tag("<="), |_| BinOp::LessEq),
        map(tag(">="), |_| BinOp::GreaterEq),
        map(tag("<"), |_| BinOp::Less),
        map(tag(">"), |_| BinOp::Greater),
    ))(i)
}

fn expr_inner(i: &str) -> PResult<Expr> {
    let (i, initial) = additive(i)?;
    let (i, rest) = many0(pair(ws(comparison_op), additive))(i)?;
    Ok((i, fold_binary(initial, rest)))
}

fn fold_binary(initial: Expr, rest: Vec<(BinOp, Expr)>) -> Expr {
    rest.into_iter().fold(initial, |acc, (op, rhs)| {
        Expr::Binary(op, acc.boxed(), rhs.boxed())
    })
}

fn expr(i: &str) -> PResult<Expr> {
    terminated(ws(expr_inner), multispace0)(i)
}

/// Parse an expression source string.
pub fn parse(input: &str) -> Result<Expr, Error> {
    nom_supreme::final_parser::final_parser::<
        _,
        _,
        _,
        ErrorTree<nom_supreme::final_parser::Location>,
    >(expr)(input)
    .map_err(|e| Error::ExpressionSyntax(e.to_string()))
}
