use num_bigint::BigInt;
use std::fmt::{Display, Formatter};

/// Unary operators of the expression grammar (`*` parses into
/// [`Expr::Deref`] and is not listed here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Plus,
    Minus,
    AddrOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Less | BinOp::LessEq | BinOp::Greater | BinOp::GreaterEq
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Eq => "==",
            BinOp::NotEq => "!=",
            BinOp::Less => "<",
            BinOp::LessEq => "<=",
            BinOp::Greater => ">",
            BinOp::GreaterEq => ">=",
        }
    }
}

/// Parsed expression, the Go expression subset the evaluator understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(String),
    IntLit(BigInt),
    FloatLit(f64),
    StringLit(String),
    CharLit(char),
    Paren(Box<Expr>),
    /// `x.y`
    Selector(Box<Expr>, String),
    /// `x[i]`
    Index(Box<Expr>, Box<Expr>),
    /// `x[low:high]`, either bound may be omitted
    Slice(Box<Expr>, Option<Box<Expr>>, Option<Box<Expr>>),
    /// `*x`
    Deref(Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// `T(x)`, `(*T)(x)`, `complex64(re, im)` - type casts and the paired
    /// complex constructors, the grammar has no real function calls
    Call(Box<Expr>, Vec<Expr>),
}

impl Expr {
    pub fn boxed(self) -> Box<Self> {
        Box::new(self)
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Ident(name) => f.write_str(name),
            Expr::IntLit(v) => v.fmt(f),
            Expr::FloatLit(v) => v.fmt(f),
            Expr::StringLit(s) => write!(f, "{s:?}"),
            Expr::CharLit(c) => write!(f, "'{c}'"),
            Expr::Paren(e) => write!(f, "({e})"),
            Expr::Selector(e, field) => write!(f, "{e}.{field}"),
            Expr::Index(e, idx) => write!(f, "{e}[{idx}]"),
            Expr::Slice(e, low, high) => {
                write!(f, "{e}[")?;
                if let Some(low) = low {
                    low.fmt(f)?;
                }
                f.write_str(":")?;
                if let Some(high) = high {
                    high.fmt(f)?;
                }
                f.write_str("]")
            }
            Expr::Deref(e) => write!(f, "*{e}"),
            Expr::Unary(op, e) => {
                let op = match op {
                    UnOp::Plus => "+",
                    UnOp::Minus => "-",
                    UnOp::AddrOf => "&",
                };
                write!(f, "{op}{e}")
            }
            Expr::Binary(op, x, y) => write!(f, "{x} {} {y}", op.as_str()),
            Expr::Call(callee, args) => {
                write!(f, "{callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    arg.fmt(f)?;
                }
                f.write_str(")")
            }
        }
    }
}
