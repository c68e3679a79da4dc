//! Arbitrary-precision constant values and the arithmetic on them.
//!
//! Every operation is fallible: division by zero, invalid shift counts and
//! non-finite float results surface as arithmetic errors instead of panics.

use crate::debugger::error::Error;
use num_bigint::BigInt;
use num_complex::Complex64;
use num_traits::{Signed, ToPrimitive, Zero};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(BigInt),
    Float(f64),
    Complex(Complex64),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Quo,
    /// Division that truncates toward zero, used when both operands carry
    /// integer types.
    QuoInt,
    Rem,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
}

fn arith(msg: impl Into<String>) -> Error {
    Error::Arithmetic(msg.into())
}

fn finite(f: f64) -> Result<f64, Error> {
    if f.is_finite() {
        Ok(f)
    } else {
        Err(arith("constant arithmetic overflow"))
    }
}

const MAX_SHIFT: u64 = 1024;

impl Constant {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Constant::Int(_) => "int",
            Constant::Float(_) => "float",
            Constant::Complex(_) => "complex",
            Constant::Bool(_) => "bool",
            Constant::Str(_) => "string",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Constant::Int(_) | Constant::Float(_) | Constant::Complex(_)
        )
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Constant::Int(i) => i.to_f64(),
            Constant::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Result<i64, Error> {
        match self {
            Constant::Int(i) => i
                .to_i64()
                .ok_or_else(|| arith(format!("constant {i} overflows int64"))),
            _ => Err(arith(format!(
                "can not convert constant {self} to int"
            ))),
        }
    }

    pub fn as_u64(&self) -> Result<u64, Error> {
        match self {
            Constant::Int(i) => i
                .to_u64()
                .ok_or_else(|| arith(format!("constant {i} overflows uint64"))),
            _ => Err(arith(format!(
                "can not convert constant {self} to uint"
            ))),
        }
    }

    /// Construct a complex constant from real and imaginary halves.
    pub fn make_complex(real: &Constant, imag: &Constant) -> Result<Constant, Error> {
        let re = real
            .as_f64()
            .ok_or_else(|| arith(format!("can not convert {real} to float")))?;
        let im = imag
            .as_f64()
            .ok_or_else(|| arith(format!("can not convert {imag} to float")))?;
        Ok(Constant::Complex(Complex64::new(re, im)))
    }

    pub fn unary_op(op: UnaryOp, x: &Constant) -> Result<Constant, Error> {
        match op {
            UnaryOp::Plus => match x {
                Constant::Int(_) | Constant::Float(_) | Constant::Complex(_) => Ok(x.clone()),
                _ => Err(arith(format!("operator + not defined on {}", x.kind_str()))),
            },
            UnaryOp::Minus => match x {
                Constant::Int(i) => Ok(Constant::Int(-i)),
                Constant::Float(f) => Ok(Constant::Float(-f)),
                Constant::Complex(c) => Ok(Constant::Complex(-c)),
                _ => Err(arith(format!("operator - not defined on {}", x.kind_str()))),
            },
        }
    }

    pub fn binary_op(op: BinOp, x: &Constant, y: &Constant) -> Result<Constant, Error> {
        use Constant::*;

        match op {
            BinOp::Shl | BinOp::Shr => return Self::shift(op, x, y),
            BinOp::Rem => {
                let (Int(a), Int(b)) = (x, y) else {
                    return Err(arith(format!(
                        "operator % not defined on {} and {}",
                        x.kind_str(),
                        y.kind_str()
                    )));
                };
                if b.is_zero() {
                    return Err(arith("division by zero"));
                }
                return Ok(Int(a % b));
            }
            BinOp::QuoInt => {
                let (Int(a), Int(b)) = (x, y) else {
                    return Err(arith("integer division on non-integer constants"));
                };
                if b.is_zero() {
                    return Err(arith("division by zero"));
                }
                return Ok(Int(a / b));
            }
            _ => {}
        }

        match (x, y) {
            (Str(a), Str(b)) => match op {
                BinOp::Add => Ok(Str(format!("{a}{b}"))),
                _ => Err(arith("operator not defined on string")),
            },
            (Int(a), Int(b)) => match op {
                BinOp::Add => Ok(Int(a + b)),
                BinOp::Sub => Ok(Int(a - b)),
                BinOp::Mul => Ok(Int(a * b)),
                BinOp::Quo => {
                    if b.is_zero() {
                        return Err(arith("division by zero"));
                    }
                    if (a % b).is_zero() {
                        Ok(Int(a / b))
                    } else {
                        let fa = a.to_f64().ok_or_else(|| arith("constant overflow"))?;
                        let fb = b.to_f64().ok_or_else(|| arith("constant overflow"))?;
                        Ok(Float(finite(fa / fb)?))
                    }
                }
                _ => unreachable!("shifts and rem are handled above"),
            },
            (Complex(_), _) | (_, Complex(_)) => {
                let to_complex = |c: &Constant| -> Result<Complex64, Error> {
                    match c {
                        Complex(v) => Ok(*v),
                        _ => c
                            .as_f64()
                            .map(|f| Complex64::new(f, 0.))
                            .ok_or_else(|| arith("operator not defined on mixed constants")),
                    }
                };
                let (a, b) = (to_complex(x)?, to_complex(y)?);
                let r = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Quo => {
                        if b.is_zero() {
                            return Err(arith("division by zero"));
                        }
                        a / b
                    }
                    _ => unreachable!("shifts and rem are handled above"),
                };
                finite(r.re)?;
                finite(r.im)?;
                Ok(Complex(r))
            }
            _ => {
                let a = x
                    .as_f64()
                    .ok_or_else(|| arith(format!("operator not defined on {}", x.kind_str())))?;
                let b = y
                    .as_f64()
                    .ok_or_else(|| arith(format!("operator not defined on {}", y.kind_str())))?;
                let r = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Quo => {
                        if b == 0. {
                            return Err(arith("division by zero"));
                        }
                        a / b
                    }
                    _ => unreachable!("shifts and rem are handled above"),
                };
                Ok(Float(finite(r)?))
            }
        }
    }

    fn shift(op: BinOp, x: &Constant, y: &Constant) -> Result<Constant, Error> {
        let Constant::Int(base) = x else {
            return Err(arith(format!("shift of type {}", x.kind_str())));
        };
        let count = match y {
            Constant::Int(i) if !i.is_negative() => i
                .to_u64()
                .filter(|&c| c <= MAX_SHIFT)
                .ok_or_else(|| arith("shift count too large"))?,
            _ => return Err(arith("shift count must be unsigned integer")),
        };

        match op {
            BinOp::Shl => Ok(Constant::Int(base << count)),
            BinOp::Shr => Ok(Constant::Int(base >> count)),
            _ => unreachable!(),
        }
    }

    pub fn compare(op: CmpOp, x: &Constant, y: &Constant) -> Result<bool, Error> {
        use std::cmp::Ordering;

        let ord = match (x, y) {
            (Constant::Int(a), Constant::Int(b)) => a.cmp(b),
            (Constant::Bool(a), Constant::Bool(b)) => {
                return match op {
                    CmpOp::Eq => Ok(a == b),
                    CmpOp::NotEq => Ok(a != b),
                    _ => Err(arith("operator not defined on bool")),
                };
            }
            (Constant::Str(a), Constant::Str(b)) => a.cmp(b),
            (Constant::Complex(_), _) | (_, Constant::Complex(_)) => {
                let as_c = |c: &Constant| match c {
                    Constant::Complex(v) => Some(*v),
                    _ => c.as_f64().map(|f| Complex64::new(f, 0.)),
                };
                let (a, b) = (
                    as_c(x).ok_or_else(|| arith("mismatched constants in comparison"))?,
                    as_c(y).ok_or_else(|| arith("mismatched constants in comparison"))?,
                );
                return match op {
                    CmpOp::Eq => Ok(a == b),
                    CmpOp::NotEq => Ok(a != b),
                    _ => Err(arith("operator not defined on complex")),
                };
            }
            _ => {
                let a = x
                    .as_f64()
                    .ok_or_else(|| arith("mismatched constants in comparison"))?;
                let b = y
                    .as_f64()
                    .ok_or_else(|| arith("mismatched constants in comparison"))?;
                a.partial_cmp(&b)
                    .ok_or_else(|| arith("unordered float comparison"))?
            }
        };

        Ok(match op {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::NotEq => ord != Ordering::Equal,
            CmpOp::Less => ord == Ordering::Less,
            CmpOp::LessEq => ord != Ordering::Greater,
            CmpOp::Greater => ord == Ordering::Greater,
            CmpOp::GreaterEq => ord != Ordering::Less,
        })
    }
}

impl Display for Constant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Int(i) => i.fmt(f),
            Constant::Float(fl) => fl.fmt(f),
            Constant::Complex(c) => f.write_fmt(format_args!("({} + {}i)", c.re, c.im)),
            Constant::Bool(b) => b.fmt(f),
            Constant::Str(s) => f.write_fmt(format_args!("{s:?}")),
        }
    }
}

impl From<i64> for Constant {
    fn from(value: i64) -> Self {
        Constant::Int(BigInt::from(value))
    }
}

impl From<u64> for Constant {
    fn from(value: u64) -> Self {
        Constant::Int(BigInt::from(value))
    }
}

impl From<f64> for Constant {
    fn from(value: f64) -> Self {
        Constant::Float(value)
    }
}

impl From<bool> for Constant {
    fn from(value: bool) -> Self {
        Constant::Bool(value)
    }
}
