//! Expression evaluation against live target memory.

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debug_info::{TypeKind, TypeMeta, TypeRef, VarLocation, VariableMeta};
use crate::debugger::error::Error;
use crate::debugger::variable::constant::{self, Constant};
use crate::debugger::variable::expr::{BinOp, Expr, UnOp};
use crate::debugger::variable::{parser, LoadContext, TypeHandle, Variable, ValueKind};
use num_bigint::BigInt;
use std::sync::Arc;

/// Evaluation scope: a stopped thread position plus its selected frame.
pub struct EvalScope<'a> {
    pub ctx: LoadContext<'a>,
    /// Program counter of the selected frame.
    pub pc: GlobalAddress,
    /// Frame base (call frame address) of the selected frame.
    pub frame_base: RelocatedAddress,
}

impl EvalScope<'_> {
    pub fn new(
        ctx: LoadContext<'_>,
        pc: GlobalAddress,
        frame_base: RelocatedAddress,
    ) -> EvalScope<'_> {
        EvalScope {
            ctx,
            pc,
            frame_base,
        }
    }

    /// Returns the value of the given expression.
    pub fn eval_expression(&self, source: &str) -> Result<Variable, Error> {
        let ast = parser::parse(source)?;
        let mut value = self.eval_ast(&ast)?;
        value.load_value(&self.ctx);
        Ok(value)
    }

    fn eval_ast(&self, expr: &Expr) -> Result<Variable, Error> {
        match expr {
            Expr::Call(callee, args) => {
                if let Expr::Ident(name) = callee.as_ref() {
                    if args.len() == 2 && (name == "complex64" || name == "complex128") {
                        return self.eval_complex_cast(name, args);
                    }
                }
                // this must be a type cast because function calls are unsupported
                self.eval_type_cast(callee, args)
            }
            Expr::Ident(name) => self.eval_ident(name),
            Expr::Paren(inner) => self.eval_ast(inner),
            Expr::Selector(x, field) => {
                // try to interpret the selector as a package variable first
                if let Expr::Ident(maybe_pkg) = x.as_ref() {
                    if let Ok(v) = self.package_var(&format!("{maybe_pkg}.{field}")) {
                        return Ok(v);
                    }
                }
                let xv = self.eval_ast(x)?;
                xv.struct_member(field, &self.ctx)
            }
            Expr::Index(x, index) => self.eval_index(x, index),
            Expr::Slice(x, low, high) => self.eval_reslice(x, low.as_deref(), high.as_deref()),
            Expr::Deref(x) => self.eval_pointer_deref(x),
            Expr::Unary(UnOp::AddrOf, x) => self.eval_addr_of(x),
            Expr::Unary(op, x) => self.eval_unary(*op, x),
            Expr::Binary(op, x, y) => self.eval_binary(*op, x, y),
            Expr::IntLit(v) => Ok(Variable::constant(Constant::Int(v.clone()))),
            Expr::FloatLit(v) => Ok(Variable::constant(Constant::Float(*v))),
            Expr::StringLit(s) => Ok(Variable::constant(Constant::Str(s.clone()))),
            Expr::CharLit(c) => Ok(Variable::constant(Constant::Int(BigInt::from(*c as u32)))),
        }
    }

    /// Evaluates identifier expressions.
    fn eval_ident(&self, name: &str) -> Result<Variable, Error> {
        match name {
            "true" | "false" => return Ok(Variable::constant(Constant::Bool(name == "true"))),
            "nil" => return Ok(Variable::nil()),
            _ => {}
        }

        // try to interpret this as a local variable
        if let Some(meta) = self
            .ctx
            .info
            .scope_variables(self.pc)
            .into_iter()
            .find(|v| v.name == name)
        {
            return self.build_variable(&meta);
        }

        // not a local, try a package variable of the current function's package
        if let Some(func) = self.ctx.info.function_by_pc(self.pc) {
            if let Ok(mut v) = self.package_var(&format!("{}.{name}", func.package_name())) {
                v.name = Some(name.to_string());
                return Ok(v);
            }
        }

        Err(Error::IdentUnknown(name.to_string()))
    }

    fn package_var(&self, qualified_name: &str) -> Result<Variable, Error> {
        let meta = self
            .ctx
            .info
            .global_variable(qualified_name)
            .ok_or_else(|| Error::IdentUnknown(qualified_name.to_string()))?;
        self.build_variable(&meta)
    }

    fn build_variable(&self, meta: &VariableMeta) -> Result<Variable, Error> {
        let type_ref = meta
            .type_ref
            .ok_or_else(|| Error::Unreadable(format!("variable {} has no type", meta.name)))?;

        let addr = match meta.location {
            VarLocation::FrameOffset(offset) => Some(self.frame_base.offset(offset as isize)),
            VarLocation::Static(global) => Some(global.relocate(self.ctx.mapping_offset)),
            VarLocation::Unknown => None,
        };

        let mut v = Variable::with_type(
            Some(meta.name.clone()),
            addr,
            TypeHandle::Debug(type_ref),
            &self.ctx,
        )?;
        if addr.is_none() {
            v.unreadable = Some("unsupported location description".to_string());
            v.loaded = true;
        }
        Ok(v)
    }

    /// Evaluates expressions `<subexpr>[<subexpr>]` (subscript access to
    /// arrays, slices, strings and maps).
    fn eval_index(&self, x: &Expr, index: &Expr) -> Result<Variable, Error> {
        let mut xv = self.eval_ast(x)?;
        xv.load_value(&self.ctx);
        if let Some(reason) = &xv.unreadable {
            return Err(Error::Unreadable(reason.clone()));
        }

        let mut idx = self.eval_ast(index)?;

        match xv.kind {
            Some(k) if k.is_sequence() => {
                if xv.base == 0 {
                    return Err(Error::Unreadable(format!("can not index \"{x}\"")));
                }
                let n = self.var_as_int(&mut idx)?;
                if k == ValueKind::String {
                    return self.string_byte(&xv, n);
                }
                xv.slice_access(n, &self.ctx)
            }
            Some(ValueKind::Map) => {
                idx.load_value(&self.ctx);
                if let Some(reason) = &idx.unreadable {
                    return Err(Error::Unreadable(reason.clone()));
                }
                self.map_access(&xv, &idx)
            }
            _ => Err(Error::TypeMismatch(
                xv.type_name(self.ctx.info),
                "indexable type".to_string(),
            )),
        }
    }

    fn string_byte(&self, string: &Variable, idx: i64) -> Result<Variable, Error> {
        if idx < 0 || idx >= string.len {
            return Err(Error::Arithmetic("index out of bounds".to_string()));
        }
        let byte = self
            .ctx
            .target
            .read_memory(RelocatedAddress::from(string.base + idx as usize), 1)?[0];
        Ok(Variable::constant(Constant::Int(BigInt::from(byte))))
    }

    fn map_access(&self, map: &Variable, idx: &Variable) -> Result<Variable, Error> {
        let mut it = map.map_iterator(&self.ctx)?;

        let mut first = true;
        while let Some((mut key, value)) = it.next(&self.ctx)? {
            key.load_value(&self.ctx);
            if let Some(reason) = &key.unreadable {
                return Err(Error::Unreadable(format!(
                    "can not access unreadable map: {reason}"
                )));
            }
            if first {
                first = false;
                self.check_type_assignable(idx, &key)?;
            }
            if compare_values(constant::CmpOp::Eq, &key, idx, self.ctx.info)? {
                return Ok(value);
            }
        }
        Err(Error::KeyNotFound)
    }

    /// Evaluates expressions `<subexpr>[<subexpr>:<subexpr>]`.
    /// Convention: reslicing a map moves its display skip counter instead.
    fn eval_reslice(
        &self,
        x: &Expr,
        low: Option<&Expr>,
        high: Option<&Expr>,
    ) -> Result<Variable, Error> {
        let mut xv = self.eval_ast(x)?;
        xv.load_value(&self.ctx);
        if let Some(reason) = &xv.unreadable {
            return Err(Error::Unreadable(reason.clone()));
        }

        let low = match low {
            Some(e) => {
                let mut v = self.eval_ast(e)?;
                self.var_as_int(&mut v)?
            }
            None => 0,
        };

        match xv.kind {
            Some(k) if k.is_sequence() => {
                if xv.base == 0 {
                    return Err(Error::Unreadable(format!("can not slice \"{x}\"")));
                }
                let high = match high {
                    Some(e) => {
                        let mut v = self.eval_ast(e)?;
                        self.var_as_int(&mut v)?
                    }
                    None => xv.len,
                };
                xv.reslice(low, high, &self.ctx)
            }
            Some(ValueKind::Map) => {
                if high.is_some() {
                    return Err(Error::Unsupported(
                        "second slice argument must be empty for maps",
                    ));
                }
                xv.map_skip += low as usize;
                Ok(xv)
            }
            _ => Err(Error::TypeMismatch(
                xv.type_name(self.ctx.info),
                "sliceable type".to_string(),
            )),
        }
    }

    /// Evaluates a pointer dereference expression: `*<subexpr>`.
    fn eval_pointer_deref(&self, x: &Expr) -> Result<Variable, Error> {
        let mut xv = self.eval_ast(x)?;

        if xv.type_handle.is_none() {
            return Err(Error::TypeMismatch(
                format!("expression \"{x}\""),
                "pointer".to_string(),
            ));
        }
        if xv.kind != Some(ValueKind::Pointer) {
            return Err(Error::TypeMismatch(
                xv.type_name(self.ctx.info),
                "pointer".to_string(),
            ));
        }

        if xv.children.len() == 1 {
            // pointers fabricated by typecasts from integers carry their
            // single pointee as a child
            let mut child = xv.children.remove(0);
            child.only_addr = false;
            return Ok(child);
        }
        xv.maybe_dereference(&self.ctx)
    }

    /// Evaluates expressions `&<subexpr>`.
    fn eval_addr_of(&self, x: &Expr) -> Result<Variable, Error> {
        let mut xv = self.eval_ast(x)?;
        let Some(addr) = xv.addr else {
            return Err(Error::Unsupported("can not take address of expression"));
        };

        xv.only_addr = true;

        let TypeHandle::Debug(pointee_ref) = xv
            .type_handle
            .clone()
            .ok_or(Error::Unsupported("can not take address of untyped value"))?
        else {
            return Err(Error::Unsupported(
                "can not take address of fabricated value",
            ));
        };

        let pointee_name = xv.type_name(self.ctx.info);
        let mut result = Variable {
            kind: Some(ValueKind::Pointer),
            type_handle: Some(TypeHandle::Synthetic(Arc::new(TypeMeta {
                name: Some(format!("*{pointee_name}")),
                byte_size: self.ctx.arch.ptr_size as u64,
                kind: TypeKind::Pointer(Some(pointee_ref)),
            }))),
            base: addr.as_usize(),
            loaded: true,
            ..Default::default()
        };
        result.children.push(xv);
        Ok(result)
    }

    /// Evaluates expressions `-<subexpr>` and `+<subexpr>`.
    fn eval_unary(&self, op: UnOp, x: &Expr) -> Result<Variable, Error> {
        let mut xv = self.eval_ast(x)?;
        xv.load_value(&self.ctx);
        if let Some(reason) = &xv.unreadable {
            return Err(Error::Unreadable(reason.clone()));
        }
        let Some(value) = &xv.value else {
            return Err(Error::TypeMismatch(
                format!("operand \"{x}\""),
                "numeric value".to_string(),
            ));
        };

        let const_op = match op {
            UnOp::Plus => constant::UnaryOp::Plus,
            UnOp::Minus => constant::UnaryOp::Minus,
            UnOp::AddrOf => unreachable!("address-of has its own evaluation"),
        };
        let result = Constant::unary_op(const_op, value)?;

        match &xv.type_handle {
            Some(handle) => Ok(Variable {
                type_handle: Some(handle.clone()),
                kind: xv.kind,
                value: Some(result),
                loaded: true,
                ..Default::default()
            }),
            None => Ok(Variable::constant(result)),
        }
    }

    fn eval_binary(&self, op: BinOp, x: &Expr, y: &Expr) -> Result<Variable, Error> {
        let mut xv = self.eval_ast(x)?;
        let mut yv = self.eval_ast(y)?;

        xv.load_value(&self.ctx);
        yv.load_value(&self.ctx);

        if let Some(reason) = &xv.unreadable {
            return Err(Error::Unreadable(reason.clone()));
        }
        if let Some(reason) = &yv.unreadable {
            return Err(Error::Unreadable(reason.clone()));
        }

        let negotiated = self.negotiate_type(op, &xv, &yv)?;

        if op.is_comparison() {
            let cmp_op = match op {
                BinOp::Eq => constant::CmpOp::Eq,
                BinOp::NotEq => constant::CmpOp::NotEq,
                BinOp::Less => constant::CmpOp::Less,
                BinOp::LessEq => constant::CmpOp::LessEq,
                BinOp::Greater => constant::CmpOp::Greater,
                BinOp::GreaterEq => constant::CmpOp::GreaterEq,
                _ => unreachable!(),
            };
            let result = compare_values(cmp_op, &xv, &yv, self.ctx.info)?;
            return Ok(Variable::constant(Constant::Bool(result)));
        }

        let Some(x_value) = &xv.value else {
            return Err(Error::TypeMismatch(
                format!("operand \"{x}\""),
                "loadable value".to_string(),
            ));
        };
        let Some(y_value) = &yv.value else {
            return Err(Error::TypeMismatch(
                format!("operand \"{y}\""),
                "loadable value".to_string(),
            ));
        };

        let mut const_op = match op {
            BinOp::Add => constant::BinOp::Add,
            BinOp::Sub => constant::BinOp::Sub,
            BinOp::Mul => constant::BinOp::Mul,
            BinOp::Div => constant::BinOp::Quo,
            BinOp::Rem => constant::BinOp::Rem,
            BinOp::Shl => constant::BinOp::Shl,
            BinOp::Shr => constant::BinOp::Shr,
            _ => unreachable!("comparisons are handled above"),
        };

        // division between integer typed operands truncates toward zero
        if const_op == constant::BinOp::Quo {
            if let Some(handle) = &negotiated {
                let meta = handle.meta(self.ctx.info)?;
                if matches!(meta.kind, TypeKind::Int | TypeKind::Uint) {
                    const_op = constant::BinOp::QuoInt;
                }
            }
        }

        let result = Constant::binary_op(const_op, x_value, y_value)?;

        match negotiated {
            None => Ok(Variable::constant(result)),
            Some(handle) => {
                let meta = handle.meta(self.ctx.info)?;
                check_overflow(&result, &meta)?;
                Ok(Variable {
                    kind: Some(match meta.kind {
                        TypeKind::Uint => ValueKind::Uint,
                        TypeKind::Float => ValueKind::Float,
                        TypeKind::Complex => ValueKind::Complex,
                        _ => ValueKind::Int,
                    }),
                    type_handle: Some(handle),
                    value: Some(result),
                    loaded: true,
                    ..Default::default()
                })
            }
        }
    }

    /// Binary operand types are negotiated: two typed operands must match,
    /// an untyped constant adopts the typed side after a convertibility
    /// check, two untyped operands stay untyped.
    fn negotiate_type(
        &self,
        op: BinOp,
        xv: &Variable,
        yv: &Variable,
    ) -> Result<Option<TypeHandle>, Error> {
        if op == BinOp::Shl || op == BinOp::Shr {
            if !matches!(xv.value, Some(Constant::Int(_))) {
                return Err(Error::Arithmetic(format!(
                    "shift of non-integer operand ({})",
                    xv.type_name(self.ctx.info)
                )));
            }

            match yv.kind {
                Some(ValueKind::Uint) => {}
                Some(ValueKind::Int) | None => {
                    let negative = matches!(&yv.value, Some(Constant::Int(i)) if i.sign() == num_bigint::Sign::Minus);
                    if yv.type_handle.is_some() || negative {
                        return Err(Error::Arithmetic(
                            "shift count must be unsigned integer".to_string(),
                        ));
                    }
                }
                _ => {
                    return Err(Error::Arithmetic(
                        "shift count must be unsigned integer".to_string(),
                    ));
                }
            }

            return Ok(xv.type_handle.clone());
        }

        match (&xv.type_handle, &yv.type_handle) {
            (None, None) => Ok(None),
            (Some(xt), Some(yt)) => {
                let xname = xt.name(self.ctx.info);
                let yname = yt.name(self.ctx.info);
                if xname != yname {
                    return Err(Error::TypeMismatch(xname, yname));
                }
                Ok(Some(xt.clone()))
            }
            (Some(_), None) => {
                self.check_type_assignable(yv, xv)?;
                Ok(xv.type_handle.clone())
            }
            (None, Some(_)) => {
                self.check_type_assignable(xv, yv)?;
                Ok(yv.type_handle.clone())
            }
        }
    }

    /// Check that the untyped value `v` is convertible to the type of
    /// `typed`.
    fn check_type_assignable(&self, v: &Variable, typed: &Variable) -> Result<(), Error> {
        let Some(handle) = &typed.type_handle else {
            return Ok(());
        };

        if v.type_handle.is_some() {
            let vname = v.type_name(self.ctx.info);
            let tname = handle.name(self.ctx.info);
            if vname != tname {
                return Err(Error::TypeMismatch(vname, tname));
            }
            return Ok(());
        }

        let meta = handle.meta(self.ctx.info)?;

        if v.is_nil() {
            return match typed.kind {
                Some(k) if k.is_nil_comparable() => Ok(()),
                Some(ValueKind::Pointer) | Some(ValueKind::Interface) => Ok(()),
                _ => Err(Error::TypeMismatch(
                    "nil".to_string(),
                    meta.display_name().to_string(),
                )),
            };
        }

        let convertible = match (&meta.kind, &v.value) {
            (TypeKind::Int | TypeKind::Uint, Some(Constant::Int(_))) => true,
            (TypeKind::Float, Some(Constant::Int(_) | Constant::Float(_))) => true,
            (TypeKind::Bool, Some(Constant::Bool(_))) => true,
            (TypeKind::String, Some(Constant::Str(_))) => true,
            (
                TypeKind::Complex,
                Some(Constant::Complex(_) | Constant::Float(_) | Constant::Int(_)),
            ) => true,
            _ => false,
        };
        if !convertible {
            return Err(Error::TypeMismatch(
                v.value
                    .as_ref()
                    .map(|c| format!("constant {c}"))
                    .unwrap_or_else(|| "value".to_string()),
                meta.display_name().to_string(),
            ));
        }
        Ok(())
    }

    /// Eval expressions `complex64(<float>, <float>)` and
    /// `complex128(<float>, <float>)`.
    fn eval_complex_cast(&self, type_name: &str, args: &[Expr]) -> Result<Variable, Error> {
        let mut realv = self.eval_ast(&args[0])?;
        let mut imagv = self.eval_ast(&args[1])?;
        realv.load_value(&self.ctx);
        imagv.load_value(&self.ctx);

        if let Some(reason) = &realv.unreadable {
            return Err(Error::Unreadable(reason.clone()));
        }
        if let Some(reason) = &imagv.unreadable {
            return Err(Error::Unreadable(reason.clone()));
        }

        let byte_size: u64 = if type_name == "complex64" { 8 } else { 16 };

        let real = realv
            .value
            .as_ref()
            .ok_or_else(|| Error::TypeMismatch(format!("\"{}\"", args[0]), "float".to_string()))?;
        let imag = imagv
            .value
            .as_ref()
            .ok_or_else(|| Error::TypeMismatch(format!("\"{}\"", args[1]), "float".to_string()))?;
        let value = Constant::make_complex(real, imag)?;

        Ok(Variable {
            kind: Some(ValueKind::Complex),
            type_handle: Some(TypeHandle::Synthetic(Arc::new(TypeMeta {
                name: Some(type_name.to_string()),
                byte_size,
                kind: TypeKind::Complex,
            }))),
            value: Some(value),
            loaded: true,
            ..Default::default()
        })
    }

    /// Eval type cast expressions.
    fn eval_type_cast(&self, callee: &Expr, args: &[Expr]) -> Result<Variable, Error> {
        if args.len() != 1 {
            return Err(Error::Unsupported("wrong number of arguments for a type cast"));
        }

        let mut argv = self.eval_ast(&args[0])?;
        argv.load_value(&self.ctx);
        if let Some(reason) = &argv.unreadable {
            return Err(Error::Unreadable(reason.clone()));
        }

        // remove all enclosing parenthesis from the type name
        let mut type_expr = callee;
        while let Expr::Paren(inner) = type_expr {
            type_expr = inner;
        }

        // pointer types rarely appear in the debug information on their
        // own, fabricate one so any known type can be pointed at
        if let Expr::Deref(pointee_expr) = type_expr {
            let pointee_name = pointee_expr.to_string();
            let pointee_ref = self
                .ctx
                .info
                .type_by_name(&pointee_name)
                .ok_or(Error::TypeNotFound(pointee_name.clone()))?;
            return self.fabricate_pointer(&argv, &args[0], pointee_ref, format!("*{pointee_name}"));
        }

        let type_name = type_expr.to_string();
        let type_ref = self
            .ctx
            .info
            .type_by_name(&type_name)
            .ok_or(Error::TypeNotFound(type_name.clone()))?;
        let meta = self.ctx.info.type_meta(type_ref)?;

        if let TypeKind::Pointer(Some(pointee_ref)) = meta.kind {
            return self.fabricate_pointer(&argv, &args[0], pointee_ref, type_name);
        }

        // non-pointer casts are type compatibility checks
        let typed = Variable {
            kind: Some(ValueKind::from_meta(&meta)),
            type_handle: Some(TypeHandle::Debug(type_ref)),
            loaded: true,
            ..Default::default()
        };
        self.check_type_assignable(&argv, &typed)?;
        Ok(Variable {
            value: argv.value,
            ..typed
        })
    }

    /// Only integer kind values may be cast into pointer types. The result
    /// is a synthetic pointer whose single child is the pointee.
    fn fabricate_pointer(
        &self,
        argv: &Variable,
        arg_expr: &Expr,
        pointee_ref: TypeRef,
        type_name: String,
    ) -> Result<Variable, Error> {
        match argv.kind {
            Some(ValueKind::Int) | Some(ValueKind::Uint) | None => {}
            _ => {
                return Err(Error::TypeMismatch(
                    format!("\"{arg_expr}\""),
                    type_name,
                ));
            }
        }
        let addr = argv
            .value
            .as_ref()
            .ok_or_else(|| Error::TypeMismatch(format!("\"{arg_expr}\""), type_name.clone()))?
            .as_u64()?;

        let pointee = Variable::with_type(
            None,
            Some(RelocatedAddress::from(addr)),
            TypeHandle::Debug(pointee_ref),
            &self.ctx,
        )?;

        let mut result = Variable {
            kind: Some(ValueKind::Pointer),
            type_handle: Some(TypeHandle::Synthetic(Arc::new(TypeMeta {
                name: Some(type_name),
                byte_size: self.ctx.arch.ptr_size as u64,
                kind: TypeKind::Pointer(Some(pointee_ref)),
            }))),
            base: addr as usize,
            loaded: true,
            ..Default::default()
        };
        result.children.push(pointee);
        Ok(result)
    }

    /// Coerce a value into a signed integer index.
    fn var_as_int(&self, v: &mut Variable) -> Result<i64, Error> {
        if v.type_handle.is_none() {
            let Some(value) = &v.value else {
                return Err(Error::TypeMismatch(
                    "value".to_string(),
                    "int".to_string(),
                ));
            };
            return value.as_i64();
        }

        v.load_value(&self.ctx);
        if let Some(reason) = &v.unreadable {
            return Err(Error::Unreadable(reason.clone()));
        }
        if v.kind != Some(ValueKind::Int) {
            return Err(Error::TypeMismatch(
                v.type_name(self.ctx.info),
                "int".to_string(),
            ));
        }
        v.value
            .as_ref()
            .ok_or_else(|| Error::Unreadable("value not loaded".to_string()))?
            .as_i64()
    }
}

/// Pointer payload for comparison: fabricated pointers carry their target
/// as a child, loaded pointers keep it in `base`.
fn pointer_target(v: &Variable) -> usize {
    if let Some(child) = v.children.first() {
        return child.addr.map(|a| a.as_usize()).unwrap_or(0);
    }
    v.base
}

/// Compares two loaded values. Both must have a compatible type (as
/// determined by type negotiation).
pub fn compare_values(
    op: constant::CmpOp,
    xv: &Variable,
    yv: &Variable,
    info: &dyn crate::debugger::debug_info::DebugInfo,
) -> Result<bool, Error> {
    use crate::debugger::variable::constant::CmpOp;

    // dispatch on the typed side when one of the operands is the nil sentinel
    let (xv, yv, op) = if xv.is_nil() && !yv.is_nil() {
        let mirrored = match op {
            CmpOp::Less => CmpOp::Greater,
            CmpOp::LessEq => CmpOp::GreaterEq,
            CmpOp::Greater => CmpOp::Less,
            CmpOp::GreaterEq => CmpOp::LessEq,
            other => other,
        };
        (yv, xv, mirrored)
    } else {
        (xv, yv, op)
    };

    match xv.kind {
        None
        | Some(ValueKind::Int)
        | Some(ValueKind::Uint)
        | Some(ValueKind::Float)
        | Some(ValueKind::Complex)
        | Some(ValueKind::Bool) => {
            let (Some(x), Some(y)) = (&xv.value, &yv.value) else {
                return Err(Error::Unreadable("comparison of unloaded values".to_string()));
            };
            Constant::compare(op, x, y)
        }
        Some(ValueKind::String) => {
            let (Some(Constant::Str(x)), Some(Constant::Str(y))) = (&xv.value, &yv.value) else {
                return Err(Error::Unreadable("comparison of unloaded strings".to_string()));
            };
            if x.len() as i64 != xv.len || y.len() as i64 != yv.len {
                return Err(Error::Arithmetic("string too long for comparison".to_string()));
            }
            Constant::compare(op, &Constant::Str(x.clone()), &Constant::Str(y.clone()))
        }
        _ => {
            if op != CmpOp::Eq && op != CmpOp::NotEq {
                return Err(Error::Arithmetic(format!(
                    "operator not defined on {}",
                    xv.type_name(info)
                )));
            }

            let eql = match xv.kind {
                Some(ValueKind::Pointer) => pointer_target(xv) == pointer_target(yv),
                Some(ValueKind::Array) => {
                    if xv.children.len() as i64 != xv.len || yv.children.len() as i64 != yv.len {
                        return Err(Error::Arithmetic(
                            "array too long for comparison".to_string(),
                        ));
                    }
                    equal_children(xv, yv, true, info)?
                }
                Some(ValueKind::Struct) => {
                    if xv.children.len() != yv.children.len() {
                        false
                    } else {
                        equal_children(xv, yv, false, info)?
                    }
                }
                Some(k) if k.is_nil_comparable() => {
                    if !xv.is_nil() && !yv.is_nil() {
                        return Err(Error::Arithmetic(format!(
                            "can not compare {} variables",
                            xv.type_name(info)
                        )));
                    }
                    xv.base == yv.base
                }
                Some(ValueKind::Nil) => yv.is_nil(),
                _ => {
                    return Err(Error::Unsupported("comparison of this kind"));
                }
            };

            Ok(if op == CmpOp::NotEq { !eql } else { eql })
        }
    }
}

fn equal_children(
    xv: &Variable,
    yv: &Variable,
    shortcircuit: bool,
    info: &dyn crate::debugger::debug_info::DebugInfo,
) -> Result<bool, Error> {
    let mut equal = true;
    for (x_child, y_child) in xv.children.iter().zip(yv.children.iter()) {
        let eql = compare_values(constant::CmpOp::Eq, x_child, y_child, info)?;
        equal = equal && eql;
        if !equal && shortcircuit {
            return Ok(false);
        }
    }
    Ok(equal)
}

/// Typed binary results must fit the negotiated type.
fn check_overflow(value: &Constant, meta: &TypeMeta) -> Result<(), Error> {
    let Constant::Int(i) = value else {
        return Ok(());
    };
    let bits = meta.byte_size * 8;
    if bits == 0 || bits > 64 {
        return Ok(());
    }

    let fits = match meta.kind {
        TypeKind::Int => {
            let min = -(BigInt::from(1) << (bits - 1));
            let max = (BigInt::from(1) << (bits - 1)) - 1;
            *i >= min && *i <= max
        }
        TypeKind::Uint => {
            let max = (BigInt::from(1) << bits) - 1;
            *i >= BigInt::from(0) && *i <= max
        }
        _ => true,
    };

    if !fits {
        return Err(Error::Arithmetic(format!(
            "constant {i} overflows {}",
            meta.display_name()
        )));
    }
    Ok(())
}
