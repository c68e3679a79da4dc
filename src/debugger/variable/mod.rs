pub mod constant;
pub mod eval;
pub mod expr;
pub mod parser;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::arch::Arch;
use crate::debugger::debug_info::{DebugInfo, TypeKind, TypeMeta, TypeRef};
use crate::debugger::error::Error;
use crate::debugger::target::{read_ptr, TargetControl};
use crate::debugger::variable::constant::Constant;
use bytes::Bytes;
use num_bigint::BigInt;
use num_complex::Complex64;
use std::sync::Arc;

/// At most this many sequence elements are mirrored into children.
const MAX_CHILDREN: i64 = 64;
/// At most this many string bytes are materialized.
const MAX_STR_LEN: i64 = 4096;

/// Classification of a value, a Go `reflect.Kind` flattened to what the
/// evaluator distinguishes between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Uint,
    Float,
    Complex,
    Bool,
    String,
    Pointer,
    Slice,
    Array,
    Map,
    Struct,
    Chan,
    Func,
    Interface,
    /// The nil sentinel, a value with neither address nor constant.
    Nil,
}

impl ValueKind {
    pub fn from_meta(meta: &TypeMeta) -> ValueKind {
        match meta.kind {
            TypeKind::Int => ValueKind::Int,
            TypeKind::Uint => ValueKind::Uint,
            TypeKind::Float => ValueKind::Float,
            TypeKind::Complex => ValueKind::Complex,
            TypeKind::Bool => ValueKind::Bool,
            TypeKind::Pointer(_) => ValueKind::Pointer,
            TypeKind::Array { .. } => ValueKind::Array,
            TypeKind::Slice { .. } => ValueKind::Slice,
            TypeKind::String => ValueKind::String,
            TypeKind::Struct { .. } => ValueKind::Struct,
            TypeKind::Map { .. } => ValueKind::Map,
            TypeKind::Chan => ValueKind::Chan,
            TypeKind::Func => ValueKind::Func,
            TypeKind::Interface => ValueKind::Interface,
        }
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, ValueKind::Slice | ValueKind::Array | ValueKind::String)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, ValueKind::Int | ValueKind::Uint)
    }

    /// Kinds that compare against nil only.
    pub fn is_nil_comparable(&self) -> bool {
        matches!(
            self,
            ValueKind::Slice | ValueKind::Map | ValueKind::Chan | ValueKind::Func
        )
    }
}

/// Type of an evaluator value: either a reference into the debug
/// information or a type fabricated by the evaluator (pointer casts,
/// address-of results).
#[derive(Debug, Clone)]
pub enum TypeHandle {
    Debug(TypeRef),
    Synthetic(Arc<TypeMeta>),
}

impl TypeHandle {
    pub fn meta(&self, info: &dyn DebugInfo) -> Result<Arc<TypeMeta>, Error> {
        match self {
            TypeHandle::Debug(type_ref) => info.type_meta(*type_ref),
            TypeHandle::Synthetic(meta) => Ok(meta.clone()),
        }
    }

    pub fn name(&self, info: &dyn DebugInfo) -> String {
        self.meta(info)
            .map(|m| m.display_name().to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }
}

/// Everything value loading needs to reach the target.
#[derive(Clone, Copy)]
pub struct LoadContext<'a> {
    pub info: &'a dyn DebugInfo,
    pub target: &'a dyn TargetControl,
    pub arch: Arch,
    pub mapping_offset: usize,
}

impl<'a> LoadContext<'a> {
    pub fn new(
        info: &'a dyn DebugInfo,
        target: &'a dyn TargetControl,
        arch: Arch,
        mapping_offset: usize,
    ) -> Self {
        Self {
            info,
            target,
            arch,
            mapping_offset,
        }
    }

    fn read(&self, addr: usize, len: usize) -> Result<Bytes, Error> {
        self.target
            .read_memory(RelocatedAddress::from(addr), len)
            .map(Bytes::from)
    }

    fn read_word(&self, addr: usize) -> Result<u64, Error> {
        read_ptr(
            self.target,
            RelocatedAddress::from(addr),
            self.arch.ptr_size,
        )
    }
}

/// Evaluator value. Mirrors a region of target memory typed by the debug
/// information, or carries a bare constant when no storage backs it.
#[derive(Debug, Clone, Default)]
pub struct Variable {
    pub name: Option<String>,
    pub addr: Option<RelocatedAddress>,
    pub type_handle: Option<TypeHandle>,
    pub kind: Option<ValueKind>,
    pub value: Option<Constant>,
    /// Element count for sequences and maps, byte count for strings.
    pub len: i64,
    pub cap: i64,
    /// Data pointer for slice/string/map kinds, pointee for pointers.
    pub base: usize,
    pub stride: i64,
    pub elem_type: Option<TypeRef>,
    pub children: Vec<Variable>,
    pub loaded: bool,
    pub only_addr: bool,
    pub unreadable: Option<String>,
    /// Entries to skip when a map is displayed page by page.
    pub map_skip: usize,
}

impl Variable {
    /// The nil sentinel: no address, no constant, no type.
    pub fn nil() -> Self {
        Variable {
            name: Some("nil".to_string()),
            kind: Some(ValueKind::Nil),
            loaded: true,
            ..Default::default()
        }
    }

    pub fn is_nil(&self) -> bool {
        self.kind == Some(ValueKind::Nil)
    }

    /// Untyped constant value.
    pub fn constant(value: Constant) -> Self {
        let len = match &value {
            Constant::Str(s) => s.len() as i64,
            _ => 0,
        };
        Variable {
            value: Some(value),
            len,
            loaded: true,
            ..Default::default()
        }
    }

    /// Value backed by target memory.
    pub fn with_type(
        name: Option<String>,
        addr: Option<RelocatedAddress>,
        type_handle: TypeHandle,
        ctx: &LoadContext,
    ) -> Result<Self, Error> {
        let meta = type_handle.meta(ctx.info)?;
        Ok(Variable {
            name,
            addr,
            kind: Some(ValueKind::from_meta(&meta)),
            type_handle: Some(type_handle),
            ..Default::default()
        })
    }

    pub fn type_name(&self, info: &dyn DebugInfo) -> String {
        match &self.type_handle {
            Some(handle) => handle.name(info),
            None => match &self.value {
                Some(c) => format!("untyped {}", c.kind_str()),
                None => "nil".to_string(),
            },
        }
    }

    fn meta(&self, info: &dyn DebugInfo) -> Result<Option<Arc<TypeMeta>>, Error> {
        self.type_handle
            .as_ref()
            .map(|h| h.meta(info))
            .transpose()
    }

    /// Mirror the value from target memory. Failures do not abort the load,
    /// they attach to the value (or the offending child) as an unreadable
    /// reason.
    pub fn load_value(&mut self, ctx: &LoadContext) {
        if self.loaded || self.only_addr {
            return;
        }
        self.loaded = true;

        if let Err(e) = self.load_value_internal(ctx) {
            self.unreadable = Some(e.to_string());
        }
    }

    fn load_value_internal(&mut self, ctx: &LoadContext) -> Result<(), Error> {
        let Some(meta) = self.meta(ctx.info)? else {
            return Ok(());
        };
        let Some(addr) = self.addr else {
            return Ok(());
        };
        let addr = addr.as_usize();

        match &meta.kind {
            TypeKind::Int => {
                let buf = ctx.read(addr, meta.byte_size as usize)?;
                self.value = Some(Constant::Int(BigInt::from(sign_extend(&buf))));
            }
            TypeKind::Uint => {
                let buf = ctx.read(addr, meta.byte_size as usize)?;
                self.value = Some(Constant::Int(BigInt::from(zero_extend(&buf))));
            }
            TypeKind::Bool => {
                let buf = ctx.read(addr, 1)?;
                self.value = Some(Constant::Bool(buf[0] != 0));
            }
            TypeKind::Float => {
                let buf = ctx.read(addr, meta.byte_size as usize)?;
                self.value = Some(Constant::Float(read_float(&buf)));
            }
            TypeKind::Complex => {
                let half = meta.byte_size as usize / 2;
                let re = read_float(&ctx.read(addr, half)?);
                let im = read_float(&ctx.read(addr + half, half)?);
                self.value = Some(Constant::Complex(Complex64::new(re, im)));
            }
            TypeKind::String => {
                self.base = ctx.read_word(addr)? as usize;
                self.len = ctx.read_word(addr + ctx.arch.ptr_size)? as i64;
                self.stride = 1;
                let load_len = self.len.min(MAX_STR_LEN).max(0);
                let data = ctx.read(self.base, load_len as usize)?;
                let s = String::from_utf8_lossy(&data).into_owned();
                self.value = Some(Constant::Str(s));
            }
            TypeKind::Pointer(_) => {
                self.base = ctx.read_word(addr)? as usize;
            }
            TypeKind::Array { elem, len } => {
                let elem_meta = ctx.info.type_meta(*elem)?;
                self.base = addr;
                self.len = *len;
                self.cap = *len;
                self.stride = elem_meta.byte_size as i64;
                self.elem_type = Some(*elem);
                self.load_children(ctx)?;
            }
            TypeKind::Slice { elem } => {
                let elem_meta = ctx.info.type_meta(*elem)?;
                self.base = ctx.read_word(addr)? as usize;
                self.len = ctx.read_word(addr + ctx.arch.ptr_size)? as i64;
                self.cap = ctx.read_word(addr + 2 * ctx.arch.ptr_size)? as i64;
                self.stride = elem_meta.byte_size as i64;
                self.elem_type = Some(*elem);
                self.load_children(ctx)?;
            }
            TypeKind::Struct { fields } => {
                for field in fields {
                    let mut child = Variable::with_type(
                        Some(field.name.clone()),
                        Some(RelocatedAddress::from(addr + field.offset)),
                        TypeHandle::Debug(field.type_ref),
                        ctx,
                    )?;
                    child.load_value(ctx);
                    self.children.push(child);
                }
                self.len = self.children.len() as i64;
            }
            TypeKind::Map { .. } => {
                // map header is a single pointer to the runtime hash table
                self.base = ctx.read_word(addr)? as usize;
                if self.base != 0 {
                    let mut it = self.map_iterator(ctx)?;
                    self.len = it.count;
                    while let Some((key, value)) = it.next(ctx)? {
                        self.children.push(key);
                        self.children.push(value);
                    }
                }
            }
            TypeKind::Chan | TypeKind::Func | TypeKind::Interface => {
                self.base = ctx.read_word(addr)? as usize;
            }
        }

        Ok(())
    }

    fn load_children(&mut self, ctx: &LoadContext) -> Result<(), Error> {
        let elem = self.elem_type.expect("sequence must have element type");
        let count = self.len.min(MAX_CHILDREN).max(0);
        for i in 0..count {
            let child_addr = self.base + (i * self.stride) as usize;
            let mut child = Variable::with_type(
                Some(format!("[{i}]")),
                Some(RelocatedAddress::from(child_addr)),
                TypeHandle::Debug(elem),
                ctx,
            )?;
            child.load_value(ctx);
            self.children.push(child);
        }
        Ok(())
    }

    /// Sequence element by index, bounds checked against the length.
    pub fn slice_access(&self, idx: i64, ctx: &LoadContext) -> Result<Variable, Error> {
        if idx < 0 || idx >= self.len {
            return Err(Error::Arithmetic("index out of bounds".to_string()));
        }
        let elem = self
            .elem_type
            .ok_or(Error::Unsupported("sequence without element type"))?;
        Variable::with_type(
            None,
            Some(RelocatedAddress::from(
                self.base + (idx * self.stride) as usize,
            )),
            TypeHandle::Debug(elem),
            ctx,
        )
    }

    /// Share a subrange of the underlying storage.
    pub fn reslice(&self, low: i64, high: i64, ctx: &LoadContext) -> Result<Variable, Error> {
        if low < 0 || low > self.len || high < low || high > self.len {
            return Err(Error::Arithmetic("index out of bounds".to_string()));
        }

        if self.kind == Some(ValueKind::String) {
            let base = self.base + low as usize;
            let data = ctx.read(base, (high - low) as usize)?;
            return Ok(Variable {
                kind: Some(ValueKind::String),
                type_handle: self.type_handle.clone(),
                value: Some(Constant::Str(String::from_utf8_lossy(&data).into_owned())),
                base,
                len: high - low,
                stride: 1,
                loaded: true,
                ..Default::default()
            });
        }

        let elem = self
            .elem_type
            .ok_or(Error::Unsupported("sequence without element type"))?;
        let elem_meta = ctx.info.type_meta(elem)?;

        // arrays reslice into slice-typed results
        let type_handle = match self.kind {
            Some(ValueKind::Array) => TypeHandle::Synthetic(Arc::new(TypeMeta {
                name: Some(format!("[]{}", elem_meta.display_name())),
                byte_size: 3 * ctx.arch.ptr_size as u64,
                kind: TypeKind::Slice { elem },
            })),
            _ => self
                .type_handle
                .clone()
                .ok_or(Error::Unsupported("reslice of untyped value"))?,
        };

        let mut result = Variable {
            name: None,
            addr: None,
            kind: Some(ValueKind::Slice),
            type_handle: Some(type_handle),
            base: self.base + (low * self.stride) as usize,
            len: high - low,
            cap: high - low,
            stride: self.stride,
            elem_type: Some(elem),
            loaded: true,
            ..Default::default()
        };
        result.load_children(ctx)?;
        Ok(result)
    }

    /// Project a struct field out of the value.
    pub fn struct_member(&self, member: &str, ctx: &LoadContext) -> Result<Variable, Error> {
        let meta = self
            .meta(ctx.info)?
            .ok_or(Error::Unsupported("field access on untyped value"))?;

        // implicit dereference, `x.y` works through a pointer to struct
        if let TypeKind::Pointer(_) = meta.kind {
            let pointee = self.clone_loaded(ctx).maybe_dereference(ctx)?;
            return pointee.struct_member(member, ctx);
        }

        let addr = self
            .addr
            .ok_or(Error::Unsupported("field access on value without address"))?;
        let field = meta.field(member).ok_or_else(|| {
            Error::IdentUnknown(format!("{}.{member}", meta.display_name()))
        })?;

        Variable::with_type(
            Some(member.to_string()),
            Some(addr.offset(field.offset as isize)),
            TypeHandle::Debug(field.type_ref),
            ctx,
        )
    }

    fn clone_loaded(&self, ctx: &LoadContext) -> Variable {
        let mut v = self.clone();
        v.load_value(ctx);
        v
    }

    /// Follow a pointer: produce the pointee value.
    pub fn maybe_dereference(&self, ctx: &LoadContext) -> Result<Variable, Error> {
        let meta = self
            .meta(ctx.info)?
            .ok_or(Error::Unsupported("dereference of untyped value"))?;
        let TypeKind::Pointer(pointee) = meta.kind else {
            return Err(Error::TypeMismatch(
                meta.display_name().to_string(),
                "pointer".to_string(),
            ));
        };
        let pointee = pointee.ok_or(Error::Unsupported("dereference of opaque pointer"))?;

        let target_addr = if self.loaded || self.base != 0 {
            self.base
        } else {
            let addr = self
                .addr
                .ok_or(Error::Unsupported("dereference of value without address"))?;
            ctx.read_word(addr.as_usize())? as usize
        };

        if target_addr == 0 {
            return Err(Error::NilDeref);
        }

        Variable::with_type(
            None,
            Some(RelocatedAddress::from(target_addr)),
            TypeHandle::Debug(pointee),
            ctx,
        )
    }

    /// Iterator over live entries of a map value.
    pub fn map_iterator(&self, ctx: &LoadContext) -> Result<MapIterator, Error> {
        let meta = self
            .meta(ctx.info)?
            .ok_or(Error::Unsupported("map iteration on untyped value"))?;
        let TypeKind::Map { key, value, hash } = meta.kind else {
            return Err(Error::TypeMismatch(
                meta.display_name().to_string(),
                "map".to_string(),
            ));
        };

        MapIterator::new(ctx, self.base, key, value, hash)
    }
}

/// Walks the runtime hash table of a map: buckets in order, slots with a
/// non-empty tophash, then the overflow chain of each bucket.
pub struct MapIterator {
    pub count: i64,
    key_type: TypeRef,
    value_type: TypeRef,
    buckets_base: usize,
    bucket_size: usize,
    num_buckets: usize,
    slots_per_bucket: usize,
    tophash_offset: usize,
    keys_offset: usize,
    values_offset: usize,
    overflow_offset: usize,
    key_stride: usize,
    value_stride: usize,
    bucket_idx: usize,
    bucket_addr: usize,
    slot: usize,
}

impl MapIterator {
    fn new(
        ctx: &LoadContext,
        hmap_addr: usize,
        key_type: TypeRef,
        value_type: TypeRef,
        hash_type: TypeRef,
    ) -> Result<Self, Error> {
        let hash_meta = ctx.info.type_meta(hash_type)?;
        let field = |name: &str| {
            hash_meta
                .field(name)
                .cloned()
                .ok_or_else(|| Error::Unreadable(format!("hash table has no `{name}` field")))
        };

        let count_field = field("count")?;
        let b_field = field("B")?;
        let buckets_field = field("buckets")?;

        let count = {
            let count_meta = ctx.info.type_meta(count_field.type_ref)?;
            let buf = ctx.read(hmap_addr + count_field.offset, count_meta.byte_size as usize)?;
            sign_extend(&buf)
        };
        let b = ctx.read(hmap_addr + b_field.offset, 1)?[0];
        let buckets_base = ctx.read_word(hmap_addr + buckets_field.offset)? as usize;

        // bucket layout comes from the pointee of the `buckets` field
        let buckets_ptr_meta = ctx.info.type_meta(buckets_field.type_ref)?;
        let TypeKind::Pointer(Some(bucket_ref)) = buckets_ptr_meta.kind else {
            return Err(Error::Unreadable("map buckets field is not a pointer".to_string()));
        };
        let bucket_meta = ctx.info.type_meta(bucket_ref)?;
        let bucket_field = |name: &str| {
            bucket_meta
                .field(name)
                .cloned()
                .ok_or_else(|| Error::Unreadable(format!("map bucket has no `{name}` field")))
        };

        let tophash = bucket_field("tophash")?;
        let keys = bucket_field("keys")?;
        let values = bucket_field("values")?;
        let overflow = bucket_field("overflow")?;

        let tophash_meta = ctx.info.type_meta(tophash.type_ref)?;
        let TypeKind::Array { len: slots, .. } = tophash_meta.kind else {
            return Err(Error::Unreadable("map bucket tophash is not an array".to_string()));
        };

        let key_stride = ctx.info.type_meta(key_type)?.byte_size as usize;
        let value_stride = ctx.info.type_meta(value_type)?.byte_size as usize;

        Ok(MapIterator {
            count,
            key_type,
            value_type,
            buckets_base,
            bucket_size: bucket_meta.byte_size as usize,
            num_buckets: 1usize << b,
            slots_per_bucket: slots as usize,
            tophash_offset: tophash.offset,
            keys_offset: keys.offset,
            values_offset: values.offset,
            overflow_offset: overflow.offset,
            key_stride,
            value_stride,
            bucket_idx: 0,
            bucket_addr: buckets_base,
            slot: 0,
        })
    }

    /// Next live key/value pair, keys and values loaded lazily by the caller.
    pub fn next(&mut self, ctx: &LoadContext) -> Result<Option<(Variable, Variable)>, Error> {
        loop {
            if self.bucket_idx >= self.num_buckets {
                return Ok(None);
            }

            if self.slot >= self.slots_per_bucket {
                // follow the overflow chain before moving to the next bucket
                let overflow = ctx.read_word(self.bucket_addr + self.overflow_offset)? as usize;
                if overflow != 0 {
                    self.bucket_addr = overflow;
                } else {
                    self.bucket_idx += 1;
                    self.bucket_addr = self.buckets_base + self.bucket_idx * self.bucket_size;
                }
                self.slot = 0;
                continue;
            }

            let slot = self.slot;
            self.slot += 1;

            let tophash = ctx.read(self.bucket_addr + self.tophash_offset + slot, 1)?[0];
            if tophash == 0 {
                continue;
            }

            let key_addr = self.bucket_addr + self.keys_offset + slot * self.key_stride;
            let value_addr = self.bucket_addr + self.values_offset + slot * self.value_stride;

            let key = Variable::with_type(
                None,
                Some(RelocatedAddress::from(key_addr)),
                TypeHandle::Debug(self.key_type),
                ctx,
            )?;
            let value = Variable::with_type(
                None,
                Some(RelocatedAddress::from(value_addr)),
                TypeHandle::Debug(self.value_type),
                ctx,
            )?;
            return Ok(Some((key, value)));
        }
    }
}

fn sign_extend(buf: &[u8]) -> i64 {
    let mut val = 0i64;
    for (i, b) in buf.iter().enumerate().take(8) {
        val |= (*b as i64) << (i * 8);
    }
    let bits = (buf.len().min(8) * 8) as u32;
    if bits < 64 {
        let shift = 64 - bits;
        (val << shift) >> shift
    } else {
        val
    }
}

fn zero_extend(buf: &[u8]) -> u64 {
    let mut val = 0u64;
    for (i, b) in buf.iter().enumerate().take(8) {
        val |= (*b as u64) << (i * 8);
    }
    val
}

fn read_float(buf: &[u8]) -> f64 {
    match buf.len() {
        4 => f32::from_le_bytes(buf.try_into().expect("4 bytes")) as f64,
        _ => f64::from_le_bytes(buf[..8].try_into().expect("8 bytes")),
    }
}
