//! The DWARF backed symbol oracle.
//!
//! One pass over the debug sections indexes functions, line rows, global
//! and scoped variables; types are resolved lazily by their section offset.
//! Go specific shapes (slices, strings, maps, channels) are recognized by
//! the runtime naming conventions of the compiler.

use crate::debugger::address::GlobalAddress;
use crate::debugger::debug_info::{
    DebugInfo, Field, Function, Place, TypeKind, TypeMeta, TypeRef, VarLocation, VariableMeta,
};
use crate::debugger::error::Error;
use gimli::{
    AttributeValue, BaseAddresses, CfaRule, DebugFrame, DebugInfoOffset, DwTag, EhFrame,
    Operation, Reader, Register, RunTimeEndian, Section, SectionId, UnitOffset,
    UnitSectionOffset, UnwindSection,
};
use log::{debug, warn};
use object::{Object, ObjectSection, ObjectSymbol};
use rayon::prelude::*;
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub type EndianArcSlice = gimli::EndianArcSlice<RunTimeEndian>;

/// x86-64 stack pointer in the DWARF numbering.
const SP_REGISTER: Register = Register(7);

fn load_section(
    id: SectionId,
    file: &object::File,
    endian: RunTimeEndian,
) -> Result<EndianArcSlice, Error> {
    let data = file
        .section_by_name(id.name())
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[]));
    Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
}

/// Load every debug section up front, in parallel inside the rayon pool.
fn load_dwarf(
    file: &object::File,
    endian: RunTimeEndian,
) -> Result<gimli::Dwarf<EndianArcSlice>, Error> {
    const SECTIONS: &[SectionId] = &[
        SectionId::DebugAbbrev,
        SectionId::DebugAddr,
        SectionId::DebugAranges,
        SectionId::DebugInfo,
        SectionId::DebugLine,
        SectionId::DebugLineStr,
        SectionId::DebugStr,
        SectionId::DebugStrOffsets,
        SectionId::DebugTypes,
        SectionId::DebugLoc,
        SectionId::DebugLocLists,
        SectionId::DebugRanges,
        SectionId::DebugRngLists,
    ];

    let loaded: Result<Vec<(&'static str, EndianArcSlice)>, Error> = SECTIONS
        .par_iter()
        .map(|&id| Ok((id.name(), load_section(id, file, endian)?)))
        .collect();
    let loaded: HashMap<&'static str, EndianArcSlice> = loaded?.into_iter().collect();

    gimli::Dwarf::load(|id| -> Result<EndianArcSlice, Error> {
        Ok(loaded
            .get(id.name())
            .cloned()
            .unwrap_or_else(|| gimli::EndianArcSlice::new(Arc::from(&[][..]), endian)))
    })
}

struct ParsedUnit {
    unit: gimli::Unit<EndianArcSlice>,
    /// Section offset of the unit start, converts unit refs into [`TypeRef`]s.
    section_start: u64,
}

/// Debug information of a single executable.
pub struct DwarfInfo {
    dwarf: gimli::Dwarf<EndianArcSlice>,
    units: Vec<ParsedUnit>,
    functions: Vec<Function>,
    places: Vec<Place>,
    symbols: HashMap<String, GlobalAddress>,
    globals: HashMap<String, VariableMeta>,
    scope_vars: Vec<(Vec<gimli::Range>, VariableMeta)>,
    types_by_name: HashMap<String, TypeRef>,
    type_cache: RefCell<HashMap<u64, Arc<TypeMeta>>>,
    eh_frame: EhFrame<EndianArcSlice>,
    debug_frame: DebugFrame<EndianArcSlice>,
    bases: BaseAddresses,
}

impl DwarfInfo {
    pub fn build(file: &object::File) -> Result<Self, Error> {
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let eh_frame = EhFrame::load(|id| load_section(id, file, endian))?;
        let debug_frame = DebugFrame::load(|id| load_section(id, file, endian))?;

        let section_addr = |name: &str| -> Option<u64> {
            file.sections().find_map(|section| {
                if section.name().ok()? == name {
                    Some(section.address())
                } else {
                    None
                }
            })
        };
        let mut bases = BaseAddresses::default();
        if let Some(got) = section_addr(".got") {
            bases = bases.set_got(got);
        }
        if let Some(text) = section_addr(".text") {
            bases = bases.set_text(text);
        }
        if let Some(eh) = section_addr(".eh_frame") {
            bases = bases.set_eh_frame(eh);
        }
        if let Some(eh_frame_hdr) = section_addr(".eh_frame_hdr") {
            bases = bases.set_eh_frame_hdr(eh_frame_hdr);
        }

        let dwarf = load_dwarf(file, endian)?;

        let symbols = file
            .symbols()
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                (!name.is_empty()).then(|| (name.to_string(), GlobalAddress::from(sym.address())))
            })
            .collect();

        let mut this = DwarfInfo {
            dwarf,
            units: vec![],
            functions: vec![],
            places: vec![],
            symbols,
            globals: HashMap::new(),
            scope_vars: vec![],
            types_by_name: HashMap::new(),
            type_cache: RefCell::default(),
            eh_frame,
            debug_frame,
            bases,
        };
        this.index_units()?;
        Ok(this)
    }

    fn index_units(&mut self) -> Result<(), Error> {
        let mut headers = vec![];
        let mut iter = self.dwarf.units();
        while let Some(header) = iter.next()? {
            headers.push(header);
        }

        for header in headers {
            let section_start = match header.offset() {
                UnitSectionOffset::DebugInfoOffset(offset) => offset.0 as u64,
                UnitSectionOffset::DebugTypesOffset(offset) => offset.0 as u64,
            };
            let unit = self.dwarf.unit(header)?;
            self.index_unit(&unit, section_start)?;
            self.index_line_program(&unit)?;
            self.units.push(ParsedUnit {
                unit,
                section_start,
            });
        }

        self.functions.sort_by_key(|f| u64::from(f.entry()));
        self.places.sort_by_key(|p| p.address);
        Ok(())
    }

    fn index_unit(
        &mut self,
        unit: &gimli::Unit<EndianArcSlice>,
        section_start: u64,
    ) -> Result<(), Error> {
        let mut current_fn_ranges: Vec<gimli::Range> = vec![];
        let mut fn_depth = 0isize;
        let mut depth = 0isize;

        let mut entries = unit.entries();
        while let Some((delta_depth, entry)) = entries.next_dfs()? {
            depth += delta_depth;

            let name = self.entry_name(unit, entry)?;
            let type_ref = self.entry_type_ref(unit, entry, section_start)?;

            match entry.tag() {
                gimli::DW_TAG_subprogram => {
                    let ranges = self.entry_ranges(unit, entry)?;
                    if let Some(name) = name {
                        if !ranges.is_empty() {
                            current_fn_ranges = ranges.clone();
                            fn_depth = depth;
                            self.functions.push(Function { name, ranges });
                            continue;
                        }
                    }
                    current_fn_ranges = vec![];
                    fn_depth = depth;
                }
                gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
                    let Some(name) = name else { continue };
                    let location = self.entry_location(unit, entry)?;
                    let meta = VariableMeta {
                        name: name.clone(),
                        type_ref,
                        location,
                    };

                    let inside_function = depth > fn_depth && !current_fn_ranges.is_empty();
                    if inside_function {
                        self.scope_vars.push((current_fn_ranges.clone(), meta));
                    } else if matches!(location, VarLocation::Static(_)) {
                        self.globals.insert(name, meta);
                    }
                }
                tag if is_type_tag(tag) => {
                    if let (Some(name), Some(offset)) =
                        (name, entry.offset().to_debug_info_offset(&unit.header))
                    {
                        self.types_by_name
                            .entry(name)
                            .or_insert(TypeRef(offset.0 as u64));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn index_line_program(&mut self, unit: &gimli::Unit<EndianArcSlice>) -> Result<(), Error> {
        let Some(program) = unit.line_program.clone() else {
            return Ok(());
        };

        let mut rows = program.rows();
        while let Some((header, row)) = rows.next_row()? {
            if row.end_sequence() {
                continue;
            }
            let Some(line) = row.line() else { continue };

            let mut path = PathBuf::new();
            if let Some(file) = row.file(header) {
                if let Some(dir) = file.directory(header) {
                    if let Some(dir) = self
                        .dwarf
                        .attr_string(unit, dir)
                        .ok()
                        .and_then(|s| s.to_string_lossy().map(|d| d.into_owned()).ok())
                    {
                        path.push(dir);
                    }
                }
                if let Some(file_name) = self
                    .dwarf
                    .attr_string(unit, file.path_name())
                    .ok()
                    .and_then(|s| s.to_string_lossy().map(|f| f.into_owned()).ok())
                {
                    path.push(file_name);
                }
            }

            self.places.push(Place {
                file: path,
                line_number: line.get(),
                address: GlobalAddress::from(row.address()),
                is_stmt: row.is_stmt(),
            });
        }
        Ok(())
    }

    fn entry_name(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
    ) -> Result<Option<String>, Error> {
        let Some(attr) = entry.attr(gimli::DW_AT_name)? else {
            return Ok(None);
        };
        Ok(self
            .dwarf
            .attr_string(unit, attr.value())
            .ok()
            .and_then(|s| s.to_string_lossy().map(|name| name.into_owned()).ok()))
    }

    fn entry_type_ref(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
        section_start: u64,
    ) -> Result<Option<TypeRef>, Error> {
        match entry.attr_value(gimli::DW_AT_type)? {
            Some(AttributeValue::UnitRef(offset)) => {
                Ok(Some(TypeRef(section_start + offset.0 as u64)))
            }
            Some(AttributeValue::DebugInfoRef(DebugInfoOffset(offset))) => {
                Ok(Some(TypeRef(offset as u64)))
            }
            _ => Ok(None),
        }
    }

    fn entry_ranges(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
    ) -> Result<Vec<gimli::Range>, Error> {
        let mut ranges = vec![];
        let mut iter = self.dwarf.die_ranges(unit, entry)?;
        while let Some(range) = iter.next()? {
            if range.begin != range.end {
                ranges.push(range);
            }
        }
        Ok(ranges)
    }

    fn entry_location(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
    ) -> Result<VarLocation, Error> {
        let Some(AttributeValue::Exprloc(expression)) =
            entry.attr_value(gimli::DW_AT_location)?
        else {
            return Ok(VarLocation::Unknown);
        };

        let mut ops = expression.operations(unit.encoding());
        match ops.next() {
            Ok(Some(Operation::Address { address })) => {
                Ok(VarLocation::Static(GlobalAddress::from(address)))
            }
            Ok(Some(Operation::FrameOffset { offset })) => Ok(VarLocation::FrameOffset(offset)),
            _ => Ok(VarLocation::Unknown),
        }
    }

    fn unit_for_offset(&self, offset: u64) -> Option<&ParsedUnit> {
        self.units
            .iter()
            .take_while(|u| u.section_start <= offset)
            .last()
    }

    /// Assemble the [`TypeMeta`] of a DIE. Referenced types stay references,
    /// recursion in the type graph terminates naturally.
    fn build_type(&self, type_ref: TypeRef) -> Result<TypeMeta, Error> {
        let parsed = self
            .unit_for_offset(type_ref.0)
            .ok_or_else(|| Error::TypeNotFound(format!("offset {:#x}", type_ref.0)))?;
        let unit = &parsed.unit;
        let offset = UnitOffset((type_ref.0 - parsed.section_start) as usize);
        let entry = unit.entry(offset)?;

        let name = self.entry_name(unit, &entry)?;
        let byte_size = entry
            .attr(gimli::DW_AT_byte_size)?
            .and_then(|attr| attr.udata_value())
            .unwrap_or(0);
        let referenced = self.entry_type_ref(unit, &entry, parsed.section_start)?;

        let kind = match entry.tag() {
            gimli::DW_TAG_base_type => match entry.attr_value(gimli::DW_AT_encoding)? {
                Some(AttributeValue::Encoding(gimli::DW_ATE_signed))
                | Some(AttributeValue::Encoding(gimli::DW_ATE_signed_char)) => TypeKind::Int,
                Some(AttributeValue::Encoding(gimli::DW_ATE_unsigned))
                | Some(AttributeValue::Encoding(gimli::DW_ATE_unsigned_char))
                | Some(AttributeValue::Encoding(gimli::DW_ATE_address)) => TypeKind::Uint,
                Some(AttributeValue::Encoding(gimli::DW_ATE_float)) => TypeKind::Float,
                Some(AttributeValue::Encoding(gimli::DW_ATE_complex_float)) => TypeKind::Complex,
                Some(AttributeValue::Encoding(gimli::DW_ATE_boolean)) => TypeKind::Bool,
                other => {
                    debug!(target: "dwarf-loader", "unexpected base type encoding: {other:?}");
                    TypeKind::Uint
                }
            },
            gimli::DW_TAG_pointer_type => TypeKind::Pointer(referenced),
            gimli::DW_TAG_array_type => {
                let elem =
                    referenced.ok_or(Error::NoDebugInformation("array element type"))?;
                TypeKind::Array {
                    elem,
                    len: self.array_len(parsed, &entry)?,
                }
            }
            gimli::DW_TAG_subroutine_type => TypeKind::Func,
            gimli::DW_TAG_structure_type => {
                self.structure_kind(parsed, &entry, name.as_deref())?
            }
            gimli::DW_TAG_typedef => {
                return self.typedef_kind(name, byte_size, referenced);
            }
            gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
                let inner =
                    referenced.ok_or(Error::NoDebugInformation("qualified type target"))?;
                return Ok((*self.type_meta(inner)?).clone());
            }
            other => {
                warn!(target: "dwarf-loader", "unsupported type tag {other}");
                TypeKind::Uint
            }
        };

        Ok(TypeMeta {
            name,
            byte_size,
            kind,
        })
    }

    /// Go emits slices, strings, interfaces and hash tables as structures
    /// following runtime naming conventions.
    fn structure_kind(
        &self,
        parsed: &ParsedUnit,
        entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
        name: Option<&str>,
    ) -> Result<TypeKind, Error> {
        let fields = self.structure_fields(parsed, entry)?;

        match name {
            Some("string") => return Ok(TypeKind::String),
            Some("runtime.iface") | Some("runtime.eface") => return Ok(TypeKind::Interface),
            Some(n) if n.starts_with("[]") => {
                let elem_ptr = fields
                    .iter()
                    .find(|f| f.name == "array")
                    .ok_or(Error::NoDebugInformation("slice data pointer"))?;
                let ptr_meta = self.type_meta(elem_ptr.type_ref)?;
                let TypeKind::Pointer(Some(elem)) = ptr_meta.kind else {
                    return Err(Error::NoDebugInformation("slice element type"));
                };
                return Ok(TypeKind::Slice { elem });
            }
            Some(n) if n.starts_with("interface") => return Ok(TypeKind::Interface),
            _ => {}
        }

        Ok(TypeKind::Struct { fields })
    }

    fn structure_fields(
        &self,
        parsed: &ParsedUnit,
        entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
    ) -> Result<Vec<Field>, Error> {
        let unit = &parsed.unit;
        let mut fields = vec![];

        let mut tree = unit.entries_tree(Some(entry.offset()))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let child_entry = child.entry();
            if child_entry.tag() != gimli::DW_TAG_member {
                continue;
            }
            let Some(name) = self.entry_name(unit, child_entry)? else {
                continue;
            };
            let Some(type_ref) =
                self.entry_type_ref(unit, child_entry, parsed.section_start)?
            else {
                continue;
            };
            let offset = child_entry
                .attr(gimli::DW_AT_data_member_location)?
                .and_then(|attr| attr.udata_value())
                .unwrap_or(0) as usize;
            fields.push(Field {
                name,
                offset,
                type_ref,
            });
        }
        Ok(fields)
    }

    fn array_len(
        &self,
        parsed: &ParsedUnit,
        entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
    ) -> Result<i64, Error> {
        let unit = &parsed.unit;
        let mut tree = unit.entries_tree(Some(entry.offset()))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let child_entry = child.entry();
            if child_entry.tag() != gimli::DW_TAG_subrange_type {
                continue;
            }
            if let Some(attr) = child_entry.attr(gimli::DW_AT_count)? {
                return Ok(attr.udata_value().unwrap_or(0) as i64);
            }
            if let Some(attr) = child_entry.attr(gimli::DW_AT_upper_bound)? {
                return Ok(attr.udata_value().map(|u| u as i64 + 1).unwrap_or(0));
            }
        }
        Ok(0)
    }

    /// Typedefs mostly resolve through to their target; Go map and channel
    /// headers are recognized here by name.
    fn typedef_kind(
        &self,
        name: Option<String>,
        byte_size: u64,
        referenced: Option<TypeRef>,
    ) -> Result<TypeMeta, Error> {
        let target =
            referenced.ok_or(Error::NoDebugInformation("typedef target"))?;
        let target_meta = self.type_meta(target)?;

        if let Some(type_name) = name.as_deref() {
            if type_name.starts_with("map[") {
                // the map header is a pointer to the runtime hash table
                if let TypeKind::Pointer(Some(hash)) = target_meta.kind {
                    let (key, value) = self.map_key_value(hash)?;
                    return Ok(TypeMeta {
                        name,
                        byte_size: byte_size.max(8),
                        kind: TypeKind::Map { key, value, hash },
                    });
                }
            }
            if type_name.starts_with("chan ") || type_name.starts_with("chan<-") {
                return Ok(TypeMeta {
                    name,
                    byte_size: byte_size.max(8),
                    kind: TypeKind::Chan,
                });
            }
            if type_name.starts_with("func(") {
                return Ok(TypeMeta {
                    name,
                    byte_size: byte_size.max(8),
                    kind: TypeKind::Func,
                });
            }
        }

        let mut meta = (*target_meta).clone();
        if name.is_some() {
            meta.name = name;
        }
        Ok(meta)
    }

    /// Key and value types of a map, recovered from the bucket layout of
    /// its hash table struct.
    fn map_key_value(&self, hash: TypeRef) -> Result<(TypeRef, TypeRef), Error> {
        let hash_meta = self.type_meta(hash)?;
        let buckets = hash_meta
            .field("buckets")
            .ok_or(Error::NoDebugInformation("map buckets"))?;
        let buckets_meta = self.type_meta(buckets.type_ref)?;
        let TypeKind::Pointer(Some(bucket)) = buckets_meta.kind else {
            return Err(Error::NoDebugInformation("map bucket type"));
        };
        let bucket_meta = self.type_meta(bucket)?;

        let elem_of = |field_name: &str| -> Result<TypeRef, Error> {
            let field = bucket_meta
                .field(field_name)
                .ok_or(Error::NoDebugInformation("map bucket layout"))?;
            let array_meta = self.type_meta(field.type_ref)?;
            match array_meta.kind {
                TypeKind::Array { elem, .. } => Ok(elem),
                _ => Err(Error::NoDebugInformation("map bucket layout")),
            }
        };

        Ok((elem_of("keys")?, elem_of("values")?))
    }
}

fn is_type_tag(tag: DwTag) -> bool {
    matches!(
        tag,
        gimli::DW_TAG_base_type
            | gimli::DW_TAG_pointer_type
            | gimli::DW_TAG_array_type
            | gimli::DW_TAG_structure_type
            | gimli::DW_TAG_typedef
            | gimli::DW_TAG_subroutine_type
    )
}

impl DebugInfo for DwarfInfo {
    fn function_by_name(&self, name: &str) -> Option<Function> {
        self.functions.iter().find(|f| f.name == name).cloned()
    }

    fn function_by_pc(&self, pc: GlobalAddress) -> Option<Function> {
        self.functions.iter().find(|f| f.contains(pc)).cloned()
    }

    fn place_from_pc(&self, pc: GlobalAddress) -> Option<Place> {
        let idx = self
            .places
            .partition_point(|place| place.address <= pc);
        idx.checked_sub(1).map(|i| self.places[i].clone())
    }

    fn places_for_line(&self, file: &str, line: u64) -> Vec<Place> {
        self.places
            .iter()
            .filter(|p| p.is_stmt && p.line_number == line && p.file.ends_with(file))
            .cloned()
            .collect()
    }

    fn function_places(&self, function: &Function) -> Vec<Place> {
        self.places
            .iter()
            .filter(|p| p.address.in_ranges(&function.ranges))
            .cloned()
            .collect()
    }

    fn symbol_address(&self, name: &str) -> Option<GlobalAddress> {
        self.symbols.get(name).copied()
    }

    fn type_by_name(&self, name: &str) -> Option<TypeRef> {
        self.types_by_name.get(name).copied()
    }

    fn type_meta(&self, type_ref: TypeRef) -> Result<Arc<TypeMeta>, Error> {
        if let Some(meta) = self.type_cache.borrow().get(&type_ref.0) {
            return Ok(meta.clone());
        }
        let meta = Arc::new(self.build_type(type_ref)?);
        self.type_cache
            .borrow_mut()
            .insert(type_ref.0, meta.clone());
        Ok(meta)
    }

    fn scope_variables(&self, pc: GlobalAddress) -> Vec<VariableMeta> {
        self.scope_vars
            .iter()
            .filter(|(ranges, _)| pc.in_ranges(ranges))
            .map(|(_, meta)| meta.clone())
            .collect()
    }

    fn global_variable(&self, name: &str) -> Option<VariableMeta> {
        self.globals.get(name).cloned()
    }

    fn cfa_offset(&self, pc: GlobalAddress) -> Result<i64, Error> {
        let mut ucx = Box::new(gimli::UnwindContext::new());

        let row = match self.eh_frame.fde_for_address(
            &self.bases,
            pc.into(),
            EhFrame::cie_from_offset,
        ) {
            Ok(fde) => {
                fde.unwind_info_for_address(&self.eh_frame, &self.bases, &mut ucx, pc.into())?
                    .clone()
            }
            Err(gimli::Error::NoUnwindInfoForAddress) | Err(gimli::Error::UnexpectedEof(_)) => {
                let fde = self
                    .debug_frame
                    .fde_for_address(&self.bases, pc.into(), DebugFrame::cie_from_offset)
                    .map_err(|_| Error::NoFrameDescription(pc))?;
                fde.unwind_info_for_address(&self.debug_frame, &self.bases, &mut ucx, pc.into())?
                    .clone()
            }
            Err(e) => return Err(e.into()),
        };

        match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } if *register == SP_REGISTER => {
                Ok(*offset)
            }
            other => {
                debug!(target: "dwarf-loader", "unsupported cfa rule at {pc}: {other:?}");
                Err(Error::NoFrameDescription(pc))
            }
        }
    }
}
