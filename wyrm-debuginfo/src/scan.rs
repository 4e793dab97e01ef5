//! Per-unit scanning of DIEs into the name index.
//!
//! One worker indexes one compilation unit: it compiles the unit's abbreviation table, then
//! interprets the resulting instruction stream over the unit's DIEs. The scanner tracks its
//! depth in the DIE tree and only considers entries directly below the unit DIE, with one
//! exception: enumerators one level deeper are indexed under the offset of their enumeration
//! type, so a lookup by enumerator name finds the enum that defines it.

use gimli::constants;
use gimli::DwTag;

use crate::abbrev::{self, AbbrevTable};
use crate::elf::ElfFile;
use crate::error::{Error, ErrorKind};
use crate::index::{IndexFlags, NameLoc, NameSection, ShardList};
use crate::line::FileNameTable;
use crate::reader::Reader;
use crate::unit::Unit;

/// Bound on `DW_AT_specification` chains; a longer chain is a cycle in all but name.
const MAX_SPECIFICATION_CHAIN: usize = 64;

/// The attributes of one DIE, collected while executing its instruction stream.
#[derive(Clone, Copy, Default)]
struct DieRecord<'data> {
    /// Absolute offset of the next sibling within `.debug_info`, if recorded.
    sibling: Option<u64>,
    name: Option<NameLoc<'data>>,
    stmt_list: Option<u64>,
    /// 0 means "no file".
    decl_file: u64,
    /// Absolute offset of the specification DIE within `.debug_info`, if any.
    specification: Option<u64>,
    flags: u8,
}

/// Indexes every matching DIE of one compilation unit.
pub(crate) fn index_unit(
    files: &[ElfFile],
    unit: &Unit,
    flags: IndexFlags,
    shards: &ShardList,
) -> Result<(), Error> {
    let file = &files[unit.file as usize];
    let table = AbbrevTable::compile(
        unit,
        &file.debug_abbrev,
        file.debug_line.is_some(),
        flags,
        file.endian(),
    )?;

    let mut r = Reader::new(&file.debug_info, file.endian());
    r.seek(unit.dies_offset as usize)?;

    let mut depth = 0usize;
    let mut enumeration_die: Option<u64> = None;
    let mut file_table: Option<FileNameTable> = None;

    while (r.position() as u64) < unit.end {
        let die_offset = r.position() as u64;
        let code = r.read_uleb128()?;
        if code == 0 {
            if depth <= 1 {
                break;
            }
            depth -= 1;
            if depth == 1 {
                enumeration_die = None;
            }
            continue;
        }

        let insns = table.insns_for(code)?;
        let die = execute_insns(&mut r, insns, unit, file)?;
        let tag_bits = die.flags & abbrev::TAG_MASK;
        let has_children = die.flags & abbrev::TAG_FLAG_CHILDREN != 0;

        if tag_bits == constants::DW_TAG_compile_unit.0 as u8 {
            if depth == 0 {
                if let (Some(stmt_list), Some(debug_line)) =
                    (die.stmt_list, file.debug_line.as_deref())
                {
                    file_table =
                        Some(FileNameTable::read(debug_line, stmt_list, file.endian())?);
                }
            }
        } else if tag_bits != 0 && die.flags & abbrev::TAG_FLAG_DECLARATION == 0 {
            let tag = DwTag(u16::from(tag_bits));
            let entry_offset = if tag == constants::DW_TAG_enumerator {
                // Enumerators are indexed under the enclosing enumeration's offset.
                if depth == 2 {
                    enumeration_die
                } else {
                    None
                }
            } else if depth == 1 {
                Some(die_offset)
            } else {
                None
            };

            if let Some(entry_offset) = entry_offset {
                if abbrev::should_index(tag, flags) {
                    insert_die(
                        files,
                        file,
                        unit,
                        &table,
                        die,
                        tag,
                        entry_offset,
                        file_table.as_ref(),
                        shards,
                    )?;
                }
            }
        }

        if tag_bits == constants::DW_TAG_enumeration_type.0 as u8
            && depth == 1
            && flags.contains(IndexFlags::ENUMERATORS)
        {
            enumeration_die = Some(die_offset);
        }

        if has_children {
            match die.sibling {
                Some(target) if target > r.position() as u64 && target <= unit.end => {
                    r.seek(target as usize)?;
                }
                _ => depth += 1,
            }
        } else if depth == 0 {
            // A childless unit DIE ends the unit.
            break;
        }
    }

    Ok(())
}

/// Executes one DIE's instruction stream, advancing `r` past the DIE's attributes.
fn execute_insns<'data>(
    r: &mut Reader<'data>,
    insns: &[u8],
    unit: &Unit,
    file: &'data ElfFile,
) -> Result<DieRecord<'data>, Error> {
    let corrupt = || Error::new(ErrorKind::DwarfFormat, "corrupt abbreviation instructions");
    let reference = |value: u64| {
        unit.offset
            .checked_add(value)
            .ok_or_else(|| Error::new(ErrorKind::DwarfFormat, "reference offset out of range"))
    };

    let mut die = DieRecord::default();
    let mut ip = 0usize;

    loop {
        let insn = *insns.get(ip).ok_or_else(corrupt)?;
        ip += 1;

        match insn {
            abbrev::INSN_END => {
                die.flags = *insns.get(ip).ok_or_else(corrupt)?;
                return Ok(die);
            }
            1..=abbrev::MAX_SKIP => r.skip(insn as usize)?,
            abbrev::INSN_BLOCK1 => {
                let len = r.read_u8()?;
                r.skip(len as usize)?;
            }
            abbrev::INSN_BLOCK2 => {
                let len = r.read_u16()?;
                r.skip(len as usize)?;
            }
            abbrev::INSN_BLOCK4 => {
                let len = r.read_u32()?;
                r.skip(len as usize)?;
            }
            abbrev::INSN_EXPRLOC => {
                let len = r.read_uleb128()?;
                let len = usize::try_from(len).map_err(|_| Error::from(ErrorKind::Overflow))?;
                r.skip(len)?;
            }
            abbrev::INSN_LEB128 => r.skip_leb128()?,
            abbrev::INSN_STRING => r.skip_cstr()?,
            abbrev::INSN_SIBLING_REF1 => {
                die.sibling = Some(reference(u64::from(r.read_u8()?))?)
            }
            abbrev::INSN_SIBLING_REF2 => {
                die.sibling = Some(reference(u64::from(r.read_u16()?))?)
            }
            abbrev::INSN_SIBLING_REF4 => {
                die.sibling = Some(reference(u64::from(r.read_u32()?))?)
            }
            abbrev::INSN_SIBLING_REF8 => die.sibling = Some(reference(r.read_u64()?)?),
            abbrev::INSN_SIBLING_REF_UDATA => {
                die.sibling = Some(reference(r.read_uleb128()?)?)
            }
            abbrev::INSN_NAME_STRING => {
                let offset = r.position() as u64;
                let bytes = r.read_cstr()?;
                die.name = Some(NameLoc {
                    bytes,
                    section: NameSection::Info,
                    offset,
                });
            }
            abbrev::INSN_NAME_STRP4 => {
                die.name = Some(read_strp(file, u64::from(r.read_u32()?))?)
            }
            abbrev::INSN_NAME_STRP8 => die.name = Some(read_strp(file, r.read_u64()?)?),
            abbrev::INSN_STMT_LIST_LINEPTR4 => {
                die.stmt_list = Some(u64::from(r.read_u32()?))
            }
            abbrev::INSN_STMT_LIST_LINEPTR8 => die.stmt_list = Some(r.read_u64()?),
            abbrev::INSN_DECL_FILE_DATA1 => die.decl_file = u64::from(r.read_u8()?),
            abbrev::INSN_DECL_FILE_DATA2 => die.decl_file = u64::from(r.read_u16()?),
            abbrev::INSN_DECL_FILE_DATA4 => die.decl_file = u64::from(r.read_u32()?),
            abbrev::INSN_DECL_FILE_DATA8 => die.decl_file = r.read_u64()?,
            abbrev::INSN_DECL_FILE_UDATA => die.decl_file = r.read_uleb128()?,
            abbrev::INSN_SPECIFICATION_REF1 => {
                die.specification = Some(reference(u64::from(r.read_u8()?))?)
            }
            abbrev::INSN_SPECIFICATION_REF2 => {
                die.specification = Some(reference(u64::from(r.read_u16()?))?)
            }
            abbrev::INSN_SPECIFICATION_REF4 => {
                die.specification = Some(reference(u64::from(r.read_u32()?))?)
            }
            abbrev::INSN_SPECIFICATION_REF8 => {
                die.specification = Some(reference(r.read_u64()?)?)
            }
            abbrev::INSN_SPECIFICATION_REF_UDATA => {
                die.specification = Some(reference(r.read_uleb128()?)?)
            }
            _ => return Err(corrupt()),
        }
    }
}

fn read_strp<'data>(file: &'data ElfFile, offset: u64) -> Result<NameLoc<'data>, Error> {
    let start = usize::try_from(offset)
        .ok()
        .filter(|&start| start < file.debug_str.len())
        .ok_or_else(|| Error::new(ErrorKind::DwarfFormat, "string offset out of range"))?;

    let bytes = match file.debug_str[start..].iter().position(|&byte| byte == 0) {
        Some(len) => &file.debug_str[start..start + len],
        None => {
            return Err(Error::new(
                ErrorKind::DwarfFormat,
                ".debug_str is not NUL-terminated",
            ))
        }
    };

    Ok(NameLoc {
        bytes,
        section: NameSection::Str,
        offset,
    })
}

/// Finishes one indexable DIE: resolves its specification chain, computes the file digest and
/// inserts it into the map.
#[allow(clippy::too_many_arguments)]
fn insert_die<'data>(
    files: &[ElfFile],
    file: &'data ElfFile,
    unit: &Unit,
    table: &AbbrevTable,
    mut die: DieRecord<'data>,
    tag: DwTag,
    entry_offset: u64,
    file_table: Option<&FileNameTable>,
    shards: &ShardList,
) -> Result<(), Error> {
    let mut hops = 0usize;
    loop {
        if die.name.is_some() && die.decl_file != 0 {
            break;
        }
        let Some(target) = die.specification.take() else {
            break;
        };

        hops += 1;
        if hops > MAX_SPECIFICATION_CHAIN {
            return Err(Error::new(
                ErrorKind::DwarfFormat,
                "specification chain too long",
            ));
        }
        if target < unit.dies_offset || target >= unit.end {
            return Err(Error::new(
                ErrorKind::DwarfFormat,
                "specification reference out of unit",
            ));
        }

        let mut spec_reader = Reader::new(&file.debug_info, file.endian());
        spec_reader.seek(target as usize)?;
        let code = spec_reader.read_uleb128()?;
        if code == 0 {
            break;
        }
        let spec_die = execute_insns(&mut spec_reader, table.insns_for(code)?, unit, file)?;

        if die.name.is_none() {
            die.name = spec_die.name;
        }
        if die.decl_file == 0 {
            die.decl_file = spec_die.decl_file;
        }
        die.specification = spec_die.specification;
    }

    let file_name_hash = if die.decl_file == 0 {
        0
    } else {
        file_table
            .and_then(|file_table| file_table.hash(die.decl_file))
            .ok_or_else(|| Error::new(ErrorKind::DwarfFormat, "file index out of range"))?
    };

    if let Some(name) = die.name {
        shards.insert(files, name, tag, file_name_hash, unit.file, entry_offset);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use gimli::constants;
    use similar_asserts::assert_eq;
    use wyrm_testutils::{DebugAbbrev, DebugInfo, DebugLine, DebugStr, LineProgram};

    use crate::line::file_path_hash;
    use crate::unit::split_units;

    const STRP: u16 = constants::DW_FORM_strp.0;
    const STRING: u16 = constants::DW_FORM_string.0;
    const DATA1: u16 = constants::DW_FORM_data1.0;
    const REF4: u16 = constants::DW_FORM_ref4.0;
    const SEC_OFFSET: u16 = constants::DW_FORM_sec_offset.0;
    const FLAG_PRESENT: u16 = constants::DW_FORM_flag_present.0;

    const AT_NAME: u16 = constants::DW_AT_name.0;
    const AT_DECL_FILE: u16 = constants::DW_AT_decl_file.0;
    const AT_SIBLING: u16 = constants::DW_AT_sibling.0;
    const AT_STMT_LIST: u16 = constants::DW_AT_stmt_list.0;
    const AT_SPECIFICATION: u16 = constants::DW_AT_specification.0;
    const AT_DECLARATION: u16 = constants::DW_AT_declaration.0;

    const TAG_CU: u16 = constants::DW_TAG_compile_unit.0;
    const TAG_STRUCT: u16 = constants::DW_TAG_structure_type.0;
    const TAG_VARIABLE: u16 = constants::DW_TAG_variable.0;
    const TAG_SUBPROGRAM: u16 = constants::DW_TAG_subprogram.0;
    const TAG_ENUM: u16 = constants::DW_TAG_enumeration_type.0;
    const TAG_ENUMERATOR: u16 = constants::DW_TAG_enumerator.0;

    fn src_line_table() -> Vec<u8> {
        let mut line = DebugLine::new();
        line.add(LineProgram::new(4).directory(b"/src").file(b"a.c", 1));
        line.finish()
    }

    fn index(
        file: ElfFile,
        flags: IndexFlags,
    ) -> Result<(ShardList, Vec<ElfFile>), Error> {
        let shards = ShardList::new();
        let units = split_units(0, &file.debug_info, file.endian())?;
        let files = vec![file];
        for unit in &units {
            index_unit(&files, unit, flags, &shards)?;
        }
        Ok((shards, files))
    }

    #[test]
    fn test_struct_with_decl_file() {
        let abbrev = DebugAbbrev::new()
            .decl(1, TAG_CU, true)
            .attrib(AT_STMT_LIST, SEC_OFFSET)
            .end_decl()
            .decl(2, TAG_STRUCT, false)
            .attrib(AT_NAME, STRP)
            .attrib(AT_DECL_FILE, DATA1)
            .end_decl()
            .finish();

        let mut strs = DebugStr::new();
        let foo = strs.add(b"foo");

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        info.u32(0); // stmt_list
        let struct_offset = info.offset();
        info.uleb(2);
        info.u32(foo as u32);
        info.u8(1); // decl_file
        info.uleb(0); // end of children
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), Some(src_line_table()), strs.finish());
        let (shards, files) = index(file, IndexFlags::TYPES).unwrap();

        let entries = shards.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tag(), TAG_STRUCT);
        assert_eq!(entries[0].name(&files), b"foo");
        assert_eq!(entries[0].offset(), struct_offset);
        assert_eq!(entries[0].file_name_hash(), file_path_hash(b"/src/a.c"));
    }

    #[test]
    fn test_no_flags_no_entries() {
        let abbrev = DebugAbbrev::new()
            .decl(1, TAG_CU, true)
            .end_decl()
            .decl(2, TAG_STRUCT, false)
            .attrib(AT_NAME, STRING)
            .end_decl()
            .finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        info.uleb(2);
        info.cstr(b"foo");
        info.uleb(0);
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), None, b"\0".to_vec());
        let (shards, _) = index(file, IndexFlags::VARIABLES).unwrap();
        assert!(shards.snapshot().is_empty());
    }

    #[test]
    fn test_childless_unit_die() {
        let abbrev = DebugAbbrev::new().decl(1, TAG_CU, false).end_decl().finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), None, b"\0".to_vec());
        let (shards, _) = index(file, IndexFlags::TYPES).unwrap();
        assert!(shards.snapshot().is_empty());
    }

    #[test]
    fn test_inline_name() {
        let abbrev = DebugAbbrev::new()
            .decl(1, TAG_CU, true)
            .end_decl()
            .decl(2, TAG_VARIABLE, false)
            .attrib(AT_NAME, STRING)
            .end_decl()
            .finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        info.uleb(2);
        info.cstr(b"jiffies");
        info.uleb(0);
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), None, b"\0".to_vec());
        let (shards, files) = index(file, IndexFlags::VARIABLES).unwrap();

        let entries = shards.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name(&files), b"jiffies");
        assert_eq!(entries[0].file_name_hash(), 0);
    }

    #[test]
    fn test_declaration_not_indexed() {
        let abbrev = DebugAbbrev::new()
            .decl(1, TAG_CU, true)
            .end_decl()
            .decl(2, TAG_STRUCT, false)
            .attrib(AT_NAME, STRING)
            .attrib(AT_DECLARATION, FLAG_PRESENT)
            .end_decl()
            .finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        info.uleb(2);
        info.cstr(b"foo");
        info.uleb(0);
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), None, b"\0".to_vec());
        let (shards, _) = index(file, IndexFlags::TYPES).unwrap();
        assert!(shards.snapshot().is_empty());
    }

    #[test]
    fn test_nested_die_not_indexed() {
        let abbrev = DebugAbbrev::new()
            .decl(1, TAG_CU, true)
            .end_decl()
            .decl(2, TAG_SUBPROGRAM, true)
            .end_decl()
            .decl(3, TAG_VARIABLE, false)
            .attrib(AT_NAME, STRING)
            .end_decl()
            .finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        info.uleb(2); // subprogram, depth 1
        info.uleb(3); // local variable, depth 2
        info.cstr(b"local");
        info.uleb(0); // end subprogram children
        info.uleb(0); // end unit children
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), None, b"\0".to_vec());
        let (shards, _) = index(file, IndexFlags::VARIABLES).unwrap();
        assert!(shards.snapshot().is_empty());
    }

    #[test]
    fn test_enumerator_under_enumeration_offset() {
        let abbrev = DebugAbbrev::new()
            .decl(1, TAG_CU, true)
            .end_decl()
            .decl(2, TAG_ENUM, true)
            .attrib(AT_NAME, STRING)
            .end_decl()
            .decl(3, TAG_ENUMERATOR, false)
            .attrib(AT_NAME, STRING)
            .end_decl()
            .finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        let enum_offset = info.offset();
        info.uleb(2);
        info.cstr(b"color");
        info.uleb(3);
        info.cstr(b"RED");
        info.uleb(3);
        info.cstr(b"GREEN");
        info.uleb(0); // end enumeration children
        info.uleb(0); // end unit children
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), None, b"\0".to_vec());
        let (shards, files) = index(file, IndexFlags::ENUMERATORS).unwrap();

        let entries = shards.snapshot();
        assert_eq!(entries.len(), 2);
        for entry in &entries {
            assert_eq!(entry.tag(), TAG_ENUMERATOR);
            assert_eq!(entry.offset(), enum_offset);
        }
        let mut names: Vec<&[u8]> = entries.iter().map(|entry| entry.name(&files)).collect();
        names.sort();
        assert_eq!(names, [&b"GREEN"[..], &b"RED"[..]]);
    }

    #[test]
    fn test_enumeration_without_types_flag_not_indexed() {
        let abbrev = DebugAbbrev::new()
            .decl(1, TAG_CU, true)
            .end_decl()
            .decl(2, TAG_ENUM, true)
            .attrib(AT_NAME, STRING)
            .end_decl()
            .decl(3, TAG_ENUMERATOR, false)
            .attrib(AT_NAME, STRING)
            .end_decl()
            .finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        info.uleb(2);
        info.cstr(b"color");
        info.uleb(3);
        info.cstr(b"RED");
        info.uleb(0);
        info.uleb(0);
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), None, b"\0".to_vec());

        let (shards, files) = index(file, IndexFlags::ENUMERATORS).unwrap();
        let entries = shards.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name(&files), b"RED");
    }

    #[test]
    fn test_sibling_skips_children() {
        let abbrev = DebugAbbrev::new()
            .decl(1, TAG_CU, true)
            .end_decl()
            .decl(2, TAG_SUBPROGRAM, true)
            .attrib(AT_NAME, STRING)
            .attrib(AT_SIBLING, REF4)
            .end_decl()
            .decl(3, TAG_VARIABLE, false)
            .attrib(AT_NAME, STRING)
            .end_decl()
            .finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        info.uleb(2);
        info.cstr(b"helper");
        let sibling_field = info.offset();
        info.u32(0); // patched below
        info.uleb(3); // local inside the subprogram, skipped via the sibling
        info.cstr(b"local");
        info.uleb(0); // end subprogram children
        let sibling_target = info.unit_offset();
        info.uleb(3); // top-level variable after the subprogram
        info.cstr(b"global");
        info.uleb(0); // end unit children
        info.end_unit();
        info.patch_u32(sibling_field, sibling_target as u32);

        let file = ElfFile::synthetic(abbrev, info.finish(), None, b"\0".to_vec());
        let (shards, files) =
            index(file, IndexFlags::VARIABLES | IndexFlags::FUNCTIONS).unwrap();

        let entries = shards.snapshot();
        let mut names: Vec<&[u8]> = entries.iter().map(|entry| entry.name(&files)).collect();
        names.sort();
        assert_eq!(names, [&b"global"[..], &b"helper"[..]]);
    }

    #[test]
    fn test_specification_resolves_name_and_file() {
        let abbrev = DebugAbbrev::new()
            .decl(1, TAG_CU, true)
            .attrib(AT_STMT_LIST, SEC_OFFSET)
            .end_decl()
            .decl(2, TAG_STRUCT, true)
            .attrib(AT_NAME, STRING)
            .end_decl()
            .decl(3, TAG_VARIABLE, false)
            .attrib(AT_NAME, STRING)
            .attrib(AT_DECL_FILE, DATA1)
            .attrib(AT_DECLARATION, FLAG_PRESENT)
            .end_decl()
            .decl(4, TAG_VARIABLE, false)
            .attrib(AT_SPECIFICATION, REF4)
            .end_decl()
            .finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        info.u32(0); // stmt_list
        info.uleb(2); // structure at depth 1; types are not requested
        info.cstr(b"counters");
        let member_offset = info.unit_offset();
        info.uleb(3); // member declaration at depth 2
        info.cstr(b"counter");
        info.u8(1); // decl_file
        info.uleb(0); // end structure children
        let definition_offset = info.offset();
        info.uleb(4); // definition referencing the declaration
        info.u32(member_offset as u32);
        info.uleb(0); // end unit children
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), Some(src_line_table()), b"\0".to_vec());
        let (shards, files) = index(file, IndexFlags::VARIABLES).unwrap();

        let entries = shards.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tag(), TAG_VARIABLE);
        assert_eq!(entries[0].name(&files), b"counter");
        assert_eq!(entries[0].offset(), definition_offset);
        assert_eq!(entries[0].file_name_hash(), file_path_hash(b"/src/a.c"));
    }

    #[test]
    fn test_specification_cycle_fails() {
        let abbrev = DebugAbbrev::new()
            .decl(1, TAG_CU, true)
            .end_decl()
            .decl(2, TAG_VARIABLE, false)
            .attrib(AT_SPECIFICATION, REF4)
            .end_decl()
            .finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        let die_offset = info.unit_offset();
        info.uleb(2);
        info.u32(die_offset as u32); // points back at itself
        info.uleb(0);
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), None, b"\0".to_vec());
        let err = index(file, IndexFlags::VARIABLES).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::DwarfFormat);
    }

    #[test]
    fn test_decl_file_out_of_range() {
        let abbrev = DebugAbbrev::new()
            .decl(1, TAG_CU, true)
            .attrib(AT_STMT_LIST, SEC_OFFSET)
            .end_decl()
            .decl(2, TAG_STRUCT, false)
            .attrib(AT_NAME, STRING)
            .attrib(AT_DECL_FILE, DATA1)
            .end_decl()
            .finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        info.u32(0);
        info.uleb(2);
        info.cstr(b"foo");
        info.u8(9); // only one file in the table
        info.uleb(0);
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), Some(src_line_table()), b"\0".to_vec());
        let err = index(file, IndexFlags::TYPES).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::DwarfFormat);
    }

    #[test]
    fn test_missing_abbreviation_code_fails() {
        let abbrev = DebugAbbrev::new().decl(1, TAG_CU, true).end_decl().finish();

        let mut info = DebugInfo::new();
        info.begin_unit(4, 0, 8);
        info.uleb(1);
        info.uleb(7); // never declared
        info.uleb(0);
        info.end_unit();

        let file = ElfFile::synthetic(abbrev, info.finish(), None, b"\0".to_vec());
        let err = index(file, IndexFlags::TYPES).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::DwarfFormat);
    }
}
