//! Compilation of DWARF abbreviation tables into a skip/parse instruction stream.
//!
//! Scanning a compilation unit's DIEs with generic attribute-by-attribute dispatch is the
//! hottest loop in the indexer. Instead, each unit's abbreviation table is compiled once into a
//! compact byte stream: most attributes collapse into "advance the cursor by N bytes"
//! instructions, and only the handful of attributes the indexer reads get dedicated opcodes. The
//! scanner then interprets this stream per DIE without reconsulting the abbreviation table.
//!
//! The instruction encoding: a byte between 1 and [`MAX_SKIP`] advances the cursor by that many
//! bytes; bytes from 230 upwards are opcodes for attribute forms whose size or content needs
//! work at scan time; a zero byte terminates a DIE's stream and is followed by a flag byte whose
//! low six bits carry the DWARF tag (when the tag is of interest), bit 6 the declaration flag
//! and bit 7 the children flag.

use gimli::constants;
use gimli::{DwAt, DwForm, DwTag};

use crate::error::{Error, ErrorKind};
use crate::index::IndexFlags;
use crate::reader::Reader;
use crate::unit::Unit;

/// Mask extracting the DWARF tag from a flag byte.
pub(crate) const TAG_MASK: u8 = 0x3f;
/// The DIE carries `DW_AT_declaration`.
pub(crate) const TAG_FLAG_DECLARATION: u8 = 0x40;
/// The DIE has children.
pub(crate) const TAG_FLAG_CHILDREN: u8 = 0x80;

/// The largest cursor advance a single skip instruction can encode.
pub(crate) const MAX_SKIP: u8 = 229;

pub(crate) const INSN_END: u8 = 0;
pub(crate) const INSN_BLOCK1: u8 = 230;
pub(crate) const INSN_BLOCK2: u8 = 231;
pub(crate) const INSN_BLOCK4: u8 = 232;
pub(crate) const INSN_EXPRLOC: u8 = 233;
pub(crate) const INSN_LEB128: u8 = 234;
pub(crate) const INSN_STRING: u8 = 235;
pub(crate) const INSN_SIBLING_REF1: u8 = 236;
pub(crate) const INSN_SIBLING_REF2: u8 = 237;
pub(crate) const INSN_SIBLING_REF4: u8 = 238;
pub(crate) const INSN_SIBLING_REF8: u8 = 239;
pub(crate) const INSN_SIBLING_REF_UDATA: u8 = 240;
pub(crate) const INSN_NAME_STRP4: u8 = 241;
pub(crate) const INSN_NAME_STRP8: u8 = 242;
pub(crate) const INSN_NAME_STRING: u8 = 243;
pub(crate) const INSN_STMT_LIST_LINEPTR4: u8 = 244;
pub(crate) const INSN_STMT_LIST_LINEPTR8: u8 = 245;
pub(crate) const INSN_DECL_FILE_DATA1: u8 = 246;
pub(crate) const INSN_DECL_FILE_DATA2: u8 = 247;
pub(crate) const INSN_DECL_FILE_DATA4: u8 = 248;
pub(crate) const INSN_DECL_FILE_DATA8: u8 = 249;
pub(crate) const INSN_DECL_FILE_UDATA: u8 = 250;
pub(crate) const INSN_SPECIFICATION_REF1: u8 = 251;
pub(crate) const INSN_SPECIFICATION_REF2: u8 = 252;
pub(crate) const INSN_SPECIFICATION_REF4: u8 = 253;
pub(crate) const INSN_SPECIFICATION_REF8: u8 = 254;
pub(crate) const INSN_SPECIFICATION_REF_UDATA: u8 = 255;

/// Returns `true` if DIEs with this tag are inserted into the name map.
pub(crate) fn should_index(tag: DwTag, flags: IndexFlags) -> bool {
    match tag {
        constants::DW_TAG_base_type
        | constants::DW_TAG_class_type
        | constants::DW_TAG_enumeration_type
        | constants::DW_TAG_structure_type
        | constants::DW_TAG_typedef
        | constants::DW_TAG_union_type => flags.contains(IndexFlags::TYPES),
        constants::DW_TAG_enumerator => flags.contains(IndexFlags::ENUMERATORS),
        constants::DW_TAG_variable => flags.contains(IndexFlags::VARIABLES),
        constants::DW_TAG_subprogram => flags.contains(IndexFlags::FUNCTIONS),
        _ => false,
    }
}

/// Returns the tag bits to store in the flag byte, or 0 when the scanner has no use for the tag.
fn preserved_tag(tag: u64, flags: IndexFlags) -> u8 {
    if tag == 0 || tag > u64::from(TAG_MASK) {
        return 0;
    }
    let tag = DwTag(tag as u16);
    let keep = should_index(tag, flags)
        || tag == constants::DW_TAG_compile_unit
        || (tag == constants::DW_TAG_enumeration_type
            && flags.contains(IndexFlags::ENUMERATORS));
    if keep {
        tag.0 as u8 & TAG_MASK
    } else {
        0
    }
}

/// A compiled abbreviation table.
///
/// `decls` maps abbreviation code − 1 to the start of that declaration's instruction stream
/// within `insns`.
#[derive(Debug)]
pub(crate) struct AbbrevTable {
    decls: Vec<u32>,
    insns: Vec<u8>,
}

impl AbbrevTable {
    /// Compiles the abbreviation table referenced by `unit` from `.debug_abbrev`.
    pub fn compile(
        unit: &Unit,
        debug_abbrev: &[u8],
        has_debug_line: bool,
        flags: IndexFlags,
        endian: gimli::RunTimeEndian,
    ) -> Result<AbbrevTable, Error> {
        let offset = usize::try_from(unit.abbrev_offset)
            .ok()
            .filter(|&offset| offset <= debug_abbrev.len())
            .ok_or_else(|| {
                Error::new(ErrorKind::DwarfFormat, "abbreviation offset out of range")
            })?;

        let mut r = Reader::new(&debug_abbrev[offset..], endian);
        let mut table = AbbrevTable {
            decls: Vec::new(),
            insns: Vec::new(),
        };

        let mut expected_code = 1u64;
        loop {
            let code = r.read_uleb128()?;
            if code == 0 {
                return Ok(table);
            }
            if code != expected_code {
                return Err(Error::new(
                    ErrorKind::DwarfFormat,
                    "non-sequential abbreviation code",
                ));
            }
            expected_code += 1;

            table.compile_decl(&mut r, unit, has_debug_line, flags)?;
        }
    }

    fn compile_decl(
        &mut self,
        r: &mut Reader<'_>,
        unit: &Unit,
        has_debug_line: bool,
        flags: IndexFlags,
    ) -> Result<(), Error> {
        let tag = r.read_uleb128()?;
        let children = r.read_u8()? != 0;

        self.decls.push(self.insns.len() as u32);

        let mut flag_byte = preserved_tag(tag, flags);
        if children {
            flag_byte |= TAG_FLAG_CHILDREN;
        }

        let die_indexed = tag <= u64::from(u16::MAX) && should_index(DwTag(tag as u16), flags);
        let mut last_skip: Option<usize> = None;

        loop {
            let at = r.read_uleb128()?;
            let form = r.read_uleb128()?;
            if at == 0 && form == 0 {
                break;
            }

            if at == u64::from(constants::DW_AT_declaration.0) {
                flag_byte |= TAG_FLAG_DECLARATION;
            }

            self.compile_attrib(
                unit,
                has_debug_line,
                flags,
                die_indexed,
                tag,
                at,
                form,
                &mut last_skip,
            )?;
        }

        self.insns.push(INSN_END);
        self.insns.push(flag_byte);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_attrib(
        &mut self,
        unit: &Unit,
        has_debug_line: bool,
        flags: IndexFlags,
        die_indexed: bool,
        tag: u64,
        at: u64,
        form: u64,
        last_skip: &mut Option<usize>,
    ) -> Result<(), Error> {
        let at = if at <= u64::from(u16::MAX) {
            DwAt(at as u16)
        } else {
            DwAt(0)
        };
        let form = if form <= u64::from(u16::MAX) {
            DwForm(form as u16)
        } else {
            return Err(Error::new(ErrorKind::DwarfFormat, "unknown attribute form"));
        };

        let in_enumeration = tag == u64::from(constants::DW_TAG_enumeration_type.0)
            && flags.contains(IndexFlags::ENUMERATORS);

        // The enumeration case must descend into the children instead of skipping to the
        // sibling, so no sibling opcode is emitted for it.
        if at == constants::DW_AT_sibling && !in_enumeration {
            match form {
                constants::DW_FORM_ref1 => return Ok(self.push_op(INSN_SIBLING_REF1, last_skip)),
                constants::DW_FORM_ref2 => return Ok(self.push_op(INSN_SIBLING_REF2, last_skip)),
                constants::DW_FORM_ref4 => return Ok(self.push_op(INSN_SIBLING_REF4, last_skip)),
                constants::DW_FORM_ref8 => return Ok(self.push_op(INSN_SIBLING_REF8, last_skip)),
                constants::DW_FORM_ref_udata => {
                    return Ok(self.push_op(INSN_SIBLING_REF_UDATA, last_skip))
                }
                _ => {}
            }
        } else if at == constants::DW_AT_name && die_indexed {
            match form {
                constants::DW_FORM_string => return Ok(self.push_op(INSN_NAME_STRING, last_skip)),
                constants::DW_FORM_strp => {
                    let op = if unit.is_64_bit {
                        INSN_NAME_STRP8
                    } else {
                        INSN_NAME_STRP4
                    };
                    return Ok(self.push_op(op, last_skip));
                }
                _ => {}
            }
        } else if at == constants::DW_AT_stmt_list
            && tag == u64::from(constants::DW_TAG_compile_unit.0)
            && has_debug_line
        {
            match form {
                constants::DW_FORM_data4 => {
                    return Ok(self.push_op(INSN_STMT_LIST_LINEPTR4, last_skip))
                }
                constants::DW_FORM_data8 => {
                    return Ok(self.push_op(INSN_STMT_LIST_LINEPTR8, last_skip))
                }
                constants::DW_FORM_sec_offset => {
                    let op = if unit.is_64_bit {
                        INSN_STMT_LIST_LINEPTR8
                    } else {
                        INSN_STMT_LIST_LINEPTR4
                    };
                    return Ok(self.push_op(op, last_skip));
                }
                _ => {}
            }
        } else if at == constants::DW_AT_decl_file && die_indexed {
            match form {
                constants::DW_FORM_data1 => {
                    return Ok(self.push_op(INSN_DECL_FILE_DATA1, last_skip))
                }
                constants::DW_FORM_data2 => {
                    return Ok(self.push_op(INSN_DECL_FILE_DATA2, last_skip))
                }
                constants::DW_FORM_data4 => {
                    return Ok(self.push_op(INSN_DECL_FILE_DATA4, last_skip))
                }
                constants::DW_FORM_data8 => {
                    return Ok(self.push_op(INSN_DECL_FILE_DATA8, last_skip))
                }
                constants::DW_FORM_udata => {
                    return Ok(self.push_op(INSN_DECL_FILE_UDATA, last_skip))
                }
                _ => {}
            }
        } else if at == constants::DW_AT_specification && die_indexed {
            match form {
                constants::DW_FORM_ref1 => {
                    return Ok(self.push_op(INSN_SPECIFICATION_REF1, last_skip))
                }
                constants::DW_FORM_ref2 => {
                    return Ok(self.push_op(INSN_SPECIFICATION_REF2, last_skip))
                }
                constants::DW_FORM_ref4 => {
                    return Ok(self.push_op(INSN_SPECIFICATION_REF4, last_skip))
                }
                constants::DW_FORM_ref8 => {
                    return Ok(self.push_op(INSN_SPECIFICATION_REF8, last_skip))
                }
                constants::DW_FORM_ref_udata => {
                    return Ok(self.push_op(INSN_SPECIFICATION_REF_UDATA, last_skip))
                }
                _ => {}
            }
        }

        match form {
            constants::DW_FORM_addr => {
                self.push_skip(u64::from(unit.address_size), last_skip);
                Ok(())
            }
            constants::DW_FORM_data1 | constants::DW_FORM_ref1 | constants::DW_FORM_flag => {
                self.push_skip(1, last_skip);
                Ok(())
            }
            constants::DW_FORM_data2 | constants::DW_FORM_ref2 => {
                self.push_skip(2, last_skip);
                Ok(())
            }
            constants::DW_FORM_data4 | constants::DW_FORM_ref4 => {
                self.push_skip(4, last_skip);
                Ok(())
            }
            constants::DW_FORM_data8
            | constants::DW_FORM_ref8
            | constants::DW_FORM_ref_sig8 => {
                // ref_sig8 references a type unit; the cross-reference is not followed.
                self.push_skip(8, last_skip);
                Ok(())
            }
            constants::DW_FORM_ref_addr
            | constants::DW_FORM_sec_offset
            | constants::DW_FORM_strp => {
                self.push_skip(if unit.is_64_bit { 8 } else { 4 }, last_skip);
                Ok(())
            }
            constants::DW_FORM_block1 => Ok(self.push_op(INSN_BLOCK1, last_skip)),
            constants::DW_FORM_block2 => Ok(self.push_op(INSN_BLOCK2, last_skip)),
            constants::DW_FORM_block4 => Ok(self.push_op(INSN_BLOCK4, last_skip)),
            constants::DW_FORM_block | constants::DW_FORM_exprloc => {
                Ok(self.push_op(INSN_EXPRLOC, last_skip))
            }
            constants::DW_FORM_sdata
            | constants::DW_FORM_udata
            | constants::DW_FORM_ref_udata => Ok(self.push_op(INSN_LEB128, last_skip)),
            constants::DW_FORM_string => Ok(self.push_op(INSN_STRING, last_skip)),
            constants::DW_FORM_flag_present => Ok(()),
            constants::DW_FORM_indirect => Err(Error::new(
                ErrorKind::DwarfFormat,
                "DW_FORM_indirect is not supported",
            )),
            _ => Err(Error::new(
                ErrorKind::DwarfFormat,
                format!("unknown attribute form {}", form.0),
            )),
        }
    }

    fn push_op(&mut self, op: u8, last_skip: &mut Option<usize>) {
        self.insns.push(op);
        *last_skip = None;
    }

    fn push_skip(&mut self, mut count: u64, last_skip: &mut Option<usize>) {
        if count == 0 {
            return;
        }

        if let Some(index) = *last_skip {
            let free = u64::from(MAX_SKIP - self.insns[index]);
            let merged = free.min(count);
            self.insns[index] += merged as u8;
            count -= merged;
        }

        while count > 0 {
            let chunk = count.min(u64::from(MAX_SKIP));
            self.insns.push(chunk as u8);
            *last_skip = Some(self.insns.len() - 1);
            count -= chunk;
        }
    }

    /// Returns the instruction stream for the given abbreviation code.
    pub fn insns_for(&self, code: u64) -> Result<&[u8], Error> {
        let index = code
            .checked_sub(1)
            .and_then(|code| usize::try_from(code).ok())
            .filter(|&code| code < self.decls.len())
            .ok_or_else(|| {
                Error::new(ErrorKind::DwarfFormat, "unknown abbreviation code")
            })?;
        Ok(&self.insns[self.decls[index] as usize..])
    }
}
