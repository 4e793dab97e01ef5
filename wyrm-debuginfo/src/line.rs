//! File-name hash tables built from the DWARF line-number program.
//!
//! A DIE's `DW_AT_decl_file` is an index into the file table of its unit's line-number program.
//! Comparing declaring files across units (and across object files) by index is meaningless, and
//! comparing by string would require keeping every path around. Instead, each referenced file is
//! reduced to a 64-bit SipHash digest over its canonicalised path, computed once per unit from
//! the line-program header. Only the header is parsed; the line-number state machine itself is
//! of no interest here.
//!
//! Digests are built suffix-first: a directory contributes its path components in reverse order,
//! each terminated by a `/`, and the file name is appended to its directory's digest. Keyed
//! hashing uses a zero key; inputs come from the debugger operator, so hash flooding is not a
//! concern.

use std::hash::Hasher;

use gimli::RunTimeEndian;
use siphasher::sip::SipHasher13;
use wyrm_common::ReverseComponents;

use crate::error::{Error, ErrorKind};
use crate::reader::Reader;

/// The file-name digests of one compilation unit, indexed by DWARF file index − 1.
#[derive(Clone, Debug, Default)]
pub(crate) struct FileNameTable {
    hashes: Vec<u64>,
}

impl FileNameTable {
    /// Parses the line-number program header at `offset` and digests its file table.
    pub fn read(
        debug_line: &[u8],
        offset: u64,
        endian: RunTimeEndian,
    ) -> Result<FileNameTable, Error> {
        let offset = usize::try_from(offset)
            .ok()
            .filter(|&offset| offset < debug_line.len())
            .ok_or_else(|| {
                Error::new(ErrorKind::DwarfFormat, "line program offset out of range")
            })?;

        let mut r = Reader::new(&debug_line[offset..], endian);
        let (length, is_64_bit) = r.read_initial_length()?;
        let body_start = offset + r.position();
        let body = usize::try_from(length)
            .ok()
            .and_then(|length| body_start.checked_add(length))
            .and_then(|end| debug_line.get(body_start..end))
            .ok_or_else(|| Error::new(ErrorKind::Truncated, "line program exceeds .debug_line"))?;
        let mut r = Reader::new(body, endian);

        let version = r.read_u16()?;
        if !(2..=4).contains(&version) {
            return Err(Error::new(
                ErrorKind::DwarfFormat,
                format!("unknown line number program version {version}"),
            ));
        }

        let _header_length = r.read_offset(is_64_bit)?;
        let _minimum_instruction_length = r.read_u8()?;
        if version >= 4 {
            let _maximum_operations_per_instruction = r.read_u8()?;
        }
        let _default_is_stmt = r.read_u8()?;
        let _line_base = r.read_u8()?;
        let _line_range = r.read_u8()?;
        let opcode_base = r.read_u8()?;
        if opcode_base > 0 {
            r.skip(opcode_base as usize - 1)?;
        }

        let mut directories = Vec::new();
        loop {
            let directory = r.read_cstr()?;
            if directory.is_empty() {
                break;
            }
            let mut hasher = SipHasher13::new();
            hash_path_into(&mut hasher, directory);
            directories.push(hasher);
        }

        let mut hashes = Vec::new();
        loop {
            let name = r.read_cstr()?;
            if name.is_empty() {
                break;
            }
            let directory_index = r.read_uleb128()?;
            r.skip_leb128()?; // mtime
            r.skip_leb128()?; // size

            let mut hasher = match directory_index.checked_sub(1) {
                None => SipHasher13::new(),
                Some(index) => usize::try_from(index)
                    .ok()
                    .and_then(|index| directories.get(index))
                    .cloned()
                    .ok_or_else(|| {
                        Error::new(ErrorKind::DwarfFormat, "directory index out of range")
                    })?,
            };
            hasher.write(name);
            hashes.push(hasher.finish());
        }

        Ok(FileNameTable { hashes })
    }

    /// Returns the digest for a 1-based DWARF file index, or `None` past the end of the table.
    pub fn hash(&self, file_index: u64) -> Option<u64> {
        usize::try_from(file_index)
            .ok()
            .and_then(|index| index.checked_sub(1))
            .and_then(|index| self.hashes.get(index))
            .copied()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }
}

fn hash_path_into(hasher: &mut SipHasher13, path: &[u8]) {
    for component in ReverseComponents::new(path) {
        hasher.write(component);
        hasher.write(b"/");
    }
}

/// Computes the canonical digest of a file path.
///
/// The digest matches what indexing stores for a DIE declared in this file, so callers can test
/// entries for "declared in the same file" without string comparisons:
///
/// ```
/// use wyrm_debuginfo::file_path_hash;
///
/// assert_eq!(file_path_hash(b"/usr/./src//a.c"), file_path_hash(b"/usr/src/a.c"));
/// assert_ne!(file_path_hash(b"/usr/src/a.c"), file_path_hash(b"/usr/src/b.c"));
/// ```
pub fn file_path_hash(path: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new();
    match path.iter().rposition(|&b| b == b'/') {
        Some(0) => {
            hash_path_into(&mut hasher, b"/");
            hasher.write(&path[1..]);
        }
        Some(position) => {
            hash_path_into(&mut hasher, &path[..position]);
            hasher.write(&path[position + 1..]);
        }
        None => hasher.write(path),
    }
    hasher.finish()
}
