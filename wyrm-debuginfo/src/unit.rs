//! Splitting `.debug_info` into compilation units.
//!
//! Indexing distributes whole compilation units across worker threads, so the section is first
//! cut into unit descriptors. Only the unit headers are validated here; the content of a unit is
//! checked by the scanner that consumes it.

use gimli::RunTimeEndian;

use crate::error::{Error, ErrorKind};
use crate::reader::Reader;

/// A compilation unit within one file's `.debug_info` section.
#[derive(Clone, Debug)]
pub(crate) struct Unit {
    /// Index of the owning file in the index's file list.
    pub file: u32,
    /// Offset of the unit header within `.debug_info`.
    pub offset: u64,
    /// Offset of the first DIE within `.debug_info`.
    pub dies_offset: u64,
    /// One past the last byte of the unit within `.debug_info`.
    pub end: u64,
    /// The DWARF version from the unit header. Only versions 2, 3 and 4 are accepted.
    pub version: u16,
    /// Offset of the unit's abbreviation table within `.debug_abbrev`.
    pub abbrev_offset: u64,
    /// Size in bytes of an address on the target machine.
    pub address_size: u8,
    /// Whether the unit uses the DWARF64 format.
    pub is_64_bit: bool,
}

/// Produces the list of compilation units in a `.debug_info` section.
pub(crate) fn split_units(
    file_index: u32,
    debug_info: &[u8],
    endian: RunTimeEndian,
) -> Result<Vec<Unit>, Error> {
    let mut units = Vec::new();
    let mut r = Reader::new(debug_info, endian);

    while !r.is_empty() {
        let offset = r.position() as u64;
        let (length, is_64_bit) = r.read_initial_length()?;
        if length > r.remaining() as u64 {
            return Err(Error::new(
                ErrorKind::Truncated,
                "unit length exceeds .debug_info",
            ));
        }
        let end = r.position() as u64 + length;

        let version = r.read_u16()?;
        if !(2..=4).contains(&version) {
            return Err(Error::new(
                ErrorKind::DwarfFormat,
                format!("unknown DWARF version {version}"),
            ));
        }
        let abbrev_offset = r.read_offset(is_64_bit)?;
        let address_size = r.read_u8()?;
        if address_size == 0 || address_size > 8 {
            return Err(Error::new(
                ErrorKind::DwarfFormat,
                format!("unsupported address size {address_size}"),
            ));
        }
        if r.position() as u64 > end {
            return Err(Error::new(ErrorKind::Truncated, "unit header exceeds unit"));
        }

        units.push(Unit {
            file: file_index,
            offset,
            dies_offset: r.position() as u64,
            end,
            version,
            abbrev_offset,
            address_size,
            is_64_bit,
        });

        r.seek(end as usize)?;
    }

    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    use crate::error::ErrorKind;

    fn split(debug_info: &[u8]) -> Result<Vec<Unit>, Error> {
        split_units(0, debug_info, RunTimeEndian::Little)
    }

    fn header32(version: u16, body: &[u8]) -> Vec<u8> {
        let mut section = Vec::new();
        let length = 7 + body.len() as u32;
        section.extend_from_slice(&length.to_le_bytes());
        section.extend_from_slice(&version.to_le_bytes());
        section.extend_from_slice(&0u32.to_le_bytes());
        section.push(8);
        section.extend_from_slice(body);
        section
    }

    #[test]
    fn test_single_unit() {
        let section = header32(4, &[0x00]);
        let units = split(&section).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].offset, 0);
        assert_eq!(units[0].dies_offset, 11);
        assert_eq!(units[0].end, section.len() as u64);
        assert_eq!(units[0].version, 4);
        assert_eq!(units[0].address_size, 8);
        assert!(!units[0].is_64_bit);
    }

    #[test]
    fn test_multiple_units() {
        let mut section = header32(2, &[0x00]);
        let second_offset = section.len() as u64;
        section.extend(header32(3, &[0x00, 0x00]));

        let units = split(&section).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].offset, second_offset);
        assert_eq!(units[1].version, 3);
    }

    #[test]
    fn test_dwarf64_unit() {
        let mut section = Vec::new();
        section.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
        section.extend_from_slice(&11u64.to_le_bytes());
        section.extend_from_slice(&4u16.to_le_bytes());
        section.extend_from_slice(&0u64.to_le_bytes());
        section.push(8);

        let units = split(&section).unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].is_64_bit);
        assert_eq!(units[0].dies_offset, 23);
        assert_eq!(units[0].end, section.len() as u64);
    }

    #[test]
    fn test_version_5_rejected() {
        let section = header32(5, &[0x00]);
        let err = split(&section).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::DwarfFormat);
    }

    #[test]
    fn test_truncated_unit() {
        let mut section = header32(4, &[0x00]);
        let length = (section.len() as u32).wrapping_add(100);
        section[..4].copy_from_slice(&length.to_le_bytes());

        let err = split(&section).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Truncated);
    }
}
