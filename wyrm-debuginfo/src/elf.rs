//! Loading of debug sections from ELF files and relocation of their contents.
//!
//! The indexer consumes five sections from every registered file: `.symtab`, `.debug_abbrev`,
//! `.debug_info`, `.debug_line` and `.debug_str`. Section contents are copied out of the mapped
//! file into owned images so that relocations can be applied in place; relocatable objects such
//! as kernel modules carry `SHT_RELA` sections against their debug data that must be resolved
//! before any DWARF parsing happens.

use std::path::{Path, PathBuf};

use flate2::{Decompress, FlushDecompress};
use gimli::RunTimeEndian;
use goblin::container::{Container, Ctx};
use goblin::elf;
use goblin::elf::compression_header::{CompressionHeader, ELFCOMPRESS_ZLIB};
use goblin::elf::reloc::{R_X86_64_32, R_X86_64_64, R_X86_64_NONE};
use goblin::elf::SectionHeader;
use goblin::strtab::Strtab;
use rayon::prelude::*;
use wyrm_common::ByteView;

use crate::error::{Error, ErrorKind};

const SHT_NOBITS: u32 = elf::section_header::SHT_NOBITS;
const SHT_RELA: u32 = elf::section_header::SHT_RELA;
const SHF_COMPRESSED: u64 = elf::section_header::SHF_COMPRESSED as u64;
const SHF_GROUP: u64 = elf::section_header::SHF_GROUP as u64;

/// The debug sections consumed by the indexer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SectionKind {
    Symtab,
    Abbrev,
    Info,
    Line,
    Str,
}

impl SectionKind {
    const ALL: [SectionKind; 5] = [
        SectionKind::Symtab,
        SectionKind::Abbrev,
        SectionKind::Info,
        SectionKind::Line,
        SectionKind::Str,
    ];

    fn name(self) -> &'static str {
        match self {
            SectionKind::Symtab => ".symtab",
            SectionKind::Abbrev => ".debug_abbrev",
            SectionKind::Info => ".debug_info",
            SectionKind::Line => ".debug_line",
            SectionKind::Str => ".debug_str",
        }
    }

    fn compressed_name(self) -> Option<&'static str> {
        match self {
            SectionKind::Symtab => None,
            SectionKind::Abbrev => Some(".zdebug_abbrev"),
            SectionKind::Info => Some(".zdebug_info"),
            SectionKind::Line => Some(".zdebug_line"),
            SectionKind::Str => Some(".zdebug_str"),
        }
    }
}

/// A single `Elf64_Rela` entry against one of the captured sections.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Rela {
    pub offset: u64,
    pub sym: u32,
    pub rtype: u32,
    pub addend: i64,
}

/// All relocation entries of one `SHT_RELA` section, tagged with their target.
#[derive(Clone, Debug)]
pub(crate) struct RelaBlock {
    pub target: SectionKind,
    pub entries: Vec<Rela>,
}

/// The captured state of one registered ELF file.
///
/// Section images are owned so that the relocation engine can patch them. The symbol table is
/// reduced to its `st_value` column, which is all relocation needs; both it and the pending
/// relocation blocks are dropped once the file has been indexed.
#[derive(Debug)]
pub(crate) struct ElfFile {
    path: PathBuf,
    endian: RunTimeEndian,
    pub debug_abbrev: Vec<u8>,
    pub debug_info: Vec<u8>,
    pub debug_line: Option<Vec<u8>>,
    pub debug_str: Vec<u8>,
    pub symtab: Vec<u64>,
    pub relas: Vec<RelaBlock>,
    /// Sorted start offsets of the file's compilation units, filled in when the file is indexed.
    pub units: Vec<u64>,
}

impl ElfFile {
    /// Parses the ELF container and captures the five debug sections.
    ///
    /// `path` is the identity the file is registered under; `view` holds the raw file bytes.
    pub fn load(path: PathBuf, view: &ByteView) -> Result<ElfFile, Error> {
        let data = view.as_slice();

        if data.get(..elf::header::SELFMAG) != Some(&elf::header::ELFMAG[..]) {
            return Err(ErrorKind::NotElf.into());
        }

        let header = elf::Elf::parse_header(data)
            .map_err(|_| Error::new(ErrorKind::ElfFormat, "ELF header unreadable"))?;

        if header.e_ident[elf::header::EI_CLASS] != elf::header::ELFCLASS64 {
            return Err(Error::new(ErrorKind::ElfFormat, "only 64-bit ELF is supported"));
        }

        let endian = match header.e_ident[elf::header::EI_DATA] {
            elf::header::ELFDATA2LSB => RunTimeEndian::Little,
            elf::header::ELFDATA2MSB => RunTimeEndian::Big,
            _ => return Err(Error::new(ErrorKind::ElfFormat, "unknown ELF data encoding")),
        };

        let ctx = Ctx {
            container: Container::Big,
            le: match endian {
                RunTimeEndian::Little => scroll::Endian::Little,
                RunTimeEndian::Big => scroll::Endian::Big,
            },
        };

        let sections =
            SectionHeader::parse(data, header.e_shoff as usize, header.e_shnum as usize, ctx)
                .map_err(|_| Error::new(ErrorKind::ElfFormat, "unable to parse section headers"))?;

        let shdr_strtab = match sections.get(header.e_shstrndx as usize) {
            Some(shdr) => Strtab::parse(data, shdr.sh_offset as usize, shdr.sh_size as usize, 0x0)
                .map_err(|_| Error::new(ErrorKind::ElfFormat, "malformed section name table"))?,
            None => Strtab::default(),
        };

        // Pass 1: locate the five sections by name.
        let mut indices: [Option<usize>; 5] = [None; 5];
        for (index, section) in sections.iter().enumerate() {
            if section.sh_type == SHT_NOBITS || section.sh_flags & SHF_GROUP != 0 {
                continue;
            }
            if section.sh_offset == 0 {
                // dsymutil-style phantom headers; no section can start at file offset zero.
                continue;
            }

            let name = match shdr_strtab.get_at(section.sh_name) {
                Some(name) => name,
                None => continue,
            };

            for (slot, kind) in indices.iter_mut().zip(SectionKind::ALL) {
                if slot.is_none()
                    && (name == kind.name() || Some(name) == kind.compressed_name())
                {
                    *slot = Some(index);
                }
            }
        }

        for (slot, kind) in indices.iter().zip(SectionKind::ALL) {
            if slot.is_none()
                && !matches!(kind, SectionKind::Symtab | SectionKind::Line)
            {
                return Err(Error::new(
                    ErrorKind::MissingDebug,
                    format!("no {} section", kind.name()),
                ));
            }
        }

        let image = |index: Option<usize>| -> Result<Option<Vec<u8>>, Error> {
            let section = match index {
                Some(index) => &sections[index],
                None => return Ok(None),
            };
            let bytes = section_bytes(data, section)?;

            let name = shdr_strtab.get_at(section.sh_name).unwrap_or_default();
            if section.sh_flags & SHF_COMPRESSED != 0 || name.starts_with(".z") {
                decompress_section(bytes, ctx).map(Some)
            } else {
                Ok(Some(bytes.to_vec()))
            }
        };

        let required = |bytes: Option<Vec<u8>>| bytes.ok_or(Error::from(ErrorKind::MissingDebug));
        let debug_abbrev = required(image(indices[1])?)?;
        let debug_info = required(image(indices[2])?)?;
        let debug_line = image(indices[3])?;
        let debug_str = required(image(indices[4])?)?;

        let symtab = match indices[0] {
            Some(index) => {
                let section = &sections[index];
                let count = if section.sh_entsize == 0 {
                    0
                } else {
                    (section.sh_size / section.sh_entsize) as usize
                };
                let syms = elf::Symtab::parse(data, section.sh_offset as usize, count, ctx)
                    .map_err(|_| Error::new(ErrorKind::ElfFormat, "malformed symbol table"))?;
                syms.iter().map(|sym| sym.st_value).collect()
            }
            None => Vec::new(),
        };

        // Pass 2: capture every RELA section targeting one of the five.
        let mut relas = Vec::new();
        for section in &sections {
            if section.sh_type != SHT_RELA {
                continue;
            }
            let target = indices
                .iter()
                .zip(SectionKind::ALL)
                .find(|(slot, _)| **slot == Some(section.sh_info as usize))
                .map(|(_, kind)| kind);
            let target = match target {
                Some(target) => target,
                None => continue,
            };

            let entries = elf::RelocSection::parse(
                data,
                section.sh_offset as usize,
                section.sh_size as usize,
                true,
                ctx,
            )
            .map_err(|_| Error::new(ErrorKind::ElfFormat, "malformed relocation section"))?;

            relas.push(RelaBlock {
                target,
                entries: entries
                    .iter()
                    .map(|reloc| Rela {
                        offset: reloc.r_offset,
                        sym: reloc.r_sym as u32,
                        rtype: reloc.r_type,
                        addend: reloc.r_addend.unwrap_or(0),
                    })
                    .collect(),
            });
        }

        Ok(ElfFile {
            path,
            endian,
            debug_abbrev,
            debug_info,
            debug_line,
            debug_str,
            symtab,
            relas,
            units: Vec::new(),
        })
    }

    /// The path this file is registered under.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The byte order of the file's sections.
    pub fn endian(&self) -> RunTimeEndian {
        self.endian
    }

    /// Applies all pending relocations to this file's section images.
    fn apply_relocations(&mut self) -> Result<(), Error> {
        let blocks = std::mem::take(&mut self.relas);
        let total: usize = blocks.iter().map(|block| block.entries.len()).sum();
        if total != 0 {
            tracing::trace!(path = %self.path.display(), relocations = total, "relocating");
        }

        let ElfFile {
            debug_abbrev,
            debug_info,
            debug_line,
            debug_str,
            symtab,
            endian,
            ..
        } = self;

        for block in &blocks {
            let target: &mut [u8] = match block.target {
                SectionKind::Abbrev => debug_abbrev,
                SectionKind::Info => debug_info,
                SectionKind::Line => match debug_line {
                    Some(line) => line,
                    None => continue,
                },
                SectionKind::Str => debug_str,
                SectionKind::Symtab => continue,
            };
            apply_block(target, &block.entries, symtab, *endian)?;
        }

        Ok(())
    }
}

#[cfg(test)]
impl ElfFile {
    /// Builds a file record directly from section images, bypassing the ELF container.
    pub(crate) fn synthetic(
        debug_abbrev: Vec<u8>,
        debug_info: Vec<u8>,
        debug_line: Option<Vec<u8>>,
        debug_str: Vec<u8>,
    ) -> ElfFile {
        ElfFile {
            path: PathBuf::from("<synthetic>"),
            endian: RunTimeEndian::Little,
            debug_abbrev,
            debug_info,
            debug_line,
            debug_str,
            symtab: Vec::new(),
            relas: Vec::new(),
            units: Vec::new(),
        }
    }
}

/// Applies the relocations of all newly registered files, in parallel.
///
/// Section buffers have no concurrent readers during this phase; each worker owns the images of
/// the files it patches. The first error wins and cancels the remaining work.
pub(crate) fn apply_relocations(files: &mut [ElfFile]) -> Result<(), Error> {
    files.par_iter_mut().try_for_each(ElfFile::apply_relocations)
}

fn apply_block(
    target: &mut [u8],
    entries: &[Rela],
    symtab: &[u64],
    endian: RunTimeEndian,
) -> Result<(), Error> {
    for rela in entries {
        if rela.rtype == R_X86_64_NONE {
            continue;
        }

        let size = match rela.rtype {
            R_X86_64_32 => 4,
            R_X86_64_64 => 8,
            _ => {
                return Err(Error::new(
                    ErrorKind::ElfFormat,
                    format!("unsupported relocation type {}", rela.rtype),
                ))
            }
        };

        let sym = *symtab.get(rela.sym as usize).ok_or_else(|| {
            Error::new(ErrorKind::ElfFormat, "relocation against invalid symbol")
        })?;
        let value = sym.wrapping_add(rela.addend as u64);

        let offset = usize::try_from(rela.offset)
            .ok()
            .filter(|offset| offset.checked_add(size).is_some_and(|end| end <= target.len()))
            .ok_or_else(|| {
                Error::new(ErrorKind::ElfFormat, "relocation offset out of range")
            })?;

        match (rela.rtype, endian) {
            (R_X86_64_32, RunTimeEndian::Little) => {
                target[offset..offset + 4].copy_from_slice(&(value as u32).to_le_bytes())
            }
            (R_X86_64_32, RunTimeEndian::Big) => {
                target[offset..offset + 4].copy_from_slice(&(value as u32).to_be_bytes())
            }
            (R_X86_64_64, RunTimeEndian::Little) => {
                target[offset..offset + 8].copy_from_slice(&value.to_le_bytes())
            }
            (R_X86_64_64, RunTimeEndian::Big) => {
                target[offset..offset + 8].copy_from_slice(&value.to_be_bytes())
            }
            _ => unreachable!(),
        }
    }

    Ok(())
}

fn section_bytes<'data>(data: &'data [u8], section: &SectionHeader) -> Result<&'data [u8], Error> {
    let offset = section.sh_offset as usize;
    let size = section.sh_size as usize;
    data.get(offset..)
        .and_then(|rest| rest.get(..size))
        .ok_or_else(|| Error::new(ErrorKind::ElfFormat, "section exceeds file size"))
}

/// Decompresses a zlib-compressed section image.
///
/// Handles both the legacy GNU header (`"ZLIB"` magic followed by a big-endian size) and the
/// `SHF_COMPRESSED` compression header.
fn decompress_section(section_data: &[u8], ctx: Ctx) -> Result<Vec<u8>, Error> {
    let malformed = || Error::new(ErrorKind::ElfFormat, "malformed compressed section");

    let (size, compressed) = if section_data.starts_with(b"ZLIB") {
        // 4 bytes of magic followed by an 8-byte big-endian size prefix.
        if section_data.len() < 12 {
            return Err(malformed());
        }

        let mut size_bytes = [0; 8];
        size_bytes.copy_from_slice(&section_data[4..12]);

        (u64::from_be_bytes(size_bytes), &section_data[12..])
    } else {
        let compression = CompressionHeader::parse(section_data, 0, ctx).map_err(|_| malformed())?;
        if compression.ch_type != ELFCOMPRESS_ZLIB {
            return Err(Error::new(
                ErrorKind::ElfFormat,
                "unsupported section compression type",
            ));
        }

        let compressed = section_data
            .get(CompressionHeader::size(ctx)..)
            .ok_or_else(malformed)?;
        (compression.ch_size, compressed)
    };

    let mut decompressed = Vec::with_capacity(size as usize);
    Decompress::new(true)
        .decompress_vec(compressed, &mut decompressed, FlushDecompress::Finish)
        .map_err(|_| malformed())?;

    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    fn reloc(offset: u64, sym: u32, rtype: u32, addend: i64) -> Rela {
        Rela {
            offset,
            sym,
            rtype,
            addend,
        }
    }

    #[test]
    fn test_apply_64() {
        let mut target = vec![0u8; 16];
        let symtab = [0x1000u64, 0x2000];
        apply_block(
            &mut target,
            &[reloc(8, 1, R_X86_64_64, 0x10)],
            &symtab,
            RunTimeEndian::Little,
        )
        .unwrap();
        assert_eq!(&target[8..16], &0x2010u64.to_le_bytes());
    }

    #[test]
    fn test_apply_32_truncates() {
        let mut target = vec![0u8; 8];
        let symtab = [0x1_0000_2000u64];
        apply_block(
            &mut target,
            &[reloc(0, 0, R_X86_64_32, 0)],
            &symtab,
            RunTimeEndian::Little,
        )
        .unwrap();
        assert_eq!(&target[..4], &0x2000u32.to_le_bytes());
        assert_eq!(&target[4..], &[0u8; 4]);
    }

    #[test]
    fn test_apply_none_is_noop() {
        let mut target = vec![0xffu8; 8];
        apply_block(
            &mut target,
            &[reloc(0, 99, R_X86_64_NONE, 0)],
            &[],
            RunTimeEndian::Little,
        )
        .unwrap();
        assert_eq!(target, vec![0xffu8; 8]);
    }

    #[test]
    fn test_apply_unknown_type() {
        let mut target = vec![0u8; 8];
        let err = apply_block(
            &mut target,
            &[reloc(0, 0, 42, 0)],
            &[0],
            RunTimeEndian::Little,
        )
        .unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::ElfFormat);
    }

    #[test]
    fn test_apply_out_of_range() {
        let mut target = vec![0u8; 8];

        let err = apply_block(
            &mut target,
            &[reloc(6, 0, R_X86_64_32, 0)],
            &[0],
            RunTimeEndian::Little,
        )
        .unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::ElfFormat);

        let err = apply_block(
            &mut target,
            &[reloc(0, 1, R_X86_64_32, 0)],
            &[0],
            RunTimeEndian::Little,
        )
        .unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::ElfFormat);
    }

    #[test]
    fn test_apply_big_endian() {
        let mut target = vec![0u8; 4];
        apply_block(
            &mut target,
            &[reloc(0, 0, R_X86_64_32, 1)],
            &[0x1233],
            RunTimeEndian::Big,
        )
        .unwrap();
        assert_eq!(target, 0x1234u32.to_be_bytes());
    }
}
