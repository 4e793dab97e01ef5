//! Synthetic ELF and DWARF fixtures for tests.
//!
//! Index tests need object files with precisely controlled debug information: specific
//! abbreviation tables, DIE trees, line-number programs and relocations. Checking in binary
//! fixtures for every combination would be unmaintainable, so this crate builds them in memory.
//! All builders emit little-endian, 32-bit-format DWARF version 4 unless stated otherwise.

use goblin::elf::header;
use goblin::elf::section_header;

/// Appends an unsigned LEB128 encoding of `value`.
pub fn leb128(bytes: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        bytes.push(byte);
        if value == 0 {
            return;
        }
    }
}

/// Builds a `.debug_abbrev` section.
#[derive(Default)]
pub struct DebugAbbrev {
    bytes: Vec<u8>,
}

impl DebugAbbrev {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts an abbreviation declaration.
    pub fn decl(mut self, code: u64, tag: u16, children: bool) -> Self {
        leb128(&mut self.bytes, code);
        leb128(&mut self.bytes, u64::from(tag));
        self.bytes.push(children as u8);
        self
    }

    /// Adds an attribute specification to the current declaration.
    pub fn attrib(mut self, at: u16, form: u16) -> Self {
        leb128(&mut self.bytes, u64::from(at));
        leb128(&mut self.bytes, u64::from(form));
        self
    }

    /// Terminates the current declaration.
    pub fn end_decl(mut self) -> Self {
        self.bytes.push(0);
        self.bytes.push(0);
        self
    }

    /// Terminates the table and returns the section bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.bytes.push(0);
        self.bytes
    }
}

/// Builds a `.debug_str` section and hands out the offsets of interned strings.
#[derive(Default)]
pub struct DebugStr {
    bytes: Vec<u8>,
}

impl DebugStr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a string and returns its section offset.
    pub fn add(&mut self, s: &[u8]) -> u64 {
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(s);
        self.bytes.push(0);
        offset
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Builds a `.debug_info` section of one or more DWARF32 compilation units.
#[derive(Default)]
pub struct DebugInfo {
    bytes: Vec<u8>,
    unit_start: Option<usize>,
}

impl DebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a unit header. The unit length is patched in by [`end_unit`](Self::end_unit).
    pub fn begin_unit(&mut self, version: u16, abbrev_offset: u32, address_size: u8) {
        assert!(self.unit_start.is_none(), "unit already open");
        self.unit_start = Some(self.bytes.len());
        self.bytes.extend_from_slice(&0u32.to_le_bytes());
        self.bytes.extend_from_slice(&version.to_le_bytes());
        self.bytes.extend_from_slice(&abbrev_offset.to_le_bytes());
        self.bytes.push(address_size);
    }

    /// Patches the open unit's length.
    pub fn end_unit(&mut self) {
        let start = self.unit_start.take().expect("no open unit");
        let length = (self.bytes.len() - start - 4) as u32;
        self.bytes[start..start + 4].copy_from_slice(&length.to_le_bytes());
    }

    /// The current offset within the section.
    pub fn offset(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// The current offset relative to the open unit's header.
    pub fn unit_offset(&self) -> u64 {
        (self.bytes.len() - self.unit_start.expect("no open unit")) as u64
    }

    pub fn uleb(&mut self, value: u64) {
        leb128(&mut self.bytes, value);
    }

    pub fn u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Overwrites 4 bytes at an absolute section offset, for back-patching references.
    pub fn patch_u32(&mut self, offset: u64, value: u32) {
        let offset = offset as usize;
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn cstr(&mut self, s: &[u8]) {
        self.bytes.extend_from_slice(s);
        self.bytes.push(0);
    }

    pub fn finish(self) -> Vec<u8> {
        assert!(self.unit_start.is_none(), "unit left open");
        self.bytes
    }
}

/// Builds a `.debug_line` section containing line-number program headers.
#[derive(Default)]
pub struct DebugLine {
    bytes: Vec<u8>,
}

/// One line-number program: its directories and file entries.
pub struct LineProgram {
    version: u16,
    directories: Vec<Vec<u8>>,
    files: Vec<(Vec<u8>, u64)>,
}

impl LineProgram {
    pub fn new(version: u16) -> Self {
        LineProgram {
            version,
            directories: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn directory(mut self, path: &[u8]) -> Self {
        self.directories.push(path.to_vec());
        self
    }

    pub fn file(mut self, name: &[u8], directory_index: u64) -> Self {
        self.files.push((name.to_vec(), directory_index));
        self
    }
}

impl DebugLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a program header and returns its section offset, for use as `DW_AT_stmt_list`.
    pub fn add(&mut self, program: LineProgram) -> u64 {
        let offset = self.bytes.len() as u64;

        let mut body = Vec::new();
        body.extend_from_slice(&program.version.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // header_length, unused by the reader
        body.push(1); // minimum_instruction_length
        if program.version >= 4 {
            body.push(1); // maximum_operations_per_instruction
        }
        body.push(1); // default_is_stmt
        body.push(0xfb); // line_base
        body.push(14); // line_range
        body.push(1); // opcode_base

        for directory in &program.directories {
            body.extend_from_slice(directory);
            body.push(0);
        }
        body.push(0);
        for (name, directory_index) in &program.files {
            body.extend_from_slice(name);
            body.push(0);
            leb128(&mut body, *directory_index);
            leb128(&mut body, 0); // mtime
            leb128(&mut body, 0); // size
        }
        body.push(0);

        self.bytes
            .extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&body);
        offset
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// One relocation for [`ElfBuilder::rela`].
#[derive(Clone, Copy)]
pub struct RelaEntry {
    pub offset: u64,
    pub sym: u32,
    pub rtype: u32,
    pub addend: i64,
}

struct SectionSpec {
    name: String,
    sh_type: u32,
    data: Vec<u8>,
    info: u32,
    entsize: u64,
}

/// Builds a minimal 64-bit little-endian relocatable ELF image.
#[derive(Default)]
pub struct ElfBuilder {
    sections: Vec<SectionSpec>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `SHT_PROGBITS` section and returns its section header index.
    pub fn section(&mut self, name: &str, data: Vec<u8>) -> u32 {
        self.push(SectionSpec {
            name: name.to_owned(),
            sh_type: section_header::SHT_PROGBITS,
            data,
            info: 0,
            entsize: 0,
        })
    }

    /// Adds a `.symtab` whose symbol at index `i` has `st_value` `values[i]`.
    pub fn symtab(&mut self, values: &[u64]) -> u32 {
        let mut data = Vec::new();
        for &value in values {
            data.extend_from_slice(&0u32.to_le_bytes()); // st_name
            data.push(0); // st_info
            data.push(0); // st_other
            data.extend_from_slice(&1u16.to_le_bytes()); // st_shndx
            data.extend_from_slice(&value.to_le_bytes());
            data.extend_from_slice(&0u64.to_le_bytes()); // st_size
        }
        self.push(SectionSpec {
            name: ".symtab".to_owned(),
            sh_type: section_header::SHT_SYMTAB,
            data,
            info: 0,
            entsize: 24,
        })
    }

    /// Adds a `SHT_RELA` section targeting the section at index `target`.
    pub fn rela(&mut self, name: &str, target: u32, entries: &[RelaEntry]) -> u32 {
        let mut data = Vec::new();
        for entry in entries {
            data.extend_from_slice(&entry.offset.to_le_bytes());
            let info = (u64::from(entry.sym) << 32) | u64::from(entry.rtype);
            data.extend_from_slice(&info.to_le_bytes());
            data.extend_from_slice(&entry.addend.to_le_bytes());
        }
        self.push(SectionSpec {
            name: name.to_owned(),
            sh_type: section_header::SHT_RELA,
            data,
            info: target,
            entsize: 24,
        })
    }

    fn push(&mut self, spec: SectionSpec) -> u32 {
        self.sections.push(spec);
        // Section header index 0 is the null section.
        self.sections.len() as u32
    }

    /// Serialises the image.
    pub fn build(self) -> Vec<u8> {
        let mut shstrtab = vec![0u8];
        let mut name_offsets = vec![0u32];
        for spec in &self.sections {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(spec.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab");
        shstrtab.push(0);

        let ehsize = 64usize;
        let shentsize = 64usize;
        let shnum = self.sections.len() + 2; // null + sections + .shstrtab

        // Section data follows the ELF header; the section header table goes last.
        let mut data_offsets = Vec::new();
        let mut cursor = ehsize;
        for spec in &self.sections {
            data_offsets.push(cursor);
            cursor += spec.data.len();
        }
        let shstrtab_offset = cursor;
        cursor += shstrtab.len();
        let shoff = cursor;

        let mut out = Vec::with_capacity(shoff + shnum * shentsize);

        // ELF header.
        out.extend_from_slice(&header::ELFMAG[..]);
        out.push(header::ELFCLASS64);
        out.push(header::ELFDATA2LSB);
        out.push(1); // EI_VERSION
        out.extend_from_slice(&[0; 9]); // OS ABI, ABI version, padding
        out.extend_from_slice(&header::ET_REL.to_le_bytes());
        out.extend_from_slice(&header::EM_X86_64.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        out.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
        out.extend_from_slice(&(shoff as u64).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(ehsize as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
        out.extend_from_slice(&(shentsize as u16).to_le_bytes());
        out.extend_from_slice(&(shnum as u16).to_le_bytes());
        out.extend_from_slice(&((shnum - 1) as u16).to_le_bytes()); // e_shstrndx

        // Section data.
        for spec in &self.sections {
            out.extend_from_slice(&spec.data);
        }
        out.extend_from_slice(&shstrtab);

        // Section header table: the null section first.
        let encode_header =
            |name: u32, sh_type: u32, offset: usize, size: usize, info: u32, entsize: u64| {
                let mut sh = Vec::with_capacity(shentsize);
                sh.extend_from_slice(&name.to_le_bytes());
                sh.extend_from_slice(&sh_type.to_le_bytes());
                sh.extend_from_slice(&0u64.to_le_bytes()); // sh_flags
                sh.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
                sh.extend_from_slice(&(offset as u64).to_le_bytes());
                sh.extend_from_slice(&(size as u64).to_le_bytes());
                sh.extend_from_slice(&0u32.to_le_bytes()); // sh_link
                sh.extend_from_slice(&info.to_le_bytes());
                sh.extend_from_slice(&1u64.to_le_bytes()); // sh_addralign
                sh.extend_from_slice(&entsize.to_le_bytes());
                sh
            };

        out.extend_from_slice(&encode_header(0, section_header::SHT_NULL, 0, 0, 0, 0));
        for (index, (spec, &offset)) in self.sections.iter().zip(&data_offsets).enumerate() {
            out.extend_from_slice(&encode_header(
                name_offsets[index + 1],
                spec.sh_type,
                offset,
                spec.data.len(),
                spec.info,
                spec.entsize,
            ));
        }
        out.extend_from_slice(&encode_header(
            shstrtab_name,
            section_header::SHT_STRTAB,
            shstrtab_offset,
            shstrtab.len(),
            0,
            0,
        ));

        out
    }
}

/// A minimal 32-bit ELF header, for exercising the 64-bit-only restriction.
pub fn minimal_elf32() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&header::ELFMAG[..]);
    out.push(header::ELFCLASS32);
    out.push(header::ELFDATA2LSB);
    out.push(1);
    out.extend_from_slice(&[0; 9]);
    out.extend_from_slice(&header::ET_REL.to_le_bytes());
    out.extend_from_slice(&header::EM_386.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // e_entry
    out.extend_from_slice(&0u32.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&52u16.to_le_bytes()); // e_ehsize
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&40u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}
