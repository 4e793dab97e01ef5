//! Indexing of DWARF debugging information across many ELF files.
//!
//! This crate is the core of `wyrm`, a programmable debugger library: a fast, concurrent
//! multi-map from identifier name to the Debugging Information Entries (DIEs) defining entities
//! of that name, built by parsing `.debug_abbrev`, `.debug_info`, `.debug_line`, `.debug_str`
//! and `.symtab` directly. Debugging a crashed kernel routinely means consuming the debug
//! information of hundreds of modules, so the index is built in parallel and is designed around
//! a small memory footprint: entries borrow their names from the owning file's sections and
//! collapse duplicate declarations across translation units.
//!
//! The central type is [`DwarfIndex`]. Files are registered with [`DwarfIndex::open`] (or
//! [`DwarfIndex::open_view`] for caller-owned bytes), indexed by [`DwarfIndex::update`], and
//! queried through [`DwarfIndex::find`] and [`DwarfIndex::iter`]. Query results resolve on
//! demand into [`gimli`] units and entries for further inspection.
//!
//! # Background
//!
//! Generic DWARF consumers dispatch every attribute through an "attribute × form" decision per
//! DIE. For index construction that is wasted work: almost all attributes are skipped, and only
//! name, declaration coordinates and tree-shape attributes matter. Each unit's abbreviation
//! table is therefore compiled once into a compact skip/parse instruction stream that the DIE
//! scanner interprets, which keeps the hot loop branch-light. See the `abbrev` module for the
//! encoding.
//!
//! Supported inputs are 64-bit little- or big-endian ELF and DWARF versions 2 through 4 in
//! DWARF32 or DWARF64 encoding, with `R_X86_64_NONE`/`R_X86_64_32`/`R_X86_64_64` relocations
//! applied to the debug sections of relocatable files. Split DWARF and type-unit
//! cross-references (`DW_FORM_ref_sig8`) are not followed.
//!
//! [`DwarfIndex`]: struct.DwarfIndex.html
//! [`DwarfIndex::open`]: struct.DwarfIndex.html#method.open
//! [`DwarfIndex::open_view`]: struct.DwarfIndex.html#method.open_view
//! [`DwarfIndex::update`]: struct.DwarfIndex.html#method.update
//! [`DwarfIndex::find`]: struct.DwarfIndex.html#method.find
//! [`DwarfIndex::iter`]: struct.DwarfIndex.html#method.iter

#![warn(missing_docs)]

mod abbrev;
mod elf;
mod error;
mod index;
mod line;
mod reader;
mod scan;
mod unit;

pub use crate::error::*;
pub use crate::index::*;
pub use crate::line::file_path_hash;

#[doc(hidden)]
pub use gimli;
