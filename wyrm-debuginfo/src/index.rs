//! The concurrent, sharded name index.
//!
//! The index maps identifier names to the Debugging Information Entries that define entities of
//! that name, across every registered ELF file. It is the data structure every higher-level
//! debugger operation (type lookup, object lookup, stack-frame variable resolution) consults, so
//! registration is cheap and all heavy work happens in a single parallel [`update`].
//!
//! Internally the map is split into 2⁸ shards selected by the high bits of a name's hash; each
//! shard pairs a lock-protected head table with a dense array of entries threaded into per-name
//! chains. Names are never copied: entries reference the bytes inside their owning file's
//! `.debug_str` or `.debug_info` image.
//!
//! [`update`]: struct.DwarfIndex.html#method.update

use std::collections::HashMap;
use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use gimli::{DwTag, EndianSlice, RunTimeEndian, UnitOffset};
use hashbrown::hash_table::Entry as TableEntry;
use hashbrown::HashTable;
use parking_lot::Mutex;
use rayon::prelude::*;
use siphasher::sip::SipHasher13;
use wyrm_common::ByteView;

use crate::elf::{self, ElfFile};
use crate::error::{Error, ErrorKind};
use crate::scan;
use crate::unit::{self, Unit};

const SHARD_COUNT: usize = 256;
const NO_NEXT: u32 = u32::MAX;

bitflags! {
    /// Selects which kinds of named entities an index collects.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IndexFlags: u32 {
        /// Base, class, enumeration, structure, typedef and union types.
        const TYPES = 1;
        /// Variables.
        const VARIABLES = 1 << 1;
        /// Enumerators, indexed under the offset of their enumeration type.
        const ENUMERATORS = 1 << 2;
        /// Functions.
        const FUNCTIONS = 1 << 3;
    }
}

/// Identifies a registered file within its index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) u32);

/// The section a name is stored in.
#[derive(Clone, Copy, Debug)]
pub(crate) enum NameSection {
    /// `.debug_str`.
    Str,
    /// An inline string in `.debug_info`.
    Info,
}

/// A name resolved during scanning: the bytes plus their location in the owning file.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NameLoc<'data> {
    pub bytes: &'data [u8],
    pub section: NameSection,
    pub offset: u64,
}

/// The stored location of an entry's name.
///
/// Entries never own name memory; they record where in the owning file's sections the bytes
/// live, which stays valid for the life of the file.
#[derive(Clone, Copy, Debug)]
struct NameRef {
    section: NameSection,
    offset: u64,
    len: u32,
}

/// One indexed DIE.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IndexEntry {
    tag: u16,
    next: u32,
    file: u32,
    name: NameRef,
    file_name_hash: u64,
    offset: u64,
}

#[derive(Default, Debug)]
struct ShardInner {
    heads: HashTable<u32>,
    entries: Vec<IndexEntry>,
}

#[derive(Debug)]
struct Shard {
    inner: Mutex<ShardInner>,
}

/// The sharded name map.
#[derive(Debug)]
pub(crate) struct ShardList {
    shards: Vec<Shard>,
}

fn name_hash(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write(bytes);
    hasher.finish()
}

fn entry_name<'a>(files: &'a [ElfFile], entry: &IndexEntry) -> &'a [u8] {
    let file = &files[entry.file as usize];
    let data: &[u8] = match entry.name.section {
        NameSection::Str => &file.debug_str,
        NameSection::Info => &file.debug_info,
    };
    &data[entry.name.offset as usize..entry.name.offset as usize + entry.name.len as usize]
}

impl ShardList {
    pub(crate) fn new() -> ShardList {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        shards.resize_with(SHARD_COUNT, || Shard {
            inner: Mutex::new(ShardInner::default()),
        });
        ShardList { shards }
    }

    /// Inserts one indexed DIE.
    ///
    /// Insertion is idempotent under `(name, tag, file_name_hash)`: a duplicate collapses into
    /// the existing entry, which is how identical declarations across translation units (and
    /// across files) fold together. New entries are appended to the shard's dense array and
    /// threaded onto the tail of their name's chain.
    pub(crate) fn insert(
        &self,
        files: &[ElfFile],
        name: NameLoc<'_>,
        tag: DwTag,
        file_name_hash: u64,
        file: u32,
        offset: u64,
    ) {
        let hash = name_hash(name.bytes);
        // The low bits drive the bucket probe inside the shard, so take the shard index from the
        // high bits of the same hash.
        let shard = &self.shards[(hash >> 56) as usize];
        let mut guard = shard.inner.lock();
        let ShardInner { heads, entries } = &mut *guard;

        let new_index = entries.len() as u32;
        let new_entry = IndexEntry {
            tag: tag.0,
            next: NO_NEXT,
            file,
            name: NameRef {
                section: name.section,
                offset: name.offset,
                len: name.bytes.len() as u32,
            },
            file_name_hash,
            offset,
        };

        let slot = heads.entry(
            hash,
            |&head| entry_name(files, &entries[head as usize]) == name.bytes,
            |&head| name_hash(entry_name(files, &entries[head as usize])),
        );
        match slot {
            TableEntry::Occupied(head) => {
                let mut index = *head.get();
                loop {
                    let entry = &entries[index as usize];
                    if entry.tag == tag.0 && entry.file_name_hash == file_name_hash {
                        return;
                    }
                    if entry.next == NO_NEXT {
                        break;
                    }
                    index = entry.next;
                }
                entries[index as usize].next = new_index;
                entries.push(new_entry);
            }
            TableEntry::Vacant(slot) => {
                entries.push(new_entry);
                slot.insert(new_index);
            }
        }
    }

    /// Discards every entry belonging to a file with index `first_file` or higher.
    ///
    /// Entries of one update always occupy a contiguous suffix of each shard's dense array, so
    /// truncating from the tail is sufficient. Head and chain links that now point past the end
    /// are swept afterwards.
    fn rollback(&mut self, first_file: u32) {
        for shard in &mut self.shards {
            let inner = shard.inner.get_mut();

            let mut len = inner.entries.len();
            while len > 0 && inner.entries[len - 1].file >= first_file {
                len -= 1;
            }
            inner.entries.truncate(len);

            let len = len as u32;
            inner.heads.retain(|&mut head| head < len);
            for entry in &mut inner.entries {
                if entry.next != NO_NEXT && entry.next >= len {
                    entry.next = NO_NEXT;
                }
            }
        }
    }
}

#[cfg(test)]
impl ShardList {
    /// All entries in deterministic iteration order, for assertions.
    pub(crate) fn snapshot(&self) -> Vec<IndexEntry> {
        self.shards
            .iter()
            .flat_map(|shard| shard.inner.lock().entries.clone())
            .collect()
    }
}

#[cfg(test)]
impl IndexEntry {
    pub(crate) fn tag(&self) -> u16 {
        self.tag
    }

    pub(crate) fn file_name_hash(&self) -> u64 {
        self.file_name_hash
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn name<'a>(&self, files: &'a [ElfFile]) -> &'a [u8] {
        entry_name(files, self)
    }
}

/// A name index over the DWARF debug information of many ELF files.
///
/// Files are registered with [`open`] or [`open_view`] and become queryable after the next
/// [`update`], which indexes all pending files in parallel. A failed update rolls back the files
/// it introduced and leaves previously indexed files untouched. Dropping the index releases all
/// files and entries.
///
/// # Example
///
/// ```no_run
/// use wyrm_debuginfo::{DwarfIndex, IndexFlags};
///
/// # fn main() -> Result<(), wyrm_debuginfo::Error> {
/// let mut index = DwarfIndex::new(IndexFlags::TYPES | IndexFlags::VARIABLES)?;
/// index.open("/lib/modules/vmlinux")?;
/// index.update()?;
///
/// for entry in index.find(b"task_struct", &[gimli::constants::DW_TAG_structure_type]) {
///     println!("{:#x} in {}", entry.debug_info_offset(), entry.file_path().display());
/// }
/// # Ok(())
/// # }
/// ```
///
/// [`open`]: #method.open
/// [`open_view`]: #method.open_view
/// [`update`]: #method.update
#[derive(Debug)]
pub struct DwarfIndex {
    flags: IndexFlags,
    by_path: HashMap<PathBuf, u32>,
    files: Vec<ElfFile>,
    /// Files below this index are committed; the rest are pending the next update.
    committed: usize,
    shards: ShardList,
}

impl DwarfIndex {
    /// Creates an empty index collecting the entities selected by `flags`.
    ///
    /// At least one flag must be set or the call fails with `InvalidArgument`.
    pub fn new(flags: IndexFlags) -> Result<DwarfIndex, Error> {
        if flags.is_empty() {
            return Err(Error::new(ErrorKind::InvalidArgument, "no index flags set"));
        }

        Ok(DwarfIndex {
            flags,
            by_path: HashMap::new(),
            files: Vec::new(),
            committed: 0,
            shards: ShardList::new(),
        })
    }

    /// The flags this index was created with.
    pub fn flags(&self) -> IndexFlags {
        self.flags
    }

    /// Registers the ELF file at `path` for indexing by the next [`update`](#method.update).
    ///
    /// The path is canonicalised first; registering the same canonical path again returns the
    /// existing handle without touching the file.
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<FileId, Error> {
        let path = path.as_ref();
        let canonical = fs::canonicalize(path).map_err(|err| Error::os(path, err))?;

        if let Some(&id) = self.by_path.get(&canonical) {
            return Ok(FileId(id));
        }

        let view = ByteView::open(&canonical).map_err(|err| Error::os(&canonical, err))?;
        self.register(canonical, &view)
    }

    /// Registers an ELF file whose bytes are owned by the caller.
    ///
    /// `path` is the identity the file is registered under and is used verbatim; the bytes do
    /// not have to exist on disk. Registering the same path again returns the existing handle.
    pub fn open_view<P: Into<PathBuf>>(
        &mut self,
        path: P,
        view: &ByteView,
    ) -> Result<FileId, Error> {
        let path = path.into();

        if let Some(&id) = self.by_path.get(&path) {
            return Ok(FileId(id));
        }

        self.register(path, view)
    }

    fn register(&mut self, path: PathBuf, view: &ByteView) -> Result<FileId, Error> {
        let file = ElfFile::load(path.clone(), view)?;

        let id = self.files.len() as u32;
        self.files.push(file);
        self.by_path.insert(path, id);

        tracing::debug!(id, path = %self.files[id as usize].path().display(), "registered file");
        Ok(FileId(id))
    }

    /// The path a file was registered under.
    pub fn file_path(&self, id: FileId) -> Option<&Path> {
        self.files.get(id.0 as usize).map(ElfFile::path)
    }

    /// Indexes all files registered since the last update.
    ///
    /// The update is all-or-nothing: on error, every file it introduced is discarded together
    /// with any entries already produced for it, and the index is left exactly as before the
    /// call. Previously indexed files remain queryable either way. Calling `update` with no
    /// pending files is a no-op.
    #[tracing::instrument(skip_all, fields(pending = self.files.len() - self.committed))]
    pub fn update(&mut self) -> Result<(), Error> {
        if self.committed == self.files.len() {
            return Ok(());
        }

        let base = self.committed;
        match self.index_pending(base) {
            Ok(()) => {
                self.committed = self.files.len();
                tracing::debug!(files = self.files.len() - base, "update committed");
                Ok(())
            }
            Err(err) => {
                self.rollback(base);
                tracing::debug!(error = %err, "update rolled back");
                Err(err)
            }
        }
    }

    fn index_pending(&mut self, base: usize) -> Result<(), Error> {
        elf::apply_relocations(&mut self.files[base..])?;

        for file in &mut self.files[base..] {
            if file.debug_str.last().is_some_and(|&byte| byte != 0) {
                return Err(Error::new(
                    ErrorKind::DwarfFormat,
                    ".debug_str is not NUL-terminated",
                ));
            }
            // The symbol values were only needed for relocation.
            file.symtab = Vec::new();
        }

        let unit_lists = self.files[base..]
            .par_iter()
            .enumerate()
            .map(|(index, file)| {
                unit::split_units((base + index) as u32, &file.debug_info, file.endian())
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let mut units: Vec<Unit> = Vec::new();
        for list in unit_lists {
            units.extend(list);
        }
        for unit in &units {
            self.files[unit.file as usize].units.push(unit.offset);
        }

        tracing::debug!(units = units.len(), "indexing units");

        let files = &self.files;
        let shards = &self.shards;
        let flags = self.flags;
        units
            .par_iter()
            .try_for_each(|unit| scan::index_unit(files, unit, flags, shards))
    }

    fn rollback(&mut self, base: usize) {
        self.shards.rollback(base as u32);
        for file in self.files.drain(base..) {
            self.by_path.remove(file.path());
        }
    }

    /// Returns an iterator over the indexed DIEs with the given name.
    ///
    /// `tags` filters the result to the given DWARF tags; an empty slice matches all. Entries
    /// are yielded in chain order, head to tail.
    pub fn find<'index>(&'index self, name: &[u8], tags: &'index [DwTag]) -> Entries<'index> {
        let hash = name_hash(name);
        let shard_index = (hash >> 56) as usize;
        let inner = self.shards.shards[shard_index].inner.lock();
        let head = inner
            .heads
            .find(hash, |&head| {
                entry_name(&self.files, &inner.entries[head as usize]) == name
            })
            .copied();
        drop(inner);

        Entries {
            index: self,
            tags,
            state: EntriesState::Chain {
                shard: shard_index,
                next: head.unwrap_or(NO_NEXT),
            },
        }
    }

    /// Returns an iterator over every indexed DIE.
    ///
    /// Iteration is deterministic for a given index state: shards in order, entries in insertion
    /// order within each shard.
    pub fn iter(&self) -> Entries<'_> {
        Entries {
            index: self,
            tags: &[],
            state: EntriesState::All { shard: 0, index: 0 },
        }
    }
}

enum EntriesState {
    Chain { shard: usize, next: u32 },
    All { shard: usize, index: u32 },
}

/// An iterator over indexed DIEs, returned by [`DwarfIndex::find`] and [`DwarfIndex::iter`].
///
/// [`DwarfIndex::find`]: struct.DwarfIndex.html#method.find
/// [`DwarfIndex::iter`]: struct.DwarfIndex.html#method.iter
pub struct Entries<'index> {
    index: &'index DwarfIndex,
    tags: &'index [DwTag],
    state: EntriesState,
}

impl<'index> Entries<'index> {
    fn next_entry(&mut self) -> Option<IndexEntry> {
        match &mut self.state {
            EntriesState::Chain { shard, next } => {
                if *next == NO_NEXT {
                    return None;
                }
                let inner = self.index.shards.shards[*shard].inner.lock();
                let entry = inner.entries[*next as usize];
                *next = entry.next;
                Some(entry)
            }
            EntriesState::All { shard, index } => loop {
                if *shard >= SHARD_COUNT {
                    return None;
                }
                let inner = self.index.shards.shards[*shard].inner.lock();
                if (*index as usize) < inner.entries.len() {
                    let entry = inner.entries[*index as usize];
                    *index += 1;
                    return Some(entry);
                }
                *shard += 1;
                *index = 0;
            },
        }
    }
}

impl<'index> Iterator for Entries<'index> {
    type Item = IndexedDie<'index>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.next_entry()?;
            if self.tags.is_empty() || self.tags.contains(&DwTag(entry.tag)) {
                return Some(IndexedDie {
                    index: self.index,
                    entry,
                });
            }
        }
    }
}

/// One occurrence of a named entity in a specific file at a specific DIE offset.
pub struct IndexedDie<'index> {
    index: &'index DwarfIndex,
    entry: IndexEntry,
}

impl<'index> IndexedDie<'index> {
    /// The DWARF tag of the indexed DIE.
    pub fn tag(&self) -> DwTag {
        DwTag(self.entry.tag)
    }

    /// The name the DIE is indexed under.
    pub fn name(&self) -> &'index [u8] {
        entry_name(&self.index.files, &self.entry)
    }

    /// The file the DIE was found in.
    pub fn file(&self) -> FileId {
        FileId(self.entry.file)
    }

    /// The path of the file the DIE was found in.
    pub fn file_path(&self) -> &'index Path {
        self.index.files[self.entry.file as usize].path()
    }

    /// The digest of the DIE's declaring file, or 0 if it has none.
    ///
    /// Compare against [`file_path_hash`](fn.file_path_hash.html) to test for "declared in this
    /// file".
    pub fn file_name_hash(&self) -> u64 {
        self.entry.file_name_hash
    }

    /// The DIE's offset within its file's `.debug_info` section.
    ///
    /// For an enumerator this is the offset of the enclosing enumeration type.
    pub fn debug_info_offset(&self) -> u64 {
        self.entry.offset
    }

    /// Resolves the entry to a DWARF view of the owning file positioned at this DIE.
    pub fn resolve(&self) -> Result<ResolvedDie<'index>, Error> {
        let file = &self.index.files[self.entry.file as usize];

        let unit_offset = file
            .units
            .partition_point(|&offset| offset <= self.entry.offset)
            .checked_sub(1)
            .map(|index| file.units[index])
            .ok_or(ErrorKind::Lookup)?;

        let endian = file.endian();
        let dwarf = gimli::Dwarf::load(|section| -> Result<_, Error> {
            Ok(EndianSlice::new(gimli_section(file, section), endian))
        })?;

        let mut headers = dwarf.debug_info.units();
        while let Some(header) = headers
            .next()
            .map_err(|err| Error::new(ErrorKind::Lookup, err))?
        {
            let matches = header
                .offset()
                .as_debug_info_offset()
                .is_some_and(|offset| offset.0 as u64 == unit_offset);
            if !matches {
                continue;
            }

            let unit = gimli::Unit::new(&dwarf, header)
                .map_err(|err| Error::new(ErrorKind::Lookup, err))?;
            let offset = UnitOffset((self.entry.offset - unit_offset) as usize);
            return Ok(ResolvedDie {
                dwarf,
                unit,
                offset,
            });
        }

        Err(ErrorKind::Lookup.into())
    }
}

fn gimli_section<'data>(file: &'data ElfFile, id: gimli::SectionId) -> &'data [u8] {
    match id {
        gimli::SectionId::DebugAbbrev => &file.debug_abbrev,
        gimli::SectionId::DebugInfo => &file.debug_info,
        gimli::SectionId::DebugLine => file.debug_line.as_deref().unwrap_or(&[]),
        gimli::SectionId::DebugStr => &file.debug_str,
        _ => &[],
    }
}

type Slice<'data> = EndianSlice<'data, RunTimeEndian>;

/// A DWARF view of a file, positioned at one indexed DIE.
pub struct ResolvedDie<'data> {
    dwarf: gimli::Dwarf<Slice<'data>>,
    unit: gimli::Unit<Slice<'data>>,
    offset: UnitOffset<usize>,
}

impl<'data> ResolvedDie<'data> {
    /// The DWARF view of the owning file.
    pub fn dwarf(&self) -> &gimli::Dwarf<Slice<'data>> {
        &self.dwarf
    }

    /// The compilation unit containing the DIE.
    pub fn unit(&self) -> &gimli::Unit<Slice<'data>> {
        &self.unit
    }

    /// The DIE's offset within its compilation unit.
    pub fn offset(&self) -> UnitOffset<usize> {
        self.offset
    }

    /// Reads the DIE itself.
    pub fn entry(
        &self,
    ) -> Result<gimli::DebuggingInformationEntry<'_, '_, Slice<'data>>, Error> {
        self.unit
            .header
            .entry(&self.unit.abbreviations, self.offset)
            .map_err(|err| Error::new(ErrorKind::Lookup, err))
    }
}

impl From<gimli::Error> for Error {
    fn from(err: gimli::Error) -> Self {
        Error::new(ErrorKind::DwarfFormat, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use gimli::constants;
    use similar_asserts::assert_eq;

    fn synthetic_file(debug_str: &[u8]) -> ElfFile {
        ElfFile::synthetic(Vec::new(), Vec::new(), None, debug_str.to_vec())
    }

    fn str_name<'a>(file: &ElfFile, name: &'a [u8]) -> NameLoc<'a> {
        let offset = file
            .debug_str
            .windows(name.len() + 1)
            .position(|window| &window[..name.len()] == name && window[name.len()] == 0)
            .expect("name not in synthetic .debug_str");
        NameLoc {
            bytes: name,
            section: NameSection::Str,
            offset: offset as u64,
        }
    }

    #[test]
    fn test_insert_idempotent() {
        let files = vec![synthetic_file(b"foo\0")];
        let shards = ShardList::new();
        let name = str_name(&files[0], b"foo");

        for _ in 0..3 {
            shards.insert(
                &files,
                name,
                constants::DW_TAG_structure_type,
                0x1234,
                0,
                0x10,
            );
        }

        let total: usize = shards
            .shards
            .iter()
            .map(|shard| shard.inner.lock().entries.len())
            .sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_chain_order_and_dedup() {
        let files = vec![synthetic_file(b"foo\0")];
        let shards = ShardList::new();
        let name = str_name(&files[0], b"foo");

        shards.insert(&files, name, constants::DW_TAG_structure_type, 1, 0, 0x10);
        shards.insert(&files, name, constants::DW_TAG_structure_type, 2, 0, 0x20);
        shards.insert(&files, name, constants::DW_TAG_variable, 1, 0, 0x30);
        // Same tag and file hash as the first insert: collapsed.
        shards.insert(&files, name, constants::DW_TAG_structure_type, 1, 0, 0x40);

        let hash = name_hash(b"foo");
        let shard = &shards.shards[(hash >> 56) as usize];
        let inner = shard.inner.lock();
        assert_eq!(inner.entries.len(), 3);

        let mut offsets = Vec::new();
        let mut next = *inner
            .heads
            .find(hash, |&head| {
                entry_name(&files, &inner.entries[head as usize]) == b"foo"
            })
            .unwrap();
        while next != NO_NEXT {
            let entry = inner.entries[next as usize];
            offsets.push(entry.offset);
            next = entry.next;
        }
        assert_eq!(offsets, [0x10, 0x20, 0x30]);
    }

    #[test]
    fn test_rollback_sweeps_heads_and_links() {
        let files = vec![synthetic_file(b"foo\0"), synthetic_file(b"foo\0bar\0")];
        let mut shards = ShardList::new();
        let foo = str_name(&files[0], b"foo");
        let bar = str_name(&files[1], b"bar");

        shards.insert(&files, foo, constants::DW_TAG_structure_type, 1, 0, 0x10);
        // Entries of the failed file 1: one extending the "foo" chain, one new name.
        shards.insert(&files, foo, constants::DW_TAG_structure_type, 2, 1, 0x20);
        shards.insert(&files, bar, constants::DW_TAG_variable, 0, 1, 0x30);

        shards.rollback(1);

        let hash = name_hash(b"foo");
        let inner = shards.shards[(hash >> 56) as usize].inner.lock();
        let head = *inner
            .heads
            .find(hash, |&head| {
                entry_name(&files, &inner.entries[head as usize]) == b"foo"
            })
            .unwrap();
        let entry = inner.entries[head as usize];
        assert_eq!(entry.offset, 0x10);
        assert_eq!(entry.next, NO_NEXT);
        drop(inner);

        let hash = name_hash(b"bar");
        let inner = shards.shards[(hash >> 56) as usize].inner.lock();
        assert!(inner
            .heads
            .find(hash, |&head| {
                entry_name(&files, &inner.entries[head as usize]) == b"bar"
            })
            .is_none());
    }

    #[test]
    fn test_empty_flags_rejected() {
        let err = DwarfIndex::new(IndexFlags::empty()).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::InvalidArgument);
    }
}
