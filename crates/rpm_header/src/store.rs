//! Decoding of the tag index and bounds checked access to the mapped data store.

use std::borrow::Cow;
use std::fmt;
use std::fmt::Formatter;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use crate::value::{TagKind, TagValue};
use crate::{
    align_up, HeaderError, HEADER_MAGIC_AND_VERSION, INDEX_RECORD_SIZE, LEAD_SIZE, PAGE_SIZE,
    SECTION_HEADER_SIZE, SIGNATURE_TAG_OFFSET,
};

/// Identifies one of the two header sections of a package.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SectionKind {
    /// The signature section that directly follows the lead.
    Signature,
    /// The main header section that follows the signature section.
    Main,
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SectionKind::Signature => write!(f, "signature"),
            SectionKind::Main => write!(f, "main"),
        }
    }
}

/// The location of a header section within the package file.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SectionLayout {
    /// Which section this is.
    pub kind: SectionKind,
    /// Absolute offset of the section header.
    pub header_offset: u64,
    /// Number of records in the tag index.
    pub entry_count: u32,
    /// The size of the data store as declared by the section header.
    pub data_size: u32,
    /// Absolute offset of the first byte of the data store.
    pub store_offset: u64,
    /// Absolute offset of the first byte after the section. For the signature section this
    /// includes the padding to the next 8 byte boundary.
    pub end: u64,
}

/// A single record of the merged tag index.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TagEntry {
    /// The tag id. Signature tags are shifted by [`SIGNATURE_TAG_OFFSET`].
    pub tag: i32,
    /// The type of the data.
    pub kind: TagKind,
    /// Absolute offset of the data in the package file (and the mapping).
    pub offset: u64,
    /// The number of elements.
    pub count: u32,
}

/// The decoded tag index of a package together with a read-only mapping of its header data.
///
/// The mapping covers the package file from its first byte up to the end of the main section's
/// data store. Every value handed out by the store borrows from this mapping, so the borrow
/// checker ensures nothing outlives it.
#[derive(Debug)]
pub struct TagStore {
    entries: Vec<TagEntry>,
    sections: [SectionLayout; 2],
    map: Mmap,
    len: usize,
}

fn io_error(context: &str) -> impl FnOnce(std::io::Error) -> HeaderError + '_ {
    move |err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            HeaderError::Truncated(format!("unexpected end of file while {context}"))
        } else {
            HeaderError::Io(context.to_string(), err)
        }
    }
}

impl TagStore {
    /// Opens the package at `path` and decodes its headers, starting at the beginning of the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HeaderError> {
        let path = path.as_ref();
        let (mut file, _) = fs_err::File::open(path)
            .map_err(|err| HeaderError::Io(format!("opening '{}'", path.display()), err))?
            .into_parts();
        Self::read(&mut file)
    }

    /// Decodes the lead, the signature section and the main section of a package starting at the
    /// current position of `file`.
    ///
    /// On success the position of `file` is left at the first byte after the main section, which
    /// is where the payload of the package starts.
    pub fn read(file: &mut File) -> Result<Self, HeaderError> {
        let file_len = file
            .metadata()
            .map_err(io_error("reading the package metadata"))?
            .len();
        let start = file
            .stream_position()
            .map_err(io_error("determining the stream position"))?;

        let mut position = start + LEAD_SIZE;
        let mut entries = Vec::new();
        let signature = read_section(file, SectionKind::Signature, position, file_len, &mut entries)?;
        position = signature.end;
        let main = read_section(file, SectionKind::Main, position, file_len, &mut entries)?;

        let store_end = main.end;
        if store_end > file_len {
            return Err(HeaderError::Truncated(format!(
                "the header data ends at byte {store_end} but the file is only {file_len} bytes"
            )));
        }
        let len = usize::try_from(store_end).map_err(|_| {
            HeaderError::Truncated(format!("the header data size {store_end} is not addressable"))
        })?;

        // Safety: the mapping is read-only and only the part backed by the file is ever read.
        let map = unsafe {
            MmapOptions::new()
                .len(align_up(store_end, PAGE_SIZE) as usize)
                .map(&*file)
        }
        .map_err(io_error("mapping the header data"))?;

        file.seek(SeekFrom::Start(store_end))
            .map_err(io_error("seeking to the payload"))?;

        entries.sort_by_key(|entry| entry.tag);
        tracing::trace!(
            "decoded {} tags, header data ends at {store_end}",
            entries.len()
        );

        Ok(Self {
            entries,
            sections: [signature, main],
            map,
            len,
        })
    }

    /// Returns the layout of the signature and the main section, in that order.
    pub fn sections(&self) -> &[SectionLayout; 2] {
        &self.sections
    }

    /// The absolute offset of the first byte after the headers.
    pub fn payload_offset(&self) -> u64 {
        self.len as u64
    }

    /// All entries of the merged index, sorted by tag.
    pub fn entries(&self) -> &[TagEntry] {
        &self.entries
    }

    /// Looks up the index entry of a tag.
    pub fn entry(&self, tag: i32) -> Option<&TagEntry> {
        self.entries
            .binary_search_by_key(&tag, |entry| entry.tag)
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// Returns the number of elements stored for `tag`, or 0 if the tag is absent.
    pub fn count(&self, tag: i32) -> u32 {
        self.entry(tag).map_or(0, |entry| entry.count)
    }

    /// Returns the `index`-th element of `tag`.
    ///
    /// An absent tag or an index past the number of elements yields `Ok(None)`. Data that lies
    /// outside the header store is an error.
    pub fn get(&self, tag: i32, index: u32) -> Result<Option<TagValue<'_>>, HeaderError> {
        let Some(entry) = self.entry(tag) else {
            return Ok(None);
        };
        if index >= entry.count {
            return Ok(None);
        }

        let value = match entry.kind {
            kind if kind.is_string() => TagValue::String(self.nth_string(entry, index)?),
            TagKind::Binary => {
                if index != 0 {
                    return Ok(None);
                }
                TagValue::Binary(self.slice(tag, entry.offset, u64::from(entry.count))?)
            }
            TagKind::Char => TagValue::Char(self.element::<1>(entry, index)?[0]),
            TagKind::Int8 => TagValue::Int8(i8::from_be_bytes(self.element::<1>(entry, index)?)),
            TagKind::Int16 => TagValue::Int16(i16::from_be_bytes(self.element(entry, index)?)),
            TagKind::Int32 => TagValue::Int32(i32::from_be_bytes(self.element(entry, index)?)),
            kind => return Err(HeaderError::UnsupportedType { tag, kind }),
        };
        Ok(Some(value))
    }

    /// Returns the `index`-th string of `tag`. Non-string tags yield `Ok(None)`.
    pub fn get_bytes(&self, tag: i32, index: u32) -> Result<Option<&[u8]>, HeaderError> {
        match self.entry(tag) {
            Some(entry) if entry.kind.is_string() => {
                Ok(self.get(tag, index)?.and_then(|value| value.as_bytes()))
            }
            _ => Ok(None),
        }
    }

    /// Like [`TagStore::get_bytes`] but converts the string to UTF-8, replacing invalid sequences.
    pub fn get_str(&self, tag: i32, index: u32) -> Result<Option<Cow<'_, str>>, HeaderError> {
        Ok(self.get_bytes(tag, index)?.map(String::from_utf8_lossy))
    }

    /// Returns the `index`-th integer of `tag`. String and binary tags yield `Ok(None)`.
    pub fn get_int(&self, tag: i32, index: u32) -> Result<Option<i64>, HeaderError> {
        match self.entry(tag) {
            Some(entry) if entry.kind.is_string() || entry.kind == TagKind::Binary => Ok(None),
            _ => Ok(self.get(tag, index)?.and_then(|value| value.as_int())),
        }
    }

    /// Returns all strings of `tag` in one sequential scan. An absent tag yields an empty vector.
    pub fn string_array(&self, tag: i32) -> Result<Vec<&[u8]>, HeaderError> {
        let Some(entry) = self.entry(tag) else {
            return Ok(Vec::new());
        };
        if !entry.kind.is_string() {
            return Err(HeaderError::UnsupportedType {
                tag,
                kind: entry.kind,
            });
        }

        // Every string takes at least one byte so the count can never exceed the store length.
        let mut strings = Vec::with_capacity((entry.count as usize).min(self.len));
        let mut offset = entry.offset;
        for _ in 0..entry.count {
            let string = self.string_at(tag, offset)?;
            offset += string.len() as u64 + 1;
            strings.push(string);
        }
        Ok(strings)
    }

    /// Returns all integers of `tag`. An absent tag yields an empty vector.
    pub fn int_array(&self, tag: i32) -> Result<Vec<i64>, HeaderError> {
        let Some(entry) = self.entry(tag) else {
            return Ok(Vec::new());
        };
        let width = match entry.kind {
            TagKind::Char | TagKind::Int8 | TagKind::Int16 | TagKind::Int32 => entry.kind.width(),
            _ => None,
        }
        .ok_or(HeaderError::UnsupportedType {
            tag,
            kind: entry.kind,
        })?;
        let total = u64::from(entry.count)
            .checked_mul(width)
            .ok_or(HeaderError::OutOfBounds { tag })?;
        let bytes = self.slice(tag, entry.offset, total)?;

        Ok(bytes
            .chunks_exact(width as usize)
            .map(|chunk| match entry.kind {
                TagKind::Char => i64::from(chunk[0]),
                TagKind::Int8 => i64::from(chunk[0] as i8),
                TagKind::Int16 => i64::from(i16::from_be_bytes([chunk[0], chunk[1]])),
                _ => i64::from(i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            })
            .collect())
    }

    /// The accessible part of the mapping.
    fn data(&self) -> &[u8] {
        &self.map[..self.len]
    }

    /// Returns `len` bytes starting at the absolute offset `start`.
    fn slice(&self, tag: i32, start: u64, len: u64) -> Result<&[u8], HeaderError> {
        let end = start
            .checked_add(len)
            .ok_or(HeaderError::OutOfBounds { tag })?;
        if end > self.len as u64 {
            return Err(HeaderError::OutOfBounds { tag });
        }
        Ok(&self.data()[start as usize..end as usize])
    }

    /// Returns the `index`-th fixed width element of `entry`.
    fn element<const N: usize>(&self, entry: &TagEntry, index: u32) -> Result<[u8; N], HeaderError> {
        let start = u64::from(index)
            .checked_mul(N as u64)
            .and_then(|relative| entry.offset.checked_add(relative))
            .ok_or(HeaderError::OutOfBounds { tag: entry.tag })?;
        let bytes = self.slice(entry.tag, start, N as u64)?;
        let mut element = [0u8; N];
        element.copy_from_slice(bytes);
        Ok(element)
    }

    /// Returns the NUL terminated string that starts at the absolute offset `offset`.
    fn string_at(&self, tag: i32, offset: u64) -> Result<&[u8], HeaderError> {
        if offset >= self.len as u64 {
            return Err(HeaderError::OutOfBounds { tag });
        }
        let rest = &self.data()[offset as usize..];
        let end = memchr::memchr(0, rest).ok_or(HeaderError::UnterminatedString { tag })?;
        Ok(&rest[..end])
    }

    /// Finds the `index`-th string of `entry` by skipping over the strings before it.
    fn nth_string(&self, entry: &TagEntry, index: u32) -> Result<&[u8], HeaderError> {
        let mut offset = entry.offset;
        for _ in 0..index {
            offset += self.string_at(entry.tag, offset)?.len() as u64 + 1;
        }
        self.string_at(entry.tag, offset)
    }
}

/// Reads the header and the tag index of one section starting at `header_offset`. The decoded
/// index records are appended to `entries`.
fn read_section(
    file: &mut File,
    kind: SectionKind,
    header_offset: u64,
    file_len: u64,
    entries: &mut Vec<TagEntry>,
) -> Result<SectionLayout, HeaderError> {
    file.seek(SeekFrom::Start(header_offset))
        .map_err(io_error("seeking to a header section"))?;

    let mut header = [0u8; SECTION_HEADER_SIZE as usize];
    file.read_exact(&mut header)
        .map_err(io_error("reading a section header"))?;
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != HEADER_MAGIC_AND_VERSION {
        return Err(HeaderError::InvalidMagic {
            section: kind,
            found: magic,
        });
    }
    let entry_count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let data_size = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);

    let index_len = u64::from(entry_count) * INDEX_RECORD_SIZE;
    let store_offset = header_offset + SECTION_HEADER_SIZE + index_len;
    if store_offset > file_len {
        return Err(HeaderError::Truncated(format!(
            "the {kind} section declares {entry_count} index records which do not fit in the file"
        )));
    }

    let mut index = vec![0u8; index_len as usize];
    file.read_exact(&mut index)
        .map_err(io_error("reading a tag index"))?;

    entries.reserve(entry_count as usize);
    for record in index.chunks_exact(INDEX_RECORD_SIZE as usize) {
        let field = |at: usize| {
            u32::from_be_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]])
        };
        let mut tag = field(0) as i32;
        if kind == SectionKind::Signature {
            tag = tag.wrapping_sub(SIGNATURE_TAG_OFFSET);
        }
        entries.push(TagEntry {
            tag,
            kind: TagKind::from_code(field(4)),
            offset: store_offset + u64::from(field(8)),
            count: field(12),
        });
    }

    let store_size = match kind {
        SectionKind::Signature => align_up(u64::from(data_size), 8),
        SectionKind::Main => u64::from(data_size),
    };

    Ok(SectionLayout {
        kind,
        header_offset,
        entry_count,
        data_size,
        store_offset,
        end: store_offset + store_size,
    })
}

#[cfg(test)]
mod test {
    use std::io::{Seek, Write};

    use assert_matches::assert_matches;
    use rstest::rstest;

    use super::{SectionKind, TagStore};
    use crate::tag;
    use crate::value::{TagKind, TagValue};
    use crate::write::{HeaderBuilder, PackageWriter};
    use crate::{HeaderError, LEAD_SIZE, SIGNATURE_TAG_OFFSET};

    fn sample_package() -> PackageWriter {
        let signature = HeaderBuilder::new()
            .int32(1000, [1234])
            .binary(1004, b"\x01\x02\x03");
        let main = HeaderBuilder::new()
            .string(tag::NAME, "foo")
            .string(tag::VERSION, "1.0")
            .string_array(tag::BASENAMES, ["a", "bb", "", "dddd"])
            .int16(tag::FILEMODES, [0o100644u16 as i16, 0o40755u16 as i16, -1, 7])
            .int32(tag::FILESIZES, [1, 2, 3, -1])
            .int8(tag::FILEFLAGS, [1, -1])
            .i18n_string(tag::SUMMARY, "a summary");
        PackageWriter::new(signature, main)
    }

    fn write_to_file(
        package: &PackageWriter,
        payload: &[u8],
    ) -> (std::fs::File, [crate::SectionLayout; 2]) {
        let mut file = tempfile::tempfile().unwrap();
        let layout = package.write(&mut file).unwrap();
        file.write_all(payload).unwrap();
        file.rewind().unwrap();
        (file, layout)
    }

    #[test]
    fn test_layout_round_trip() {
        let (mut file, layout) = write_to_file(&sample_package(), b"payload");
        let store = TagStore::read(&mut file).unwrap();

        assert_eq!(store.sections(), &layout);
        let [signature, main] = *store.sections();
        assert_eq!(signature.header_offset, LEAD_SIZE);
        assert_eq!(signature.end % 8, 0);
        assert_eq!(main.header_offset, signature.end);
        assert_eq!(
            main.store_offset,
            main.header_offset + 16 + 16 * u64::from(main.entry_count)
        );
        assert_eq!(store.payload_offset(), main.end);
        assert_eq!(file.stream_position().unwrap(), main.end);
    }

    #[test]
    fn test_entries_are_sorted_and_signature_tags_shifted() {
        let (mut file, _) = write_to_file(&sample_package(), b"");
        let store = TagStore::read(&mut file).unwrap();

        let tags: Vec<i32> = store.entries().iter().map(|e| e.tag).collect();
        let mut sorted = tags.clone();
        sorted.sort();
        assert_eq!(tags, sorted);

        assert_eq!(store.get_int(1000 - SIGNATURE_TAG_OFFSET, 0).unwrap(), Some(1234));
        assert_eq!(
            store.get(1004 - SIGNATURE_TAG_OFFSET, 0).unwrap(),
            Some(TagValue::Binary(b"\x01\x02\x03"))
        );
        // The main section name tag is not confused with the shifted signature tags.
        assert_eq!(store.get_bytes(tag::NAME, 0).unwrap(), Some(&b"foo"[..]));
    }

    #[test]
    fn test_string_array_access() {
        let (mut file, _) = write_to_file(&sample_package(), b"");
        let store = TagStore::read(&mut file).unwrap();

        assert_eq!(store.count(tag::BASENAMES), 4);
        assert_eq!(store.get_bytes(tag::BASENAMES, 0).unwrap(), Some(&b"a"[..]));
        assert_eq!(store.get_bytes(tag::BASENAMES, 1).unwrap(), Some(&b"bb"[..]));
        assert_eq!(store.get_bytes(tag::BASENAMES, 2).unwrap(), Some(&b""[..]));
        assert_eq!(store.get_bytes(tag::BASENAMES, 3).unwrap(), Some(&b"dddd"[..]));
        assert_eq!(
            store.string_array(tag::BASENAMES).unwrap(),
            vec![&b"a"[..], b"bb", b"", b"dddd"]
        );
        assert_eq!(
            store.get_bytes(tag::SUMMARY, 0).unwrap(),
            Some(&b"a summary"[..])
        );
    }

    #[test]
    fn test_integer_access() {
        let (mut file, _) = write_to_file(&sample_package(), b"");
        let store = TagStore::read(&mut file).unwrap();

        assert_eq!(
            store.get(tag::FILEMODES, 0).unwrap(),
            Some(TagValue::Int16(0o100644u16 as i16))
        );
        assert_eq!(store.get_int(tag::FILEMODES, 2).unwrap(), Some(-1));
        assert_eq!(store.get_int(tag::FILESIZES, 3).unwrap(), Some(-1));
        assert_eq!(store.get_int(tag::FILEFLAGS, 1).unwrap(), Some(-1));
        assert_eq!(store.int_array(tag::FILESIZES).unwrap(), vec![1, 2, 3, -1]);
        assert_eq!(store.get_int(tag::NAME, 0).unwrap(), None);
        assert_eq!(store.get_bytes(tag::FILESIZES, 0).unwrap(), None);
    }

    #[rstest]
    #[case(tag::NAME)]
    #[case(tag::BASENAMES)]
    #[case(tag::FILEMODES)]
    #[case(tag::FILESIZES)]
    #[case(tag::FILEFLAGS)]
    #[case(tag::SUMMARY)]
    #[case(1004 - SIGNATURE_TAG_OFFSET)]
    #[case(tag::URL)]
    fn test_index_past_count_is_absent(#[case] tag: i32) {
        let (mut file, _) = write_to_file(&sample_package(), b"");
        let store = TagStore::read(&mut file).unwrap();

        let count = store.count(tag);
        for index in [count, count + 1, u32::MAX] {
            assert_eq!(store.get(tag, index).unwrap(), None);
        }
    }

    #[test]
    fn test_invalid_magic() {
        let (mut file, layout) = write_to_file(&sample_package(), b"");
        file.seek(std::io::SeekFrom::Start(layout[1].header_offset))
            .unwrap();
        file.write_all(&[0, 0, 0, 0]).unwrap();
        file.rewind().unwrap();

        assert_matches!(
            TagStore::read(&mut file),
            Err(HeaderError::InvalidMagic {
                section: SectionKind::Main,
                found: 0
            })
        );
    }

    #[test]
    fn test_truncated_store() {
        let (mut file, layout) = write_to_file(&sample_package(), b"");
        file.set_len(layout[1].end - 1).unwrap();

        let err = TagStore::read(&mut file).unwrap_err();
        assert_matches!(err, HeaderError::Truncated(_));
        assert!(!err.is_format_error());
    }

    #[test]
    fn test_truncated_lead() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 50]).unwrap();
        file.rewind().unwrap();

        assert_matches!(TagStore::read(&mut file), Err(HeaderError::Truncated(_)));
    }

    #[test]
    fn test_out_of_bounds_offset() {
        let main = HeaderBuilder::new()
            .string(tag::NAME, "foo")
            .dangling(tag::VERSION, TagKind::Int32, 2, 1 << 20);
        let (mut file, _) = write_to_file(&PackageWriter::new(HeaderBuilder::new(), main), b"");
        let store = TagStore::read(&mut file).unwrap();

        assert_matches!(
            store.get(tag::VERSION, 1),
            Err(HeaderError::OutOfBounds { tag: tag::VERSION })
        );
        assert_matches!(
            store.int_array(tag::VERSION),
            Err(HeaderError::OutOfBounds { .. })
        );
    }

    #[test]
    fn test_unterminated_string() {
        let main = HeaderBuilder::new().raw(tag::NAME, TagKind::String, 1, b"abc".to_vec());
        let (mut file, _) = write_to_file(&PackageWriter::new(HeaderBuilder::new(), main), b"");
        let store = TagStore::read(&mut file).unwrap();

        assert_matches!(
            store.get(tag::NAME, 0),
            Err(HeaderError::UnterminatedString { tag: tag::NAME })
        );
    }

    #[test]
    fn test_int64_is_unsupported() {
        let main = HeaderBuilder::new().raw(tag::SIZE, TagKind::Int64, 1, vec![0; 8]);
        let (mut file, _) = write_to_file(&PackageWriter::new(HeaderBuilder::new(), main), b"");
        let store = TagStore::read(&mut file).unwrap();

        assert_eq!(store.count(tag::SIZE), 1);
        assert_matches!(
            store.get(tag::SIZE, 0),
            Err(HeaderError::UnsupportedType {
                kind: TagKind::Int64,
                ..
            })
        );
        // Out of range access is still just absence.
        assert_eq!(store.get(tag::SIZE, 1).unwrap(), None);
    }

    #[test]
    fn test_read_from_offset() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"garbage!").unwrap();
        let layout = sample_package().write(&mut file).unwrap();
        file.seek(std::io::SeekFrom::Start(8)).unwrap();

        // The writer assumes it starts at offset 0, so all offsets shift by the garbage prefix.
        let store = TagStore::read(&mut file).unwrap();
        assert_eq!(store.sections()[1].end, layout[1].end + 8);
        assert_eq!(store.get_bytes(tag::NAME, 0).unwrap(), Some(&b"foo"[..]));
    }
}
