//! Writing of package headers.
//!
//! The writer produces the lead, the signature section and the main section in the same layout
//! [`crate::TagStore`] decodes. It does not compute digests or signatures, so the packages it
//! produces are only useful to tools that do not verify them.

use std::io::{self, Write};

use crate::store::{SectionKind, SectionLayout};
use crate::value::TagKind;
use crate::{
    align_up, HEADER_MAGIC_AND_VERSION, INDEX_RECORD_SIZE, LEAD_SIZE, PAGE_SIZE,
    REFLINK_PAYLOAD_MAGIC, SECTION_HEADER_SIZE,
};

/// The magic number that starts the lead.
const LEAD_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];

/// The signature type stored in the lead, indicating a header style signature section.
const LEAD_SIGNATURE_TYPE: u16 = 5;

#[derive(Debug, Clone)]
enum RecordData {
    Inline(Vec<u8>),
    Dangling(u32),
}

#[derive(Debug, Clone)]
struct Record {
    tag: i32,
    kind: TagKind,
    count: u32,
    data: RecordData,
}

/// Collects the tags of a single header section.
///
/// Tags are written to the index in the order in which they are added. Tags of the signature
/// section must be given in their on-disk numbering, i.e. without [`crate::SIGNATURE_TAG_OFFSET`]
/// applied.
#[derive(Debug, Clone, Default)]
pub struct HeaderBuilder {
    records: Vec<Record>,
}

fn nul_terminated<S: AsRef<[u8]>>(values: impl IntoIterator<Item = S>) -> (u32, Vec<u8>) {
    let mut count = 0;
    let mut data = Vec::new();
    for value in values {
        data.extend_from_slice(value.as_ref());
        data.push(0);
        count += 1;
    }
    (count, data)
}

impl HeaderBuilder {
    /// Constructs an empty section.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, tag: i32, kind: TagKind, count: u32, data: RecordData) -> Self {
        self.records.push(Record {
            tag,
            kind,
            count,
            data,
        });
        self
    }

    /// Adds a single string.
    pub fn string(self, tag: i32, value: &str) -> Self {
        let (count, data) = nul_terminated([value]);
        self.push(tag, TagKind::String, count, RecordData::Inline(data))
    }

    /// Adds a translatable string with a single (untranslated) value.
    pub fn i18n_string(self, tag: i32, value: &str) -> Self {
        let (count, data) = nul_terminated([value]);
        self.push(tag, TagKind::I18nString, count, RecordData::Inline(data))
    }

    /// Adds an array of strings.
    pub fn string_array<S: AsRef<[u8]>>(self, tag: i32, values: impl IntoIterator<Item = S>) -> Self {
        let (count, data) = nul_terminated(values);
        self.push(tag, TagKind::StringArray, count, RecordData::Inline(data))
    }

    /// Adds an array of 8 bit integers.
    pub fn int8(self, tag: i32, values: impl IntoIterator<Item = i8>) -> Self {
        let data: Vec<u8> = values.into_iter().flat_map(i8::to_be_bytes).collect();
        self.push(tag, TagKind::Int8, data.len() as u32, RecordData::Inline(data))
    }

    /// Adds an array of 16 bit integers.
    pub fn int16(self, tag: i32, values: impl IntoIterator<Item = i16>) -> Self {
        let data: Vec<u8> = values.into_iter().flat_map(i16::to_be_bytes).collect();
        let count = (data.len() / 2) as u32;
        self.push(tag, TagKind::Int16, count, RecordData::Inline(data))
    }

    /// Adds an array of 32 bit integers.
    pub fn int32(self, tag: i32, values: impl IntoIterator<Item = i32>) -> Self {
        let data: Vec<u8> = values.into_iter().flat_map(i32::to_be_bytes).collect();
        let count = (data.len() / 4) as u32;
        self.push(tag, TagKind::Int32, count, RecordData::Inline(data))
    }

    /// Adds a binary blob.
    pub fn binary(self, tag: i32, value: &[u8]) -> Self {
        self.push(
            tag,
            TagKind::Binary,
            value.len() as u32,
            RecordData::Inline(value.to_vec()),
        )
    }

    /// Adds a record with arbitrary data. The data is stored verbatim, no terminators are added
    /// and `count` is not checked against it.
    pub fn raw(self, tag: i32, kind: TagKind, count: u32, data: Vec<u8>) -> Self {
        self.push(tag, kind, count, RecordData::Inline(data))
    }

    /// Adds an index record that points at `offset` in the data store without storing any data.
    pub fn dangling(self, tag: i32, kind: TagKind, count: u32, offset: u32) -> Self {
        self.push(tag, kind, count, RecordData::Dangling(offset))
    }

    /// Encodes the section header plus index and the data store of this section.
    fn encode(&self) -> (Vec<u8>, Vec<u8>) {
        let mut store = Vec::new();
        let mut index = Vec::with_capacity(self.records.len() * INDEX_RECORD_SIZE as usize);
        for record in &self.records {
            let offset = match &record.data {
                RecordData::Inline(data) => {
                    let align = match record.kind {
                        TagKind::Int16 => 2,
                        TagKind::Int32 => 4,
                        TagKind::Int64 => 8,
                        _ => 1,
                    };
                    store.resize(align_up(store.len() as u64, align) as usize, 0);
                    let offset = store.len() as u32;
                    store.extend_from_slice(data);
                    offset
                }
                RecordData::Dangling(offset) => *offset,
            };
            index.extend_from_slice(&(record.tag as u32).to_be_bytes());
            index.extend_from_slice(&record.kind.code().to_be_bytes());
            index.extend_from_slice(&offset.to_be_bytes());
            index.extend_from_slice(&record.count.to_be_bytes());
        }

        let mut header = Vec::with_capacity(SECTION_HEADER_SIZE as usize + index.len());
        header.extend_from_slice(&HEADER_MAGIC_AND_VERSION.to_be_bytes());
        header.extend_from_slice(&[0; 4]);
        header.extend_from_slice(&(self.records.len() as u32).to_be_bytes());
        header.extend_from_slice(&(store.len() as u32).to_be_bytes());
        header.extend_from_slice(&index);
        (header, store)
    }
}

/// Writes the lead and both header sections of a package.
#[derive(Debug, Clone, Default)]
pub struct PackageWriter {
    signature: HeaderBuilder,
    main: HeaderBuilder,
}

impl PackageWriter {
    /// Constructs a writer from the signature and the main section.
    pub fn new(signature: HeaderBuilder, main: HeaderBuilder) -> Self {
        Self { signature, main }
    }

    /// Writes the lead and both sections to `writer`, assuming `writer` is positioned at offset 0
    /// of the package. Returns the layout of both sections. The payload, if any, should be
    /// written directly after at offset `layout[1].end`.
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<[SectionLayout; 2]> {
        writer.write_all(&lead())?;

        let mut position = LEAD_SIZE;
        let mut layouts = Vec::with_capacity(2);
        for (kind, section) in [
            (SectionKind::Signature, &self.signature),
            (SectionKind::Main, &self.main),
        ] {
            let (header, store) = section.encode();
            writer.write_all(&header)?;
            writer.write_all(&store)?;

            let store_offset = position + header.len() as u64;
            let mut end = store_offset + store.len() as u64;
            if kind == SectionKind::Signature {
                let padded = align_up(end, 8);
                writer.write_all(&vec![0; (padded - end) as usize])?;
                end = padded;
            }

            layouts.push(SectionLayout {
                kind,
                header_offset: position,
                entry_count: section.records.len() as u32,
                data_size: store.len() as u32,
                store_offset,
                end,
            });
            position = end;
        }

        Ok([layouts[0], layouts[1]])
    }
}

fn lead() -> [u8; LEAD_SIZE as usize] {
    let mut lead = [0u8; LEAD_SIZE as usize];
    lead[..4].copy_from_slice(&LEAD_MAGIC);
    // Format version 3.0
    lead[4] = 3;
    lead[78..80].copy_from_slice(&LEAD_SIGNATURE_TYPE.to_be_bytes());
    lead
}

/// Writes a reflink payload: the payload magic followed by the contents of every file, each
/// starting on a [`PAGE_SIZE`] boundary and padded with zeros to the next one.
///
/// `position` is the absolute offset at which the payload starts, usually the end of the main
/// section. Returns the absolute offset of every file.
pub fn write_reflink_payload<W: Write, C: AsRef<[u8]>>(
    writer: &mut W,
    position: u64,
    files: impl IntoIterator<Item = C>,
) -> io::Result<Vec<u64>> {
    writer.write_all(&REFLINK_PAYLOAD_MAGIC.to_be_bytes())?;
    let mut position = position + 4;

    let mut offsets = Vec::new();
    let aligned = align_up(position, PAGE_SIZE);
    writer.write_all(&vec![0; (aligned - position) as usize])?;
    position = aligned;

    for contents in files {
        let contents = contents.as_ref();
        offsets.push(position);
        writer.write_all(contents)?;
        let end = position + contents.len() as u64;
        let padded = align_up(end, PAGE_SIZE);
        writer.write_all(&vec![0; (padded - end) as usize])?;
        position = padded;
    }

    Ok(offsets)
}
