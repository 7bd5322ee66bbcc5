#![deny(missing_docs)]

//! `rpm_header` decodes the signature and main header sections of an RPM package into a
//! [`TagStore`]: a sorted tag index plus a read-only memory mapping of the data stores.
//!
//! On top of the raw store, [`PackageMetadata`] exposes the well known package attributes and the
//! per-file arrays that are needed to install or query a package. The [`write`] module can produce
//! packages in the same format, which is mostly useful to craft packages for tests.
//!
//! ```rust,no_run
//! use rpm_header::{PackageMetadata, TagStore};
//!
//! let store = TagStore::open("foo-1.0-1.x86_64.rpm").unwrap();
//! let metadata = PackageMetadata::new(&store);
//! println!("{}", metadata.nevra().unwrap());
//! ```

mod metadata;
mod store;
pub mod tag;
mod value;
pub mod write;

pub use metadata::{FileFlags, FileRecord, FileType, Nevra, PackageMetadata};
pub use store::{SectionKind, SectionLayout, TagEntry, TagStore};
pub use value::{TagKind, TagValue};

/// Size of the lead that precedes the header sections. Its contents are never interpreted.
pub const LEAD_SIZE: u64 = 96;

/// Size of the header that starts both the signature and the main section.
pub const SECTION_HEADER_SIZE: u64 = 16;

/// Size of a single record in the tag index of a section.
pub const INDEX_RECORD_SIZE: u64 = 16;

/// The magic number and version that start every header section.
pub const HEADER_MAGIC_AND_VERSION: u32 = 0x8ead_e801;

/// Signature tags share their numeric space with the main header tags. While merging both
/// sections the signature tag ids are shifted down by this amount so both sets stay disjoint.
pub const SIGNATURE_TAG_OFFSET: i32 = 743;

/// Page size the reflink payload layout is aligned to. Every file in such a payload starts on a
/// multiple of this value.
pub const PAGE_SIZE: u64 = 4096;

/// The big-endian value that starts a payload laid out for reflink cloning, in place of a
/// compressed archive.
pub const REFLINK_PAYLOAD_MAGIC: u32 = 12245589;

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// An error that can occur when decoding or reading a package header.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    /// An IO error occurred while reading the package.
    #[error("an io error occurred while {0}")]
    Io(String, #[source] std::io::Error),

    /// The package ended before all the data declared by its headers was read.
    #[error("the package is truncated: {0}")]
    Truncated(String),

    /// A section did not start with the expected magic number.
    #[error("invalid RPM header magic in the {section} section (found {found:#010x})")]
    InvalidMagic {
        /// The section that was being decoded.
        section: SectionKind,
        /// The value found in place of the magic number.
        found: u32,
    },

    /// The data of a tag lies (partially) outside the header data store.
    #[error("the data of tag {tag} lies outside the header data store")]
    OutOfBounds {
        /// The tag that was accessed.
        tag: i32,
    },

    /// A string value is not terminated before the end of the header data store.
    #[error("the string data of tag {tag} is not terminated")]
    UnterminatedString {
        /// The tag that was accessed.
        tag: i32,
    },

    /// The tag is stored with a type that cannot be decoded.
    #[error("tag {tag} has an unsupported type ({kind})")]
    UnsupportedType {
        /// The tag that was accessed.
        tag: i32,
        /// The type of the tag.
        kind: TagKind,
    },

    /// A file refers to a directory that does not exist in the directory name array.
    #[error("file {index} refers to directory {dir_index} which does not exist")]
    InvalidDirIndex {
        /// The index of the file.
        index: usize,
        /// The directory index stored for the file.
        dir_index: i64,
    },
}

impl HeaderError {
    /// Returns true if this error was caused by malformed package data. Failing and short reads
    /// from the underlying file are I/O errors.
    pub fn is_format_error(&self) -> bool {
        !matches!(self, HeaderError::Io(..) | HeaderError::Truncated(_))
    }
}
