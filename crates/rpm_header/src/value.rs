use std::fmt;
use std::fmt::Formatter;

/// The type of the data stored for a tag.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TagKind {
    /// A tag without data.
    Null,
    /// Single bytes.
    Char,
    /// 8 bit integers.
    Int8,
    /// 16 bit big-endian integers.
    Int16,
    /// 32 bit big-endian integers.
    Int32,
    /// 64 bit integers. These are recognized but cannot be read.
    Int64,
    /// A single NUL terminated string.
    String,
    /// An opaque blob of `count` bytes.
    Binary,
    /// `count` consecutive NUL terminated strings.
    StringArray,
    /// Translated strings, stored like a string array.
    I18nString,
    /// A type code this crate does not know about.
    Unknown(u32),
}

impl TagKind {
    /// Decodes the type code stored in an index record.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => TagKind::Null,
            1 => TagKind::Char,
            2 => TagKind::Int8,
            3 => TagKind::Int16,
            4 => TagKind::Int32,
            5 => TagKind::Int64,
            6 => TagKind::String,
            7 => TagKind::Binary,
            8 => TagKind::StringArray,
            9 => TagKind::I18nString,
            other => TagKind::Unknown(other),
        }
    }

    /// Returns the type code used to store this kind in an index record.
    pub fn code(self) -> u32 {
        match self {
            TagKind::Null => 0,
            TagKind::Char => 1,
            TagKind::Int8 => 2,
            TagKind::Int16 => 3,
            TagKind::Int32 => 4,
            TagKind::Int64 => 5,
            TagKind::String => 6,
            TagKind::Binary => 7,
            TagKind::StringArray => 8,
            TagKind::I18nString => 9,
            TagKind::Unknown(code) => code,
        }
    }

    /// Returns true for the kinds whose data is a sequence of NUL terminated strings.
    pub fn is_string(self) -> bool {
        matches!(
            self,
            TagKind::String | TagKind::StringArray | TagKind::I18nString
        )
    }

    /// The width in bytes of a single element of a fixed width kind.
    pub(crate) fn width(self) -> Option<u64> {
        match self {
            TagKind::Char | TagKind::Int8 | TagKind::Binary => Some(1),
            TagKind::Int16 => Some(2),
            TagKind::Int32 => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TagKind::Null => write!(f, "null"),
            TagKind::Char => write!(f, "char"),
            TagKind::Int8 => write!(f, "int8"),
            TagKind::Int16 => write!(f, "int16"),
            TagKind::Int32 => write!(f, "int32"),
            TagKind::Int64 => write!(f, "int64"),
            TagKind::String => write!(f, "string"),
            TagKind::Binary => write!(f, "binary"),
            TagKind::StringArray => write!(f, "string array"),
            TagKind::I18nString => write!(f, "i18n string"),
            TagKind::Unknown(code) => write!(f, "unknown type {code}"),
        }
    }
}

/// A single decoded element of a tag. String and binary values borrow from the mapped store.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TagValue<'a> {
    /// A single byte.
    Char(u8),
    /// An 8 bit integer.
    Int8(i8),
    /// A 16 bit integer.
    Int16(i16),
    /// A 32 bit integer.
    Int32(i32),
    /// The bytes of a string, without its NUL terminator.
    String(&'a [u8]),
    /// The complete blob of a binary tag.
    Binary(&'a [u8]),
}

impl<'a> TagValue<'a> {
    /// Returns the value as an integer if it is one of the integer kinds. Narrow integers are
    /// sign extended, [`TagValue::Char`] is zero extended.
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            TagValue::Char(v) => Some(i64::from(v)),
            TagValue::Int8(v) => Some(i64::from(v)),
            TagValue::Int16(v) => Some(i64::from(v)),
            TagValue::Int32(v) => Some(i64::from(v)),
            TagValue::String(_) | TagValue::Binary(_) => None,
        }
    }

    /// Returns the value as an unsigned integer if it is one of the integer kinds. The stored bits
    /// are reinterpreted as unsigned, so a 32 bit size of `-1` yields `u32::MAX`.
    pub fn as_uint(&self) -> Option<u64> {
        match *self {
            TagValue::Char(v) => Some(u64::from(v)),
            TagValue::Int8(v) => Some(u64::from(v as u8)),
            TagValue::Int16(v) => Some(u64::from(v as u16)),
            TagValue::Int32(v) => Some(u64::from(v as u32)),
            TagValue::String(_) | TagValue::Binary(_) => None,
        }
    }

    /// Returns the raw bytes if this is a string value.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match *self {
            TagValue::String(bytes) => Some(bytes),
            _ => None,
        }
    }
}
