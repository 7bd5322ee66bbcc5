//! Well known tag ids of the main header section.

#![allow(missing_docs)]

pub const NAME: i32 = 1000;
pub const VERSION: i32 = 1001;
pub const RELEASE: i32 = 1002;
pub const SUMMARY: i32 = 1004;
pub const DESCRIPTION: i32 = 1005;
pub const BUILDTIME: i32 = 1006;
pub const BUILDHOST: i32 = 1007;
pub const SIZE: i32 = 1009;
pub const VENDOR: i32 = 1011;
pub const LICENSE: i32 = 1014;
pub const PACKAGER: i32 = 1015;
pub const GROUP: i32 = 1016;
pub const URL: i32 = 1020;
pub const ARCH: i32 = 1022;
pub const FILESIZES: i32 = 1028;
pub const FILEMODES: i32 = 1030;
pub const FILELINKTOS: i32 = 1036;
pub const FILEFLAGS: i32 = 1037;
pub const FILEUSERNAME: i32 = 1039;
pub const FILEGROUPNAME: i32 = 1040;
pub const SOURCERPM: i32 = 1044;
pub const FILEINODES: i32 = 1096;
pub const PREFIXES: i32 = 1098;
pub const DIRINDEXES: i32 = 1116;
pub const BASENAMES: i32 = 1117;
pub const DIRNAMES: i32 = 1118;
pub const PAYLOADCOMPRESSOR: i32 = 1125;
pub const FILENLINKS: i32 = 5045;
