//! Renders the query output of `rpm -q`.

use std::io::{self, Write};

use chrono::{DateTime, TimeZone};
use itertools::Itertools;
use rpm_header::{FileFlags, HeaderError, PackageMetadata, TagStore};

/// An error that can occur while rendering a query.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// A header value could not be decoded.
    #[error(transparent)]
    Header(#[from] HeaderError),

    /// Writing the output failed.
    #[error("failed to write the query output")]
    Io(#[from] io::Error),
}

/// What a query prints for every package.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryFormat {
    /// Print the package information (`-qi`).
    pub info: bool,
    /// List the files (`-ql`).
    pub list: bool,
    /// List only documentation files (`-qd`, implies `list`).
    pub docs: bool,
    /// List only configuration files (`-qc`, implies `list`).
    pub configs: bool,
}

impl QueryFormat {
    fn lists_files(&self) -> bool {
        self.list || self.docs || self.configs
    }

    fn includes(&self, flags: FileFlags) -> bool {
        match (self.docs, self.configs) {
            (false, false) => true,
            (true, false) => flags.contains(FileFlags::DOC),
            (false, true) => flags.contains(FileFlags::CONFIG),
            (true, true) => flags.contains(FileFlags::DOC) || flags.contains(FileFlags::CONFIG),
        }
    }
}

/// Writes the query output for one package. Build dates are shown in `timezone`.
pub fn render<W: Write, Tz: TimeZone>(
    metadata: &PackageMetadata<'_>,
    format: QueryFormat,
    timezone: &Tz,
    out: &mut W,
) -> Result<(), RenderError>
where
    Tz::Offset: std::fmt::Display,
{
    if !format.info && !format.lists_files() {
        writeln!(out, "{}", metadata.nevra()?)?;
    }

    if format.info {
        render_info(metadata, timezone, out)?;
    }

    if format.lists_files() {
        for file in metadata.files()? {
            if !format.includes(file.flags) {
                continue;
            }
            out.write_all(file.dir_name)?;
            out.write_all(file.base_name)?;
            out.write_all(b"\n")?;
        }
    }

    Ok(())
}

fn render_info<W: Write, Tz: TimeZone>(
    metadata: &PackageMetadata<'_>,
    timezone: &Tz,
    out: &mut W,
) -> Result<(), RenderError>
where
    Tz::Offset: std::fmt::Display,
{
    fn field<W: Write>(out: &mut W, label: &str, value: &str) -> io::Result<()> {
        writeln!(out, "{label:<12}: {value}")
    }
    let or_none = |value: Option<std::borrow::Cow<'_, str>>| {
        value.map_or_else(|| String::from("(none)"), |value| value.into_owned())
    };

    field(out, "Name", &or_none(metadata.name()?))?;
    field(out, "Version", &or_none(metadata.version()?))?;
    field(out, "Release", &or_none(metadata.release()?))?;
    field(out, "Group", &or_none(metadata.group()?))?;
    field(out, "Size", &metadata.size()?.unwrap_or(0).to_string())?;
    field(out, "License", &or_none(metadata.license()?))?;
    field(out, "Source RPM", &or_none(metadata.source_rpm()?))?;

    let build_time = metadata.build_time()?.unwrap_or(DateTime::UNIX_EPOCH);
    // Local time has no zone abbreviation in chrono, so the offset is printed instead.
    let build_date = build_time
        .with_timezone(timezone)
        .format("%a %d %b %Y %T %z")
        .to_string();
    field(out, "Build Date", &build_date)?;
    field(out, "Build Host", &or_none(metadata.build_host()?))?;
    field(
        out,
        "Relocations",
        metadata
            .prefixes()?
            .as_deref()
            .unwrap_or("(not relocatable)"),
    )?;
    if let Some(vendor) = metadata.vendor()? {
        field(out, "Vendor", &vendor)?;
    }
    if let Some(url) = metadata.url()? {
        field(out, "URL", &url)?;
    }
    field(out, "Summary", &or_none(metadata.summary()?))?;
    writeln!(out, "Description :\n{}", or_none(metadata.description()?))?;
    Ok(())
}

/// Logs every index entry of `store` at trace level.
pub fn trace_tags(store: &TagStore) {
    if !tracing::enabled!(tracing::Level::TRACE) {
        return;
    }
    let dump = store
        .entries()
        .iter()
        .map(|entry| {
            format!(
                "tag[{}] type {} offset {:#x} count {}",
                entry.tag, entry.kind, entry.offset, entry.count
            )
        })
        .join("\n");
    tracing::trace!("index entries:\n{dump}");
}

#[cfg(test)]
mod test {
    use std::io::Seek;

    use chrono::{FixedOffset, Utc};
    use rpm_header::write::{HeaderBuilder, PackageWriter};
    use rpm_header::{tag, PackageMetadata, TagStore};
    use rstest::rstest;

    use super::{render, QueryFormat};

    fn store(main: HeaderBuilder) -> TagStore {
        let mut file = tempfile::tempfile().unwrap();
        PackageWriter::new(HeaderBuilder::new(), main)
            .write(&mut file)
            .unwrap();
        file.rewind().unwrap();
        TagStore::read(&mut file).unwrap()
    }

    fn package() -> TagStore {
        store(
            HeaderBuilder::new()
                .string(tag::NAME, "foo")
                .string(tag::VERSION, "1.0")
                .string(tag::RELEASE, "1")
                .string(tag::ARCH, "x86_64")
                .i18n_string(tag::SUMMARY, "The foo tool")
                .i18n_string(tag::DESCRIPTION, "foo does\nall the things")
                .i18n_string(tag::GROUP, "Applications/System")
                .int32(tag::BUILDTIME, [1_700_000_000])
                .string(tag::BUILDHOST, "builder.example.org")
                .int32(tag::SIZE, [12_345])
                .string(tag::LICENSE, "MIT")
                .string(tag::URL, "https://example.org/foo")
                .string(tag::SOURCERPM, "foo-1.0-1.src.rpm")
                .string_array(tag::DIRNAMES, ["/etc/", "/usr/bin/", "/usr/share/doc/foo/"])
                .string_array(tag::BASENAMES, ["foo.conf", "foo", "README"])
                .int32(tag::DIRINDEXES, [0, 1, 2])
                .int32(tag::FILEFLAGS, [1, 0, 2]),
        )
    }

    fn query(store: &TagStore, format: QueryFormat) -> String {
        let mut out = Vec::new();
        render(&PackageMetadata::new(store), format, &Utc, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_plain() {
        assert_eq!(
            query(&package(), QueryFormat::default()),
            "foo-1.0-1.x86_64\n"
        );
    }

    #[test]
    fn test_info() {
        insta::assert_snapshot!(query(&package(), QueryFormat { info: true, ..QueryFormat::default() }), @r###"
        Name        : foo
        Version     : 1.0
        Release     : 1
        Group       : Applications/System
        Size        : 12345
        License     : MIT
        Source RPM  : foo-1.0-1.src.rpm
        Build Date  : Tue 14 Nov 2023 22:13:20 +0000
        Build Host  : builder.example.org
        Relocations : (not relocatable)
        URL         : https://example.org/foo
        Summary     : The foo tool
        Description :
        foo does
        all the things
        "###);
    }

    #[test]
    fn test_info_of_sparse_package() {
        let store = store(HeaderBuilder::new().string(tag::NAME, "bare"));
        insta::assert_snapshot!(query(&store, QueryFormat { info: true, ..QueryFormat::default() }), @r###"
        Name        : bare
        Version     : (none)
        Release     : (none)
        Group       : (none)
        Size        : 0
        License     : (none)
        Source RPM  : (none)
        Build Date  : Thu 01 Jan 1970 00:00:00 +0000
        Build Host  : (none)
        Relocations : (not relocatable)
        Summary     : (none)
        Description :
        (none)
        "###);
    }

    #[test]
    fn test_build_date_uses_offset() {
        let timezone = FixedOffset::east_opt(2 * 3600).unwrap();
        let mut out = Vec::new();
        let format = QueryFormat {
            info: true,
            ..QueryFormat::default()
        };
        render(&PackageMetadata::new(&package()), format, &timezone, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(
            out.contains("Build Date  : Wed 15 Nov 2023 00:13:20 +0200\n"),
            "{out}"
        );
    }

    #[rstest]
    #[case(false, false, "/etc/foo.conf\n/usr/bin/foo\n/usr/share/doc/foo/README\n")]
    #[case(true, false, "/usr/share/doc/foo/README\n")]
    #[case(false, true, "/etc/foo.conf\n")]
    #[case(true, true, "/etc/foo.conf\n/usr/share/doc/foo/README\n")]
    fn test_list(#[case] docs: bool, #[case] configs: bool, #[case] expected: &str) {
        let format = QueryFormat {
            list: true,
            docs,
            configs,
            ..QueryFormat::default()
        };
        assert_eq!(query(&package(), format), expected);
    }

    #[test]
    fn test_info_and_list() {
        let format = QueryFormat {
            info: true,
            configs: true,
            ..QueryFormat::default()
        };
        let output = query(&package(), format);
        assert!(output.starts_with("Name        : foo\n"));
        assert!(output.ends_with("all the things\n/etc/foo.conf\n"));
    }
}
