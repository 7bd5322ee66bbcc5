use std::fs::File;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_matches::assert_matches;
use rpm_header::write::{write_reflink_payload, HeaderBuilder, PackageWriter};
use rpm_header::{tag, PackageMetadata, TagStore};
use rpm_install::{
    install_package, CloneMethod, ConflictError, InstallError, InstallOptions, InstalledContent,
    NameResolver,
};

/// Resolves every name to the current user so installations work without privileges.
struct CurrentUser;

impl NameResolver for CurrentUser {
    fn uid(&self, _name: Option<&str>) -> u32 {
        nix::unistd::getuid().as_raw()
    }

    fn gid(&self, _name: Option<&str>) -> u32 {
        nix::unistd::getgid().as_raw()
    }
}

fn options(root: &Path) -> InstallOptions {
    InstallOptions {
        root: Some(root.to_path_buf()),
        clone_method: CloneMethod::Copy,
        privileged: Some(false),
        name_resolver: Some(Arc::new(CurrentUser)),
        ..InstallOptions::default()
    }
}

fn headers() -> HeaderBuilder {
    HeaderBuilder::new()
        .string(tag::NAME, "foo")
        .string(tag::VERSION, "1.0")
        .string(tag::RELEASE, "1")
        .string(tag::ARCH, "x86_64")
        .string(tag::SOURCERPM, "foo-1.0-1.src.rpm")
        .string_array(tag::DIRNAMES, ["/usr/", "/usr/bin/", "/etc/"])
        .string_array(
            tag::BASENAMES,
            ["bin", "foo", "foo-link", "bar", "foo.conf", "bar-hardlink"],
        )
        .int32(tag::DIRINDEXES, [0, 1, 1, 1, 2, 1])
        .int16(
            tag::FILEMODES,
            [
                0o040_755,
                0o100_755u16 as i16,
                0o120_777u16 as i16,
                0o100_644u16 as i16,
                0o100_600u16 as i16,
                0o100_644u16 as i16,
            ],
        )
        .int32(tag::FILESIZES, [0, 12, 3, 5000, 9, 5000])
        .int32(tag::FILEFLAGS, [0, 0, 0, 0, 1, 0])
        .int32(tag::FILEINODES, [1, 2, 3, 42, 5, 42])
        .string_array(tag::FILELINKTOS, ["", "", "foo", "", "", ""])
        .string_array(tag::FILEUSERNAME, ["root"; 6])
        .string_array(tag::FILEGROUPNAME, ["root"; 6])
}

fn write_reflink_package(dir: &Path) -> PathBuf {
    let path = dir.join("foo-1.0-1.x86_64.rpm");
    let mut file = File::create(&path).unwrap();
    let layout = PackageWriter::new(HeaderBuilder::new(), headers())
        .write(&mut file)
        .unwrap();
    let bar = vec![b'b'; 5000];
    write_reflink_payload(
        &mut file,
        layout[1].end,
        [&b"#!/bin/true\n"[..], &bar[..], &b"key=value"[..]],
    )
    .unwrap();
    path
}

#[test]
fn test_install_reflink_package() {
    let packages = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let package = write_reflink_package(packages.path());

    let summary = install_package(&package, &options(root.path())).unwrap();
    assert_eq!(summary.nevra.to_string(), "foo-1.0-1.x86_64");
    assert_matches!(&summary.content, InstalledContent::Reflinked(applied) if applied.copied == 3 && applied.hardlinks == 1);
    assert_eq!(summary.owned, 6);

    let root = root.path();
    assert_eq!(
        std::fs::read(root.join("usr/bin/foo")).unwrap(),
        b"#!/bin/true\n"
    );
    assert_eq!(
        std::fs::metadata(root.join("usr/bin/foo"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777,
        0o755
    );
    assert_eq!(
        std::fs::read_link(root.join("usr/bin/foo-link")).unwrap(),
        Path::new("foo")
    );
    assert_eq!(std::fs::read(root.join("usr/bin/bar")).unwrap().len(), 5000);
    assert_eq!(
        std::fs::metadata(root.join("usr/bin/bar")).unwrap().ino(),
        std::fs::metadata(root.join("usr/bin/bar-hardlink"))
            .unwrap()
            .ino()
    );
    assert_eq!(std::fs::read(root.join("etc/foo.conf")).unwrap(), b"key=value");

    // The header store holds exactly the headers.
    let header_path = summary.header_path.unwrap();
    assert_eq!(
        header_path,
        root.join("usr/lib/sysimage/rpm-headers/foo-1.0-1.x86_64.rpm")
    );
    let stored = TagStore::open(&header_path).unwrap();
    assert_eq!(
        std::fs::metadata(&header_path).unwrap().len(),
        stored.payload_offset()
    );
    assert_eq!(
        PackageMetadata::new(&stored).nevra().unwrap().to_string(),
        "foo-1.0-1.x86_64"
    );
}

#[test]
fn test_reinstall() {
    let packages = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let package = write_reflink_package(packages.path());
    install_package(&package, &options(root.path())).unwrap();

    // The header store refuses a second copy.
    assert_matches!(
        install_package(&package, &options(root.path())),
        Err(InstallError::Conflict(ConflictError::AlreadyInstalled(_)))
    );

    // Without touching the header store the existing files conflict.
    let just_fs = InstallOptions {
        just_fs: true,
        ..options(root.path())
    };
    assert_matches!(
        install_package(&package, &just_fs),
        Err(InstallError::Conflict(ConflictError::AlreadyExists(_)))
    );

    let force = InstallOptions {
        force: true,
        ..just_fs
    };
    let summary = install_package(&package, &force).unwrap();
    assert!(summary.header_path.is_none());
    assert_eq!(
        std::fs::read(root.path().join("usr/bin/foo")).unwrap(),
        b"#!/bin/true\n"
    );
}

#[test]
fn test_install_only_prefix() {
    let packages = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let package = write_reflink_package(packages.path());
    let options = InstallOptions {
        only_prefix: Some(PathBuf::from("/etc")),
        just_fs: true,
        ..options(root.path())
    };
    install_package(&package, &options).unwrap();

    assert_eq!(
        std::fs::read(root.path().join("etc/foo.conf")).unwrap(),
        b"key=value"
    );
    assert!(!root.path().join("usr").exists());
}

/// Appends a `newc` entry to `archive`.
fn cpio_entry(archive: &mut Vec<u8>, name: &str, mode: u32, data: &[u8]) {
    archive.extend_from_slice(b"070701");
    let fields = [
        1,
        mode,
        0,
        0,
        1,
        0,
        data.len() as u32,
        0,
        0,
        0,
        0,
        name.len() as u32 + 1,
        0,
    ];
    for field in fields {
        archive.extend_from_slice(format!("{field:08X}").as_bytes());
    }
    archive.extend_from_slice(name.as_bytes());
    archive.push(0);
    while archive.len() % 4 != 0 {
        archive.push(0);
    }
    archive.extend_from_slice(data);
    while archive.len() % 4 != 0 {
        archive.push(0);
    }
}

#[test]
fn test_install_cpio_package() {
    let packages = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("etc")).unwrap();
    std::fs::write(root.path().join("etc/foo.conf"), b"local").unwrap();

    let mut archive = Vec::new();
    cpio_entry(&mut archive, "./usr/bin/foo", 0o100_755, b"#!/bin/true\n");
    cpio_entry(&mut archive, "./etc/foo.conf", 0o100_600, b"key=value");
    cpio_entry(&mut archive, "TRAILER!!!", 0, b"");
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&archive).unwrap();
    let payload = encoder.finish().unwrap();

    let path = packages.path().join("foo.rpm");
    let mut file = File::create(&path).unwrap();
    PackageWriter::new(
        HeaderBuilder::new(),
        headers().string(tag::PAYLOADCOMPRESSOR, "gzip"),
    )
    .write(&mut file)
    .unwrap();
    file.write_all(&payload).unwrap();
    drop(file);

    let summary = install_package(&path, &options(root.path())).unwrap();
    assert_matches!(
        &summary.content,
        InstalledContent::Extracted { backups, summary } if backups.len() == 1 && summary.files == 2
    );

    let etc = root.path().join("etc");
    assert_eq!(std::fs::read(etc.join("foo.conf")).unwrap(), b"key=value");
    assert_eq!(std::fs::read(etc.join("foo.conf.rpmorig")).unwrap(), b"local");
    assert_eq!(
        std::fs::read(root.path().join("usr/bin/foo")).unwrap(),
        b"#!/bin/true\n"
    );
}

#[test]
fn test_uncompressed_payload_is_rejected() {
    let packages = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let path = packages.path().join("plain.rpm");
    let mut file = File::create(&path).unwrap();
    PackageWriter::new(HeaderBuilder::new(), headers())
        .write(&mut file)
        .unwrap();
    file.write_all(b"070701 not compressed").unwrap();
    drop(file);

    let options = InstallOptions {
        just_fs: true,
        ..options(root.path())
    };
    assert_matches!(
        install_package(&path, &options),
        Err(InstallError::Payload(rpm_install::PayloadError::UnsupportedCompression))
    );
}

#[test]
fn test_install_reflink_or_copy() {
    let packages = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let package = write_reflink_package(packages.path());
    let options = InstallOptions {
        clone_method: CloneMethod::ReflinkOrCopy,
        just_fs: true,
        ..options(root.path())
    };

    let summary = install_package(&package, &options).unwrap();
    assert_matches!(
        &summary.content,
        InstalledContent::Reflinked(applied) if applied.reflinked + applied.copied == 3
    );
    assert_eq!(
        std::fs::read(root.path().join("usr/bin/foo")).unwrap(),
        b"#!/bin/true\n"
    );
    assert_eq!(
        std::fs::read(root.path().join("usr/bin/bar")).unwrap(),
        vec![b'b'; 5000]
    );
}

#[test]
fn test_paths_outside_of_root_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let path = dir.path().join("escape.rpm");
    let mut file = File::create(&path).unwrap();
    let main = HeaderBuilder::new()
        .string(tag::NAME, "escape")
        .string(tag::VERSION, "1.0")
        .string(tag::RELEASE, "1")
        .string(tag::ARCH, "x86_64")
        .string(tag::SOURCERPM, "escape-1.0-1.src.rpm")
        .string_array(tag::DIRNAMES, ["/../escape/"])
        .string_array(tag::BASENAMES, ["pwned"])
        .int32(tag::DIRINDEXES, [0])
        .int16(tag::FILEMODES, [0o100_644u16 as i16])
        .int32(tag::FILESIZES, [5])
        .int32(tag::FILEFLAGS, [0])
        .int32(tag::FILEINODES, [1])
        .string_array(tag::FILELINKTOS, [""])
        .string_array(tag::FILEUSERNAME, ["root"])
        .string_array(tag::FILEGROUPNAME, ["root"]);
    let layout = PackageWriter::new(HeaderBuilder::new(), main)
        .write(&mut file)
        .unwrap();
    write_reflink_payload(&mut file, layout[1].end, [&b"pwned"[..]]).unwrap();
    drop(file);

    assert_matches!(
        install_package(&path, &options(&root)),
        Err(InstallError::PathEscapesRoot(p)) if p == Path::new("/../escape/pwned")
    );
    assert!(!dir.path().join("escape").exists());
    // Nothing was recorded either.
    assert!(!root.join("usr/lib/sysimage/rpm-headers").exists());
}
