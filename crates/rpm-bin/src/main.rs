use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use miette::{Context, IntoDiagnostic};
use rpm_bin::query::{self, QueryFormat};
use rpm_header::{PackageMetadata, TagStore};
use rpm_install::{install_package, CloneMethod, HeaderStore, InstallOptions};

/// Install and query RPM packages
#[derive(Debug, Parser)]
#[command(name = "rpm", version, about, long_about = None)]
struct Opt {
    /// Install packages. Together with -q: show package information
    #[clap(short = 'i', long = "install")]
    install_or_info: bool,

    /// Upgrade (install) packages
    #[clap(short = 'U', long = "upgrade")]
    upgrade: bool,

    /// Query packages
    #[clap(short, long)]
    query: bool,

    /// Query package files instead of installed packages
    #[clap(short = 'p', long = "package")]
    package_files: bool,

    /// List the files of the packages
    #[clap(short, long)]
    list: bool,

    /// List only documentation files (implies -l)
    #[clap(short = 'd', long = "docfiles")]
    docs: bool,

    /// List only configuration files (implies -l)
    #[clap(short = 'c', long = "configfiles")]
    configs: bool,

    /// Query all installed packages
    #[clap(short, long)]
    all: bool,

    /// The root directory to install into and to query
    #[clap(short, long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Replace files that already exist
    #[clap(long)]
    force: bool,

    /// Only install files below this directory
    #[clap(long, value_name = "PREFIX")]
    only_prefix: Option<PathBuf>,

    /// Only install the files, do not record the package headers
    #[clap(long = "justfs")]
    just_fs: bool,

    /// Copy file contents when the file system cannot reflink them
    #[clap(long)]
    allow_copy: bool,

    /// Ignored, dependencies are never checked
    #[clap(long, hide = true)]
    #[allow(dead_code)]
    nodeps: bool,

    /// Ignored, digests are never checked
    #[clap(long, hide = true)]
    #[allow(dead_code)]
    nodigest: bool,

    /// Ignored, signatures are never checked
    #[clap(long, hide = true)]
    #[allow(dead_code)]
    nosignature: bool,

    /// Increase the log level, can be repeated
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Package files to install or query, or names of installed packages to query
    packages: Vec<String>,
}

enum Mode {
    Install,
    Query(QueryFormat),
}

impl Opt {
    fn mode(&self) -> miette::Result<Mode> {
        if self.query {
            if self.upgrade {
                miette::bail!("-q and -U cannot be combined");
            }
            return Ok(Mode::Query(QueryFormat {
                info: self.install_or_info,
                list: self.list,
                docs: self.docs,
                configs: self.configs,
            }));
        }
        if self.install_or_info || self.upgrade {
            return Ok(Mode::Install);
        }
        miette::bail!("one of -i, -U or -q is required")
    }

    fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| PathBuf::from("/"))
    }
}

/// Entry point of the `rpm` cli.
fn main() -> miette::Result<()> {
    let opt = Opt::parse();
    rpm_bin::init_logging(opt.verbose)?;

    let mode = opt.mode()?;
    if !(opt.all && matches!(mode, Mode::Query(_))) && opt.packages.is_empty() {
        miette::bail!("no packages given");
    }

    match mode {
        Mode::Install => install(&opt),
        Mode::Query(format) if opt.package_files => query_files(&opt, format),
        Mode::Query(format) if opt.all => query_all(&opt, format),
        Mode::Query(format) => query_installed(&opt, format),
    }
}

fn install(opt: &Opt) -> miette::Result<()> {
    let options = InstallOptions {
        root: opt.root.clone(),
        force: opt.force,
        only_prefix: opt.only_prefix.clone(),
        just_fs: opt.just_fs,
        clone_method: if opt.allow_copy {
            CloneMethod::ReflinkOrCopy
        } else {
            CloneMethod::Reflink
        },
        ..InstallOptions::default()
    };

    for package in &opt.packages {
        let summary = install_package(Path::new(package), &options)
            .into_diagnostic()
            .with_context(|| format!("failed to install {package}"))?;
        if opt.verbose > 0 {
            eprintln!(
                "{} {}",
                console::style("installed").green(),
                summary.nevra
            );
        }
    }
    Ok(())
}

fn print_package(store: &TagStore, format: QueryFormat, out: &mut impl Write) -> miette::Result<()> {
    query::trace_tags(store);
    query::render(
        &PackageMetadata::new(store),
        format,
        &chrono::Local,
        out,
    )
    .into_diagnostic()
}

fn query_files(opt: &Opt, format: QueryFormat) -> miette::Result<()> {
    let mut out = std::io::stdout().lock();
    for package in &opt.packages {
        let store = TagStore::open(Path::new(package))
            .into_diagnostic()
            .with_context(|| format!("failed to read {package}"))?;
        print_package(&store, format, &mut out)?;
    }
    Ok(())
}

fn query_all(opt: &Opt, format: QueryFormat) -> miette::Result<()> {
    let header_store = HeaderStore::new(&opt.root());
    let mut out = std::io::stdout().lock();
    for path in header_store.entries().into_diagnostic()? {
        let store = match TagStore::open(&path) {
            Ok(store) => store,
            Err(err) => {
                tracing::warn!("skipping {}: {err}", path.display());
                continue;
            }
        };
        print_package(&store, format, &mut out)?;
    }
    Ok(())
}

fn query_installed(opt: &Opt, format: QueryFormat) -> miette::Result<()> {
    let header_store = HeaderStore::new(&opt.root());
    let mut out = std::io::stdout().lock();
    let mut missing = 0;
    for name in &opt.packages {
        let found = header_store.find(name).into_diagnostic()?;
        if found.is_empty() {
            writeln!(out, "package {name} is not installed").into_diagnostic()?;
            missing += 1;
            continue;
        }
        for path in found {
            let store = TagStore::open(&path)
                .into_diagnostic()
                .with_context(|| format!("failed to read {}", path.display()))?;
            print_package(&store, format, &mut out)?;
        }
    }

    if missing > 0 {
        miette::bail!("{missing} package(s) not installed");
    }
    Ok(())
}
