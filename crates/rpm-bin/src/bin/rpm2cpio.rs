use std::io::BufReader;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use miette::{Context, IntoDiagnostic};
use rpm_header::{PackageMetadata, TagStore};

/// Output a cpio archive of the rpm file
#[derive(Debug, Parser)]
#[command(name = "rpm2cpio", version, about, long_about = None)]
struct Opt {
    /// The package to convert
    package: PathBuf,

    /// Increase the log level, can be repeated
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// Entry point of the `rpm2cpio` cli.
fn main() -> miette::Result<()> {
    let opt = Opt::parse();
    rpm_bin::init_logging(opt.verbose)?;

    let (mut file, _) = fs_err::File::open(&opt.package).into_diagnostic()?.into_parts();
    let store = TagStore::read(&mut file)
        .into_diagnostic()
        .with_context(|| format!("failed to read {}", opt.package.display()))?;
    let compressor = PackageMetadata::new(&store)
        .payload_compressor()
        .into_diagnostic()?;

    // The file is positioned at the start of the payload.
    let mut payload =
        rpm_install::payload::decompress(BufReader::new(file), compressor.as_deref(), true)
            .into_diagnostic()?;
    std::io::copy(&mut payload, &mut std::io::stdout().lock())
        .into_diagnostic()
        .context("error unpacking")?;
    Ok(())
}
