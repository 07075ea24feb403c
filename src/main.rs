//! vpkstore CLI - build, inspect and verify packed VPK stores.
//!
//! This is the main entry point for the vpkstore command-line application.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use vpkstore::{
    AddFileResult, PackedStore, SignatureCheck, SigningKeys, StoreConfig, DEFAULT_WRITE_CHUNK_SIZE,
    KEY_SIZE,
};

/// vpkstore - packed content archive tool
#[derive(Parser)]
#[command(name = "vpkstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose logging (same as RUST_LOG=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a directory tree into a store
    Pack {
        /// Source directory
        #[arg(short, long)]
        source: PathBuf,

        /// Directory file to write (`<name>_dir.vpk`)
        #[arg(short, long, env = "VPK_DIR")]
        vpk: PathBuf,

        /// Maximum bytes per chunk file
        #[arg(long, env = "VPK_CHUNK_SIZE", default_value_t = DEFAULT_WRITE_CHUNK_SIZE)]
        chunk_size: u64,

        /// Bytes of each file kept inline in the directory
        #[arg(long, default_value_t = 0)]
        preload: usize,

        /// Split files that do not fit the open chunk across chunk files
        #[arg(long)]
        multichunk: bool,

        /// Store everything inside the directory file
        #[arg(long)]
        embed: bool,

        /// Hex private key to sign the directory with
        #[arg(long, env = "VPK_PRIVATE_KEY", hide_env_values = true)]
        private_key: Option<String>,
    },

    /// List the files of a store
    List {
        /// Directory file
        #[arg(short, long, env = "VPK_DIR")]
        vpk: PathBuf,

        /// Filter pattern (glob-style)
        #[arg(short, long)]
        filter: Option<String>,

        /// Show sizes, chunks and CRCs
        #[arg(short, long)]
        detailed: bool,
    },

    /// Extract files from a store
    Extract {
        /// Directory file
        #[arg(short, long, env = "VPK_DIR")]
        vpk: PathBuf,

        /// Output directory
        #[arg(short, long, env = "OUTPUT_FOLDER")]
        output: PathBuf,

        /// Filter pattern (glob-style)
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Check hashes, content CRCs and the signature
    Verify {
        /// Directory file
        #[arg(short, long, env = "VPK_DIR")]
        vpk: PathBuf,

        /// Hex public key the store must be signed with
        #[arg(long, env = "VPK_PUBLIC_KEY")]
        public_key: Option<String>,
    },

    /// Rewrite the directory file with a signature
    Sign {
        /// Directory file
        #[arg(short, long, env = "VPK_DIR")]
        vpk: PathBuf,

        /// Hex private key
        #[arg(long, env = "VPK_PRIVATE_KEY", hide_env_values = true)]
        private_key: String,
    },

    /// Generate a signing key pair
    Keygen,

    /// Show store metadata
    Info {
        /// Directory file
        #[arg(short, long, env = "VPK_DIR")]
        vpk: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Pack {
            source,
            vpk,
            chunk_size,
            preload,
            multichunk,
            embed,
            private_key,
        } => {
            let config = StoreConfig::default()
                .with_write_chunk_size(chunk_size)
                .with_embedded_chunk(embed);
            let keys = private_key.as_deref().map(parse_private_key).transpose()?;
            cmd_pack(&source, &vpk, config, preload, multichunk, keys)?;
        }
        Commands::List {
            vpk,
            filter,
            detailed,
        } => {
            cmd_list(&vpk, filter.as_deref(), detailed)?;
        }
        Commands::Extract {
            vpk,
            output,
            filter,
        } => {
            cmd_extract(&vpk, &output, filter.as_deref())?;
        }
        Commands::Verify { vpk, public_key } => {
            let public_key = public_key.as_deref().map(parse_key_hex).transpose()?;
            cmd_verify(&vpk, public_key.as_ref().map(|k| k.as_slice()))?;
        }
        Commands::Sign { vpk, private_key } => {
            cmd_sign(&vpk, parse_private_key(&private_key)?)?;
        }
        Commands::Keygen => cmd_keygen(),
        Commands::Info { vpk } => cmd_info(&vpk)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn parse_key_hex(text: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = hex::decode(text.trim()).context("Key is not valid hex")?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("Key must be {KEY_SIZE} bytes, got {}", b.len()))
}

fn parse_private_key(text: &str) -> Result<SigningKeys> {
    Ok(SigningKeys::from_seed(parse_key_hex(text)?))
}

fn cmd_pack(
    source: &Path,
    vpk: &Path,
    config: StoreConfig,
    preload: usize,
    multichunk: bool,
    keys: Option<SigningKeys>,
) -> Result<()> {
    println!("Scanning: {}", source.display());

    let mut files = Vec::new();
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.context("Failed to walk source directory")?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    let mut store = if vpk.exists() {
        info!(path = %vpk.display(), "appending to existing store");
        PackedStore::open(vpk, config).context("Failed to open existing store")?
    } else {
        PackedStore::create(vpk, config).context("Failed to create store")?
    };
    if let Some(keys) = keys {
        store.set_signing_keys(keys);
    }

    println!("Packing {} files...", files.len());
    let pb = progress_bar(files.len() as u64)?;
    let start = Instant::now();
    let (mut added, mut updated, mut unchanged) = (0usize, 0usize, 0usize);

    for path in &files {
        let relative = path.strip_prefix(source).unwrap_or(path);
        let name = relative.to_string_lossy().replace('\\', "/");
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

        let outcome = store
            .add_file(&name, preload, &data, multichunk, None)
            .with_context(|| format!("Failed to add {name}"))?;
        match outcome {
            AddFileResult::NewFile => added += 1,
            AddFileResult::FileUpdated => updated += 1,
            AddFileResult::SameFileUnchanged => unchanged += 1,
        }
        pb.inc(1);
    }
    pb.finish_with_message("Done");

    store.write().context("Failed to write directory")?;
    println!(
        "Packed {} new, {} updated, {} unchanged into {} chunk file(s) in {:?}",
        added,
        updated,
        unchanged,
        store.chunk_count(),
        start.elapsed()
    );

    Ok(())
}

fn open_store(vpk: &Path) -> Result<PackedStore> {
    PackedStore::open(vpk, StoreConfig::default()).context("Failed to open store")
}

fn cmd_list(vpk: &Path, filter: Option<&str>, detailed: bool) -> Result<()> {
    let store = open_store(vpk)?;
    let names = store.get_file_list(filter)?;

    for name in &names {
        if !detailed {
            println!("{name}");
            continue;
        }
        let Some(handle) = store.open_file(name) else {
            continue;
        };
        let chunk = match handle.chunk() {
            Some(vpkstore::EMBEDDED_CHUNK) | None => "dir".to_string(),
            Some(c) => format!("{c:03}"),
        };
        println!(
            "{:>12} {:>6} {:>4} {:08x} {}",
            handle.size(),
            handle.preload().len(),
            chunk,
            handle.crc(),
            name
        );
    }

    println!("\nTotal: {} entries", names.len());

    Ok(())
}

fn cmd_extract(vpk: &Path, output: &Path, filter: Option<&str>) -> Result<()> {
    println!("Opening store: {}", vpk.display());

    let start = Instant::now();
    let store = open_store(vpk)?;
    println!("Loaded {} entries in {:?}", store.entry_count(), start.elapsed());

    let names = store.get_file_list(filter)?;
    println!("Extracting {} entries...", names.len());

    fs::create_dir_all(output)?;
    let pb = progress_bar(names.len() as u64)?;
    let start = Instant::now();
    let mut short = 0usize;

    for name in &names {
        let output_path = contained_output_path(output, name)?;
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Some(handle) = store.open_file(name) {
            let data = store.read_file(name).unwrap_or_default();
            if (data.len() as u64) < handle.size() {
                warn!(name = %name, "short read while extracting");
                short += 1;
            }
            fs::write(&output_path, data)
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
        }

        store.service();
        pb.inc(1);
    }

    pb.finish_with_message("Done");
    println!("Extraction completed in {:?}", start.elapsed());
    if short > 0 {
        println!("{}", store.pack_file_load_error_summary());
        bail!("{short} file(s) could not be read completely");
    }

    Ok(())
}

/// Join a stored name onto the output directory, refusing names that escape it.
fn contained_output_path(output: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        bail!("Refusing to extract {name:?} outside {}", output.display());
    }
    Ok(output.join(relative))
}

fn cmd_verify(vpk: &Path, public_key: Option<&[u8]>) -> Result<()> {
    let store = open_store(vpk)?;
    let mut failures = 0usize;

    let directory_ok = store.test_directory_hash();
    println!("Directory hash:   {}", if directory_ok { "ok" } else { "MISMATCH" });
    failures += usize::from(!directory_ok);

    let chunks_ok = store.test_master_chunk_hash();
    println!("Chunk hashes:     {}", if chunks_ok { "ok" } else { "MISMATCH" });
    failures += usize::from(!chunks_ok);

    let signature = store.check_signature(public_key);
    println!("Signature:        {signature:?}");
    match signature {
        SignatureCheck::ValidSignature => {}
        SignatureCheck::NotSigned if public_key.is_none() => {}
        _ => failures += 1,
    }

    let names = store.get_file_list(None)?;
    let pb = progress_bar(names.len() as u64)?;
    let mut bad_crc = 0usize;
    for name in &names {
        if store.verify_file_crc(name) == Some(false) {
            debug!(name = %name, "content CRC mismatch");
            bad_crc += 1;
        }
        store.service();
        pb.inc(1);
    }
    pb.finish_and_clear();
    println!("Content CRCs:     {} of {} ok", names.len() - bad_crc, names.len());
    failures += bad_crc;

    store.service();
    println!("{}", store.pack_file_load_error_summary());

    if failures > 0 {
        bail!("Verification failed with {failures} problem(s)");
    }
    Ok(())
}

fn cmd_sign(vpk: &Path, keys: SigningKeys) -> Result<()> {
    let mut store = open_store(vpk)?;
    println!("Signing with public key {}", hex::encode(keys.public_key_bytes()));
    store.set_signing_keys(keys);
    store.write().context("Failed to write signed directory")?;

    let check = store.check_signature(None);
    if !check.is_valid() {
        bail!("Signature check after signing returned {check:?}");
    }
    println!("Signed {} bytes", store.signed_size());
    Ok(())
}

fn cmd_keygen() {
    let mut seed = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut seed);
    let keys = SigningKeys::from_seed(seed);

    println!("private: {}", hex::encode(keys.private_key_bytes()));
    println!("public:  {}", hex::encode(keys.public_key_bytes()));
}

fn cmd_info(vpk: &Path) -> Result<()> {
    let store = open_store(vpk)?;
    let hashes = store.hashes();

    println!("Directory:      {}", store.paths().dir_path().display());
    println!("Entries:        {}", store.entry_count());
    println!("Chunk files:    {}", store.chunk_count());
    println!("Embedded bytes: {}", store.embedded_size());
    println!("Fractions:      {}", store.fraction_hashes().len());
    println!("Directory MD5:  {}", hashes.directory);
    println!("Chunks MD5:     {}", hashes.chunk_hashes);
    println!("Total MD5:      {}", hashes.total);
    match store.signature_public_key() {
        Some(key) => println!(
            "Signed by:      {} ({} bytes)",
            hex::encode(key),
            store.signed_size()
        ),
        None => println!("Signed by:      (unsigned)"),
    }

    Ok(())
}
