#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use cfs::{
    BlockCache, CacheConfig, CacheStats, CfsError, ContigFs, FileFlash, FileHandle, FsConfig,
    FsGeometry, FsUsage, OpenMode,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_ERASE_BLOCK: u32 = 4096;
const COPY_CHUNK: usize = 64 * 1024;
/// Name `put` writes under before swapping the file into place.
const PUT_STAGING: &str = ".cfs-put.partial";

// ── Configuration ───────────────────────────────────────────────────────────

/// Image parameters, optionally loaded from a JSON file with `--config`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ImageConfig {
    erase_block_size: u32,
    cache: CacheConfig,
    fs: FsConfig,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            erase_block_size: DEFAULT_ERASE_BLOCK,
            cache: CacheConfig::default(),
            fs: FsConfig::default(),
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ImageConfig> {
    let Some(path) = path else {
        return Ok(ImageConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

#[derive(Debug, Default)]
struct Options {
    json: bool,
    config: Option<PathBuf>,
    size: Option<u64>,
    positional: Vec<String>,
}

impl Options {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut options = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--json" => options.json = true,
                "--config" => {
                    let Some(path) = args.next() else {
                        bail!("--config requires a path");
                    };
                    options.config = Some(PathBuf::from(path));
                }
                "--size" => {
                    let Some(size) = args.next() else {
                        bail!("--size requires a byte count");
                    };
                    options.size = Some(
                        size.parse()
                            .with_context(|| format!("invalid --size value {size:?}"))?,
                    );
                }
                flag if flag.starts_with("--") => bail!("unknown option: {flag}"),
                _ => options.positional.push(arg),
            }
        }
        Ok(options)
    }

    fn arg(&self, index: usize, what: &str) -> Result<&str> {
        match self.positional.get(index) {
            Some(value) => Ok(value.as_str()),
            None => bail!("missing {what}"),
        }
    }
}

// ── Image access ────────────────────────────────────────────────────────────

struct Image {
    fs: ContigFs,
    config: ImageConfig,
}

impl Image {
    /// Open (or, with `create_size`, create) the image at `path` and mount it.
    fn open(path: &Path, options: &Options, create_size: Option<u64>) -> Result<Self> {
        let config = load_config(options.config.as_deref())?;
        let flash = match create_size {
            Some(size) => FileFlash::create(path, size, config.erase_block_size)
                .with_context(|| format!("failed to create image {}", path.display()))?,
            None => FileFlash::open(path, config.erase_block_size)
                .with_context(|| format!("failed to open image {}", path.display()))?,
        };
        let cache = Arc::new(BlockCache::new(config.cache.clone()).context("cache config")?);
        let device = cache.register(Arc::new(flash)).context("register image")?;
        let fs = ContigFs::mount(cache, device, &config.fs)
            .with_context(|| format!("failed to mount {}", path.display()))?;
        Ok(Self { fs, config })
    }

    fn formatted(&self) -> Result<bool> {
        Ok(ContigFs::probe(
            self.fs.cache(),
            self.fs.device_id(),
            &self.config.fs,
        )?)
    }

    /// Persist the table and flush every buffer back to the image.
    fn commit(self) -> Result<()> {
        self.fs.shutdown().context("failed to write back the image")
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let options = Options::parse(args)?;

    match command.as_str() {
        "format" => format_cmd(&options),
        "ls" => ls(&options),
        "put" => put(&options),
        "get" => get(&options),
        "rm" => rm(&options),
        "stat" => stat(&options),
        "inspect" => inspect(&options),
        "defrag" => defrag(&options),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("cfs-cli\n");
    println!("USAGE:");
    println!("  cfs-cli format <image> [--size <bytes>]");
    println!("  cfs-cli ls <image> [--json]");
    println!("  cfs-cli put <image> <host-file> [name]");
    println!("  cfs-cli get <image> <name> [host-file]");
    println!("  cfs-cli rm <image> <name>");
    println!("  cfs-cli stat <image> <name> [--json]");
    println!("  cfs-cli inspect <image> [--json]");
    println!("  cfs-cli defrag <image>");
    println!();
    println!("Every command accepts --config <json> with erase_block_size, cache and fs sections.");
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn format_cmd(options: &Options) -> Result<()> {
    let path = Path::new(options.arg(0, "image path")?);
    let image = Image::open(path, options, options.size)?;
    image.fs.format()?;
    let geometry = *image.fs.geometry();
    image.commit()?;
    println!(
        "formatted {}: {} blocks of {} bytes, {} file slots",
        path.display(),
        geometry.total_blocks,
        geometry.block_size,
        geometry.max_files
    );
    Ok(())
}

fn ls(options: &Options) -> Result<()> {
    let image = Image::open(Path::new(options.arg(0, "image path")?), options, None)?;
    let files = image.fs.list();
    if options.json {
        return print_json(&files);
    }
    println!("{:<32} {:>10} {:>6} {:>6}", "NAME", "SIZE", "FIRST", "BLOCKS");
    for file in files {
        println!(
            "{:<32} {:>10} {:>6} {:>6}",
            file.name, file.size, file.first_block, file.block_count
        );
    }
    Ok(())
}

fn put(options: &Options) -> Result<()> {
    let path = Path::new(options.arg(0, "image path")?);
    let host = Path::new(options.arg(1, "host file")?);
    let name = match options.positional.get(2) {
        Some(name) => name.clone(),
        None => host
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("host file has no file name")?,
    };
    let data = std::fs::read(host).with_context(|| format!("failed to read {}", host.display()))?;

    let image = Image::open(path, options, None)?;
    let written = put_file(&image.fs, &name, &data)?;
    image.commit()?;
    println!("{name}: {written} bytes");
    Ok(())
}

/// Store `data` as `name`, replacing an existing file only once the new
/// contents are fully written. On failure the old file is left as it was.
fn put_file(fs: &ContigFs, name: &str, data: &[u8]) -> Result<usize> {
    remove_if_present(fs, PUT_STAGING)?;
    let written = match copy_in(fs, PUT_STAGING, data) {
        Ok(written) => written,
        Err(err) => {
            remove_if_present(fs, PUT_STAGING)
                .and_then(|()| fs.sync().map_err(Into::into))
                .context("failed to discard the partial copy")?;
            return Err(err);
        }
    };
    fs.rename(PUT_STAGING, name)?;
    Ok(written)
}

fn remove_if_present(fs: &ContigFs, name: &str) -> Result<()> {
    match fs.unlink(name) {
        Ok(()) | Err(CfsError::NotFound(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn copy_in(fs: &ContigFs, name: &str, data: &[u8]) -> Result<usize> {
    let handle = fs.open(name, OpenMode::WriteOnly, true)?;
    let copied = write_all(fs, handle, data);
    fs.close(handle)?;
    copied
}

fn write_all(fs: &ContigFs, handle: FileHandle, data: &[u8]) -> Result<usize> {
    fs.reserve(handle, data.len() as u64)?;
    let mut written = 0_usize;
    for chunk in data.chunks(COPY_CHUNK) {
        let n = fs.write(handle, chunk)?;
        written += n;
        if n < chunk.len() {
            bail!("out of space after {written} of {} bytes", data.len());
        }
    }
    Ok(written)
}

fn get(options: &Options) -> Result<()> {
    let image = Image::open(Path::new(options.arg(0, "image path")?), options, None)?;
    let name = options.arg(1, "file name")?;
    let size = image.fs.stat(name)?.size;
    let handle = image.fs.open(name, OpenMode::ReadOnly, false)?;
    let mut data = vec![0_u8; usize::try_from(size).context("file too large for memory")?];
    let mut done = 0;
    while done < data.len() {
        let n = image.fs.read(handle, &mut data[done..])?;
        if n == 0 {
            bail!("{name} ended after {done} of {size} bytes");
        }
        done += n;
    }
    image.fs.close(handle)?;

    match options.positional.get(2) {
        Some(out) => std::fs::write(out, &data).with_context(|| format!("failed to write {out}"))?,
        None => io::stdout().write_all(&data).context("failed to write stdout")?,
    }
    Ok(())
}

fn rm(options: &Options) -> Result<()> {
    let image = Image::open(Path::new(options.arg(0, "image path")?), options, None)?;
    let name = options.arg(1, "file name")?;
    image.fs.unlink(name)?;
    image.commit()
}

fn stat(options: &Options) -> Result<()> {
    let image = Image::open(Path::new(options.arg(0, "image path")?), options, None)?;
    let name = options.arg(1, "file name")?;
    let stat = image.fs.stat(name)?;
    if options.json {
        return print_json(&stat);
    }
    println!("name: {name}");
    println!("size: {}", stat.size);
    println!("blocks: {}", stat.blocks);
    println!("block_size: {}", stat.block_size);
    Ok(())
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    formatted: bool,
    geometry: FsGeometry,
    usage: FsUsage,
    cache: CacheStats,
}

fn inspect(options: &Options) -> Result<()> {
    let image = Image::open(Path::new(options.arg(0, "image path")?), options, None)?;
    let output = InspectOutput {
        formatted: image.formatted()?,
        geometry: *image.fs.geometry(),
        usage: image.fs.usage(),
        cache: image.fs.cache().stats(),
    };
    if options.json {
        return print_json(&output);
    }
    println!("ContigFS Inspector");
    println!("formatted: {}", output.formatted);
    println!("region_offset: {}", output.geometry.region_offset);
    println!("block_size: {}", output.geometry.block_size);
    println!("total_blocks: {}", output.usage.total_blocks);
    println!("free_blocks: {}", output.usage.free_blocks);
    println!("largest_free_run: {}", output.usage.largest_free_run);
    println!("files: {}/{}", output.usage.files, output.geometry.max_files);
    println!(
        "cache: {} hits, {} misses, {} resident",
        output.cache.hits, output.cache.misses, output.cache.resident
    );
    Ok(())
}

fn defrag(options: &Options) -> Result<()> {
    let image = Image::open(Path::new(options.arg(0, "image path")?), options, None)?;
    let before = image.fs.usage().largest_free_run;
    let moved = image.fs.defragment()?;
    let after = image.fs.usage().largest_free_run;
    image.commit()?;
    if moved {
        println!("largest free run: {before} -> {after} blocks");
    } else {
        println!("free space already contiguous ({after} blocks)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs::MemoryFlash;

    fn parse(args: &[&str]) -> Result<Options> {
        Options::parse(args.iter().map(|arg| (*arg).to_owned()))
    }

    #[test]
    fn options_split_flags_from_positionals() {
        let options = parse(&["img.bin", "--json", "notes", "--config", "c.json"]).expect("parse");
        assert!(options.json);
        assert_eq!(options.config.as_deref(), Some(Path::new("c.json")));
        assert_eq!(options.positional, ["img.bin", "notes"]);
        assert_eq!(options.arg(1, "name").expect("arg"), "notes");
        assert!(options.arg(2, "name").is_err());
    }

    #[test]
    fn options_reject_bad_flags() {
        assert!(parse(&["--size"]).is_err());
        assert!(parse(&["--size", "lots"]).is_err());
        assert!(parse(&["--verbose"]).is_err());
        assert_eq!(parse(&["--size", "65536"]).expect("size").size, Some(65_536));
    }

    fn small_fs() -> ContigFs {
        let cache = Arc::new(
            BlockCache::new(CacheConfig {
                buffers: 4,
                buffer_size: 4096,
                ..CacheConfig::default()
            })
            .expect("cache"),
        );
        let flash = Arc::new(MemoryFlash::new(8 * 4096, 4096).expect("flash"));
        let device = cache.register(flash).expect("register");
        let config = FsConfig {
            block_size: 4096,
            max_files: 4,
            max_open_files: 4,
            ..FsConfig::default()
        };
        ContigFs::mount(cache, device, &config).expect("mount")
    }

    fn contents(fs: &ContigFs, name: &str) -> Vec<u8> {
        let mut out = vec![0_u8; fs.stat(name).expect("stat").size as usize];
        let handle = fs.open(name, OpenMode::ReadOnly, false).expect("open");
        assert_eq!(fs.read(handle, &mut out).expect("read"), out.len());
        fs.close(handle).expect("close");
        out
    }

    #[test]
    fn put_without_room_keeps_the_old_file() {
        let fs = small_fs();
        let old = vec![0xA1_u8; 2 * 4096];
        assert_eq!(put_file(&fs, "notes", &old).expect("first put"), old.len());

        // Seven data blocks: the old two plus six new ones do not fit.
        assert!(put_file(&fs, "notes", &vec![0xB2; 6 * 4096]).is_err());
        assert_eq!(contents(&fs, "notes"), old);
        assert!(matches!(fs.stat(PUT_STAGING), Err(CfsError::NotFound(_))));
        assert_eq!(fs.usage().free_blocks, 5);

        let new = vec![0xC3_u8; 3 * 4096 + 10];
        put_file(&fs, "notes", &new).expect("replacing put");
        assert_eq!(contents(&fs, "notes"), new);
        assert_eq!(fs.usage().files, 1);
        fs.check_consistency().expect("consistent");
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: ImageConfig =
            serde_json::from_str(r#"{"fs": {"block_size": 4096}}"#).expect("config");
        assert_eq!(config.erase_block_size, DEFAULT_ERASE_BLOCK);
        assert_eq!(config.fs.block_size, 4096);
        assert_eq!(config.fs.max_files, 15);
        assert_eq!(config.cache, CacheConfig::default());
    }
}
