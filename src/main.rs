use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use blockfs::{DiskFile, FileSystem};
use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use tracing::trace;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(about = "A block-device filesystem simulated in a single image file")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and format a new image file
    Create {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(short = 'c', long, default_value_t = 1000)]
        blocks: u64,
        #[arg(short = 's', long, default_value_t = 512)]
        block_size: usize,
        #[arg(short = 'm', long, default_value_t = 16)]
        max_files: u32,
    },
    /// Register a new empty file
    Touch { image: PathBuf, name: String },
    /// Store content in a file, read from --file or stdin
    Add {
        image: PathBuf,
        name: String,
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,
    },
    /// Print a file's content
    Cat { image: PathBuf, name: String },
    /// List files
    Ls { image: PathBuf },
    /// Delete a file
    Rm { image: PathBuf, name: String },
    /// Rename a file
    Mv {
        image: PathBuf,
        name: String,
        new_name: String,
    },
    /// Print a file's metadata and block assignments
    Stat { image: PathBuf, name: String },
    /// Print the superblock counters
    Info { image: PathBuf },
}

fn open_image(image: &Path) -> Result<FileSystem<DiskFile>> {
    FileSystem::open_path(image).wrap_err_with(|| format!("could not open image {image:?}"))
}

/// Gregorian date from a Unix timestamp, via a days-from-epoch conversion.
fn format_date(secs: u64) -> String {
    let z = secs as i64 / 86_400 + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    format!("{year:04}-{month:02}-{day:02}")
}

fn slots(assigned: &[Option<u32>]) -> String {
    let used: Vec<String> = assigned
        .iter()
        .flatten()
        .map(|block| block.to_string())
        .collect();
    if used.is_empty() {
        "-".to_string()
    } else {
        used.join(" ")
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
    trace!("starting up blockfs cli");
    let cli = Cli::parse();
    match cli.command {
        Command::Create {
            image,
            blocks,
            block_size,
            max_files,
        } => {
            let fs = FileSystem::create_path(&image, blocks, block_size, max_files)
                .wrap_err_with(|| format!("failed to create image {image:?}"))?;
            fs.close()?;
            println!(
                "created {}: {blocks} blocks of {block_size} bytes, up to {max_files} files",
                image.display()
            );
        }
        Command::Touch { image, name } => {
            let mut fs = open_image(&image)?;
            fs.create(&name)?;
            fs.close()?;
        }
        Command::Add { image, name, file } => {
            let data = match file {
                Some(path) => {
                    fs::read(&path).wrap_err_with(|| format!("could not read {path:?}"))?
                }
                None => {
                    let mut buf = Vec::new();
                    io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let mut fs = open_image(&image)?;
            fs.add(&name, &data)?;
            fs.close()?;
        }
        Command::Cat { image, name } => {
            let mut fs = open_image(&image)?;
            let data = fs.read(&name)?;
            io::stdout().write_all(&data)?;
            fs.close()?;
        }
        Command::Ls { image } => {
            let fs = open_image(&image)?;
            for entry in fs.list() {
                println!(
                    "{:<24} {:>10} {}",
                    entry.name,
                    entry.size,
                    format_date(entry.created)
                );
            }
            fs.close()?;
        }
        Command::Rm { image, name } => {
            let mut fs = open_image(&image)?;
            fs.delete(&name)?;
            fs.close()?;
        }
        Command::Mv {
            image,
            name,
            new_name,
        } => {
            let mut fs = open_image(&image)?;
            fs.rename(&name, &new_name)?;
            fs.close()?;
        }
        Command::Stat { image, name } => {
            let fs = open_image(&image)?;
            let stat = fs.stat(&name)?;
            println!("name:            {}", stat.name);
            println!("created:         {}", format_date(stat.created));
            println!("size:            {} bytes", stat.size);
            println!("direct blocks:   {}", slots(&stat.direct));
            println!("indirect blocks: {}", slots(&stat.indirect));
            fs.close()?;
        }
        Command::Info { image } => {
            let fs = open_image(&image)?;
            let info = fs.superblock_info();
            println!("total blocks: {}", info.total_blocks);
            println!("block size:   {} bytes", info.block_size);
            println!("free blocks:  {}", info.free_blocks);
            println!("max files:    {}", info.max_inodes);
            println!("used files:   {}", info.used_inodes);
            fs.close()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::format_date;

    #[test]
    fn dates_format_as_year_month_day() {
        assert_eq!(format_date(0), "1970-01-01");
        assert_eq!(format_date(951_782_400), "2000-02-29");
        assert_eq!(format_date(1_700_000_000), "2023-11-14");
    }
}
