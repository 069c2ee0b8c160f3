use anyhow::{Context, Result, anyhow};
use blkflash_core::checksum::ChecksumSet;
use blkflash_core::device::{self, Device};
use blkflash_core::progress::{ProgressState, status_line};
use blkflash_core::{
    AbortHandle, BlockMap, DescriptorOptions, FlashEvent, FlashOptions, FlashState, Image,
    OpenFlags, PassKind, flash,
};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "blkflash")]
#[command(about = "A streaming disk image flasher with verification", version)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a device or file
    Write {
        /// Image file to write (.gz, .xz and .zst are decompressed on the fly)
        #[arg(required = true)]
        image: PathBuf,

        /// Target device or file; prompts for a removable device if omitted
        #[arg(short, long)]
        target: Option<PathBuf>,

        /// Block map (JSON) listing the blocks that carry data
        #[arg(short, long)]
        bmap: Option<PathBuf>,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Checksum algorithm (crc32, sha256, sha512); may be repeated
        #[arg(short, long = "checksum", default_value = "sha256")]
        checksums: Vec<String>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// List available removable devices
    List,
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// By disabling it, we can have a cleaner exit when the user cancels the
/// operation. The original terminal state is restored when this struct is
/// dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().and_then(|original| {
                let mut quiet = original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).ok().map(|()| original)
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

/// Logs go to stderr so they do not tear the progress bars.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {{msg}}"
    );
    Ok(ProgressStyle::default_bar()
        .template(&template)?
        .progress_chars("■ "))
}

/// The write and verify bars, fed from progress events.
struct FlashBars {
    write: ProgressBar,
    verify: ProgressBar,
}

impl FlashBars {
    fn new(verify: bool) -> Result<Self> {
        let write = ProgressBar::new(0);
        write.set_prefix("Writing");
        write.set_style(bar_style("green")?);

        let verify = if verify {
            let bar = ProgressBar::new(0);
            bar.set_prefix("Verifying");
            bar.set_style(bar_style("magenta")?);
            bar
        } else {
            ProgressBar::hidden()
        };
        Ok(Self { write, verify })
    }

    fn update(&self, state: &ProgressState) {
        let bar = match state.kind {
            PassKind::Write => &self.write,
            PassKind::Verify => &self.verify,
        };
        bar.set_length(state.length.max(state.transferred));
        bar.set_position(state.transferred);
        bar.set_message(status_line(state));
    }

    fn fail(&self) {
        self.write.abandon_with_message("❌ Operation failed.");
        self.verify.finish_and_clear();
    }
}

/// Resolves the target: the given path, or an interactively chosen device.
/// Returns the path and its capacity, if fixed.
fn resolve_target(target: Option<PathBuf>) -> Result<(PathBuf, Option<u64>)> {
    match target {
        Some(path) => {
            let capacity = device::target_capacity(&path)?;
            Ok((path, capacity))
        }
        None => {
            let devices = blkflash_core::platform::get_removable_devices()?;
            let device = select_device(&devices, "Select the target device to WRITE to")?;
            Ok((device.path.clone(), Some(device.size)))
        }
    }
}

fn print_checksums(label: &str, checksums: &ChecksumSet) {
    for (algorithm, digest) in checksums {
        println!("  {label} {algorithm:<7} {}", style(digest).dim());
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_image(
    image_path: PathBuf,
    target: Option<PathBuf>,
    bmap: Option<PathBuf>,
    no_verify: bool,
    checksums: Vec<String>,
    yes: bool,
    abort_slot: Arc<OnceLock<AbortHandle>>,
) -> Result<()> {
    let (target_path, capacity) = resolve_target(target)?;

    let mut image = Image::open(&image_path)
        .await
        .with_context(|| format!("cannot open image {}", image_path.display()))?;
    if let Some(bmap) = &bmap {
        image = image.with_block_map(BlockMap::load(bmap)?);
    }

    let final_size = image.size.final_size;
    if let Some(capacity) = capacity {
        if !final_size.estimation && final_size.value > capacity {
            return Err(anyhow!(
                "Image ({} bytes) does not fit on {} ({} bytes).",
                final_size.value,
                target_path.display(),
                capacity
            ));
        }
    }

    println!(
        "{} This will overwrite data on '{}'.",
        style("WARNING:").red().bold(),
        target_path.display(),
    );
    println!("  Target: {}", style(target_path.display()).cyan());
    println!("  Image:  {}", style(image_path.display()).cyan());
    if let Some(bmap) = &bmap {
        println!("  Bmap:   {}", style(bmap.display()).cyan());
    }
    println!();

    if !yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Write operation cancelled.");
        return Ok(());
    }
    println!();

    let flags = if target_path.exists() {
        OpenFlags::read_write()
    } else {
        OpenFlags::create()
    };
    let options = FlashOptions::new(DescriptorOptions::path(&target_path).flags(flags))
        .verify(!no_verify)
        .checksum_algorithms(checksums);

    let bars = FlashBars::new(!no_verify)?;
    let mut handle = flash::start(image, options)?;
    // Only the first flash of the process registers; there is only one.
    let _ = abort_slot.set(handle.abort_handle());

    let mut write_checksums = ChecksumSet::new();
    while let Some(event) = handle.next_event().await {
        match event {
            FlashEvent::Progress(state) => bars.update(&state),
            FlashEvent::State(FlashState::Verifying) => {
                bars.write.finish_with_message("Write complete.");
            }
            FlashEvent::Checksum { kind, checksums } => {
                debug!(%kind, ?checksums, "checksum");
                if kind == PassKind::Write {
                    write_checksums = checksums;
                }
            }
            FlashEvent::Abort => println!("\nAborting..."),
            other => debug!(?other, "flash event"),
        }
    }

    match handle.wait().await {
        Ok(result) => {
            if no_verify {
                bars.write
                    .finish_with_message("Write complete (verification skipped).");
            } else {
                bars.verify.finish_with_message("Verification successful.");
            }
            println!(
                "\n✨ Successfully flashed {} with {}.",
                style(target_path.display()).cyan(),
                style(image_path.display()).cyan()
            );
            println!(
                "  Read {} bytes, wrote {} bytes.",
                result.bytes_read, result.bytes_written
            );
            print_checksums("Checksum", &write_checksums);
            Ok(())
        }
        Err(e) => {
            bars.fail();
            Err(e.into())
        }
    }
}

fn list_devices() -> Result<()> {
    let devices = blkflash_core::platform::get_removable_devices()?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<12} {:<25} {:<10} {}",
        "DEVICE", "NAME", "SIZE", "LOCATION"
    );
    println!("  {:-<12} {:-<25} {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let location = if device.mount_point.is_empty() {
            "(Not mounted)".to_string()
        } else {
            device.mount_point.clone()
        };
        println!(
            "  {:<12} {:<25} {:>8.1} GB  {}",
            device.path.display(),
            device.name,
            device.size_gb(),
            location
        );
    }
    Ok(())
}

fn image_exists(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(anyhow!("Image {} does not exist.", path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Ctrl+C aborts a running flash; before one starts it simply exits.
    let abort_slot: Arc<OnceLock<AbortHandle>> = Arc::new(OnceLock::new());
    let slot = abort_slot.clone();
    ctrlc::set_handler(move || match slot.get() {
        Some(handle) => handle.abort(),
        None => std::process::exit(130),
    })?;

    match cli.command {
        Commands::Write {
            image,
            target,
            bmap,
            no_verify,
            checksums,
            yes,
        } => {
            image_exists(&image)?;
            write_image(image, target, bmap, no_verify, checksums, yes, abort_slot).await?;
        }
        Commands::List => list_devices()?,
    }

    Ok(())
}
