//! The core, UI-agnostic library for the `blkflash` disk imaging utility.
//!
//! `blkflash-core` streams a disk image onto a raw target (a block device or
//! a plain file) and reads it back to verify it. It can be driven by any
//! front-end, whether it's a command-line interface (like `blkflash`) or a
//! graphical one.
//!
//! Data moves through a pipeline of stages running as tokio tasks:
//! - [`source`] and [`reader`]: produce chunks from the image or, when
//!   verifying, from the target.
//! - [`transform`]: the synchronous stage chain, with the concrete stages in
//!   [`aligner`], [`checksum`], [`blockmap`], [`progress`], [`image`] and
//!   [`verify`].
//! - [`writer`]: coalesces contiguous chunks into vectored positional writes.
//! - [`flash`]: the orchestrator wiring them into a write pass and a verify
//!   pass, reporting through [`event::FlashEvent`]s.
//!
//! [`device`] and [`platform`] discover removable block devices.
//!
//! ## Example: Writing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use blkflash_core::{DescriptorOptions, FlashEvent, FlashOptions, Image, flash, progress};
//!
//! # async fn example() -> blkflash_core::Result<()> {
//! let image = Image::open("path/to/image.img.xz").await?;
//! let options = FlashOptions::new(DescriptorOptions::path("/dev/sdX"));
//!
//! let mut handle = flash::start(image, options)?;
//! while let Some(event) = handle.next_event().await {
//!     if let FlashEvent::Progress(state) = event {
//!         println!("{}", progress::status_line(&state));
//!     }
//! }
//! let result = handle.wait().await?;
//! println!("{} bytes written", result.bytes_written);
//! # Ok(())
//! # }
//! ```

pub mod aligner;
pub mod blockmap;
pub mod checksum;
pub mod chunk;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod event;
pub mod flash;
pub mod image;
pub mod options;
mod os_options;
pub mod platform;
pub mod progress;
pub mod reader;
pub mod source;
pub mod transform;
pub mod verify;
pub mod writer;

pub use blockmap::{BlockMap, BlockRange};
pub use chunk::Chunk;
pub use descriptor::{DescriptorOptions, OpenFlags};
pub use error::{FlashError, Result};
pub use event::{FlashEvent, FlashState, PassKind, PassResult};
pub use flash::{AbortHandle, FlashHandle, Flasher};
pub use image::{Image, ImageSize};
pub use options::FlashOptions;
