#![cfg_attr(not(test), no_std)]
extern crate alloc;

//! A wear-leveling, power-fail-safe flash filesystem for raw NOR flash.
//!
//! The on-flash layout is an object lookup table per block plus a chain of
//! object-index pages per file; see the module docs of [`layout`], [`lookup`]
//! and [`index`] for the details. Every public method takes `&mut self`,
//! which is this crate's entire concurrency story: there is no internal
//! mutex, the borrow checker is the exclusion gate, and a caller wanting
//! shared access wraps a [`Filesystem`] in their own lock.

#[macro_use]
mod fmt;

pub mod config;
pub mod error;
pub mod fd;
pub mod free_id;
pub mod gc;
pub mod index;
pub mod layout;
pub mod lookup;
pub mod ops;
pub mod page;

use alloc::vec;
use alloc::vec::Vec;

pub use config::Config;
use config::Geometry;
pub use error::Error;
use error::ErrorKind;
pub use fd::{FileHandle, OpenFlags};
use fd::FileDescriptor;
pub use nor_flash::NorFlash;

/// The persistent index of a page, unique across the whole device.
pub type PageIx = u16;
/// The index of a block (erase unit) within the device.
pub type BlockIx = u16;
/// The index of a lookup entry within a block.
pub type EntryIx = u16;

/// A mounted flash filesystem instance.
///
/// Owns the flash device, the two scratch buffers (`work`, `lu_work`), the
/// open file-descriptor table, and the persistent cursors — exactly the
/// state the design notes call out as living on the filesystem instance,
/// with no hidden global.
pub struct Filesystem<F: NorFlash> {
    pub(crate) flash: F,
    pub(crate) config: Config,
    pub(crate) geom: Geometry,

    /// Scratch buffer holding the index page currently under edit.
    pub(crate) work: Vec<u8>,
    /// Scratch buffer for lookup-region reads and gc candidate tables.
    pub(crate) lu_work: Vec<u8>,

    pub(crate) fds: Vec<Option<FileDescriptor>>,

    pub(crate) free_cursor_block: BlockIx,
    pub(crate) free_cursor_entry: EntryIx,
    pub(crate) cursor_block: BlockIx,
    pub(crate) cursor_entry: EntryIx,
    pub(crate) free_blocks: u32,

    last_error: Option<ErrorKind>,
}

impl<F: NorFlash> Filesystem<F> {
    /// Mounts a filesystem over `flash` using `config`, allocating an
    /// `fd_count`-slot file-descriptor table, and scans the device to
    /// recompute `free_blocks` (I6) — this is the full extent of mount-time
    /// recovery: there is no write-ahead log to replay (§7).
    pub fn mount(config: Config, flash: F, fd_count: usize) -> Result<Self, Error<F>> {
        let geom = config.validate::<F>()?;
        let page_size = config.log_page_size as usize;

        let mut fs = Filesystem {
            flash,
            config,
            geom,
            work: vec![0u8; page_size],
            lu_work: vec![0u8; page_size],
            fds: (0..fd_count).map(|_| None).collect(),
            free_cursor_block: 0,
            free_cursor_entry: 0,
            cursor_block: 0,
            cursor_entry: 0,
            free_blocks: 0,
            last_error: None,
        };

        fs.free_blocks = fs.count_free_blocks()?;
        info!(
            "mounted filesystem: {} blocks, {} free, {} fds",
            fs.geom.block_count, fs.free_blocks, fd_count
        );
        Ok(fs)
    }

    /// The most recent error returned by a public method, if any — mirrors
    /// the original's sticky `SPIFFS_errno()` accessor. Tracked as a kind
    /// rather than the full error, since an arbitrary HAL error need not be
    /// `Clone`.
    pub fn errno(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub(crate) fn record_error<T>(&mut self, result: Result<T, Error<F>>) -> Result<T, Error<F>> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                self.last_error = Some(ErrorKind::from(&e));
                Err(e)
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geom
    }

    /// Number of blocks currently tracked as free (I6/P4).
    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    /// Direct access to the underlying flash device, e.g. to arm a fault
    /// injector mid-test.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Unwraps the mount, handing back the flash device — used to simulate a
    /// power cycle by remounting a fresh `Filesystem` over the same medium.
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Number of blocks whose first lookup entry is `FREE` (I6). Recomputed
    /// fully at mount; maintained incrementally afterwards by `lookup`/`gc`.
    pub(crate) fn count_free_blocks(&mut self) -> Result<u32, Error<F>> {
        let mut count = 0u32;
        for block in 0..self.geom.block_count as u16 {
            let first_entry = self.read_lookup_entry(block, 0)?;
            if first_entry == layout::OBJ_ID_FREE {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Byte address of block `block`.
    pub(crate) fn block_addr(&self, block: BlockIx) -> u32 {
        self.config.phys_addr + block as u32 * self.config.log_block_size
    }

    /// Byte address of the page at local index `local_page` (0-based,
    /// counting the lookup pages themselves) within `block`.
    pub(crate) fn page_addr(&self, block: BlockIx, local_page: u32) -> u32 {
        self.block_addr(block) + local_page * self.config.log_page_size
    }

    /// Byte address of the data/index page that lookup `entry` in `block`
    /// refers to (i.e. skipping the lookup region).
    pub(crate) fn entry_page_addr(&self, block: BlockIx, entry: EntryIx) -> u32 {
        self.page_addr(block, self.geom.lookup_pages + entry as u32)
    }

    /// Reads the lookup entry `(block, entry)`.
    pub(crate) fn read_lookup_entry(&mut self, block: BlockIx, entry: EntryIx) -> Result<u16, Error<F>> {
        let byte_off = entry as u32 * 2;
        let addr = self.block_addr(block) + byte_off;
        let mut buf = [0u8; 2];
        self.flash.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Programs lookup entry `(block, entry)` to `value`.
    pub(crate) fn write_lookup_entry(&mut self, block: BlockIx, entry: EntryIx, value: u16) -> Result<(), Error<F>> {
        let byte_off = entry as u32 * 2;
        let addr = self.block_addr(block) + byte_off;
        self.flash.write(addr, &value.to_le_bytes())?;
        Ok(())
    }

    /// Splits an absolute page index into its owning `(block, entry)` pair.
    pub(crate) fn split_page_ix(&self, pix: PageIx) -> (BlockIx, EntryIx) {
        let pages_per_block = self.geom.pages_per_block;
        let local = pix as u32 % pages_per_block;
        let block = pix as u32 / pages_per_block;
        (block as BlockIx, (local - self.geom.lookup_pages) as EntryIx)
    }

    /// Combines a `(block, entry)` pair into an absolute page index.
    pub(crate) fn make_page_ix(&self, block: BlockIx, entry: EntryIx) -> PageIx {
        (block as u32 * self.geom.pages_per_block + self.geom.lookup_pages + entry as u32) as PageIx
    }

    /// Byte address of the page referred to by an absolute page index.
    pub(crate) fn page_ix_addr(&self, pix: PageIx) -> u32 {
        self.config.phys_addr + pix as u32 * self.config.log_page_size
    }

    /// Reads and decodes the header of the page at `pix`.
    pub(crate) fn read_header(&mut self, pix: PageIx) -> Result<layout::PageHeader, Error<F>> {
        let addr = self.page_ix_addr(pix);
        let mut buf = [0u8; layout::PAGE_HEADER_SIZE];
        self.flash.read(addr, &mut buf)?;
        Ok(layout::PageHeader::decode(&buf))
    }
}
