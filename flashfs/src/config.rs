//! Runtime filesystem geometry.
//!
//! The original implementation bakes `phys_addr`/`phys_size`/`log_page_size`/
//! etc. into a compile-time config table. This crate keeps them as a plain
//! runtime value instead, since a single firmware image may want to mount
//! filesystems of different sizes on different flash parts.

use crate::error::Error;
use nor_flash::NorFlash;

/// Physical and logical geometry of a mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Byte offset of the filesystem's first block within the flash device.
    pub phys_addr: u32,
    /// Total size of the filesystem region, in bytes.
    pub phys_size: u32,
    /// The underlying hardware's erase granularity, in bytes.
    pub phys_erase_block: u32,
    /// Size of a single page (program unit), in bytes.
    pub log_page_size: u32,
    /// Size of a logical block; must be a multiple of `phys_erase_block`.
    pub log_block_size: u32,
}

impl Config {
    /// Validates the configuration and computes derived geometry.
    pub fn validate<F: NorFlash>(&self) -> Result<Geometry, Error<F>> {
        if self.phys_size == 0 || self.phys_erase_block == 0 || self.log_page_size == 0 || self.log_block_size == 0 {
            return Err(Error::InvalidConfig("sizes must be non-zero"));
        }
        if self.log_block_size % self.phys_erase_block != 0 {
            return Err(Error::InvalidConfig(
                "log_block_size must be a multiple of phys_erase_block",
            ));
        }
        if self.phys_size % self.log_block_size != 0 {
            return Err(Error::InvalidConfig(
                "phys_size must be a multiple of log_block_size",
            ));
        }
        if self.log_block_size % self.log_page_size != 0 {
            return Err(Error::InvalidConfig(
                "log_block_size must be a multiple of log_page_size",
            ));
        }

        let block_count = self.phys_size / self.log_block_size;
        let pages_per_block = self.log_block_size / self.log_page_size;

        // One lookup entry (u16) per page in the block.
        let lookup_entry_size = 2u32;
        let lookup_pages = (pages_per_block * lookup_entry_size).div_ceil(self.log_page_size);
        if lookup_pages >= pages_per_block {
            return Err(Error::InvalidConfig(
                "log_page_size too small: no room for data pages after the lookup region",
            ));
        }
        let lookup_max_entries = pages_per_block - lookup_pages;
        if lookup_max_entries == 0 {
            return Err(Error::InvalidConfig("lookup_max_entries must be non-zero"));
        }

        let page_header_size = crate::layout::PAGE_HEADER_SIZE as u32;
        if self.log_page_size <= page_header_size + crate::layout::OBJ_INDEX_HEADER_META_SIZE as u32 {
            return Err(Error::InvalidConfig(
                "log_page_size too small to hold an object-index header",
            ));
        }

        let data_page_size = self.log_page_size - page_header_size;
        let n_hdr = (self.log_page_size - page_header_size - crate::layout::OBJ_INDEX_HEADER_META_SIZE as u32) / 2;
        let n = (self.log_page_size - page_header_size) / 2;

        let max_objects = (self.phys_size / self.log_page_size / 2).max(1);

        Ok(Geometry {
            block_count,
            pages_per_block,
            lookup_pages,
            lookup_max_entries,
            data_page_size,
            n_hdr,
            n,
            max_objects,
        })
    }
}

/// Geometry values derived from a [`Config`]; computed once at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Geometry {
    pub block_count: u32,
    pub pages_per_block: u32,
    pub lookup_pages: u32,
    pub lookup_max_entries: u32,
    pub data_page_size: u32,
    /// Data-span capacity of an object-index header page.
    pub n_hdr: u32,
    /// Data-span capacity of a non-header object-index page.
    pub n: u32,
    pub max_objects: u32,
}

impl Geometry {
    /// Maps a data span index to the object-index page span containing it.
    pub fn objix_span_ix(&self, data_span: u32) -> u32 {
        if data_span < self.n_hdr {
            0
        } else {
            1 + (data_span - self.n_hdr) / self.n
        }
    }

    /// Maps a data span index to its entry offset within its object-index page.
    pub fn objix_entry(&self, data_span: u32) -> u32 {
        if data_span < self.n_hdr {
            data_span
        } else {
            (data_span - self.n_hdr) % self.n
        }
    }
}
