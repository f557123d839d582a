#![cfg_attr(not(test), no_std)]

//! Minimal raw-flash gateway trait.
//!
//! This crate plays the same role as a block device driver: it knows
//! nothing about object lookup tables, page headers, or wear leveling. It
//! only gives a caller three operations — read, write, erase — over a flat
//! byte address space, plus the physical erase granularity. Everything
//! about logical block/page sizing is a decision made above this layer.

#[macro_use]
mod fmt;


/// Converts a flash-specific error into one of a small set of generic kinds.
pub trait NorFlashError {
    fn kind(&self) -> NorFlashErrorKind;
}

/// A trait for types that can report a shared error type, mirroring the
/// split used throughout embedded-hal: implementors of [`NorFlash`] name
/// their error type here so that generic code can bound on it once.
pub trait ErrorType {
    type Error: NorFlashError;
}

/// Generic error kinds a [`NorFlash`] implementation can be in.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[non_exhaustive]
pub enum NorFlashErrorKind {
    /// The arguments are not properly aligned for the operation.
    NotAligned,
    /// The arguments are out of bounds of the device's capacity.
    OutOfBounds,
    /// Implementation-specific error.
    Other,
}

/// Raw NOR flash gateway: read, write, erase over a flat physical address
/// space. Write may only flip bits 1->0; erase resets a region to all 1s.
pub trait NorFlash: ErrorType {
    /// Total addressable capacity of the device, in bytes.
    fn capacity(&self) -> u32;

    /// The minimum erase granularity of the underlying hardware, in bytes.
    /// A filesystem's logical block size must be a multiple of this.
    fn erase_unit_size(&self) -> u32;

    /// Fill `dst` with `dst.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u32, dst: &mut [u8]) -> Result<(), Self::Error>;

    /// Program `src.len()` bytes at `addr`. May only clear bits (1 -> 0).
    /// Implementations are not required to check alignment; callers must
    /// respect page boundaries for bulk page writes.
    fn write(&mut self, addr: u32, src: &[u8]) -> Result<(), Self::Error>;

    /// Erase exactly one erase unit (`erase_unit_size()` bytes) at `addr`,
    /// setting every byte in the range back to `0xFF`.
    fn erase(&mut self, addr: u32, len: u32) -> Result<(), Self::Error>;
}

/// Returns whether a read/write touching `[addr, addr+len)` stays within
/// the device's capacity. Implementations can use this as a building block
/// for their own bounds checks.
pub fn check_bounds<T: NorFlash>(flash: &T, addr: u32, len: usize) -> Result<(), NorFlashErrorKind> {
    if len as u32 > flash.capacity() || addr > flash.capacity() - len as u32 {
        return Err(NorFlashErrorKind::OutOfBounds);
    }
    Ok(())
}
