//! Page allocator (C3) and page mover/deleter (C4).

use crate::layout::{self, PageHeader};
use crate::{Error, Filesystem, NorFlash, PageIx};

/// Bytes moved per read/write chunk when copying a page body without an
/// in-memory payload, matching `SPIFFS_COPY_BUFFER_STACK` in the original.
const COPY_BUFFER_STACK: usize = 64;

impl<F: NorFlash> Filesystem<F> {
    /// Allocates a fresh page: finds a free lookup slot, programs the lookup
    /// entry, writes the header, optionally writes `body` at `offset` bytes
    /// into the page content, and optionally finalizes it (§4.2).
    ///
    /// Each step is a raw flash program; a failure midway leaves a
    /// discoverable half-written page (`FINAL=1`, harmless — garbage
    /// collection tidies it up later). No rollback is attempted.
    pub fn allocate_page(
        &mut self,
        mut header: PageHeader,
        body: Option<&[u8]>,
        offset: u32,
        finalize: bool,
    ) -> Result<PageIx, Error<F>> {
        let (block, entry) = self.find_free_entry()?;
        let pix = self.make_page_ix(block, entry);

        self.write_lookup_entry(block, entry, header.obj_id)?;

        let page_addr = self.page_ix_addr(pix);
        self.flash.write(page_addr, &header.encode())?;

        if let Some(body) = body {
            let body_addr = page_addr + layout::PAGE_HEADER_SIZE as u32 + offset;
            self.flash.write(body_addr, body)?;
        }

        if finalize && !header.is_final() {
            header.clear_final();
            self.flash.write(page_addr + 4, &[header.flags])?;
        }

        Ok(pix)
    }

    /// Relocates the live page at `src` to a fresh slot and tombstones the
    /// source (§4.3). If `header_override` is given it is used (with `FINAL`
    /// forced set for the two-phase write) instead of re-reading `src`'s
    /// header — lets callers supply an edited in-memory page image.
    ///
    /// After this returns, exactly one live page exists for the object/span:
    /// a crash before the destination lookup entry is programmed leaves the
    /// destination unreferenced (harmless); a crash after that but before
    /// `FINAL` is cleared leaves a `FINAL=1` destination, which readers
    /// ignore, with the source still live.
    pub fn move_page(
        &mut self,
        payload: Option<&[u8]>,
        src: PageIx,
        header_override: Option<PageHeader>,
    ) -> Result<PageIx, Error<F>> {
        let (block, entry) = self.find_free_entry()?;
        let dst = self.make_page_ix(block, entry);

        let mut header = match header_override {
            Some(h) => h,
            None => self.read_header(src)?,
        };
        header.flags |= layout::flag_bit::FINAL;

        let dst_addr = self.page_ix_addr(dst);
        self.flash.write(dst_addr, &header.encode())?;

        let body_len = self.config.log_page_size - layout::PAGE_HEADER_SIZE as u32;
        match payload {
            Some(body) => {
                self.flash.write(dst_addr + layout::PAGE_HEADER_SIZE as u32, body)?;
            }
            None => {
                let src_addr = self.page_ix_addr(src) + layout::PAGE_HEADER_SIZE as u32;
                self.copy_bytes(src_addr, dst_addr + layout::PAGE_HEADER_SIZE as u32, body_len)?;
            }
        }

        self.write_lookup_entry(block, entry, header.obj_id)?;

        header.clear_final();
        self.flash.write(dst_addr + 4, &[header.flags])?;

        self.delete_page(src)?;

        Ok(dst)
    }

    /// Tombstones the page at `pix`: the lookup entry becomes `ERASED` and
    /// the header's `DELET` bit is cleared (§4.3).
    pub fn delete_page(&mut self, pix: PageIx) -> Result<(), Error<F>> {
        let (block, entry) = self.split_page_ix(pix);
        self.write_lookup_entry(block, entry, layout::OBJ_ID_ERASED)?;

        let mut header = self.read_header(pix)?;
        header.clear_delet();
        self.flash.write(self.page_ix_addr(pix) + 4, &[header.flags])?;
        Ok(())
    }

    /// Copies `len` bytes from `src_addr` to `dst_addr` through a small stack
    /// buffer, `COPY_BUFFER_STACK` bytes at a time (§4.3's `phys_cpy`). Used
    /// both for relocating a whole page body and, by the modify/truncate
    /// operations, for carrying over the unmodified prefix/suffix of a data
    /// page into its replacement.
    pub(crate) fn copy_bytes(&mut self, src_addr: u32, dst_addr: u32, len: u32) -> Result<(), Error<F>> {
        let mut buf = [0u8; COPY_BUFFER_STACK];
        let mut off = 0u32;
        while off < len {
            let chunk = (len - off).min(COPY_BUFFER_STACK as u32) as usize;
            self.flash.read(src_addr + off, &mut buf[..chunk])?;
            self.flash.write(dst_addr + off, &buf[..chunk])?;
            off += chunk as u32;
        }
        Ok(())
    }
}
