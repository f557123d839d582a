//! The object lookup engine (C2): one visitor-driven scan underlies every
//! search over the device's lookup tables.

use crate::layout::{self, PageHeader};
use crate::{BlockIx, EntryIx, Error, Filesystem, NorFlash, PageIx};

/// The result a visitor returns for each lookup entry it is shown.
///
/// `Continue` resumes the scan; any `Stop` aborts it and is surfaced to the
/// caller, per the design notes' "visitor with continue" pattern.
pub enum VisitorResult<T, F: NorFlash> {
    Continue,
    Stop(Result<T, Error<F>>),
}

impl<F: NorFlash> Filesystem<F> {
    /// Scans lookup entries in physical order starting at `(start_block,
    /// start_entry)`, wrapping around the whole device exactly once, calling
    /// `visitor(self, obj_id, block, entry)` for each entry visited.
    pub fn visit<T>(
        &mut self,
        start_block: BlockIx,
        start_entry: EntryIx,
        mut visitor: impl FnMut(&mut Self, u16, BlockIx, EntryIx) -> VisitorResult<T, F>,
    ) -> Result<T, Error<F>> {
        let lookup_max_entries = self.geom.lookup_max_entries as u16;
        let block_count = self.geom.block_count as u16;
        let total_entries = lookup_max_entries as u64 * block_count as u64;

        let mut block = start_block;
        let mut entry = start_entry;
        for _ in 0..total_entries {
            let id = self.read_lookup_entry(block, entry)?;
            match visitor(self, id, block, entry) {
                VisitorResult::Continue => {}
                VisitorResult::Stop(result) => return result,
            }
            entry += 1;
            if entry >= lookup_max_entries {
                entry = 0;
                block = (block + 1) % block_count;
            }
        }
        Err(Error::NotFound)
    }

    /// Finds the next free lookup entry, updating the free-page cursor and
    /// `free_blocks` (§4.1). Converts `NotFound` to [`Error::Full`].
    pub fn find_free_entry(&mut self) -> Result<(BlockIx, EntryIx), Error<F>> {
        let start_block = self.free_cursor_block;
        let start_entry = self.free_cursor_entry;
        let lookup_max_entries = self.geom.lookup_max_entries as u16;
        let block_count = self.geom.block_count as u16;

        let result = self.visit(start_block, start_entry, |fs, id, block, entry| {
            if id == layout::OBJ_ID_FREE {
                if entry == 0 {
                    fs.free_blocks = fs.free_blocks.saturating_sub(1);
                }
                let mut next_entry = entry + 1;
                let mut next_block = block;
                if next_entry >= lookup_max_entries {
                    next_entry = 0;
                    next_block = (next_block + 1) % block_count;
                }
                fs.free_cursor_block = next_block;
                fs.free_cursor_entry = next_entry;
                VisitorResult::Stop(Ok((block, entry)))
            } else {
                VisitorResult::Continue
            }
        });

        match result {
            Err(Error::NotFound) => Err(Error::Full),
            other => other,
        }
    }

    /// Finds the lookup entry whose value equals `target_id` (an exact id,
    /// caller decides whether it carries the index flag).
    pub fn find_id(&mut self, target_id: u16) -> Result<(BlockIx, EntryIx), Error<F>> {
        self.visit(0, 0, |_fs, id, block, entry| {
            if id == target_id {
                VisitorResult::Stop(Ok((block, entry)))
            } else {
                VisitorResult::Continue
            }
        })
    }

    /// Finds the live page owned by `target_id` whose header's `span_ix`
    /// equals `span_ix`. Unlike [`Self::find_id`], this must read candidate
    /// headers, since the lookup table alone does not carry span.
    pub fn find_id_and_index(&mut self, target_id: u16, span_ix: u16) -> Result<PageIx, Error<F>> {
        self.visit(0, 0, |fs, id, block, entry| {
            if id != target_id {
                return VisitorResult::Continue;
            }
            let pix = fs.make_page_ix(block, entry);
            match fs.read_header(pix) {
                Ok(header) if !header.is_deleted() && header.span_ix == span_ix => {
                    VisitorResult::Stop(Ok(pix))
                }
                Ok(_) => VisitorResult::Continue,
                Err(e) => VisitorResult::Stop(Err(e)),
            }
        })
    }

    /// Walks every lookup entry in physical order exactly once (no
    /// wraparound, no early stop) calling `f(self, id, block, entry)` for
    /// each. Used by the gc candidate scan (C8) and the free-object-id
    /// finder (C9), which must see every entry rather than search for one.
    pub fn scan_all(&mut self, mut f: impl FnMut(&mut Self, u16, BlockIx, EntryIx) -> Result<(), Error<F>>) -> Result<(), Error<F>> {
        let lookup_max_entries = self.geom.lookup_max_entries as u16;
        let block_count = self.geom.block_count as u16;
        for block in 0..block_count {
            for entry in 0..lookup_max_entries {
                let id = self.read_lookup_entry(block, entry)?;
                f(self, id, block, entry)?;
            }
        }
        Ok(())
    }

    /// Finds the live header page (`span_ix == 0`, index id) whose name
    /// matches `name` exactly.
    pub fn find_header_by_name(&mut self, name: &[u8]) -> Result<(PageIx, PageHeader), Error<F>> {
        self.visit(0, 0, |fs, id, block, entry| {
            if !layout::is_index_id(id) || id == layout::OBJ_ID_FREE {
                return VisitorResult::Continue;
            }
            let pix = fs.make_page_ix(block, entry);
            let header = match fs.read_header(pix) {
                Ok(h) => h,
                Err(e) => return VisitorResult::Stop(Err(e)),
            };
            if header.is_deleted() || !header.is_final() || !header.is_index() || header.span_ix != 0 {
                return VisitorResult::Continue;
            }
            let meta_addr = fs.page_ix_addr(pix) + layout::PAGE_HEADER_SIZE as u32;
            let mut meta_buf = [0u8; layout::OBJ_INDEX_HEADER_META_SIZE];
            if let Err(e) = fs.flash.read(meta_addr, &mut meta_buf) {
                return VisitorResult::Stop(Err(e.into()));
            }
            let meta = layout::ObjIndexHeaderMeta::decode(&meta_buf);
            if meta.name_str() == name {
                VisitorResult::Stop(Ok((pix, header)))
            } else {
                VisitorResult::Continue
            }
        })
    }
}
