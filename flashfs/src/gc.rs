//! Garbage collector (C8): block-candidate scoring plus the three-phase
//! cleaner state machine (`MOVE_OBJ_IX` -> `FIND_OBJ_DATA` -> `MOVE_OBJ_DATA`,
//! looping until `FINISHED`).

use alloc::vec::Vec;

use crate::fd::IndexEvent;
use crate::layout::{self, PageHeader};
use crate::{BlockIx, Error, Filesystem, NorFlash};

/// Weight applied per deleted lookup entry when scoring a gc candidate
/// block — deleted entries are free wins, so they raise the score.
const W_DELET: i32 = 10;
/// Weight applied per live (used) lookup entry — live pages must be moved,
/// so they lower the score.
const W_USED: i32 = -1;

impl<F: NorFlash> Filesystem<F> {
    /// Runs the collector if `free_blocks <= 2` (§4.7). A no-op if no
    /// candidate block has any deleted entries to reclaim.
    pub fn gc_check(&mut self) -> Result<(), Error<F>> {
        if self.free_blocks > 2 {
            return Ok(());
        }
        debug!("free_blocks={} <= 2, looking for a gc candidate", self.free_blocks);
        match self.gc_find_candidate()? {
            Some(block) => {
                info!("reclaiming block {}", block);
                self.gc_clean(block)?;
                self.gc_erase_block(block)?;
            }
            None => warn!("gc found no candidate block with any deleted entries"),
        }
        Ok(())
    }

    /// Scores every block by `deleted * W_DELET + used * W_USED` and returns
    /// the highest-scoring block with at least one deleted entry, if any.
    fn gc_find_candidate(&mut self) -> Result<Option<BlockIx>, Error<F>> {
        let capacity = ((self.config.log_page_size as usize).saturating_sub(8) / (2 + 4)).max(1);
        let mut candidates: Vec<(BlockIx, i32)> = Vec::new();

        let block_count = self.geom.block_count as u16;
        let lookup_max_entries = self.geom.lookup_max_entries as u16;

        for block in 0..block_count {
            let mut deleted = 0i32;
            let mut used = 0i32;
            for entry in 0..lookup_max_entries {
                let id = self.read_lookup_entry(block, entry)?;
                if id == layout::OBJ_ID_ERASED {
                    deleted += 1;
                } else if id != layout::OBJ_ID_FREE {
                    used += 1;
                }
            }
            if deleted > 0 {
                let score = deleted * W_DELET + used * W_USED;
                let pos = candidates.iter().position(|&(_, s)| score > s).unwrap_or(candidates.len());
                candidates.insert(pos, (block, score));
                candidates.truncate(capacity);
            }
        }

        Ok(candidates.first().map(|&(b, _)| b))
    }

    /// Evacuates every live page out of `block`.
    fn gc_clean(&mut self, block: BlockIx) -> Result<(), Error<F>> {
        self.gc_move_obj_ix(block)?;
        while let Some(obj_id) = self.gc_find_obj_data(block)? {
            self.gc_move_obj_data(block, obj_id)?;
        }
        Ok(())
    }

    /// `MOVE_OBJ_IX`: relocate every live index page in `block`; delete any
    /// already-dead ones outright.
    fn gc_move_obj_ix(&mut self, block: BlockIx) -> Result<(), Error<F>> {
        let lookup_max_entries = self.geom.lookup_max_entries as u16;
        for entry in 0..lookup_max_entries {
            let id = self.read_lookup_entry(block, entry)?;
            if id == layout::OBJ_ID_FREE || id == layout::OBJ_ID_ERASED || !layout::is_index_id(id) {
                continue;
            }
            let pix = self.make_page_ix(block, entry);
            let header = self.read_header(pix)?;
            if header.is_deleted() {
                self.delete_page(pix)?;
                self.broadcast_event(IndexEvent::Del, layout::data_id(id), header.span_ix as u32, 0, 0);
            } else {
                let new_pix = self.move_page(None, pix, None)?;
                self.broadcast_event(IndexEvent::Upd, layout::data_id(id), header.span_ix as u32, new_pix, 0);
            }
        }
        Ok(())
    }

    /// `FIND_OBJ_DATA`: finds any remaining live data-page id in `block`.
    fn gc_find_obj_data(&mut self, block: BlockIx) -> Result<Option<u16>, Error<F>> {
        let lookup_max_entries = self.geom.lookup_max_entries as u16;
        for entry in 0..lookup_max_entries {
            let id = self.read_lookup_entry(block, entry)?;
            if id == layout::OBJ_ID_FREE || id == layout::OBJ_ID_ERASED || layout::is_index_id(id) {
                continue;
            }
            return Ok(Some(id));
        }
        Ok(None)
    }

    /// `MOVE_OBJ_DATA`: loads the index page covering one span of `data_id`'s
    /// data, moves every page in `block` belonging to that span, patches the
    /// loaded index page in memory, and persists it. Pages of `data_id` in
    /// other index-page spans are left for the next `FIND_OBJ_DATA` round.
    fn gc_move_obj_data(&mut self, block: BlockIx, data_id: u16) -> Result<(), Error<F>> {
        let lookup_max_entries = self.geom.lookup_max_entries as u16;

        let mut target_span = None;
        for entry in 0..lookup_max_entries {
            let id = self.read_lookup_entry(block, entry)?;
            if id != data_id {
                continue;
            }
            let pix = self.make_page_ix(block, entry);
            let header = self.read_header(pix)?;
            if header.is_deleted() {
                continue;
            }
            target_span = Some(self.geom.objix_span_ix(header.span_ix as u32));
            break;
        }
        let target_span = match target_span {
            Some(s) => s,
            None => return Ok(()),
        };

        let hdr_id = layout::index_id(data_id);
        let hdr_pix = self.find_id_and_index(hdr_id, 0)?;

        let index_pix = if target_span == 0 {
            hdr_pix
        } else {
            self.find_id_and_index(hdr_id, target_span as u16)?
        };
        self.validate_objix(index_pix, target_span as u16)?;

        let page_size = self.config.log_page_size as usize;
        let addr = self.page_ix_addr(index_pix);
        self.flash.read(addr, &mut self.work[..page_size])?;

        let entries_off = layout::entries_offset(target_span);

        for entry in 0..lookup_max_entries {
            let id = self.read_lookup_entry(block, entry)?;
            if id != data_id {
                continue;
            }
            let pix = self.make_page_ix(block, entry);
            let header = self.read_header(pix)?;
            if header.is_deleted() {
                continue;
            }
            let data_span = header.span_ix as u32;
            if self.geom.objix_span_ix(data_span) != target_span {
                continue;
            }
            let new_pix = self.move_page(None, pix, None)?;
            let entry_ix = self.geom.objix_entry(data_span) as usize;
            layout::encode_entry(&mut self.work[entries_off..], entry_ix, new_pix);
        }

        if target_span == 0 {
            // `self.work` holds the header, freshly read above and patched
            // with the moved data pages' new pointers.
            let image = self.work.clone();
            self.update_index_hdr(hdr_pix, Some(&image), None, None)?;
        } else {
            let header = PageHeader::decode(&self.work[0..layout::PAGE_HEADER_SIZE]);
            let body = self.work[layout::PAGE_HEADER_SIZE..].to_vec();
            let new_pix = self.move_page(Some(&body), index_pix, Some(header))?;
            self.broadcast_event(IndexEvent::Upd, data_id, target_span, new_pix, 0);
        }

        Ok(())
    }

    /// Erases `block` in `phys_erase_block`-sized chunks across its whole
    /// `log_block_size` span, ignoring per-chunk errors (the block holds no
    /// live data at this point), and increments `free_blocks`.
    fn gc_erase_block(&mut self, block: BlockIx) -> Result<(), Error<F>> {
        let block_addr = self.block_addr(block);
        let erase_unit = self.flash.erase_unit_size();
        let mut off = 0u32;
        while off < self.config.log_block_size {
            let _ = self.flash.erase(block_addr + off, erase_unit);
            off += erase_unit;
        }
        self.free_blocks += 1;
        debug!("erased block {}, free_blocks={}", block, self.free_blocks);
        if self.free_cursor_block == block {
            self.free_cursor_block = (block + 1) % self.geom.block_count as u16;
            self.free_cursor_entry = 0;
        }
        Ok(())
    }
}
