//! Append / modify / truncate / read (C6): the four file-content operations,
//! plus the debug object listing supplemented from the original's
//! `spiffs_test_list_objects` (§4.9).
//!
//! All four content operations share one shape: walk data-span indices from
//! a starting span, and whenever the enclosing object-index-page span
//! changes, persist the previous in-memory index page and load or allocate
//! the next one into `self.work`. What differs is what happens to one data
//! page's worth of content per iteration.

use crate::fd::{FileHandle, IndexEvent};
use crate::layout::{self, PageHeader};
use crate::{Error, Filesystem, NorFlash};

impl<F: NorFlash> Filesystem<F> {
    /// Overwrites the `size` field of the object-index header page currently
    /// held in `self.work`, in memory only — callers persist it afterwards.
    fn set_work_size(&mut self, size: u32) {
        let off = layout::PAGE_HEADER_SIZE + 1;
        self.work[off..off + 4].copy_from_slice(&size.to_le_bytes());
    }

    /// Appends `data` at the object's current end-of-file (§4.5 Append).
    ///
    /// On entering a new index-page span, the previous one (if any work was
    /// done) is persisted: the header is rewritten in place when the object
    /// was empty, otherwise relocated via [`Self::update_index_hdr`]; a
    /// non-header index page is written to flash in place (legal — it was
    /// filled in memory and never yet persisted) and the header's size
    /// updated to match. Landing on a span boundary with nothing pending
    /// always allocates fresh rather than reusing work-buffer content from
    /// the previous span (the resolved "allocate-new" open question, §9).
    pub fn append(&mut self, handle: FileHandle, data: &[u8]) -> Result<(), Error<F>> {
        let result = self.append_impl(handle, data);
        self.record_error(result)
    }

    fn append_impl(&mut self, handle: FileHandle, data: &[u8]) -> Result<(), Error<F>> {
        if data.is_empty() {
            return Ok(());
        }

        self.gc_check()?;

        let fd = *self.fd(handle)?;
        let obj_id = fd.obj_id;
        let offset = fd.size;
        let len = data.len() as u32;
        let mut written = 0u32;

        let data_page_size = self.geom.data_page_size;
        let mut data_spix = offset / data_page_size;
        let mut page_offs = offset % data_page_size;

        let mut cur_objix_spix = 0u32;
        let mut prev_objix_spix: Option<u32> = None;
        let mut cur_objix_pix = fd.hdr_pix;

        while written < len {
            cur_objix_spix = self.geom.objix_span_ix(data_spix);

            if prev_objix_spix != Some(cur_objix_spix) {
                if written > 0 {
                    if prev_objix_spix == Some(0) {
                        self.set_work_size(offset + written);
                        if offset == 0 {
                            let addr = self.page_ix_addr(cur_objix_pix);
                            self.flash.write(addr, &self.work)?;
                        } else {
                            // `self.work` already holds the header with this
                            // pass's new data-page entries folded in; reuse
                            // it rather than re-reading the stale on-flash copy.
                            let image = self.work.clone();
                            cur_objix_pix = self.update_index_hdr(fd.hdr_pix, Some(&image), None, Some(offset + written))?;
                        }
                    } else {
                        let addr = self.page_ix_addr(cur_objix_pix);
                        self.flash.write(addr, &self.work)?;
                        let header = PageHeader::decode(&self.work[..layout::PAGE_HEADER_SIZE]);
                        self.broadcast_event(IndexEvent::Upd, layout::data_id(header.obj_id), header.span_ix as u32, cur_objix_pix, 0);
                        // `self.work` holds the non-header span just
                        // persisted above, not the header — let
                        // `update_index_hdr` re-read the header fresh.
                        self.update_index_hdr(fd.hdr_pix, None, None, Some(offset + written))?;
                    }
                }

                if cur_objix_spix == 0 {
                    let addr = self.page_ix_addr(cur_objix_pix);
                    self.flash.read(addr, &mut self.work)?;
                    self.validate_objix(cur_objix_pix, 0)?;
                } else if self.geom.objix_entry(data_spix) == 0 {
                    // Landing on this non-header span's first entry means its
                    // index page has never been created, whether this is the
                    // call's first iteration (append starting exactly on a
                    // fresh span boundary, §9's resolved open question) or a
                    // span crossed mid-call — always allocate fresh.
                    let mut header = PageHeader::new(layout::index_id(obj_id), cur_objix_spix as u16);
                    header.set_index();
                    header.clear_final();
                    let new_pix = self.allocate_page(header, None, 0, true)?;
                    self.broadcast_event(IndexEvent::New, obj_id, cur_objix_spix, new_pix, 0);
                    self.work.fill(0xFF);
                    self.work[..layout::PAGE_HEADER_SIZE].copy_from_slice(&header.encode());
                    cur_objix_pix = new_pix;
                } else {
                    let pix = if fd.cursor_index_span == cur_objix_spix {
                        fd.cursor_index_pix
                    } else {
                        self.find_id_and_index(layout::index_id(obj_id), cur_objix_spix as u16)?
                    };
                    let addr = self.page_ix_addr(pix);
                    self.flash.read(addr, &mut self.work)?;
                    self.validate_objix(pix, cur_objix_spix as u16)?;
                    cur_objix_pix = pix;
                }

                prev_objix_spix = Some(cur_objix_spix);
            }

            let to_write = (len - written).min(data_page_size - page_offs);
            let entries_off = layout::entries_offset(cur_objix_spix);
            let entry_ix = self.geom.objix_entry(data_spix) as usize;

            let data_pix = if page_offs == 0 {
                let header = PageHeader::new(layout::data_id(obj_id), data_spix as u16);
                self.allocate_page(header, Some(&data[written as usize..(written + to_write) as usize]), page_offs, true)?
            } else {
                let pix = layout::decode_entry(&self.work[entries_off..], entry_ix);
                let addr = self.page_ix_addr(pix) + layout::PAGE_HEADER_SIZE as u32 + page_offs;
                self.flash.write(addr, &data[written as usize..(written + to_write) as usize])?;
                pix
            };

            layout::encode_entry(&mut self.work[entries_off..], entry_ix, data_pix);
            if cur_objix_spix == 0 {
                self.set_work_size(offset + written + to_write);
            }

            page_offs = 0;
            data_spix += 1;
            written += to_write;
        }

        let new_hdr_pix;
        if cur_objix_spix != 0 {
            let addr = self.page_ix_addr(cur_objix_pix);
            self.flash.write(addr, &self.work)?;
            let header = PageHeader::decode(&self.work[..layout::PAGE_HEADER_SIZE]);
            self.broadcast_event(IndexEvent::Upd, layout::data_id(header.obj_id), header.span_ix as u32, cur_objix_pix, 0);
            // `self.work` holds the non-header span just written above.
            new_hdr_pix = self.update_index_hdr(fd.hdr_pix, None, None, Some(offset + written))?;
        } else if offset == 0 {
            self.set_work_size(offset + written);
            let addr = self.page_ix_addr(cur_objix_pix);
            self.flash.write(addr, &self.work)?;
            new_hdr_pix = cur_objix_pix;
        } else {
            // The whole append stayed within the header's own span;
            // `self.work` still holds it with this call's new entries.
            let image = self.work.clone();
            new_hdr_pix = self.update_index_hdr(fd.hdr_pix, Some(&image), None, Some(offset + written))?;
        }

        let fd = self.fd_mut(handle)?;
        fd.size = offset + written;
        fd.offset = offset + written;
        fd.hdr_pix = new_hdr_pix;
        fd.cursor_index_pix = cur_objix_pix;
        fd.cursor_index_span = cur_objix_spix;

        Ok(())
    }

    /// Overwrites `data.len()` bytes starting at `offset` (§4.5 Modify).
    ///
    /// A write that exactly covers a whole data page allocates a fresh page
    /// directly; otherwise a fresh page is allocated empty, the unchanged
    /// prefix and suffix are physically copied from the original, the new
    /// bytes written, the page finalized, and the original deleted. Altered
    /// index pages persist via [`Self::move_page`] on span transition
    /// (not `update_index_hdr`), except the header, which always goes
    /// through `update_index_hdr`.
    pub fn modify(&mut self, handle: FileHandle, offset: u32, data: &[u8]) -> Result<(), Error<F>> {
        let result = self.modify_impl(handle, offset, data);
        self.record_error(result)
    }

    fn modify_impl(&mut self, handle: FileHandle, offset: u32, data: &[u8]) -> Result<(), Error<F>> {
        if data.is_empty() {
            return Ok(());
        }

        self.gc_check()?;

        let fd = *self.fd(handle)?;
        let obj_id = fd.obj_id;
        let len = data.len() as u32;
        let mut written = 0u32;

        let data_page_size = self.geom.data_page_size;
        let mut data_spix = offset / data_page_size;
        let mut page_offs = offset % data_page_size;

        let mut cur_objix_spix = 0u32;
        let mut prev_objix_spix: Option<u32> = None;
        let mut cur_objix_pix = fd.hdr_pix;

        while written < len {
            cur_objix_spix = self.geom.objix_span_ix(data_spix);

            if prev_objix_spix != Some(cur_objix_spix) {
                if written > 0 {
                    if prev_objix_spix == Some(0) {
                        // `self.work` holds the header with this pass's
                        // updated data-page entries already folded in.
                        let image = self.work.clone();
                        self.update_index_hdr(fd.hdr_pix, Some(&image), None, None)?;
                    } else {
                        let header = PageHeader::decode(&self.work[..layout::PAGE_HEADER_SIZE]);
                        let body = self.work[layout::PAGE_HEADER_SIZE..].to_vec();
                        let new_pix = self.move_page(Some(&body), cur_objix_pix, Some(header))?;
                        self.broadcast_event(IndexEvent::Upd, layout::data_id(header.obj_id), header.span_ix as u32, new_pix, 0);
                        cur_objix_pix = new_pix;
                    }
                }

                if cur_objix_spix == 0 {
                    let addr = self.page_ix_addr(cur_objix_pix);
                    self.flash.read(addr, &mut self.work)?;
                    self.validate_objix(cur_objix_pix, 0)?;
                } else {
                    let pix = if fd.cursor_index_span == cur_objix_spix {
                        fd.cursor_index_pix
                    } else {
                        self.find_id_and_index(layout::index_id(obj_id), cur_objix_spix as u16)?
                    };
                    let addr = self.page_ix_addr(pix);
                    self.flash.read(addr, &mut self.work)?;
                    self.validate_objix(pix, cur_objix_spix as u16)?;
                    cur_objix_pix = pix;
                }

                prev_objix_spix = Some(cur_objix_spix);
            }

            let to_write = (len - written).min(data_page_size - page_offs);
            let entries_off = layout::entries_offset(cur_objix_spix);
            let entry_ix = self.geom.objix_entry(data_spix) as usize;
            let orig_data_pix = layout::decode_entry(&self.work[entries_off..], entry_ix);

            let header = PageHeader::new(layout::data_id(obj_id), data_spix as u16);
            let new_data_pix = if page_offs == 0 && to_write == data_page_size {
                self.allocate_page(header, Some(&data[written as usize..(written + to_write) as usize]), 0, true)?
            } else {
                let pix = self.allocate_page(header, None, 0, false)?;
                let dst_addr = self.page_ix_addr(pix) + layout::PAGE_HEADER_SIZE as u32;
                let src_addr = self.page_ix_addr(orig_data_pix) + layout::PAGE_HEADER_SIZE as u32;
                if page_offs > 0 {
                    self.copy_bytes(src_addr, dst_addr, page_offs)?;
                }
                if page_offs + to_write < data_page_size {
                    let tail_off = page_offs + to_write;
                    self.copy_bytes(src_addr + tail_off, dst_addr + tail_off, data_page_size - tail_off)?;
                }
                self.flash.write(dst_addr + page_offs, &data[written as usize..(written + to_write) as usize])?;
                let mut h = header;
                h.clear_final();
                self.flash.write(self.page_ix_addr(pix) + 4, &[h.flags])?;
                pix
            };

            self.delete_page(orig_data_pix)?;
            layout::encode_entry(&mut self.work[entries_off..], entry_ix, new_data_pix);

            page_offs = 0;
            data_spix += 1;
            written += to_write;
        }

        if cur_objix_spix != 0 {
            let header = PageHeader::decode(&self.work[..layout::PAGE_HEADER_SIZE]);
            let body = self.work[layout::PAGE_HEADER_SIZE..].to_vec();
            let new_pix = self.move_page(Some(&body), cur_objix_pix, Some(header))?;
            self.broadcast_event(IndexEvent::Upd, layout::data_id(header.obj_id), header.span_ix as u32, new_pix, 0);
            cur_objix_pix = new_pix;
        } else {
            let image = self.work.clone();
            cur_objix_pix = self.update_index_hdr(fd.hdr_pix, Some(&image), None, None)?;
        }

        let fd = self.fd_mut(handle)?;
        fd.offset = offset + written;
        fd.hdr_pix = if cur_objix_spix == 0 { cur_objix_pix } else { fd.hdr_pix };
        fd.cursor_index_pix = cur_objix_pix;
        fd.cursor_index_span = cur_objix_spix;

        Ok(())
    }

    /// Shrinks the object to `new_size`, optionally removing it entirely
    /// when it reaches zero (§4.5 Truncate).
    ///
    /// Walks spans downward from the current last one, deleting data pages
    /// and (once a span is fully vacated) the index page that covered them.
    /// The span counter is decremented unconditionally once per iteration,
    /// preserved exactly from the original rather than special-cased for a
    /// page-aligned `cur_size` (the resolved "unconditional decrement" open
    /// question, §9) — this cannot underflow because the full-page-delete
    /// branch that reaches it is only taken while at least one more page
    /// remains beyond `new_size`, and the partial-tail branch always breaks
    /// out of the loop before the decrement would be needed again.
    pub fn truncate(&mut self, handle: FileHandle, new_size: u32, remove: bool) -> Result<(), Error<F>> {
        let result = self.truncate_impl(handle, new_size, remove);
        self.record_error(result)
    }

    fn truncate_impl(&mut self, handle: FileHandle, new_size: u32, remove: bool) -> Result<(), Error<F>> {
        self.gc_check()?;

        let fd = *self.fd(handle)?;
        let obj_id = fd.obj_id;

        if fd.size <= new_size {
            if remove && new_size == 0 && fd.size == 0 {
                let addr = self.page_ix_addr(fd.hdr_pix);
                self.flash.read(addr, &mut self.work)?;
                let header = self.validate_objix(fd.hdr_pix, 0)?;
                self.delete_page(fd.hdr_pix)?;
                self.broadcast_event(IndexEvent::Del, layout::data_id(header.obj_id), 0, fd.hdr_pix, 0);
            } else {
                let fd = self.fd_mut(handle)?;
                fd.offset = fd.offset.min(new_size);
            }
            return Ok(());
        }

        let mut cur_size = fd.size;
        let mut data_spix = cur_size / self.geom.data_page_size;
        let mut cur_objix_spix = 0u32;
        let mut prev_objix_spix: Option<u32> = None;
        let mut objix_pix = fd.hdr_pix;

        let data_page_size = self.geom.data_page_size;

        while cur_size > new_size {
            cur_objix_spix = self.geom.objix_span_ix(data_spix);

            if prev_objix_spix != Some(cur_objix_spix) {
                if let Some(prev) = prev_objix_spix {
                    let header = PageHeader::decode(&self.work[..layout::PAGE_HEADER_SIZE]);
                    self.delete_page(objix_pix)?;
                    self.broadcast_event(IndexEvent::Del, layout::data_id(header.obj_id), header.span_ix as u32, objix_pix, 0);
                    if prev > 0 {
                        // `self.work` holds the non-header span just
                        // deleted above, not the header.
                        self.update_index_hdr(fd.hdr_pix, None, None, Some(cur_size))?;
                    }
                }

                objix_pix = if cur_objix_spix == 0 {
                    fd.hdr_pix
                } else {
                    self.find_id_and_index(layout::index_id(obj_id), cur_objix_spix as u16)?
                };
                let addr = self.page_ix_addr(objix_pix);
                self.flash.read(addr, &mut self.work)?;
                self.validate_objix(objix_pix, cur_objix_spix as u16)?;

                prev_objix_spix = Some(cur_objix_spix);
            }

            let entries_off = layout::entries_offset(cur_objix_spix);
            let entry_ix = self.geom.objix_entry(data_spix) as usize;
            let data_pix = layout::decode_entry(&self.work[entries_off..], entry_ix);
            layout::encode_entry(&mut self.work[entries_off..], entry_ix, layout::OBJ_ID_FREE);

            if cur_size.saturating_sub(data_page_size) >= new_size {
                self.delete_page(data_pix)?;
                cur_size -= if cur_size % data_page_size == 0 { data_page_size } else { cur_size % data_page_size };
            } else {
                let bytes_to_remove = data_page_size - (new_size % data_page_size);
                let keep = data_page_size - bytes_to_remove;

                let header = PageHeader::new(layout::data_id(obj_id), data_spix as u16);
                let new_data_pix = self.allocate_page(header, None, 0, false)?;
                let src_addr = self.page_ix_addr(data_pix) + layout::PAGE_HEADER_SIZE as u32;
                let dst_addr = self.page_ix_addr(new_data_pix) + layout::PAGE_HEADER_SIZE as u32;
                self.copy_bytes(src_addr, dst_addr, keep)?;
                self.delete_page(data_pix)?;

                let mut h = header;
                h.clear_final();
                self.flash.write(self.page_ix_addr(new_data_pix) + 4, &[h.flags])?;

                layout::encode_entry(&mut self.work[entries_off..], entry_ix, new_data_pix);
                cur_size = new_size;
                data_spix = data_spix.wrapping_sub(1);
                break;
            }

            data_spix = data_spix.wrapping_sub(1);
        }

        if cur_objix_spix == 0 {
            if cur_size == 0 {
                if remove {
                    let header = PageHeader::decode(&self.work[..layout::PAGE_HEADER_SIZE]);
                    self.delete_page(objix_pix)?;
                    self.broadcast_event(IndexEvent::Del, layout::data_id(header.obj_id), header.span_ix as u32, objix_pix, 0);
                } else {
                    let meta_end = layout::entries_offset(0);
                    self.work[meta_end..].fill(0xFF);
                    self.set_work_size(layout::UNDEFINED_LEN);
                    let image = self.work.clone();
                    self.update_index_hdr(objix_pix, Some(&image), None, Some(layout::UNDEFINED_LEN))?;
                }
            } else {
                let image = self.work.clone();
                self.update_index_hdr(objix_pix, Some(&image), None, Some(cur_size))?;
            }
        } else {
            let header = PageHeader::decode(&self.work[..layout::PAGE_HEADER_SIZE]);
            let body = self.work[layout::PAGE_HEADER_SIZE..].to_vec();
            let new_objix_pix = self.move_page(Some(&body), objix_pix, Some(header))?;
            self.broadcast_event(IndexEvent::Upd, layout::data_id(header.obj_id), header.span_ix as u32, new_objix_pix, 0);
            // `self.work` still holds the non-header span just moved above.
            self.update_index_hdr(fd.hdr_pix, None, None, Some(cur_size))?;
        }

        let fd = self.fd_mut(handle)?;
        fd.size = cur_size;
        fd.offset = cur_size;

        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `offset` (§4.5 Read).
    ///
    /// Per data page, reads `min(bytes_left_in_page, bytes_left_in_file)`;
    /// once that computed length hits zero before `buf` is filled, the read
    /// has run past the object's end.
    pub fn read(&mut self, handle: FileHandle, offset: u32, buf: &mut [u8]) -> Result<(), Error<F>> {
        let result = self.read_impl(handle, offset, buf);
        self.record_error(result)
    }

    fn read_impl(&mut self, handle: FileHandle, offset: u32, buf: &mut [u8]) -> Result<(), Error<F>> {
        let fd = *self.fd(handle)?;
        let len = buf.len() as u32;
        if len == 0 {
            return Ok(());
        }

        let data_page_size = self.geom.data_page_size;
        let mut data_spix = offset / data_page_size;
        let mut cur_offset = offset;
        let mut prev_objix_spix: Option<u32> = None;
        let mut written = 0usize;

        while cur_offset < offset + len {
            let cur_objix_spix = self.geom.objix_span_ix(data_spix);

            if prev_objix_spix != Some(cur_objix_spix) {
                let objix_pix = if cur_objix_spix == 0 {
                    fd.hdr_pix
                } else {
                    self.find_id_and_index(layout::index_id(fd.obj_id), cur_objix_spix as u16)?
                };
                let addr = self.page_ix_addr(objix_pix);
                self.flash.read(addr, &mut self.work)?;
                self.validate_objix(objix_pix, cur_objix_spix as u16)?;
                prev_objix_spix = Some(cur_objix_spix);
            }

            let entries_off = layout::entries_offset(cur_objix_spix);
            let entry_ix = self.geom.objix_entry(data_spix) as usize;
            let data_pix = layout::decode_entry(&self.work[entries_off..], entry_ix);

            let mut len_to_read = offset + len - cur_offset;
            len_to_read = len_to_read.min(data_page_size - cur_offset % data_page_size);
            len_to_read = len_to_read.min(fd.size.saturating_sub(cur_offset));
            if len_to_read == 0 {
                return Err(Error::EndOfObject);
            }

            let addr = self.page_ix_addr(data_pix) + layout::PAGE_HEADER_SIZE as u32 + (cur_offset % data_page_size);
            self.flash.read(addr, &mut buf[written..written + len_to_read as usize])?;

            written += len_to_read as usize;
            cur_offset += len_to_read;
            data_spix += 1;
        }

        self.fd_mut(handle)?.offset = cur_offset;
        Ok(())
    }

    /// Walks every live object-index header page and invokes `visitor` with
    /// `(obj_id, obj_type, size, name)` for each (§4.9). Grounded on the
    /// original's `spiffs_test_list_objects` debug helper — useful ambient
    /// tooling named but not described by the distilled public-operations
    /// list.
    pub fn list_objects(&mut self, visitor: impl FnMut(u16, u8, u32, &[u8])) -> Result<(), Error<F>> {
        let result = self.list_objects_impl(visitor);
        self.record_error(result)
    }

    fn list_objects_impl(&mut self, mut visitor: impl FnMut(u16, u8, u32, &[u8])) -> Result<(), Error<F>> {
        let block_count = self.geom.block_count as u16;
        let lookup_max_entries = self.geom.lookup_max_entries as u16;

        for block in 0..block_count {
            for entry in 0..lookup_max_entries {
                let id = self.read_lookup_entry(block, entry)?;
                if id == layout::OBJ_ID_FREE || id == layout::OBJ_ID_ERASED || !layout::is_index_id(id) {
                    continue;
                }
                let pix = self.make_page_ix(block, entry);
                let header = self.read_header(pix)?;
                if header.is_deleted() || !header.is_final() || !header.is_index() || header.span_ix != 0 {
                    continue;
                }
                let meta_addr = self.page_ix_addr(pix) + layout::PAGE_HEADER_SIZE as u32;
                let mut meta_buf = [0u8; layout::OBJ_INDEX_HEADER_META_SIZE];
                self.flash.read(meta_addr, &mut meta_buf)?;
                let meta = layout::ObjIndexHeaderMeta::decode(&meta_buf);
                let size = if meta.size == layout::UNDEFINED_LEN { 0 } else { meta.size };
                visitor(layout::data_id(id), meta.obj_type, size, meta.name_str());
            }
        }
        Ok(())
    }
}

