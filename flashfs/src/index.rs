//! Object index engine (C5): create/update/walk the header + index-page
//! chain that describes an object's data.

use crate::fd::{FileHandle, IndexEvent, OpenFlags};
use crate::layout::{self, ObjIndexHeaderMeta, PageHeader};
use crate::{Error, Filesystem, NorFlash, PageIx};

impl<F: NorFlash> Filesystem<F> {
    /// Validates an index page read against `VALIDATE_OBJIX` (§4.4): alive,
    /// finalized, is an index page, and at the expected span.
    pub fn validate_objix(&mut self, pix: PageIx, expected_span: u16) -> Result<PageHeader, Error<F>> {
        let header = self.read_header(pix)?;
        if header.is_deleted() {
            return Err(Error::Deleted);
        }
        if header.is_final() {
            return Err(Error::NotFinalized);
        }
        if !header.is_index() {
            return Err(Error::NotIndex);
        }
        if header.span_ix != expected_span {
            return Err(Error::IndexSpanMismatch {
                expected: expected_span,
                found: header.span_ix,
            });
        }
        Ok(header)
    }

    /// Creates a new object: allocates an id (C9), runs a gc check (C8),
    /// and writes a header page whose data-page array is left all-1s and
    /// whose size is `UNDEFINED_LEN` (§4.4).
    pub fn create(&mut self, name: &[u8], obj_type: u8) -> Result<(u16, PageIx), Error<F>> {
        self.gc_check()?;

        let data_id = self.find_free_obj_id()?;
        let hdr_id = layout::index_id(data_id);

        let mut header = PageHeader::new(hdr_id, 0);
        header.set_index();

        let meta = ObjIndexHeaderMeta::new(obj_type, name);
        let hdr_pix = self.allocate_page(header, Some(&meta.encode()), 0, true)?;
        debug!("created object {} at page {}", data_id, hdr_pix);

        self.broadcast_event(IndexEvent::New, data_id, 0, hdr_pix, 0);

        Ok((data_id, hdr_pix))
    }

    /// Relocates the header page at `old_hdr_pix`, applying the optional
    /// `name`/`size` overrides, and broadcasts the move to any open
    /// descriptors (§4.4).
    ///
    /// `header_image`, when given, is the in-memory header-page image the
    /// caller already has staged in `self.work` (e.g. with newly-appended
    /// data-page entries not yet on flash) — used as-is rather than re-read.
    /// When `None`, the header page is read fresh from flash into
    /// `self.work` first: this is the common case when `self.work` is
    /// currently occupied by a different index page (a just-persisted
    /// non-header span), so it must not be trusted to already hold the
    /// header's bytes.
    pub fn update_index_hdr(
        &mut self,
        old_hdr_pix: PageIx,
        header_image: Option<&[u8]>,
        name: Option<&[u8]>,
        size: Option<u32>,
    ) -> Result<PageIx, Error<F>> {
        match header_image {
            Some(image) => self.work[..image.len()].copy_from_slice(image),
            None => {
                let addr = self.page_ix_addr(old_hdr_pix);
                self.flash.read(addr, &mut self.work)?;
            }
        }
        self.validate_objix(old_hdr_pix, 0)?;

        let meta_start = layout::PAGE_HEADER_SIZE;
        let meta_end = meta_start + layout::OBJ_INDEX_HEADER_META_SIZE;
        let mut meta = ObjIndexHeaderMeta::decode(&self.work[meta_start..meta_end]);

        if let Some(name) = name {
            let n = name.len().min(layout::NAME_LEN);
            let mut buf = [0xFFu8; layout::NAME_LEN];
            buf[..n].copy_from_slice(&name[..n]);
            meta.name = buf;
        }
        if let Some(size) = size {
            meta.size = size;
        }
        self.work[meta_start..meta_end].copy_from_slice(&meta.encode());

        let header = PageHeader::decode(&self.work[0..layout::PAGE_HEADER_SIZE]);
        let body = self.work[layout::PAGE_HEADER_SIZE..].to_vec();

        let new_pix = self.move_page(Some(&body), old_hdr_pix, Some(header))?;

        self.broadcast_event(IndexEvent::Upd, layout::data_id(header.obj_id), 0, new_pix, meta.size);

        Ok(new_pix)
    }

    fn open_with(&mut self, pix: PageIx, header: PageHeader, mode: OpenFlags) -> Result<FileHandle, Error<F>> {
        let meta_addr = self.page_ix_addr(pix) + layout::PAGE_HEADER_SIZE as u32;
        let mut meta_buf = [0u8; layout::OBJ_INDEX_HEADER_META_SIZE];
        self.flash.read(meta_addr, &mut meta_buf)?;
        let meta = ObjIndexHeaderMeta::decode(&meta_buf);
        let size = if meta.size == layout::UNDEFINED_LEN { 0 } else { meta.size };

        self.alloc_fd_slot(layout::data_id(header.obj_id), size, pix, mode)
    }

    /// Opens an object by its data id (without the index flag).
    pub fn open_by_id(&mut self, data_obj_id: u16, mode: OpenFlags) -> Result<FileHandle, Error<F>> {
        let pix = self.find_id_and_index(layout::index_id(data_obj_id), 0)?;
        let header = self.validate_objix(pix, 0)?;
        self.open_with(pix, header, mode)
    }

    /// Opens an object given the persistent page index of its header.
    pub fn open_by_page(&mut self, hdr_pix: PageIx, mode: OpenFlags) -> Result<FileHandle, Error<F>> {
        let header = self.validate_objix(hdr_pix, 0)?;
        self.open_with(hdr_pix, header, mode)
    }

    /// Finds and opens the object whose name matches `name` exactly.
    pub fn find_by_name(&mut self, name: &[u8], mode: OpenFlags) -> Result<FileHandle, Error<F>> {
        let (pix, header) = self.find_header_by_name(name)?;
        self.open_with(pix, header, mode)
    }
}
