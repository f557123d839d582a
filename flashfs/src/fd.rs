//! File-descriptor cache (C7): open fd table plus propagation of index-move
//! events so every open descriptor stays coherent without holding a pointer
//! into mutable shared state — only persistent page indices.

use crate::layout;
use crate::{Error, Filesystem, NorFlash, PageIx};

/// A 1-based public handle into the fd table, surfaced to callers above the
/// core. `0` is never issued (mirrors the original's `file_nbr == 0` meaning
/// free).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FileHandle(pub u16);

/// Open-mode flags recorded on a descriptor. Present in the original's fd
/// struct (`SPIFFS_O_*`) though the distilled operations below this layer
/// (`append`/`modify`/`read`/`truncate`) do not themselves gate on mode —
/// carried for parity with the original and for veneer layers built on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OpenFlags(pub u16);

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags(0x01);
    pub const WRONLY: OpenFlags = OpenFlags(0x02);
    pub const RDWR: OpenFlags = OpenFlags(0x01 | 0x02);
    pub const CREAT: OpenFlags = OpenFlags(0x04);
    pub const TRUNC: OpenFlags = OpenFlags(0x08);
    pub const APPEND: OpenFlags = OpenFlags(0x10);

    pub fn contains(&self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = OpenFlags;
    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FileDescriptor {
    pub obj_id: u16,
    pub size: u32,
    pub offset: u32,
    pub mode: OpenFlags,
    pub hdr_pix: PageIx,
    pub cursor_index_pix: PageIx,
    pub cursor_index_span: u32,
}

/// The kind of structural change that just happened to an index page,
/// broadcast to every open descriptor of the owning object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEvent {
    New,
    Upd,
    Del,
}

impl<F: NorFlash> Filesystem<F> {
    pub(crate) fn alloc_fd_slot(
        &mut self,
        obj_id: u16,
        size: u32,
        hdr_pix: PageIx,
        mode: OpenFlags,
    ) -> Result<FileHandle, Error<F>> {
        let slot = self
            .fds
            .iter()
            .position(|f| f.is_none())
            .ok_or(Error::OutOfFileDescriptors)?;
        self.fds[slot] = Some(FileDescriptor {
            obj_id,
            size,
            offset: 0,
            mode,
            hdr_pix,
            cursor_index_pix: hdr_pix,
            cursor_index_span: 0,
        });
        Ok(FileHandle((slot + 1) as u16))
    }

    pub(crate) fn fd_slot(&self, handle: FileHandle) -> Result<usize, Error<F>> {
        let slot = handle.0.checked_sub(1).ok_or(Error::BadDescriptor)? as usize;
        if slot >= self.fds.len() || self.fds[slot].is_none() {
            return Err(Error::BadDescriptor);
        }
        Ok(slot)
    }

    pub(crate) fn fd(&self, handle: FileHandle) -> Result<&FileDescriptor, Error<F>> {
        let slot = self.fd_slot(handle)?;
        let fd = self.fds[slot].as_ref().expect("checked by fd_slot");
        if fd.obj_id == layout::OBJ_ID_ERASED {
            return Err(Error::FileClosed);
        }
        Ok(fd)
    }

    pub(crate) fn fd_mut(&mut self, handle: FileHandle) -> Result<&mut FileDescriptor, Error<F>> {
        let slot = self.fd_slot(handle)?;
        let fd = self.fds[slot].as_mut().expect("checked by fd_slot");
        if fd.obj_id == layout::OBJ_ID_ERASED {
            return Err(Error::FileClosed);
        }
        Ok(fd)
    }

    /// Closes `handle`, freeing its slot for reuse.
    pub fn close_fd(&mut self, handle: FileHandle) -> Result<(), Error<F>> {
        let slot = self.fd_slot(handle)?;
        self.fds[slot] = None;
        Ok(())
    }

    /// Propagates an index-page move/delete to every open descriptor of
    /// `obj_id` (§4.6). `span` is the index-page span that moved; `new_pix`
    /// is its new location; `new_size` is the object's current size (ignored
    /// unless `span == 0` and it is non-zero).
    pub(crate) fn broadcast_event(&mut self, event: IndexEvent, obj_id: u16, span: u32, new_pix: PageIx, new_size: u32) {
        for fd in self.fds.iter_mut().flatten() {
            if fd.obj_id != obj_id {
                continue;
            }
            if span == 0 {
                fd.hdr_pix = new_pix;
                if new_size != 0 {
                    fd.size = new_size;
                }
                if event == IndexEvent::Del {
                    fd.obj_id = layout::OBJ_ID_ERASED;
                }
            }
            if span == fd.cursor_index_span {
                fd.cursor_index_pix = if event == IndexEvent::Del { 0 } else { new_pix };
            }
        }
    }
}
