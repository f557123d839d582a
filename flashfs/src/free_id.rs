//! Free-object-id finder (C9): a bitmap pass over a small id range, falling
//! back to a compacted histogram pass when the range is too large to bitmap
//! in one page-sized scratch buffer.

use alloc::vec;

use crate::layout;
use crate::{Error, Filesystem, NorFlash};

enum CompactionOutcome {
    Found(u32),
    Narrowed(u32, u32),
    Full,
}

impl<F: NorFlash> Filesystem<F> {
    /// Picks an unused object id in the inclusive range `[1, max_objects+1]`
    /// (§4.8) — `max` below is carried as one past the top of the range so
    /// every other comparison in this module can stay an exclusive `< max`.
    pub fn find_free_obj_id(&mut self) -> Result<u16, Error<F>> {
        let mut min = 1u32;
        let mut max = self.geom.max_objects + 2;
        let page_size = self.config.log_page_size;

        loop {
            if max - min <= page_size * 8 {
                return match self.bitmap_pass(min, max)? {
                    Some(id) => Ok(id as u16),
                    None => {
                        warn!("no free object id in [{}, {})", min, max);
                        Err(Error::Full)
                    }
                };
            }
            match self.compaction_pass(min, max)? {
                CompactionOutcome::Found(id) => return Ok(id as u16),
                CompactionOutcome::Narrowed(new_min, new_max) => {
                    trace!("narrowed free-id search to [{}, {})", new_min, new_max);
                    min = new_min;
                    max = new_max;
                }
                CompactionOutcome::Full => {
                    warn!("every id bucket in [{}, {}) is saturated", min, max);
                    return Err(Error::Full);
                }
            }
        }
    }

    /// Sets bit `(id - min)` in `self.lu_work` for every live id in range,
    /// then returns the first unset bit's id.
    fn bitmap_pass(&mut self, min: u32, max: u32) -> Result<Option<u32>, Error<F>> {
        let range = (max - min) as usize;
        let bytes_needed = range.div_ceil(8);
        for b in self.lu_work[..bytes_needed].iter_mut() {
            *b = 0;
        }

        self.scan_all(|fs, id, _block, _entry| {
            if id != layout::OBJ_ID_FREE && id != layout::OBJ_ID_ERASED {
                let base = layout::data_id(id) as u32;
                if base >= min && base < max {
                    let bit = (base - min) as usize;
                    fs.lu_work[bit / 8] |= 1 << (bit % 8);
                }
            }
            Ok(())
        })?;

        for i in 0..range {
            if self.lu_work[i / 8] & (1 << (i % 8)) == 0 {
                return Ok(Some(min + i as u32));
            }
        }
        Ok(None)
    }

    /// Divides `[min, max)` into `page_size` buckets and counts live header
    /// ids per bucket; the emptiest bucket either yields a free id directly
    /// or becomes the next range to narrow into.
    fn compaction_pass(&mut self, min: u32, max: u32) -> Result<CompactionOutcome, Error<F>> {
        let page_size = self.config.log_page_size;
        let compaction = ((max - min) / page_size).max(1);
        let num_buckets = page_size as usize;
        let mut buckets = vec![0u16; num_buckets];

        self.scan_all(|fs, id, block, entry| {
            if id == layout::OBJ_ID_FREE || id == layout::OBJ_ID_ERASED || !layout::is_index_id(id) {
                return Ok(());
            }
            let base = layout::data_id(id) as u32;
            if base < min || base >= max {
                return Ok(());
            }
            let pix = fs.make_page_ix(block, entry);
            let header = fs.read_header(pix)?;
            if header.is_deleted() || header.span_ix != 0 {
                return Ok(());
            }
            let bucket = (((base - min) / compaction) as usize).min(num_buckets - 1);
            buckets[bucket] = buckets[bucket].saturating_add(1);
            Ok(())
        })?;

        let (min_bucket, &min_count) = buckets
            .iter()
            .enumerate()
            .min_by_key(|&(_, c)| *c)
            .expect("num_buckets > 0");

        if min_count == 0 {
            return Ok(CompactionOutcome::Found(min + min_bucket as u32 * compaction));
        }
        if min_count as u32 >= compaction {
            return Ok(CompactionOutcome::Full);
        }
        let new_min = min + min_bucket as u32 * compaction;
        let new_max = (new_min + compaction).min(max);
        Ok(CompactionOutcome::Narrowed(new_min, new_max))
    }
}
