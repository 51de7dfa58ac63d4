//! Memory-resident file.
//!
//! Keeps an entire file image in a heap buffer sized in multiples of a
//! configurable increment, with an optional backing file on disk. When
//! write tracking is enabled, every write is folded into an ordered set of
//! page-aligned dirty regions, and flushing writes only those regions to
//! the backing store instead of the whole image.
//!
//! The buffer length is always a multiple of the increment and at least
//! the tracked eof; the dirty-region set is non-empty only while tracking
//! is enabled and unflushed writes exist.

use super::regions::RegionIndex;
use super::sys::{validate_region, SysFile, SysOptions, MAX_ADDR};
use crate::error::{Error, Result};
use crate::observability;
use crate::sync::registry;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Default growth increment for the in-memory buffer, in bytes.
pub const DEFAULT_INCREMENT: u64 = 8192;

/// Default page size for dirty-region tracking, in bytes.
pub const DEFAULT_PAGE_SIZE: u64 = 512 * 1024;

/// Per-file configuration for [`CoreFile`].
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Buffer growth increment; zero selects [`DEFAULT_INCREMENT`].
    pub increment: u64,
    /// Keep a backing file on disk and write the image to it on flush.
    pub backing_store: bool,
    /// Track written regions and flush only those pages.
    pub write_tracking: bool,
    /// Page granularity for dirty-region rounding; zero disables tracking.
    pub page_size: u64,
    /// Treat "locking unsupported" on the backing file as success.
    pub ignore_disabled_locks: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            increment: DEFAULT_INCREMENT,
            backing_store: false,
            write_tracking: false,
            page_size: DEFAULT_PAGE_SIZE,
            ignore_disabled_locks: false,
        }
    }
}

/// Options for [`CoreFile::open`].
#[derive(Debug, Default)]
pub struct CoreOpenOptions {
    /// Open for reading and writing rather than read-only.
    pub read_write: bool,
    /// Create a fresh file rather than loading existing content.
    pub create: bool,
    /// Truncate an existing backing file on open.
    pub truncate: bool,
    /// Adopt this buffer as the initial file image.
    ///
    /// Ownership transfer of the image replaces the original design's
    /// caller-supplied buffer-management callbacks.
    pub image: Option<Vec<u8>>,
    /// Per-file configuration.
    pub config: CoreConfig,
}

fn round_up(value: u64, multiple: u64) -> u64 {
    debug_assert!(multiple > 0);
    if value % multiple == 0 {
        value
    } else {
        (value / multiple + 1) * multiple
    }
}

/// Fold the write `[start, end]` into the dirty-region index.
///
/// Endpoints are expanded to page boundaries, with the high end clamped to
/// `eof - 1`. A predecessor that touches or overlaps the expanded region
/// absorbs it; fully-shadowed successors are removed.
fn add_dirty_region(
    index: &mut RegionIndex,
    page_size: u64,
    eof: u64,
    mut start: u64,
    mut end: u64,
) {
    debug_assert!(start <= end);
    debug_assert!(eof > 0, "tracking a write into an empty file");

    // Expand to page boundaries.
    if start % page_size != 0 {
        start = (start / page_size) * page_size;
    }
    if end % page_size != page_size - 1 {
        end = (end / page_size + 1) * page_size - 1;
        if end > eof {
            end = eof - 1;
        }
    }
    debug_assert!(start <= end);

    // The region at or before the new start, and the one at or before the
    // position just past the new end.
    let before = index.less(start + 1);
    let after = index.less(end + 2);

    // Absorb a successor whose tail extends past the new region.
    if let Some((after_start, after_end)) = after {
        if start < after_start && end < after_end {
            end = after_end;
        }
    }

    // A predecessor that touches or overlaps the new start absorbs the
    // write; no new node is needed.
    let mut create_new = true;
    if let Some((before_start, before_end)) = before {
        if start <= before_end + 1 {
            start = before_start;
            create_new = false;
        }
    }

    // Remove nodes now fully shadowed by the widened region.
    let mut cursor = after;
    while let Some((cursor_start, _)) = cursor {
        if cursor_start <= start {
            break;
        }
        let previous = index.less(cursor_start.saturating_sub(1));
        index.remove(cursor_start);
        cursor = previous;
    }

    if create_new {
        match index.search(start) {
            None => index.insert(start, end),
            Some((_, existing_end)) => {
                if existing_end < end {
                    index.update_end(start, end);
                }
            }
        }
    } else if let Some((_, existing_end)) = index.search(start) {
        if existing_end < end {
            index.update_end(start, end);
        }
    }
}

/// A file held entirely in memory, with an optional backing store.
pub struct CoreFile {
    sys: Option<SysFile>,
    path: Option<PathBuf>,
    mem: Vec<u8>,
    increment: u64,
    backing_store: bool,
    dirty: bool,
    dirty_regions: Option<RegionIndex>,
    page_size: u64,
    eoa: u64,
    eof: u64,
}

impl CoreFile {
    /// Open a memory-resident file.
    ///
    /// The initial image comes from `options.image` when supplied, from the
    /// backing file when one exists, or starts empty on create. The buffer
    /// is sized to the smallest increment multiple covering the content.
    /// Dirty-region tracking is armed only for writable files with a
    /// backing store and a non-zero page size.
    pub fn open(path: Option<&Path>, options: CoreOpenOptions) -> Result<CoreFile> {
        let config = options.config;
        let increment = if config.increment == 0 {
            DEFAULT_INCREMENT
        } else {
            config.increment
        };

        let mut sys = None;
        if let Some(path) = path {
            if options.image.is_some() && !options.create {
                // Adopting an image over an existing name: refuse to
                // shadow a real file.
                if path.exists() {
                    return Err(Error::Io(std::io::ErrorKind::AlreadyExists.into()));
                }
                if config.backing_store {
                    sys = Some(SysFile::open(
                        path,
                        &SysOptions {
                            read_write: options.read_write,
                            create: true,
                            truncate: options.truncate,
                            ignore_disabled_locks: config.ignore_disabled_locks,
                            ..SysOptions::default()
                        },
                        None,
                    )?);
                }
            } else if config.backing_store || !options.create {
                sys = Some(SysFile::open(
                    path,
                    &SysOptions {
                        read_write: options.read_write,
                        create: options.create,
                        truncate: options.truncate,
                        ignore_disabled_locks: config.ignore_disabled_locks,
                        ..SysOptions::default()
                    },
                    None,
                )?);
            }
        }

        // Initial content: supplied image, else backing file, else empty.
        let (mut mem, content_len) = match options.image {
            Some(image) => {
                let len = image.len() as u64;
                (image, len)
            }
            None => {
                if !options.create {
                    if let Some(sys) = sys.as_mut() {
                        let len = sys.eof();
                        let mut mem = vec![0u8; len as usize];
                        sys.read(0, &mut mem, None)?;
                        (mem, len)
                    } else {
                        (Vec::new(), 0)
                    }
                } else {
                    (Vec::new(), 0)
                }
            }
        };

        // Buffer length is the smallest increment multiple covering the
        // content.
        let buffer_len = round_up(content_len, increment);
        mem.resize(buffer_len as usize, 0);

        let tracking = config.backing_store
            && config.write_tracking
            && options.read_write
            && config.page_size != 0;

        tracing::debug!(
            path = ?path.map(Path::display),
            content_len,
            tracking,
            "opened memory-resident file"
        );

        Ok(CoreFile {
            sys,
            path: path.map(Path::to_path_buf),
            mem,
            increment,
            backing_store: config.backing_store,
            dirty: false,
            dirty_regions: tracking.then(RegionIndex::new),
            page_size: config.page_size,
            eoa: 0,
            eof: content_len,
        })
    }

    /// The logical end-of-address.
    pub fn eoa(&self) -> u64 {
        self.eoa
    }

    /// Set the logical end-of-address.
    pub fn set_eoa(&mut self, addr: u64) -> Result<()> {
        if addr > MAX_ADDR {
            return Err(Error::Overflow { addr, size: 0 });
        }
        self.eoa = addr;
        Ok(())
    }

    /// The physical end-of-file (extent of the in-memory image).
    pub fn eof(&self) -> u64 {
        self.eof
    }

    /// Whether unflushed writes exist.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The dirty regions currently tracked, in start order.
    ///
    /// Empty when tracking is disabled or everything has been flushed.
    pub fn dirty_regions(&self) -> Vec<(u64, u64)> {
        self.dirty_regions
            .as_ref()
            .map(|index| index.iter().collect())
            .unwrap_or_default()
    }

    /// The path of the backing file, if one was named.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Compare two files with a consistent, arbitrary order.
    ///
    /// Files with a backing store compare by file identity; unnamed files
    /// compare by buffer identity.
    pub fn cmp_identity(&self, other: &CoreFile) -> Ordering {
        match (&self.sys, &other.sys) {
            (Some(mine), Some(theirs)) => mine.cmp_identity(theirs),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => (self.mem.as_ptr() as usize).cmp(&(other.mem.as_ptr() as usize)),
        }
    }

    /// Read `buf.len()` bytes starting at `addr`.
    ///
    /// Bytes past the eof read as zeros.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        validate_region(addr, buf.len())?;

        let mut filled = 0usize;
        if addr < self.eof {
            let available = (self.eof - addr) as usize;
            let n = buf.len().min(available);
            buf[..n].copy_from_slice(&self.mem[addr as usize..addr as usize + n]);
            filled = n;
        }
        if filled < buf.len() {
            buf[filled..].fill(0);
        }
        Ok(())
    }

    /// Write `buf` at `addr`, growing the buffer by increment multiples as
    /// needed and folding the write into the dirty-region set when
    /// tracking.
    pub fn write(&mut self, addr: u64, buf: &[u8]) -> Result<()> {
        validate_region(addr, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        let end = addr + buf.len() as u64;

        if end > self.eof {
            let new_eof = round_up(end, self.increment);
            let mut grown = std::mem::take(&mut self.mem);
            if grown
                .try_reserve_exact((new_eof as usize).saturating_sub(grown.len()))
                .is_err()
            {
                self.mem = grown;
                registry::push_diagnostic("write", format!("cannot grow image to {new_eof} bytes"));
                return Err(Error::AllocFailed(format!(
                    "memory-resident image of {new_eof} bytes"
                )));
            }
            grown.resize(new_eof as usize, 0);
            self.mem = grown;
            self.eof = new_eof;
        }

        if let Some(index) = self.dirty_regions.as_mut() {
            add_dirty_region(index, self.page_size, self.eof, addr, end - 1);
        }

        self.mem[addr as usize..end as usize].copy_from_slice(buf);
        self.dirty = true;
        Ok(())
    }

    /// Flush dirty content to the backing file, if one is configured.
    ///
    /// With tracking enabled only the dirty regions are written, in start
    /// order, each clipped to the current eof; otherwise the whole image
    /// up to eof is written. Clears the dirty flag.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty || !self.backing_store {
            return Ok(());
        }
        let Some(sys) = self.sys.as_mut() else {
            return Ok(());
        };

        let eof = self.eof;
        let mut flushed = 0u64;
        if let Some(index) = self.dirty_regions.as_mut() {
            while let Some((start, mut end)) = index.remove_first() {
                // The image may have been truncated since the write; skip
                // or clip regions accordingly.
                if start >= eof {
                    continue;
                }
                if end >= eof {
                    end = eof - 1;
                }
                let len = (end - start + 1) as usize;
                sys.write(start, &self.mem[start as usize..start as usize + len], None)?;
                flushed += len as u64;
            }
        } else {
            sys.write(0, &self.mem[..eof as usize], None)?;
            flushed = eof;
        }

        observability::record_flush_bytes(flushed);
        tracing::debug!(bytes = flushed, "flushed memory-resident file");
        self.dirty = false;
        Ok(())
    }

    /// Bring the physical extent in line with the eoa.
    ///
    /// Closing with a backing store sets the eof to the eoa and truncates
    /// the backing file to match. Not closing, the buffer is resized to
    /// the eoa rounded up to an increment multiple (zero-filling growth)
    /// and the backing file is left alone.
    pub fn truncate(&mut self, closing: bool) -> Result<()> {
        if closing && !self.backing_store {
            return Ok(());
        }

        let new_eof = if closing {
            self.eoa
        } else {
            round_up(self.eoa, self.increment)
        };
        if self.eof != new_eof {
            self.mem.resize(new_eof as usize, 0);
            if closing && self.backing_store {
                if let Some(sys) = self.sys.as_mut() {
                    sys.truncate(Some(new_eof), None)?;
                }
            }
            self.eof = new_eof;
        }
        Ok(())
    }

    /// Place a non-blocking advisory lock on the backing file, if open.
    pub fn lock(&self, exclusive: bool) -> Result<()> {
        match &self.sys {
            Some(sys) => sys.lock(exclusive, None),
            None => Ok(()),
        }
    }

    /// Remove an advisory lock from the backing file, if open.
    pub fn unlock(&self) -> Result<()> {
        match &self.sys {
            Some(sys) => sys.unlock(None),
            None => Ok(()),
        }
    }

    /// Close the file: best-effort flush, drop the dirty-region index,
    /// release the buffer, close the backing file.
    pub fn close(mut self) -> Result<()> {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "flush on close failed");
        }
        self.dirty = false;
        self.dirty_regions = None;
        self.mem = Vec::new();
        if let Some(sys) = self.sys.take() {
            sys.close(None)?;
        }
        Ok(())
    }
}

impl Drop for CoreFile {
    fn drop(&mut self) {
        // Dropping without close() still tries to persist dirty content.
        if self.dirty && self.sys.is_some() {
            let _ = self.flush();
        }
    }
}
