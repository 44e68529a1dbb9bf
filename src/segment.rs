use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use crate::cache::CacheEntry;
use crate::error::{LogError, LogResult};

/// Handles kept open per live segment. One handle suffices for a segment
/// truncated to zero length.
const OPEN_HANDLE_COUNT: usize = 8;

/// Round-robin pool of file handles over one segment file.
pub(crate) struct FilePool {
    files: Vec<File>,
    rotor: AtomicUsize,
}

impl FilePool {
    fn open(path: &PathBuf, handles: usize, create: bool) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if create {
            options.create(true);
        }
        let mut files = Vec::with_capacity(handles);
        for _ in 0..handles {
            files.push(options.open(path)?);
        }
        Ok(Self {
            files,
            rotor: AtomicUsize::new(0),
        })
    }

    fn handle(&self) -> &File {
        let slot = self.rotor.fetch_add(1, Ordering::Relaxed);
        &self.files[slot % self.files.len()]
    }

    fn primary(&self) -> &File {
        &self.files[0]
    }
}

/// Raw write window over the primary handle's memory map.
struct MapWindow {
    ptr: *mut u8,
    len: usize,
    map: MmapMut,
}

unsafe impl Send for MapWindow {}
unsafe impl Sync for MapWindow {}

impl MapWindow {
    fn new(file: &File, len: usize) -> io::Result<Self> {
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self { ptr, len, map })
    }
}

struct SegmentState {
    pool: Option<Arc<FilePool>>,
    map: Option<Arc<MapWindow>>,
    closed: bool,
}

/// One backing file holding the byte range
/// `[start_index, start_index + max_length)` of a term.
///
/// The start index never changes; `max_length` only shrinks (term finish,
/// recovery truncation). The reference count is zero-based: zero means one
/// live borrow, negative means idle and eligible for unmap or close. The
/// dirty flag makes a 0→1 transition at most once between syncs, guarding
/// single membership in the term's dirty list.
pub(crate) struct Segment {
    start_index: u64,
    max_length: AtomicU64,
    ref_count: AtomicI64,
    dirty: AtomicBool,
    path: PathBuf,
    state: RwLock<SegmentState>,
}

impl CacheEntry for Segment {
    fn cache_key(&self) -> u64 {
        self.start_index
    }
}

impl Segment {
    pub fn new(start_index: u64, max_length: u64, path: PathBuf) -> Self {
        Self {
            start_index,
            max_length: AtomicU64::new(max_length),
            ref_count: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
            path,
            state: RwLock::new(SegmentState {
                pool: None,
                map: None,
                closed: false,
            }),
        }
    }

    #[inline]
    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    #[inline]
    pub fn max_length(&self) -> u64 {
        self.max_length.load(Ordering::Acquire)
    }

    /// Exclusive end index of the range this segment may hold.
    #[inline]
    pub fn end_index(&self) -> u64 {
        self.start_index + self.max_length()
    }

    #[inline]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Takes a counted reference. The previous holder count may have been
    /// negative; pinning an idle segment revives it.
    #[inline]
    pub fn pin(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a counted reference. Returns true when the segment became
    /// idle, in which case the caller owns the unmap/close follow-up.
    #[inline]
    pub fn unpin(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) <= 0
    }

    /// True while no counted references remain.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) < 0
    }

    /// Writes `data` at the absolute index, clipping at `max_length`.
    ///
    /// Returns the amount written together with a flag reporting whether
    /// this write made the 0→1 dirty transition; the caller must then link
    /// the segment into the term's dirty list. Transient failures that
    /// coincide with a handle reopen are retried through the new handle.
    pub fn write(&self, index: u64, data: &[u8]) -> LogResult<(usize, bool)> {
        let rel = match index.checked_sub(self.start_index) {
            Some(rel) => rel,
            None => return Ok((0, false)),
        };
        let mut length = match self.clipped(rel, data.len()) {
            Some(length) => length,
            None => return Ok((0, false)),
        };

        let (mut pool, mut map) = self.cached_io();
        loop {
            if let Some(cur) = pool.clone() {
                match write_bytes(&cur, map.as_deref(), rel, &data[..length]) {
                    Ok(()) => {
                        let newly_dirty = !self.dirty.swap(true, Ordering::AcqRel);
                        let avail = self.max_length().saturating_sub(rel);
                        if (length as u64) > avail {
                            // Shrunk mid-write; clip the report and shorten
                            // the file back down.
                            length = avail as usize;
                            self.truncate()?;
                        }
                        return Ok((length, newly_dirty));
                    }
                    Err(err) => {
                        let mut state = self.state.write();
                        if pool_is_current(&state, &cur) {
                            return Err(err.into());
                        }
                        length = match self.clipped(rel, length) {
                            Some(length) => length,
                            None => return Ok((0, false)),
                        };
                        let io = self.open_for_writing(&mut state)?;
                        pool = Some(io.0);
                        map = io.1;
                    }
                }
            } else {
                let mut state = self.state.write();
                if let Some(existing) = state.pool.clone() {
                    pool = Some(existing);
                    map = state.map.clone();
                    continue;
                }
                length = match self.clipped(rel, length) {
                    Some(length) => length,
                    None => return Ok((0, false)),
                };
                let io = self.open_for_writing(&mut state)?;
                pool = Some(io.0);
                map = io.1;
            }
        }
    }

    /// Reads into `buf` from the absolute index, clipping at `max_length`.
    ///
    /// A short count only occurs at the segment boundary; within the
    /// segment the full clipped amount is returned.
    pub fn read(&self, index: u64, buf: &mut [u8]) -> LogResult<usize> {
        let rel = match index.checked_sub(self.start_index) {
            Some(rel) => rel,
            None => {
                return Err(LogError::InvalidIndex {
                    index,
                    start_index: self.start_index,
                })
            }
        };
        let mut length = match self.clipped(rel, buf.len()) {
            Some(length) => length,
            None => return Ok(0),
        };

        let (mut pool, mut map) = self.cached_io();
        loop {
            if let Some(cur) = pool.clone() {
                match read_bytes(&cur, map.as_deref(), rel, &mut buf[..length]) {
                    Ok(()) => return Ok(length),
                    Err(err) => {
                        let mut state = self.state.write();
                        if pool_is_current(&state, &cur) {
                            return Err(err.into());
                        }
                        length = match self.clipped(rel, length) {
                            Some(length) => length,
                            None => return Ok(0),
                        };
                        let io = self.open_for_reading(&mut state)?;
                        pool = Some(io.0);
                        map = io.1;
                    }
                }
            } else {
                let mut state = self.state.write();
                if let Some(existing) = state.pool.clone() {
                    pool = Some(existing);
                    map = state.map.clone();
                    continue;
                }
                length = match self.clipped(rel, length) {
                    Some(length) => length,
                    None => return Ok(0),
                };
                let io = self.open_for_reading(&mut state)?;
                pool = Some(io.0);
                map = io.1;
            }
        }
    }

    /// Lowers `max_length` so the segment ends at `end_index`.
    ///
    /// Returns true when the file on disk must be shortened or deleted.
    /// Never grows the segment.
    pub fn set_end_index(&self, end_index: u64) -> bool {
        let _state = self.state.write();
        let start = self.start_index;
        if start + self.max_length.load(Ordering::Acquire) <= end_index {
            return false;
        }
        self.max_length
            .store(end_index.saturating_sub(start), Ordering::Release);
        true
    }

    /// Claims the dirty flag (1→0). The caller must sync and, on failure,
    /// restore the flag via [`Segment::mark_dirty`].
    pub fn begin_sync(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Flips the dirty flag. Returns true on the 0→1 transition, in which
    /// case the caller re-links the segment into the dirty list.
    pub fn mark_dirty(&self) -> bool {
        !self.dirty.swap(true, Ordering::AcqRel)
    }

    /// Forces written bytes to durable storage.
    pub fn fsync(&self) -> LogResult<()> {
        let (mut pool, mut map) = self.cached_io();
        loop {
            if let Some(cur) = pool.clone() {
                match sync_io(&cur, map.as_deref()) {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        let mut state = self.state.write();
                        if pool_is_current(&state, &cur) {
                            return Err(err.into());
                        }
                        if self.max_length() == 0 {
                            return Ok(());
                        }
                        let io = self.open_for_writing(&mut state)?;
                        pool = Some(io.0);
                        map = io.1;
                    }
                }
            } else {
                let mut state = self.state.write();
                if let Some(existing) = state.pool.clone() {
                    pool = Some(existing);
                    map = state.map.clone();
                    continue;
                }
                if self.max_length() == 0 {
                    return Ok(());
                }
                let io = self.open_for_writing(&mut state)?;
                pool = Some(io.0);
                map = io.1;
            }
        }
    }

    /// Truncates or deletes the file according to `max_length`. Idempotent.
    pub fn truncate(&self) -> LogResult<()> {
        let pool = {
            let mut state = self.state.write();
            let max_length = self.max_length();
            if max_length == 0 {
                self.close_locked(&mut state, true);
                None
            } else {
                Some(self.open_for_writing(&mut state)?.0)
            }
        };

        match pool {
            Some(pool) => {
                pool.primary().set_len(self.max_length())?;
                Ok(())
            }
            None => {
                let _ = fs::remove_file(&self.path);
                Ok(())
            }
        }
    }

    /// Worker-task follow-up to a release: unmap once no counted
    /// references remain.
    pub fn unmap_if_idle(&self) {
        let mut state = self.state.write();
        if self.is_idle() {
            state.map = None;
        }
    }

    /// Worker-task follow-up to an LRU eviction: close an idle segment's
    /// handle pool outright, otherwise at least drop its mapping.
    pub fn close_or_unmap(&self) {
        let mut state = self.state.write();
        if self.is_idle() {
            self.close_locked(&mut state, false);
        } else {
            state.map = None;
        }
    }

    /// Closes the handle pool. With `permanent` set the segment refuses
    /// any further open.
    pub fn close(&self, permanent: bool) {
        let mut state = self.state.write();
        self.close_locked(&mut state, permanent);
    }

    fn close_locked(&self, state: &mut SegmentState, permanent: bool) {
        if state.pool.is_some() {
            state.pool = None;
            state.map = None;
            if permanent {
                state.closed = true;
            }
        }
    }

    fn cached_io(&self) -> (Option<Arc<FilePool>>, Option<Arc<MapWindow>>) {
        let state = self.state.read();
        (state.pool.clone(), state.map.clone())
    }

    fn clipped(&self, rel: u64, requested: usize) -> Option<usize> {
        let avail = self.max_length().saturating_sub(rel);
        let length = avail.min(requested as u64) as usize;
        if length == 0 {
            None
        } else {
            Some(length)
        }
    }

    /// Opens or re-opens the segment file for writing, pre-allocating and
    /// mapping `max_length` bytes. Caller holds the exclusive state latch.
    fn open_for_writing(
        &self,
        state: &mut SegmentState,
    ) -> LogResult<(Arc<FilePool>, Option<Arc<MapWindow>>)> {
        if let Some(pool) = state.pool.clone() {
            return Ok((pool, state.map.clone()));
        }
        if state.closed {
            return Err(LogError::Closed);
        }
        let max_length = self.max_length();
        let handles = if max_length > 0 { OPEN_HANDLE_COUNT } else { 1 };
        let pool = Arc::new(FilePool::open(&self.path, handles, max_length > 0)?);
        pool.primary().set_len(max_length)?;
        let map = if max_length > 0 {
            Some(Arc::new(MapWindow::new(
                pool.primary(),
                max_length as usize,
            )?))
        } else {
            None
        };
        state.pool = Some(pool.clone());
        state.map = map.clone();
        Ok((pool, map))
    }

    /// Opens or re-opens the segment file for reading. Caller holds the
    /// exclusive state latch. The existing file length is never changed.
    fn open_for_reading(
        &self,
        state: &mut SegmentState,
    ) -> LogResult<(Arc<FilePool>, Option<Arc<MapWindow>>)> {
        if let Some(pool) = state.pool.clone() {
            return Ok((pool, state.map.clone()));
        }
        if state.closed {
            return Err(LogError::Closed);
        }
        let max_length = self.max_length();
        let handles = if max_length > 0 { OPEN_HANDLE_COUNT } else { 1 };
        let pool = Arc::new(FilePool::open(&self.path, handles, false)?);
        let file_len = pool.primary().metadata()?.len();
        let map_len = file_len.min(max_length) as usize;
        let map = if map_len > 0 {
            Some(Arc::new(MapWindow::new(pool.primary(), map_len)?))
        } else {
            None
        };
        state.pool = Some(pool.clone());
        state.map = map.clone();
        Ok((pool, map))
    }
}

fn pool_is_current(state: &SegmentState, pool: &Arc<FilePool>) -> bool {
    state
        .pool
        .as_ref()
        .map_or(false, |current| Arc::ptr_eq(current, pool))
}

fn write_bytes(
    pool: &FilePool,
    map: Option<&MapWindow>,
    rel: u64,
    data: &[u8],
) -> io::Result<()> {
    if let Some(map) = map {
        let offset = rel as usize;
        if offset + data.len() <= map.len {
            unsafe {
                ptr::copy_nonoverlapping(data.as_ptr(), map.ptr.add(offset), data.len());
            }
            return Ok(());
        }
    }
    pool.handle().write_all_at(data, rel)
}

fn read_bytes(
    pool: &FilePool,
    map: Option<&MapWindow>,
    rel: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    if let Some(map) = map {
        let offset = rel as usize;
        if offset + buf.len() <= map.len {
            unsafe {
                ptr::copy_nonoverlapping(map.ptr.add(offset), buf.as_mut_ptr(), buf.len());
            }
            return Ok(());
        }
    }
    pool.handle().read_exact_at(buf, rel)
}

fn sync_io(pool: &FilePool, map: Option<&MapWindow>) -> io::Result<()> {
    if let Some(map) = map {
        map.map.flush()?;
    }
    let file = pool.primary();
    match file.sync_data() {
        Ok(()) => Ok(()),
        Err(err) if sync_data_unsupported(&err) => file.sync_all(),
        Err(err) => Err(err),
    }
}

fn sync_data_unsupported(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::Unsupported) {
        return true;
    }
    if let Some(code) = err.raw_os_error() {
        if code == libc::ENOSYS || code == libc::EINVAL || code == libc::ENOTSUP {
            return true;
        }
    }
    false
}
