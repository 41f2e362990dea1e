use crate::*;

/// Per-page checksum / encryption transform applied at the channel boundary.
///
/// The default [PlainCodec] is the identity. Implementations may rewrite the
/// buffer in place ( it is always exactly one page long ). Page 0 is never
/// transformed: the header must be readable before the transform is known.
pub trait PageCodec {
    /// Transform a page on its way to the backing store.
    fn encode_page(&self, pnum: u32, data: &mut Vec<u8>) -> Result<()>;

    /// Transform a page read from the backing store.
    fn decode_page(&self, pnum: u32, data: &mut Vec<u8>) -> Result<()>;
}

/// Identity page transform.
pub struct PlainCodec;

impl PageCodec for PlainCodec {
    fn encode_page(&self, _pnum: u32, _data: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
    fn decode_page(&self, _pnum: u32, _data: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
}

/// Typed read/write of fixed-size pages over a [Storage], with a write
/// barrier and a global allocation map.
///
/// Writes made between [PageChannel::start_write] and
/// [PageChannel::finish_write] are buffered and become visible in the
/// backing store together. Reads inside the barrier see the buffered
/// writes. A fatal error poisons the channel; subsequent operations fail
/// with [Error::DatabasePoisoned].
pub struct PageChannel {
    stg: RefCell<Box<dyn Storage>>,
    codec: Box<dyn PageCodec>,
    /// Parsed page 0.
    header: RefCell<Header>,
    /// Pages buffered during the current write barrier.
    dirty: RefCell<FxHashMap<u32, Data>>,
    /// Committed pages already read from the backing store.
    cache: RefCell<FxHashMap<u32, Data>>,
    /// Global map of freed page numbers.
    free_map: RefCell<UsageMap>,
    /// Barrier nesting depth.
    barrier: Cell<usize>,
    /// Page count as of the last commit.
    committed_pages: Cell<u32>,
    /// Page count snapshot for barrier rollback.
    shadow_pages: Cell<u32>,
    poisoned: Cell<bool>,
}

impl PageChannel {
    /// Create a fresh container of the given version: header page plus the
    /// global free-map page.
    pub fn create(stg: Box<dyn Storage>, codec: Box<dyn PageCodec>, version: Version) -> Result<PageChannel> {
        let header = Header {
            version,
            created: codec::now_datetime_days(),
            collation: DEFAULT_COLLATION,
            crypt: [0; 16],
            sys_root: 0,
            free_root: FREE_MAP_PAGE,
            page_count: 2,
        };
        let ch = PageChannel {
            stg: RefCell::new(stg),
            codec,
            header: RefCell::new(header),
            dirty: util::newmap(),
            cache: util::newmap(),
            free_map: RefCell::new(UsageMap::placeholder()),
            barrier: Cell::new(0),
            committed_pages: Cell::new(0),
            shadow_pages: Cell::new(2),
            poisoned: Cell::new(false),
        };
        ch.start_write()?;
        let ps = ch.page_size();
        let mut map_page = vec![0u8; ps];
        map_page[0] = PageType::UsageMap as u8;
        UsageMap::init_inline(&mut map_page[2..], 2);
        ch.write_page(FREE_MAP_PAGE, Arc::new(map_page))?;
        ch.finish_write()?;
        let map = UsageMap::load(&ch, MapOwner::new(FREE_MAP_PAGE, 2), AllocMode::Extend)?;
        *ch.free_map.borrow_mut() = map;
        Ok(ch)
    }

    /// Open an existing container.
    pub fn open(stg: Box<dyn Storage>, codec: Box<dyn PageCodec>) -> Result<PageChannel> {
        if stg.size() == 0 {
            return Err(Error::corrupt("empty file"));
        }
        // The header page size is not known until the header is parsed, so
        // probe with the largest supported page.
        let probe = std::cmp::min(stg.size() as usize, 4096);
        let mut buf = vec![0u8; probe];
        stg.read(0, &mut buf)?;
        let header = Header::load(&buf)?;
        let fmt = header.version.format();
        let page_count = header.page_count;
        if (page_count as u64) * (fmt.page_size as u64) > stg.size() {
            return Err(Error::corrupt("page count exceeds file size"));
        }
        let free_root = header.free_root;
        let ch = PageChannel {
            stg: RefCell::new(stg),
            codec,
            header: RefCell::new(header),
            dirty: util::newmap(),
            cache: util::newmap(),
            free_map: RefCell::new(UsageMap::placeholder()),
            barrier: Cell::new(0),
            committed_pages: Cell::new(page_count),
            shadow_pages: Cell::new(page_count),
            poisoned: Cell::new(false),
        };
        let map = UsageMap::load(&ch, MapOwner::new(free_root, 2), AllocMode::Extend)?;
        *ch.free_map.borrow_mut() = map;
        Ok(ch)
    }

    /// File format constants for the open container.
    pub fn fmt(&self) -> &'static FileFormat {
        self.header.borrow().version.format()
    }

    /// Size of every page in bytes.
    pub fn page_size(&self) -> usize {
        self.fmt().page_size
    }

    /// Definition page of the system object table.
    pub fn sys_root(&self) -> u32 {
        self.header.borrow().sys_root
    }

    /// Record the system object table location ( during creation ).
    pub fn set_sys_root(&self, pnum: u32) {
        self.header.borrow_mut().sys_root = pnum;
    }

    /// Default collation id from the header.
    pub fn collation(&self) -> u16 {
        self.header.borrow().collation
    }

    /// Fail if a prior fatal error invalidated the handle.
    pub fn check(&self) -> Result<()> {
        if self.poisoned.get() {
            return Err(Error::DatabasePoisoned);
        }
        Ok(())
    }

    /// Mark the handle unusable and discard buffered writes.
    pub fn poison(&self) {
        self.poisoned.set(true);
        self.dirty.borrow_mut().clear();
        self.cache.borrow_mut().clear();
        self.barrier.set(0);
    }

    /// True while a write barrier is open.
    pub fn in_barrier(&self) -> bool {
        self.barrier.get() > 0
    }

    /// Open a write barrier. Barriers nest; writes become visible when the
    /// outermost barrier finishes.
    pub fn start_write(&self) -> Result<()> {
        self.check()?;
        if self.barrier.get() == 0 {
            self.shadow_pages.set(self.header.borrow().page_count);
        }
        self.barrier.set(self.barrier.get() + 1);
        Ok(())
    }

    /// Close the barrier, making all buffered writes visible atomically.
    pub fn finish_write(&self) -> Result<()> {
        self.check()?;
        let depth = self.barrier.get();
        debug_assert!(depth > 0);
        if depth > 1 {
            self.barrier.set(depth - 1);
            return Ok(());
        }
        match self.flush() {
            Ok(()) => {
                self.barrier.set(0);
                Ok(())
            }
            Err(e) => {
                self.poison();
                Err(e)
            }
        }
    }

    /// Discard all writes buffered in the current barrier and restore the
    /// last committed state. Does not poison the handle.
    pub fn abort_write(&self) -> Result<()> {
        self.dirty.borrow_mut().clear();
        self.cache.borrow_mut().clear();
        self.barrier.set(0);
        self.header.borrow_mut().page_count = self.shadow_pages.get();
        let owner = self.free_map.borrow().owner();
        let map = UsageMap::load(self, owner, AllocMode::Extend)?;
        *self.free_map.borrow_mut() = map;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // Header carries the new page count.
        let ps = self.page_size();
        let mut hdr_page = match self.dirty.borrow().get(&0) {
            Some(d) => d.as_ref().clone(),
            None => match self.cache.borrow().get(&0) {
                Some(d) => d.as_ref().clone(),
                None => vec![0u8; ps],
            },
        };
        if hdr_page.len() != ps {
            hdr_page.resize(ps, 0);
        }
        self.header.borrow().save(&mut hdr_page);
        self.dirty.borrow_mut().insert(0, Arc::new(hdr_page));

        let dirty = std::mem::take(&mut *self.dirty.borrow_mut());
        let mut stg = self.stg.borrow_mut();
        for (pnum, data) in &dirty {
            let mut buf = data.as_ref().clone();
            debug_assert!(buf.len() == ps);
            if *pnum != 0 {
                self.codec.encode_page(*pnum, &mut buf)?;
            }
            stg.write(*pnum as u64 * ps as u64, &buf)?;
        }
        let page_count = self.header.borrow().page_count;
        stg.commit(page_count as u64 * ps as u64)?;
        drop(stg);
        self.committed_pages.set(page_count);
        let mut cache = self.cache.borrow_mut();
        for (pnum, data) in dirty {
            cache.insert(pnum, data);
        }
        Ok(())
    }

    /// Read a page. Inside a barrier, buffered writes are visible.
    pub fn read_page(&self, pnum: u32) -> Result<Data> {
        self.check()?;
        if let Some(d) = self.dirty.borrow().get(&pnum) {
            return Ok(d.clone());
        }
        if let Some(d) = self.cache.borrow().get(&pnum) {
            return Ok(d.clone());
        }
        let ps = self.page_size();
        if pnum >= self.committed_pages.get() {
            // Allocated inside the current barrier but never written.
            if pnum >= self.header.borrow().page_count {
                return Err(Error::corrupt(format!("read of unallocated page {}", pnum)));
            }
            return Ok(Arc::new(vec![0u8; ps]));
        }
        let mut buf = vec![0u8; ps];
        let r = self.stg.borrow().read(pnum as u64 * ps as u64, &mut buf);
        if let Err(e) = r {
            self.poison();
            return Err(Error::IOError(e));
        }
        if pnum != 0 {
            if let Err(e) = self.codec.decode_page(pnum, &mut buf) {
                self.poison();
                return Err(e);
            }
        }
        let data: Data = Arc::new(buf);
        self.cache.borrow_mut().insert(pnum, data.clone());
        Ok(data)
    }

    /// Queue a page write. Must be called inside a write barrier.
    pub fn write_page(&self, pnum: u32, data: Data) -> Result<()> {
        self.check()?;
        debug_assert!(self.barrier.get() > 0);
        debug_assert!(data.len() == self.page_size());
        self.dirty.borrow_mut().insert(pnum, data);
        Ok(())
    }

    /// Allocate a page number, preferring freed pages.
    pub fn alloc_page(&self) -> Result<u32> {
        self.check()?;
        debug_assert!(self.barrier.get() > 0);
        if let Some(pnum) = self.free_map.borrow().lowest() {
            self.free_map.borrow().remove(self, pnum)?;
            return Ok(pnum);
        }
        Ok(self.extend())
    }

    /// Allocate a page number past the high-water mark, bypassing the free
    /// list. Used by the free map itself when it grows.
    pub fn extend(&self) -> u32 {
        let mut h = self.header.borrow_mut();
        let pnum = h.page_count;
        h.page_count += 1;
        pnum
    }

    /// Return a page to the global free map.
    pub fn free_page(&self, pnum: u32) -> Result<()> {
        self.check()?;
        debug_assert!(self.barrier.get() > 0);
        self.free_map.borrow().add(self, pnum)
    }

    /// Whether the given page is on the global free list.
    pub fn is_free(&self, pnum: u32) -> bool {
        self.free_map.borrow().contains(pnum)
    }

    /// Allocate a page and initialise it with the given type tag.
    pub fn alloc_typed(&self, tag: PageType) -> Result<(u32, Vec<u8>)> {
        let pnum = self.alloc_page()?;
        let mut buf = vec![0u8; self.page_size()];
        buf[0] = tag as u8;
        Ok((pnum, buf))
    }
}

/// Page number of the global free-page map.
pub const FREE_MAP_PAGE: u32 = 1;

/// Default collation id written into new files.
pub const DEFAULT_COLLATION: u16 = 1033;

#[cfg(test)]
mod tests {
    use super::*;

    fn new_channel() -> PageChannel {
        PageChannel::create(MemFile::new(), Box::new(PlainCodec), Version::V2010).unwrap()
    }

    #[test]
    fn barrier_visibility() {
        let ch = new_channel();
        ch.start_write().unwrap();
        let (pnum, mut buf) = ch.alloc_typed(PageType::Data).unwrap();
        buf[100] = 0xAB;
        ch.write_page(pnum, Arc::new(buf)).unwrap();
        // Read-after-write inside the barrier.
        assert_eq!(ch.read_page(pnum).unwrap()[100], 0xAB);
        ch.finish_write().unwrap();
        assert_eq!(ch.read_page(pnum).unwrap()[100], 0xAB);
    }

    #[test]
    fn abort_discards_buffered_writes() {
        let ch = new_channel();
        ch.start_write().unwrap();
        let (pnum, buf) = ch.alloc_typed(PageType::Data).unwrap();
        ch.write_page(pnum, Arc::new(buf)).unwrap();
        ch.abort_write().unwrap();
        assert!(ch.read_page(pnum).is_err());
    }

    #[test]
    fn free_pages_are_reused() {
        let ch = new_channel();
        ch.start_write().unwrap();
        let (a, buf) = ch.alloc_typed(PageType::Data).unwrap();
        ch.write_page(a, Arc::new(buf)).unwrap();
        ch.free_page(a).unwrap();
        let b = ch.alloc_page().unwrap();
        assert_eq!(a, b);
        ch.finish_write().unwrap();
    }

    #[test]
    fn reopen_sees_committed_state() {
        let mut backing = Vec::new();
        {
            let ch = new_channel();
            ch.start_write().unwrap();
            let (pnum, mut buf) = ch.alloc_typed(PageType::Data).unwrap();
            buf[7] = 42;
            ch.write_page(pnum, Arc::new(buf)).unwrap();
            ch.finish_write().unwrap();
            // Steal the bytes for a reopen.
            let ps = ch.page_size();
            let n = 4 * ps;
            backing.resize(n, 0);
            for p in 0..4u32 {
                if let Ok(d) = ch.read_page(p) {
                    backing[p as usize * ps..(p as usize + 1) * ps].copy_from_slice(&d);
                }
            }
        }
        let ch = PageChannel::open(MemFile::from_bytes(backing), Box::new(PlainCodec)).unwrap();
        assert_eq!(ch.read_page(2).unwrap()[7], 42);
    }
}
