use crate::*;

/// How a map obtains pages for its own bookkeeping when it grows.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Through the global allocator ( table-owned maps ).
    Normal,
    /// Past the high-water mark ( the global free map itself, which cannot
    /// re-enter the allocator ).
    Extend,
}

/// Location of the owner region of a map: a page and the byte offset where
/// the encoded map begins. The region extends to the end of the page.
#[derive(Clone, Copy)]
pub struct MapOwner {
    ///
    pub page: u32,
    ///
    pub off: usize,
}

impl MapOwner {
    ///
    pub fn new(page: u32, off: usize) -> MapOwner {
        MapOwner { page, off }
    }
}

#[derive(Clone, Copy)]
enum MapKind {
    /// Small bitmap held within the owner region, covering pages from
    /// `start`.
    Inline { start: u32 },
    /// Indirection page listing dedicated bitmap pages at fixed strides.
    Reference { ref_page: u32 },
}

/// A ( potentially sparse ) set of allocated page numbers.
///
/// Two on-disk encodings: a small inline bitmap inside the owner region,
/// and a reference encoding where the owner points at an indirection page
/// of dedicated bitmap pages. An add that exceeds the inline coverage
/// promotes the map to the reference encoding within the current write
/// barrier. The whole set is mirrored in memory; mutations persist
/// immediately through the channel.
pub struct UsageMap {
    owner: MapOwner,
    mode: AllocMode,
    kind: Cell<MapKind>,
    pages: RefCell<BTreeSet<u32>>,
}

// Inline region: [0x00][u32 start][bitmap...]
// Reference region: [0x01][u32 ref_page]
// Reference page: [tag][unused][u16 count][u32 bitmap page numbers...]
// Bitmap page: [tag][unused][u16 stride index][bitmap...]
const INLINE_HDR: usize = 5;
const REF_HDR: usize = 4;
const BITMAP_HDR: usize = 4;

impl UsageMap {
    /// Empty placeholder, replaced before first use.
    pub fn placeholder() -> UsageMap {
        UsageMap {
            owner: MapOwner::new(0, 0),
            mode: AllocMode::Extend,
            kind: Cell::new(MapKind::Inline { start: 0 }),
            pages: RefCell::new(BTreeSet::new()),
        }
    }

    /// Format a fresh inline map into an owner region.
    pub fn init_inline(region: &mut [u8], start: u32) {
        region[0] = 0;
        util::setu32(region, 1, start);
        for b in region[INLINE_HDR..].iter_mut() {
            *b = 0;
        }
    }

    /// Parse the owner region and mirror the set in memory.
    pub fn load(ch: &PageChannel, owner: MapOwner, mode: AllocMode) -> Result<UsageMap> {
        let data = ch.read_page(owner.page)?;
        let region = &data[owner.off..];
        let mut pages = BTreeSet::new();
        let kind = match region[0] {
            0 => {
                let start = util::getu32(region, 1);
                for (i, byte) in region[INLINE_HDR..].iter().enumerate() {
                    let mut b = *byte;
                    while b != 0 {
                        let bit = b.trailing_zeros() as usize;
                        pages.insert(start + (i * 8 + bit) as u32);
                        b &= b - 1;
                    }
                }
                MapKind::Inline { start }
            }
            1 => {
                let ref_page = util::getu32(region, 1);
                let rp = ch.read_page(ref_page)?;
                expect_page(&rp, ref_page, PageType::UsageMap)?;
                let count = util::getu16(&rp, 2) as usize;
                let bpp = Self::bits_per_page(ch);
                for k in 0..count {
                    let bm_pnum = util::getu32(&rp, REF_HDR + k * 4);
                    if bm_pnum == 0 {
                        continue;
                    }
                    let bm = ch.read_page(bm_pnum)?;
                    expect_page(&bm, bm_pnum, PageType::UsageMap)?;
                    for (i, byte) in bm[BITMAP_HDR..].iter().enumerate() {
                        let mut b = *byte;
                        while b != 0 {
                            let bit = b.trailing_zeros() as usize;
                            pages.insert((k * bpp + i * 8 + bit) as u32);
                            b &= b - 1;
                        }
                    }
                }
                MapKind::Reference { ref_page }
            }
            x => {
                return Err(Error::corrupt(format!(
                    "page {} has unknown usage map encoding 0x{:02x}",
                    owner.page, x
                )))
            }
        };
        Ok(UsageMap {
            owner,
            mode,
            kind: Cell::new(kind),
            pages: RefCell::new(pages),
        })
    }

    fn bits_per_page(ch: &PageChannel) -> usize {
        (ch.page_size() - BITMAP_HDR) * 8
    }

    fn inline_capacity(&self, ch: &PageChannel) -> usize {
        (ch.page_size() - self.owner.off - INLINE_HDR) * 8
    }

    ///
    pub fn owner(&self) -> MapOwner {
        self.owner
    }

    /// Test whether the set contains a page number.
    pub fn contains(&self, pnum: u32) -> bool {
        self.pages.borrow().contains(&pnum)
    }

    /// Smallest page number in the set.
    pub fn lowest(&self) -> Option<u32> {
        self.pages.borrow().iter().next().copied()
    }

    /// Number of pages in the set.
    pub fn len(&self) -> usize {
        self.pages.borrow().len()
    }

    ///
    pub fn is_empty(&self) -> bool {
        self.pages.borrow().is_empty()
    }

    /// Ascending snapshot of the set. The snapshot is stable for one
    /// traversal even if the map mutates afterwards.
    pub fn snapshot(&self) -> Vec<u32> {
        self.pages.borrow().iter().copied().collect()
    }

    /// Add a page number to the set.
    pub fn add(&self, ch: &PageChannel, pnum: u32) -> Result<()> {
        if !self.pages.borrow_mut().insert(pnum) {
            return Ok(());
        }
        match self.kind.get() {
            MapKind::Inline { start } => {
                let cap = self.inline_capacity(ch);
                if pnum >= start && ((pnum - start) as usize) < cap {
                    self.flip_inline(ch, start, pnum, true)
                } else {
                    self.promote(ch)
                }
            }
            MapKind::Reference { ref_page } => self.flip_reference(ch, ref_page, pnum, true),
        }
    }

    /// Remove a page number from the set.
    pub fn remove(&self, ch: &PageChannel, pnum: u32) -> Result<()> {
        if !self.pages.borrow_mut().remove(&pnum) {
            return Ok(());
        }
        match self.kind.get() {
            MapKind::Inline { start } => self.flip_inline(ch, start, pnum, false),
            MapKind::Reference { ref_page } => self.flip_reference(ch, ref_page, pnum, false),
        }
    }

    fn flip_inline(&self, ch: &PageChannel, start: u32, pnum: u32, on: bool) -> Result<()> {
        let mut data = ch.read_page(self.owner.page)?;
        let buf = Arc::make_mut(&mut data);
        let bit = (pnum - start) as usize;
        let off = self.owner.off + INLINE_HDR + bit / 8;
        if on {
            buf[off] |= 1 << (bit % 8);
        } else {
            buf[off] &= !(1 << (bit % 8));
        }
        ch.write_page(self.owner.page, data)
    }

    fn flip_reference(&self, ch: &PageChannel, ref_page: u32, pnum: u32, on: bool) -> Result<()> {
        let bpp = Self::bits_per_page(ch);
        let k = pnum as usize / bpp;
        let mut rp = ch.read_page(ref_page)?;
        let max_entries = (ch.page_size() - REF_HDR) / 4;
        if k >= max_entries {
            return Err(Error::corrupt(format!(
                "page number {} beyond usage map capacity",
                pnum
            )));
        }
        let mut bm_pnum = util::getu32(&rp, REF_HDR + k * 4);
        if bm_pnum == 0 {
            if !on {
                return Ok(());
            }
            bm_pnum = self.alloc_map_page(ch)?;
            let mut bm = vec![0u8; ch.page_size()];
            bm[0] = PageType::UsageMap as u8;
            util::setu16(&mut bm, 2, k as u16);
            ch.write_page(bm_pnum, Arc::new(bm))?;
            let buf = Arc::make_mut(&mut rp);
            util::setu32(buf, REF_HDR + k * 4, bm_pnum);
            let count = util::getu16(buf, 2) as usize;
            if k >= count {
                util::setu16(buf, 2, (k + 1) as u16);
            }
            ch.write_page(ref_page, rp)?;
        }
        let mut bm = ch.read_page(bm_pnum)?;
        let buf = Arc::make_mut(&mut bm);
        let bit = pnum as usize % bpp;
        let off = BITMAP_HDR + bit / 8;
        if on {
            buf[off] |= 1 << (bit % 8);
        } else {
            buf[off] &= !(1 << (bit % 8));
        }
        ch.write_page(bm_pnum, bm)
    }

    fn alloc_map_page(&self, ch: &PageChannel) -> Result<u32> {
        Ok(match self.mode {
            AllocMode::Normal => ch.alloc_page()?,
            AllocMode::Extend => ch.extend(),
        })
    }

    /// Free the indirection and bitmap pages of a reference-encoded map
    /// ( dropping the owner ).
    pub fn free_meta_pages(&self, ch: &PageChannel) -> Result<()> {
        if let MapKind::Reference { ref_page } = self.kind.get() {
            let rp = ch.read_page(ref_page)?;
            let count = util::getu16(&rp, 2) as usize;
            for k in 0..count {
                let bm = util::getu32(&rp, REF_HDR + k * 4);
                if bm != 0 {
                    ch.free_page(bm)?;
                }
            }
            ch.free_page(ref_page)?;
        }
        Ok(())
    }

    /// Convert the map to the reference encoding, carrying the current set.
    fn promote(&self, ch: &PageChannel) -> Result<()> {
        let ref_page = self.alloc_map_page(ch)?;
        let mut rp = vec![0u8; ch.page_size()];
        rp[0] = PageType::UsageMap as u8;
        ch.write_page(ref_page, Arc::new(rp))?;

        let mut data = ch.read_page(self.owner.page)?;
        let buf = Arc::make_mut(&mut data);
        let region = &mut buf[self.owner.off..];
        region[0] = 1;
        util::setu32(region, 1, ref_page);
        for b in region[INLINE_HDR..].iter_mut() {
            *b = 0;
        }
        ch.write_page(self.owner.page, data)?;
        self.kind.set(MapKind::Reference { ref_page });

        let all: Vec<u32> = self.pages.borrow().iter().copied().collect();
        for pnum in all {
            self.flip_reference(ch, ref_page, pnum, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> PageChannel {
        PageChannel::create(MemFile::new(), Box::new(PlainCodec), Version::V2010).unwrap()
    }

    fn new_map(ch: &PageChannel) -> UsageMap {
        ch.start_write().unwrap();
        let (pnum, mut buf) = ch.alloc_typed(PageType::UsageMap).unwrap();
        UsageMap::init_inline(&mut buf[2..], 0);
        ch.write_page(pnum, Arc::new(buf)).unwrap();
        ch.finish_write().unwrap();
        UsageMap::load(ch, MapOwner::new(pnum, 2), AllocMode::Normal).unwrap()
    }

    #[test]
    fn add_remove_contains() {
        let ch = channel();
        let map = new_map(&ch);
        ch.start_write().unwrap();
        map.add(&ch, 5).unwrap();
        map.add(&ch, 9).unwrap();
        assert!(map.contains(5));
        assert!(!map.contains(6));
        map.remove(&ch, 5).unwrap();
        assert!(!map.contains(5));
        assert_eq!(map.snapshot(), vec![9]);
        ch.finish_write().unwrap();
    }

    #[test]
    fn survives_reload() {
        let ch = channel();
        let map = new_map(&ch);
        let owner = map.owner();
        ch.start_write().unwrap();
        for p in [3u32, 11, 200, 1000] {
            map.add(&ch, p).unwrap();
        }
        ch.finish_write().unwrap();
        let map2 = UsageMap::load(&ch, owner, AllocMode::Normal).unwrap();
        assert_eq!(map2.snapshot(), vec![3, 11, 200, 1000]);
    }

    #[test]
    fn promotes_to_reference() {
        let ch = channel();
        let map = new_map(&ch);
        let owner = map.owner();
        let cap = (ch.page_size() - 2 - 5) * 8;
        ch.start_write().unwrap();
        map.add(&ch, 7).unwrap();
        // Past the inline coverage: forces the reference encoding.
        let big = (cap + 10) as u32;
        map.add(&ch, big).unwrap();
        ch.finish_write().unwrap();
        assert!(map.contains(7));
        assert!(map.contains(big));
        let map2 = UsageMap::load(&ch, owner, AllocMode::Normal).unwrap();
        assert_eq!(map2.snapshot(), vec![7, big]);
    }

    #[test]
    fn snapshot_is_stable_under_mutation() {
        let ch = channel();
        let map = new_map(&ch);
        ch.start_write().unwrap();
        map.add(&ch, 1).unwrap();
        map.add(&ch, 2).unwrap();
        let snap = map.snapshot();
        map.remove(&ch, 2).unwrap();
        assert_eq!(snap, vec![1, 2]);
        assert_eq!(map.snapshot(), vec![1]);
        ch.finish_write().unwrap();
    }
}
