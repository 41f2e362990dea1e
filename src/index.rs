use crate::*;

/// One indexed column: table ordinal, type, direction.
#[derive(Clone, Debug)]
pub struct IndexColumn {
    /// Column ordinal in the owning table.
    pub col: usize,
    ///
    pub typ: DataType,
    ///
    pub descending: bool,
}

/// Foreign key reference carried by a referential-integrity index.
#[derive(Clone, Copy, Debug)]
pub struct ForeignKeyRef {
    /// Object id of the referenced ( parent ) table.
    pub parent_table: i32,
    /// Ordinal of the referenced IndexData within the parent table.
    pub parent_index: usize,
}

/// A logical index: a named view over a shared [IndexData].
#[derive(Clone, Debug)]
pub struct LogicalIndex {
    ///
    pub name: String,
    /// Ordinal of the backing IndexData within the owning table.
    pub data_ord: usize,
    ///
    pub unique: bool,
    /// Rows whose indexed columns are all null are not entered.
    pub ignore_nulls: bool,
    ///
    pub primary: bool,
    ///
    pub foreign_key: Option<ForeignKeyRef>,
}

/// The persistent B-tree shared by the logical indexes over one column set.
///
/// Entries are `( key bytes, row id )` pairs ordered by the concatenation
/// of the order-preserving column encodings, with the row id as the final
/// tie breaker. Node pages store separators of the same concatenated form,
/// so every comparison is a plain byte compare.
pub struct IndexData {
    /// Identity for savepoint checks: table id in the high bits, data
    /// ordinal in the low.
    pub id: u64,
    /// Root page. Stable for the life of the index ( splits grow downward ).
    pub root: Cell<u32>,
    ///
    pub cols: Vec<IndexColumn>,
    /// Any owning logical index is unique.
    pub unique: Cell<bool>,
    /// Every owning logical index ignores all-null keys.
    pub ignore_nulls: Cell<bool>,
    /// Name of the primary logical index, used in error reports.
    pub name: RefCell<String>,
}

///
pub type IndexDataPtr = Rc<IndexData>;

// Leaf page: [tag][unused][prev u32][next u32][count u16] entries...
//   entry: [klen u16][key][page u32][slot u16]
// Node page: [tag][unused][first_child u32][count u16] entries...
//   entry: [klen u16][key( incl rowid suffix )][child u32]
const LEAF_HDR: usize = 12;
const NODE_HDR: usize = 8;

struct LeafPage {
    prev: u32,
    next: u32,
    entries: Vec<Entry>,
}

#[derive(Clone)]
struct Entry {
    key: Vec<u8>,
    rowid: RowId,
}

impl Entry {
    /// Key with the row id appended, the internal comparison domain.
    fn full(&self) -> Vec<u8> {
        let mut v = self.key.clone();
        v.extend_from_slice(&self.rowid.to_be6());
        v
    }
}

struct NodePage {
    first_child: u32,
    entries: Vec<(Vec<u8>, u32)>,
}

impl LeafPage {
    fn load(data: &[u8], pnum: u32) -> Result<LeafPage> {
        expect_page(data, pnum, PageType::IndexLeaf)?;
        let prev = util::getu32(data, 2);
        let next = util::getu32(data, 6);
        let count = util::getu16(data, 10) as usize;
        let mut entries = Vec::with_capacity(count);
        let mut off = LEAF_HDR;
        for _ in 0..count {
            if off + 2 > data.len() {
                return Err(Error::corrupt(format!("leaf page {} overflows", pnum)));
            }
            let klen = util::getu16(data, off) as usize;
            off += 2;
            if off + klen + 6 > data.len() {
                return Err(Error::corrupt(format!("leaf page {} overflows", pnum)));
            }
            let key = data[off..off + klen].to_vec();
            off += klen;
            let rowid = RowId::new(util::getu32(data, off), util::getu16(data, off + 4));
            off += 6;
            entries.push(Entry { key, rowid });
        }
        Ok(LeafPage {
            prev,
            next,
            entries,
        })
    }

    fn save(&self, page_size: usize) -> Data {
        let mut data = vec![0u8; page_size];
        data[0] = PageType::IndexLeaf as u8;
        util::setu32(&mut data, 2, self.prev);
        util::setu32(&mut data, 6, self.next);
        util::setu16(&mut data, 10, self.entries.len() as u16);
        let mut off = LEAF_HDR;
        for e in &self.entries {
            util::setu16(&mut data, off, e.key.len() as u16);
            off += 2;
            data[off..off + e.key.len()].copy_from_slice(&e.key);
            off += e.key.len();
            util::setu32(&mut data, off, e.rowid.page);
            util::setu16(&mut data, off + 4, e.rowid.slot);
            off += 6;
        }
        Arc::new(data)
    }

    fn used(&self) -> usize {
        LEAF_HDR + self.entries.iter().map(|e| 8 + e.key.len()).sum::<usize>()
    }
}

impl NodePage {
    fn load(data: &[u8], pnum: u32) -> Result<NodePage> {
        expect_page(data, pnum, PageType::IndexNode)?;
        let first_child = util::getu32(data, 2);
        let count = util::getu16(data, 6) as usize;
        let mut entries = Vec::with_capacity(count);
        let mut off = NODE_HDR;
        for _ in 0..count {
            if off + 2 > data.len() {
                return Err(Error::corrupt(format!("node page {} overflows", pnum)));
            }
            let klen = util::getu16(data, off) as usize;
            off += 2;
            if off + klen + 4 > data.len() {
                return Err(Error::corrupt(format!("node page {} overflows", pnum)));
            }
            let key = data[off..off + klen].to_vec();
            off += klen;
            let child = util::getu32(data, off);
            off += 4;
            entries.push((key, child));
        }
        Ok(NodePage {
            first_child,
            entries,
        })
    }

    fn save(&self, page_size: usize) -> Data {
        let mut data = vec![0u8; page_size];
        data[0] = PageType::IndexNode as u8;
        util::setu32(&mut data, 2, self.first_child);
        util::setu16(&mut data, 6, self.entries.len() as u16);
        let mut off = NODE_HDR;
        for (key, child) in &self.entries {
            util::setu16(&mut data, off, key.len() as u16);
            off += 2;
            data[off..off + key.len()].copy_from_slice(key);
            off += key.len();
            util::setu32(&mut data, off, *child);
            off += 4;
        }
        Arc::new(data)
    }

    fn used(&self) -> usize {
        NODE_HDR
            + self
                .entries
                .iter()
                .map(|(k, _)| 6 + k.len())
                .sum::<usize>()
    }

    /// Index of the child that covers the probe: entries hold the first
    /// full key of their subtree, first_child covers everything below.
    fn child_for(&self, probe: &[u8]) -> usize {
        let mut i = 0;
        while i < self.entries.len() && self.entries[i].0.as_slice() <= probe {
            i += 1;
        }
        i // 0 = first_child, i>0 = entries[i-1].1
    }

    fn child_page(&self, i: usize) -> u32 {
        if i == 0 {
            self.first_child
        } else {
            self.entries[i - 1].1
        }
    }
}

/// A position within the tree: leaf page plus entry index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IndexPos {
    ///
    pub leaf: u32,
    ///
    pub idx: usize,
}

impl IndexData {
    ///
    pub fn new(id: u64, root: u32, cols: Vec<IndexColumn>) -> IndexData {
        IndexData {
            id,
            root: Cell::new(root),
            cols,
            unique: Cell::new(false),
            ignore_nulls: Cell::new(false),
            name: RefCell::new(String::new()),
        }
    }

    /// Allocate and write an empty root leaf, returning its page number.
    pub fn create_root(ch: &PageChannel) -> Result<u32> {
        let pnum = ch.alloc_page()?;
        let leaf = LeafPage {
            prev: 0,
            next: 0,
            entries: Vec::new(),
        };
        ch.write_page(pnum, leaf.save(ch.page_size()))?;
        Ok(pnum)
    }

    /// Build the concatenated key for a full table row. None when every
    /// indexed column is null and the index ignores nulls.
    pub fn key_from_row(&self, row: &[Value]) -> Result<Option<Vec<u8>>> {
        if self.ignore_nulls.get() && self.cols.iter().all(|c| row[c.col].is_null()) {
            return Ok(None);
        }
        let mut key = Vec::new();
        for c in &self.cols {
            key.extend(codec::encode_index_key(&row[c.col], c.typ, c.descending)?);
        }
        Ok(Some(key))
    }

    /// Build a ( possibly partial ) key from values in index-column order.
    pub fn key_from_values(&self, vals: &[Value]) -> Result<Vec<u8>> {
        if vals.is_empty() || vals.len() > self.cols.len() {
            return Err(Error::InvalidArgument(format!(
                "{} key components supplied, index has {} columns",
                vals.len(),
                self.cols.len()
            )));
        }
        let mut key = Vec::new();
        for (v, c) in vals.iter().zip(self.cols.iter()) {
            key.extend(codec::encode_index_key(v, c.typ, c.descending)?);
        }
        Ok(key)
    }

    fn load_leaf(&self, ch: &PageChannel, pnum: u32) -> Result<LeafPage> {
        LeafPage::load(&ch.read_page(pnum)?, pnum)
    }

    /// Descend to the leaf that would contain the probe, collecting the
    /// path of ( node page number, node, child index ).
    fn descend(&self, ch: &PageChannel, probe: &[u8]) -> Result<(u32, Vec<(u32, NodePage, usize)>)> {
        let mut path = Vec::new();
        let mut pnum = self.root.get();
        loop {
            let data = ch.read_page(pnum)?;
            match PageType::from_tag(data[0], pnum)? {
                PageType::IndexLeaf => return Ok((pnum, path)),
                PageType::IndexNode => {
                    let node = NodePage::load(&data, pnum)?;
                    let ci = node.child_for(probe);
                    let child = node.child_page(ci);
                    path.push((pnum, node, ci));
                    pnum = child;
                }
                t => {
                    return Err(Error::corrupt(format!(
                        "page {} of type {:?} inside index",
                        pnum, t
                    )))
                }
            }
        }
    }

    /// Leftmost ( true ) or rightmost ( false ) leaf of the tree.
    fn edge_leaf(&self, ch: &PageChannel, leftmost: bool) -> Result<u32> {
        let mut pnum = self.root.get();
        loop {
            let data = ch.read_page(pnum)?;
            match PageType::from_tag(data[0], pnum)? {
                PageType::IndexLeaf => return Ok(pnum),
                PageType::IndexNode => {
                    let node = NodePage::load(&data, pnum)?;
                    pnum = if leftmost || node.entries.is_empty() {
                        node.first_child
                    } else {
                        node.entries[node.entries.len() - 1].1
                    };
                }
                t => {
                    return Err(Error::corrupt(format!(
                        "page {} of type {:?} inside index",
                        pnum, t
                    )))
                }
            }
        }
    }

    /// Position at the first entry whose ( key, row id ) is >= the probe.
    pub fn seek_ge(&self, ch: &PageChannel, key: &[u8], rowid: RowId) -> Result<Option<IndexPos>> {
        let mut probe = key.to_vec();
        probe.extend_from_slice(&rowid.to_be6());
        let (mut pnum, _path) = self.descend(ch, &probe)?;
        loop {
            let leaf = self.load_leaf(ch, pnum)?;
            for (i, e) in leaf.entries.iter().enumerate() {
                if e.full().as_slice() >= probe.as_slice() {
                    return Ok(Some(IndexPos { leaf: pnum, idx: i }));
                }
            }
            if leaf.next == 0 {
                return Ok(None);
            }
            pnum = leaf.next;
        }
    }

    /// Position at the last entry whose ( key, row id ) is < the probe.
    pub fn seek_lt(&self, ch: &PageChannel, key: &[u8], rowid: RowId) -> Result<Option<IndexPos>> {
        let mut probe = key.to_vec();
        probe.extend_from_slice(&rowid.to_be6());
        let (mut pnum, _path) = self.descend(ch, &probe)?;
        loop {
            let leaf = self.load_leaf(ch, pnum)?;
            let mut found = None;
            for (i, e) in leaf.entries.iter().enumerate() {
                if e.full().as_slice() < probe.as_slice() {
                    found = Some(i);
                } else {
                    break;
                }
            }
            if let Some(i) = found {
                return Ok(Some(IndexPos { leaf: pnum, idx: i }));
            }
            if leaf.prev == 0 {
                return Ok(None);
            }
            pnum = leaf.prev;
        }
    }

    /// Entry at a position, if the position is still valid.
    fn entry_at(&self, ch: &PageChannel, pos: IndexPos) -> Result<Option<(Vec<u8>, RowId)>> {
        let data = ch.read_page(pos.leaf)?;
        if PageType::from_tag(data[0], pos.leaf)? != PageType::IndexLeaf {
            return Ok(None);
        }
        let leaf = LeafPage::load(&data, pos.leaf)?;
        Ok(leaf
            .entries
            .get(pos.idx)
            .map(|e| (e.key.clone(), e.rowid)))
    }

    /// Whether a live entry with exactly these key bytes exists.
    pub fn contains_key(&self, ch: &PageChannel, key: &[u8]) -> Result<bool> {
        if let Some(pos) = self.seek_ge(ch, key, RowId::ZERO)? {
            if let Some((k, _)) = self.entry_at(ch, pos)? {
                return Ok(k == key);
            }
        }
        Ok(false)
    }

    /// Insert an entry. Fails with UniquenessViolation when the index is
    /// unique and the key collides with a live entry.
    pub fn insert(&self, ch: &PageChannel, key: &[u8], rowid: RowId) -> Result<()> {
        // A leaf must be able to hold at least two entries.
        if LEAF_HDR + 2 * (8 + key.len() + 6) > ch.page_size() {
            return Err(Error::invalid("", "index entry too long"));
        }
        if self.unique.get() && self.contains_key(ch, key)? {
            return Err(Error::UniquenessViolation {
                index: self.name.borrow().clone(),
            });
        }
        let entry = Entry {
            key: key.to_vec(),
            rowid,
        };
        let probe = entry.full();
        let (pnum, path) = self.descend(ch, &probe)?;
        let mut leaf = self.load_leaf(ch, pnum)?;
        let at = leaf
            .entries
            .iter()
            .position(|e| e.full().as_slice() >= probe.as_slice())
            .unwrap_or(leaf.entries.len());
        leaf.entries.insert(at, entry);
        if leaf.used() <= ch.page_size() {
            ch.write_page(pnum, leaf.save(ch.page_size()))?;
            return Ok(());
        }
        self.split_leaf(ch, pnum, leaf, path)
    }

    /// Split an overfull leaf midway, promoting the first key of the new
    /// right sibling.
    fn split_leaf(
        &self,
        ch: &PageChannel,
        pnum: u32,
        mut leaf: LeafPage,
        path: Vec<(u32, NodePage, usize)>,
    ) -> Result<()> {
        let mid = leaf.entries.len() / 2;
        let right_entries = leaf.entries.split_off(mid);
        let sep = right_entries[0].full();
        let ps = ch.page_size();

        if path.is_empty() {
            // The root is a leaf: it stays put as a node, both halves get
            // fresh pages.
            let left_p = ch.alloc_page()?;
            let right_p = ch.alloc_page()?;
            let left = LeafPage {
                prev: 0,
                next: right_p,
                entries: leaf.entries,
            };
            let right = LeafPage {
                prev: left_p,
                next: 0,
                entries: right_entries,
            };
            ch.write_page(left_p, left.save(ps))?;
            ch.write_page(right_p, right.save(ps))?;
            let root = NodePage {
                first_child: left_p,
                entries: vec![(sep, right_p)],
            };
            ch.write_page(pnum, root.save(ps))?;
            return Ok(());
        }

        let right_p = ch.alloc_page()?;
        let old_next = leaf.next;
        leaf.next = right_p;
        let right = LeafPage {
            prev: pnum,
            next: old_next,
            entries: right_entries,
        };
        if old_next != 0 {
            let mut nxt = self.load_leaf(ch, old_next)?;
            nxt.prev = right_p;
            ch.write_page(old_next, nxt.save(ps))?;
        }
        ch.write_page(pnum, leaf.save(ps))?;
        ch.write_page(right_p, right.save(ps))?;
        self.insert_into_parent(ch, path, sep, right_p)
    }

    /// Insert a separator into the parent chain, splitting nodes as needed.
    fn insert_into_parent(
        &self,
        ch: &PageChannel,
        mut path: Vec<(u32, NodePage, usize)>,
        sep: Vec<u8>,
        child: u32,
    ) -> Result<()> {
        let ps = ch.page_size();
        let (pnum, mut node, ci) = match path.pop() {
            Some(x) => x,
            None => unreachable!(),
        };
        node.entries.insert(ci, (sep, child));
        if node.used() <= ps {
            ch.write_page(pnum, node.save(ps))?;
            return Ok(());
        }
        // Split the node: the middle entry's key promotes, its child
        // becomes the right node's first child.
        let mid = node.entries.len() / 2;
        let mut right_entries = node.entries.split_off(mid);
        let (up_key, up_child) = right_entries.remove(0);
        let right = NodePage {
            first_child: up_child,
            entries: right_entries,
        };
        if path.is_empty() {
            // Root node split: root page number stays stable.
            let left_p = ch.alloc_page()?;
            let right_p = ch.alloc_page()?;
            let left = NodePage {
                first_child: node.first_child,
                entries: node.entries,
            };
            ch.write_page(left_p, left.save(ps))?;
            ch.write_page(right_p, right.save(ps))?;
            let root = NodePage {
                first_child: left_p,
                entries: vec![(up_key, right_p)],
            };
            ch.write_page(pnum, root.save(ps))?;
            return Ok(());
        }
        let right_p = ch.alloc_page()?;
        ch.write_page(pnum, node.save(ps))?;
        ch.write_page(right_p, right.save(ps))?;
        self.insert_into_parent(ch, path, up_key, right_p)
    }

    /// Remove the entry with exactly this key and row id. Empty leaves are
    /// tolerated; no merging happens.
    pub fn delete(&self, ch: &PageChannel, key: &[u8], rowid: RowId) -> Result<()> {
        let mut probe = key.to_vec();
        probe.extend_from_slice(&rowid.to_be6());
        let (mut pnum, _path) = self.descend(ch, &probe)?;
        loop {
            let mut leaf = self.load_leaf(ch, pnum)?;
            if let Some(i) = leaf
                .entries
                .iter()
                .position(|e| e.key == key && e.rowid == rowid)
            {
                leaf.entries.remove(i);
                ch.write_page(pnum, leaf.save(ch.page_size()))?;
                return Ok(());
            }
            // Equal keys may continue on the next leaf.
            if leaf.next == 0 || leaf.entries.iter().all(|e| e.full().as_slice() > probe.as_slice())
            {
                return Err(Error::corrupt(format!(
                    "missing index entry for row {:?}",
                    rowid
                )));
            }
            pnum = leaf.next;
        }
    }

    /// Count live entries by walking the leaf chain.
    pub fn entry_count(&self, ch: &PageChannel) -> Result<u64> {
        let mut pnum = self.edge_leaf(ch, true)?;
        let mut n = 0u64;
        loop {
            let leaf = self.load_leaf(ch, pnum)?;
            n += leaf.entries.len() as u64;
            if leaf.next == 0 {
                return Ok(n);
            }
            pnum = leaf.next;
        }
    }

    /// Free every page of the tree ( dropping the index ).
    pub fn free_pages(&self, ch: &PageChannel) -> Result<()> {
        self.free_page_rec(ch, self.root.get())
    }

    fn free_page_rec(&self, ch: &PageChannel, pnum: u32) -> Result<()> {
        let data = ch.read_page(pnum)?;
        if PageType::from_tag(data[0], pnum)? == PageType::IndexNode {
            let node = NodePage::load(&data, pnum)?;
            self.free_page_rec(ch, node.first_child)?;
            for (_, child) in &node.entries {
                self.free_page_rec(ch, *child)?;
            }
        }
        ch.free_page(pnum)
    }
}

/// Cursor over an [IndexData].
///
/// State machine: BeforeFirst -> OnEntry -> AfterLast, with explicit
/// `before_first` / `after_last` transitions. Positions survive intervening
/// inserts and deletes: each step re-validates against the live page and
/// falls back to re-searching from the entry snapshot.
pub struct IndexCursor {
    ///
    pub data: IndexDataPtr,
    state: CursorPos,
}

#[derive(Clone)]
enum CursorPos {
    BeforeFirst,
    AfterLast,
    On {
        pos: IndexPos,
        key: Vec<u8>,
        rowid: RowId,
    },
}

/// Saved cursor position: a value type that can outlive its cursor.
#[derive(Clone)]
pub struct IndexSavepoint {
    source: u64,
    state: SavedPos,
}

#[derive(Clone)]
enum SavedPos {
    BeforeFirst,
    AfterLast,
    On {
        pos: IndexPos,
        key: Vec<u8>,
        rowid: RowId,
    },
}

impl IndexCursor {
    ///
    pub fn new(data: IndexDataPtr) -> IndexCursor {
        IndexCursor {
            data,
            state: CursorPos::BeforeFirst,
        }
    }

    /// Reset before the first entry.
    pub fn before_first(&mut self) {
        self.state = CursorPos::BeforeFirst;
    }

    /// Reset after the last entry.
    pub fn after_last(&mut self) {
        self.state = CursorPos::AfterLast;
    }

    /// Current ( key bytes, row id ), if positioned on an entry. The
    /// snapshot is served even if the underlying row was deleted since.
    pub fn current(&self) -> Option<(&[u8], RowId)> {
        match &self.state {
            CursorPos::On { key, rowid, .. } => Some((key.as_slice(), *rowid)),
            _ => None,
        }
    }

    fn set_on(&mut self, ch: &PageChannel, pos: IndexPos) -> Result<bool> {
        if let Some((key, rowid)) = self.data.entry_at(ch, pos)? {
            self.state = CursorPos::On { pos, key, rowid };
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Advance to the next entry. Returns false when exhausted.
    pub fn move_next(&mut self, ch: &PageChannel) -> Result<bool> {
        match self.state.clone() {
            CursorPos::AfterLast => Ok(false),
            CursorPos::BeforeFirst => {
                let mut pnum = self.data.edge_leaf(ch, true)?;
                loop {
                    let leaf = self.data.load_leaf(ch, pnum)?;
                    if !leaf.entries.is_empty() {
                        return self.set_on(ch, IndexPos { leaf: pnum, idx: 0 });
                    }
                    if leaf.next == 0 {
                        self.state = CursorPos::AfterLast;
                        return Ok(false);
                    }
                    pnum = leaf.next;
                }
            }
            CursorPos::On { pos, key, rowid } => {
                // Fast path: the cached position still names this entry.
                let live = self.data.entry_at(ch, pos)?;
                let next_from = if let Some((k, r)) = live {
                    if k == key && r == rowid {
                        Some(pos)
                    } else {
                        None
                    }
                } else {
                    None
                };
                match next_from {
                    Some(pos) => {
                        let leaf = self.data.load_leaf(ch, pos.leaf)?;
                        if pos.idx + 1 < leaf.entries.len() {
                            return self.set_on(
                                ch,
                                IndexPos {
                                    leaf: pos.leaf,
                                    idx: pos.idx + 1,
                                },
                            );
                        }
                        let mut pnum = leaf.next;
                        while pnum != 0 {
                            let nxt = self.data.load_leaf(ch, pnum)?;
                            if !nxt.entries.is_empty() {
                                return self.set_on(ch, IndexPos { leaf: pnum, idx: 0 });
                            }
                            pnum = nxt.next;
                        }
                        self.state = CursorPos::AfterLast;
                        Ok(false)
                    }
                    None => {
                        // The entry moved or is gone: continue from its
                        // successor in key order.
                        match self.data.seek_ge(ch, &key, rowid.next())? {
                            Some(pos) => self.set_on(ch, pos),
                            None => {
                                self.state = CursorPos::AfterLast;
                                Ok(false)
                            }
                        }
                    }
                }
            }
        }
    }

    /// Step back to the previous entry. Returns false when exhausted.
    pub fn move_previous(&mut self, ch: &PageChannel) -> Result<bool> {
        match self.state.clone() {
            CursorPos::BeforeFirst => Ok(false),
            CursorPos::AfterLast => {
                let mut pnum = self.data.edge_leaf(ch, false)?;
                loop {
                    let leaf = self.data.load_leaf(ch, pnum)?;
                    if !leaf.entries.is_empty() {
                        return self.set_on(
                            ch,
                            IndexPos {
                                leaf: pnum,
                                idx: leaf.entries.len() - 1,
                            },
                        );
                    }
                    if leaf.prev == 0 {
                        self.state = CursorPos::BeforeFirst;
                        return Ok(false);
                    }
                    pnum = leaf.prev;
                }
            }
            CursorPos::On { key, rowid, .. } => {
                match self.data.seek_lt(ch, &key, rowid)? {
                    Some(pos) => self.set_on(ch, pos),
                    None => {
                        self.state = CursorPos::BeforeFirst;
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Position at the first entry >= the given ( possibly partial ) key.
    pub fn seek(&mut self, ch: &PageChannel, key: &[u8]) -> Result<bool> {
        match self.data.seek_ge(ch, key, RowId::ZERO)? {
            Some(pos) => self.set_on(ch, pos),
            None => {
                self.state = CursorPos::AfterLast;
                Ok(false)
            }
        }
    }

    /// Take a savepoint of the current position.
    pub fn savepoint(&self) -> IndexSavepoint {
        IndexSavepoint {
            source: self.data.id,
            state: match &self.state {
                CursorPos::BeforeFirst => SavedPos::BeforeFirst,
                CursorPos::AfterLast => SavedPos::AfterLast,
                CursorPos::On { pos, key, rowid } => SavedPos::On {
                    pos: *pos,
                    key: key.clone(),
                    rowid: *rowid,
                },
            },
        }
    }

    /// Restore a savepoint. If the saved entry no longer exists, the cursor
    /// lands on the next surviving entry.
    pub fn restore(&mut self, ch: &PageChannel, sp: &IndexSavepoint) -> Result<()> {
        if sp.source != self.data.id {
            return Err(Error::SavepointMismatch);
        }
        match &sp.state {
            SavedPos::BeforeFirst => self.state = CursorPos::BeforeFirst,
            SavedPos::AfterLast => self.state = CursorPos::AfterLast,
            SavedPos::On { pos, key, rowid } => {
                // Valid if the node still holds the snapshot entry,
                // otherwise re-search from the key snapshot.
                if let Some((k, r)) = self.data.entry_at(ch, *pos)? {
                    if k == *key && r == *rowid {
                        self.state = CursorPos::On {
                            pos: *pos,
                            key: k,
                            rowid: r,
                        };
                        return Ok(());
                    }
                }
                match self.data.seek_ge(ch, key, *rowid)? {
                    Some(pos) => {
                        self.set_on(ch, pos)?;
                    }
                    None => self.state = CursorPos::AfterLast,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (PageChannel, IndexData) {
        let ch = PageChannel::create(MemFile::new(), Box::new(PlainCodec), Version::V2010).unwrap();
        ch.start_write().unwrap();
        let root = IndexData::create_root(&ch).unwrap();
        ch.finish_write().unwrap();
        let ix = IndexData::new(1, root, vec![IndexColumn {
            col: 0,
            typ: DataType::Long,
            descending: false,
        }]);
        *ix.name.borrow_mut() = "t".to_string();
        (ch, ix)
    }

    fn k(ix: &IndexData, v: i32) -> Vec<u8> {
        ix.key_from_values(&[Value::Int(v)]).unwrap()
    }

    #[test]
    fn insert_and_scan_sorted() {
        let (ch, ix) = setup();
        ch.start_write().unwrap();
        for (i, v) in [3, 7, 6, 1, 2].iter().enumerate() {
            ix.insert(&ch, &k(&ix, *v), RowId::new(10, i as u16)).unwrap();
        }
        ch.finish_write().unwrap();
        let data = Rc::new(ix);
        let mut c = IndexCursor::new(data.clone());
        let mut got = Vec::new();
        while c.move_next(&ch).unwrap() {
            let (_, r) = c.current().unwrap();
            got.push(r.slot);
        }
        // Slots in key order 1,2,3,6,7 -> inserted at positions 3,4,0,2,1.
        assert_eq!(got, vec![3, 4, 0, 2, 1]);
        assert_eq!(data.entry_count(&ch).unwrap(), 5);

        // Backward.
        let mut c = IndexCursor::new(data);
        c.after_last();
        let mut got = Vec::new();
        while c.move_previous(&ch).unwrap() {
            got.push(c.current().unwrap().1.slot);
        }
        assert_eq!(got, vec![1, 2, 0, 4, 3]);
    }

    #[test]
    fn unique_violation() {
        let (ch, ix) = setup();
        ix.unique.set(true);
        ch.start_write().unwrap();
        ix.insert(&ch, &k(&ix, 3), RowId::new(10, 0)).unwrap();
        let err = ix.insert(&ch, &k(&ix, 3), RowId::new(10, 1)).unwrap_err();
        assert!(matches!(err, Error::UniquenessViolation { .. }));
        ch.finish_write().unwrap();
    }

    #[test]
    fn split_many_and_order_survives() {
        let (ch, ix) = setup();
        ch.start_write().unwrap();
        let mut vals: Vec<i32> = (0..2000).collect();
        // Deterministic shuffle.
        let mut s = 12345u64;
        for i in (1..vals.len()).rev() {
            s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (s >> 33) as usize % (i + 1);
            vals.swap(i, j);
        }
        for v in &vals {
            ix.insert(&ch, &k(&ix, *v), RowId::new(5, (*v % 100) as u16))
                .unwrap();
        }
        ch.finish_write().unwrap();
        let data = Rc::new(ix);
        assert_eq!(data.entry_count(&ch).unwrap(), 2000);
        let mut c = IndexCursor::new(data.clone());
        let mut prev: Option<Vec<u8>> = None;
        let mut n = 0;
        while c.move_next(&ch).unwrap() {
            let (key, _) = c.current().unwrap();
            if let Some(p) = &prev {
                assert!(p.as_slice() < key);
            }
            prev = Some(key.to_vec());
            n += 1;
        }
        assert_eq!(n, 2000);

        // Delete everything again; empty leaves are tolerated.
        ch.start_write().unwrap();
        for v in &vals {
            data.delete(&ch, &k(&data, *v), RowId::new(5, (*v % 100) as u16))
                .unwrap();
        }
        ch.finish_write().unwrap();
        assert_eq!(data.entry_count(&ch).unwrap(), 0);
    }

    #[test]
    fn savepoint_round_trip() {
        let (ch, ix) = setup();
        ch.start_write().unwrap();
        for v in 0..10 {
            ix.insert(&ch, &k(&ix, v), RowId::new(9, v as u16)).unwrap();
        }
        ch.finish_write().unwrap();
        let data = Rc::new(ix);
        let mut c = IndexCursor::new(data.clone());
        c.move_next(&ch).unwrap();
        c.move_next(&ch).unwrap();
        let sp = c.savepoint();
        let at = c.current().unwrap().1;
        c.move_next(&ch).unwrap();
        c.restore(&ch, &sp).unwrap();
        assert_eq!(c.current().unwrap().1, at);

        // Deleted saved entry: restore lands on the next survivor.
        ch.start_write().unwrap();
        data.delete(&ch, &k(&data, 1), RowId::new(9, 1)).unwrap();
        ch.finish_write().unwrap();
        c.restore(&ch, &sp).unwrap();
        assert_eq!(c.current().unwrap().1, RowId::new(9, 2));

        // Savepoint from a different index is rejected.
        let other = Rc::new(IndexData::new(2, data.root.get(), data.cols.clone()));
        let mut c2 = IndexCursor::new(other);
        assert!(matches!(
            c2.restore(&ch, &sp),
            Err(Error::SavepointMismatch)
        ));
    }
}
