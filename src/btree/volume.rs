use core::fmt;
use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bit_vec::BitVec;
use crossbeam::queue::SegQueue;
use log::debug;

use super::{
    buffer_pool::BufferPool,
    page::{LongRecordPointer, Page, PageCategory, PageId, Slot},
    tree::Tree,
};
use crate::{
    database::Database,
    error::{DbError, ErrorKind},
    types::{ConcurrentHashMap, DbResult},
    utils::HandyRwLock,
};

/// How the pages of a pending garbage chain are linked together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLink {
    /// Tree pages freed by a join, linked by right-sibling pointers.
    Sibling,
    /// Long-record pages, linked by the long-next pointer.
    Long,
}

/// A run of freed pages waiting for the deallocation sweep: walk from
/// `head` following `link` until `stop` (exclusive) or the end.
#[derive(Debug, Clone, Copy)]
pub struct GarbageChain {
    pub head: PageId,
    pub stop: Option<PageId>,
    pub link: ChainLink,
}

#[derive(Default)]
pub struct VolumeStats {
    pub fetches: AtomicU64,
    pub stores: AtomicU64,
    pub removes: AtomicU64,
    pub traversals: AtomicU64,
    pub pages_allocated: AtomicU64,
    pub pages_freed: AtomicU64,
}

impl VolumeStats {
    pub fn live_pages(&self) -> u64 {
        self.pages_allocated.load(Ordering::Relaxed)
            - self.pages_freed.load(Ordering::Relaxed)
    }
}

/// One database file: page allocator, directory of named trees,
/// garbage-chain reclamation, statistics. Page images are written out
/// on `flush`; while the process runs, the buffer pool holds every
/// live page.
pub struct Volume {
    id: u32,
    path: String,
    file: Mutex<File>,
    read_only: bool,
    closed: AtomicBool,

    next_page: AtomicU64,
    free_pages: Mutex<Vec<u64>>,
    page_map: Mutex<BitVec>,

    garbage: SegQueue<GarbageChain>,

    directory: ConcurrentHashMap<String, Arc<Tree>>,
    pub stats: VolumeStats,
}

impl Volume {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Arc<Volume>, DbError> {
        Self::create_internal(path, false)
    }

    pub fn create_read_only<P: AsRef<Path>>(path: P) -> Result<Arc<Volume>, DbError> {
        Self::create_internal(path, true)
    }

    fn create_internal<P: AsRef<Path>>(
        path: P,
        read_only: bool,
    ) -> Result<Arc<Volume>, DbError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let volume = Arc::new(Self {
            id: Database::next_volume_id(),
            path: path_str,
            file: Mutex::new(file),
            read_only,
            closed: AtomicBool::new(false),
            // page index 0 is reserved so that it can never alias a
            // real page in a chain terminator
            next_page: AtomicU64::new(1),
            free_pages: Mutex::new(Vec::new()),
            page_map: Mutex::new(BitVec::from_elem(64, false)),
            garbage: SegQueue::new(),
            directory: ConcurrentHashMap::new(),
            stats: VolumeStats::default(),
        });
        Database::register_volume(volume.clone());
        debug!("volume {} created at {}", volume.id, volume.path);
        Ok(volume)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn check_writable(&self) -> DbResult {
        self.check_open()?;
        if self.read_only {
            return Err(DbError::new(
                ErrorKind::ReadOnly,
                &format!("volume {} is read-only", self.path),
            ));
        }
        Ok(())
    }

    pub fn check_open(&self) -> DbResult {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::new(
                ErrorKind::VolumeClosed,
                &format!("volume {} is closed", self.path),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // page allocation

    fn alloc_index(&self) -> u64 {
        let index = match self.free_pages.lock().unwrap().pop() {
            Some(index) => index,
            None => self.next_page.fetch_add(1, Ordering::AcqRel),
        };

        let mut map = self.page_map.lock().unwrap();
        if map.len() <= index as usize {
            map.grow(index as usize + 64, false);
        }
        map.set(index as usize, true);

        self.stats.pages_allocated.fetch_add(1, Ordering::Relaxed);
        index
    }

    /// Allocate a page of the given type, exclusively claimed by
    /// `owner` before it becomes visible in the pool.
    pub fn alloc_page(
        &self,
        owner: u64,
        category: PageCategory,
    ) -> Result<crate::types::Pod<Page>, DbError> {
        let pid = PageId::new(self.id, self.alloc_index());
        Database::buffer_pool().install_claimed(owner, Page::new(pid, category))
    }

    /// Allocate a page that is not yet reachable from any tree and
    /// needs no claim (fresh roots, long-record chains).
    pub fn alloc_unclaimed_page(&self, category: PageCategory) -> crate::types::Pod<Page> {
        let pid = PageId::new(self.id, self.alloc_index());
        Database::buffer_pool().install(Page::new(pid, category))
    }

    pub fn free_page(&self, pid: PageId) {
        debug_assert_eq!(pid.volume_id, self.id);
        {
            let mut map = self.page_map.lock().unwrap();
            if (pid.index as usize) < map.len() {
                map.set(pid.index as usize, false);
            }
        }
        self.free_pages.lock().unwrap().push(pid.index);
        self.stats.pages_freed.fetch_add(1, Ordering::Relaxed);
        Database::buffer_pool().discard(&pid);
    }

    // ------------------------------------------------------------------
    // garbage chains

    pub fn record_garbage_chain(&self, chain: GarbageChain) {
        debug!("volume {} recording garbage chain {:?}", self.id, chain);
        self.garbage.push(chain);
    }

    /// Free every page of every recorded chain. The chains are already
    /// unreachable from any tree when this runs, so no claims are
    /// needed.
    pub fn sweep_garbage(&self) {
        while let Some(chain) = self.garbage.pop() {
            let mut next = Some(chain.head);
            let mut hops = 0;
            while let Some(pid) = next {
                if Some(pid) == chain.stop {
                    break;
                }
                // a destroyed chain bounded by the volume's own pages
                if hops > self.next_page.load(Ordering::Acquire) {
                    break;
                }
                hops += 1;

                next = match Database::buffer_pool().peek(&pid) {
                    Some(pod) => {
                        let page = pod.rl();
                        match chain.link {
                            ChainLink::Sibling => page.right_sibling(),
                            ChainLink::Long => page.long_next(),
                        }
                    }
                    None => None,
                };
                self.free_page(pid);
            }
        }
    }

    /// Collect the long-record pointers referenced by records
    /// `[from, to)` of a page, so their chains can be reclaimed after
    /// the records are removed.
    pub fn harvest_long_records(
        page: &Page,
        from: usize,
        to: usize,
        out: &mut Vec<LongRecordPointer>,
    ) {
        for record in &page.records()[from..to] {
            if let Slot::Long(ptr) = &record.slot {
                out.push(*ptr);
            }
        }
    }

    // ------------------------------------------------------------------
    // directory of trees

    pub fn get_tree(&self, name: &str, create: bool) -> Result<Arc<Tree>, DbError> {
        self.check_open()?;
        if let Some(tree) = self.directory.get(&name.to_string()) {
            return Ok(tree);
        }
        if !create {
            return Err(DbError::new(
                ErrorKind::TreeNotFound,
                &format!("no tree {} in volume {}", name, self.path),
            ));
        }
        self.check_writable()?;

        self.directory.get_or_insert(&name.to_string(), |_| {
            let root = self.alloc_unclaimed_page(PageCategory::Data);
            let tree = Arc::new(Tree::new(name, self.id, root.rl().pid()));
            self.update_directory_tree(&tree)?;
            Ok(tree)
        })
    }

    pub fn tree_names(&self) -> Vec<String> {
        self.directory.keys()
    }

    pub(crate) fn drop_directory_entry(&self, name: &str) {
        self.directory.remove(&name.to_string());
    }

    /// Journal a directory change for the tree.
    pub fn update_directory_tree(&self, tree: &Tree) -> DbResult {
        Database::mut_log_manager().log_tree("update", tree.name())
    }

    // ------------------------------------------------------------------
    // flush

    /// Write the image of every resident page of this volume.
    pub fn flush(&self) -> DbResult {
        let page_size = BufferPool::get_page_size();
        let mut file = self.file.lock().unwrap();
        for pid in Database::buffer_pool().pages_of_volume(self.id) {
            if let Some(pod) = Database::buffer_pool().peek(&pid) {
                let mut page = pod.wl();
                if !page.is_dirty() {
                    continue;
                }
                let mut image = page.encode();
                image.resize(page_size, 0);
                file.seek(SeekFrom::Start(pid.index * page_size as u64))?;
                file.write_all(&image)?;
                page.clear_dirty();
            }
        }
        file.flush()?;
        Ok(())
    }

    pub fn close(&self) -> DbResult {
        if !self.read_only {
            self.flush()?;
        }
        self.closed.store(true, Ordering::Release);
        Database::unregister_volume(self.id);
        Ok(())
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<volume {} id {} pages {}>",
            self.path,
            self.id,
            self.stats.live_pages()
        )
    }
}
