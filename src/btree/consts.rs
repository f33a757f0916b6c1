/// A tree never grows deeper than this; a deeper descent means a cycle
/// in the index pages.
pub const MAX_TREE_DEPTH: usize = 20;

/// Bound on the walk-right loop. A search hopping more than this many
/// siblings on one level is chasing a corrupted chain.
pub const MAX_WALK_RIGHT: usize = 50;

/// Bounded retries for the benign race where pruning reorders an MVV
/// container between the visitor pass and the version append.
pub const VERSIONS_OUT_OF_ORDER_RETRIES: usize = 3;

/// Bytes reserved per page for the on-disk header.
pub const PAGE_HEADER_BYTES: usize = 64;

/// Accounting overhead per key-block (slot table entry, lengths).
pub const RECORD_OVERHEAD: usize = 16;

/// Header of a long-record chain page; the rest is payload.
pub const LONG_PAGE_HEADER_BYTES: usize = 32;

/// Largest encoded key accepted for a given page size; a data page must
/// be able to hold several records.
pub fn max_key_len(page_size: usize) -> usize {
    page_size / 8
}

/// Values whose encoded size exceeds this are stored as long-record
/// chains instead of inline.
pub fn inline_value_limit(page_size: usize) -> usize {
    page_size / 4
}

/// Payload bytes carried by one long-record page.
pub fn long_record_chunk(page_size: usize) -> usize {
    page_size - LONG_PAGE_HEADER_BYTES
}
