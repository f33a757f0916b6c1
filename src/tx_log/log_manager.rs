use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
};

use log::debug;

use crate::{error::DbError, key::Key, transaction::Transaction, types::DbResult};

// record type tags
const RECORD_START: u8 = 0x01;
const RECORD_COMMIT: u8 = 0x02;
const RECORD_ABORT: u8 = 0x03;
const RECORD_STORE: u8 = 0x10;
const RECORD_REMOVE: u8 = 0x11;
const RECORD_TREE: u8 = 0x12;

/// Append-only journal. The tree core writes one record per durable
/// operation; recovery replay is the concern of a separate component
/// and only needs the records to be self-describing.
pub struct LogManager {
    writer: BufWriter<File>,
    records: u64,
}

impl LogManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("cannot open journal");
        Self {
            writer: BufWriter::new(file),
            records: 0,
        }
    }

    fn append(&mut self, tag: u8, payload: &[u8]) -> DbResult {
        self.writer.write_all(&[tag]).map_err(DbError::from)?;
        self.writer
            .write_all(&(payload.len() as u32).to_be_bytes())
            .map_err(DbError::from)?;
        self.writer.write_all(payload).map_err(DbError::from)?;
        self.records += 1;
        Ok(())
    }

    pub fn log_start(&mut self, tx: &Transaction) -> DbResult {
        self.append(RECORD_START, &tx.start_ts().to_be_bytes())
    }

    pub fn log_commit(&mut self, tx: &Transaction) -> DbResult {
        self.append(RECORD_COMMIT, &tx.start_ts().to_be_bytes())?;
        self.writer.flush().map_err(DbError::from)
    }

    pub fn log_abort(&mut self, tx: &Transaction) -> DbResult {
        self.append(RECORD_ABORT, &tx.start_ts().to_be_bytes())
    }

    pub fn log_store(&mut self, tree: &str, key: &Key, value_len: usize) -> DbResult {
        let mut payload = Vec::with_capacity(tree.len() + key.len() + 12);
        payload.extend_from_slice(&(tree.len() as u16).to_be_bytes());
        payload.extend_from_slice(tree.as_bytes());
        payload.extend_from_slice(&(key.len() as u16).to_be_bytes());
        payload.extend_from_slice(key.encoded());
        payload.extend_from_slice(&(value_len as u32).to_be_bytes());
        self.append(RECORD_STORE, &payload)
    }

    pub fn log_remove(&mut self, tree: &str, key1: &Key, key2: &Key) -> DbResult {
        let mut payload = Vec::with_capacity(tree.len() + key1.len() + key2.len() + 8);
        payload.extend_from_slice(&(tree.len() as u16).to_be_bytes());
        payload.extend_from_slice(tree.as_bytes());
        payload.extend_from_slice(&(key1.len() as u16).to_be_bytes());
        payload.extend_from_slice(key1.encoded());
        payload.extend_from_slice(&(key2.len() as u16).to_be_bytes());
        payload.extend_from_slice(key2.encoded());
        self.append(RECORD_REMOVE, &payload)
    }

    pub fn log_tree(&mut self, op: &str, tree: &str) -> DbResult {
        debug!("journal tree record: {} {}", op, tree);
        let mut payload = Vec::with_capacity(op.len() + tree.len() + 2);
        payload.push(op.len() as u8);
        payload.extend_from_slice(op.as_bytes());
        payload.extend_from_slice(tree.as_bytes());
        self.append(RECORD_TREE, &payload)
    }

    /// Gate point for callers producing journal records faster than the
    /// journal can drain. The current journal never pushes back.
    pub fn throttle(&self) {}

    pub fn record_count(&self) -> u64 {
        self.records
    }
}
