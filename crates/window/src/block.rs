//! Fixed-size row blocks and the scanners that stream them.
//!
//! One block holds up to one batch worth of sorted rows, resident in memory or
//! spilled to an Arrow IPC stream file. Build scanners leave the block in
//! place so later stages can re-read it; evaluate scanners flush it, which is
//! what keeps peak memory below the materialized group size during the output
//! phase.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use wf_common::{Result, WfError};

/// One sorted row block.
#[derive(Debug)]
pub enum RowBlock {
    /// Block held in memory.
    Resident(RecordBatch),
    /// Block written to an IPC stream file.
    Spilled {
        /// Spill file location.
        path: PathBuf,
        /// Row count, kept so offsets survive the spill.
        rows: usize,
    },
}

impl RowBlock {
    /// Rows stored in this block.
    pub fn rows(&self) -> usize {
        match self {
            RowBlock::Resident(b) => b.num_rows(),
            RowBlock::Spilled { rows, .. } => *rows,
        }
    }
}

/// Write one block to an IPC stream file, returning the bytes written.
pub fn spill_write(batch: &RecordBatch, path: &Path) -> Result<u64> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut file, &batch.schema())
            .map_err(|e| WfError::Execution(format!("spill writer init failed: {e}")))?;
        writer
            .write(batch)
            .map_err(|e| WfError::Execution(format!("spill write failed: {e}")))?;
        writer
            .finish()
            .map_err(|e| WfError::Execution(format!("spill finish failed: {e}")))?;
    }
    Ok(std::fs::metadata(path)?.len())
}

/// Read one spilled block back.
pub fn spill_read(path: &Path) -> Result<RecordBatch> {
    let file = File::open(path)?;
    let reader = arrow::ipc::reader::StreamReader::try_new(file, None)
        .map_err(|e| WfError::Execution(format!("spill reader init failed: {e}")))?;
    let schema = reader.schema();
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| WfError::Execution(format!("spill read failed: {e}")))?);
    }
    arrow::compute::concat_batches(&schema, &batches)
        .map_err(|e| WfError::Execution(format!("spill block concat failed: {e}")))
}

/// The sorted row blocks of one hash group.
#[derive(Debug)]
pub struct BlockCollection {
    schema: SchemaRef,
    slots: Vec<Mutex<Option<RowBlock>>>,
    offsets: Vec<usize>,
    count: usize,
}

impl BlockCollection {
    /// Wrap materialized blocks, computing each block's global row offset.
    pub fn new(schema: SchemaRef, blocks: Vec<RowBlock>) -> Self {
        let mut offsets = Vec::with_capacity(blocks.len());
        let mut count = 0;
        for block in &blocks {
            offsets.push(count);
            count += block.rows();
        }
        Self {
            schema,
            slots: blocks.into_iter().map(|b| Mutex::new(Some(b))).collect(),
            offsets,
            count,
        }
    }

    /// An empty collection (used by groups that never materialized).
    pub fn empty(schema: SchemaRef) -> Self {
        Self::new(schema, Vec::new())
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when there are no blocks.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total row count across blocks.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Schema shared by every block.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Open a scanner over one block. A flushing scan drops the block (and
    /// deletes its spill file); a non-flushing scan leaves it for later stages.
    pub fn scan(&self, block_idx: usize, flush: bool) -> Result<BlockScanner> {
        let mut slot = self
            .slots
            .get(block_idx)
            .ok_or_else(|| WfError::Internal(format!("block {block_idx} out of range")))?
            .lock()
            .map_err(|_| WfError::Internal("block slot lock poisoned".to_string()))?;
        let batch = match slot.as_ref() {
            None => {
                return Err(WfError::Internal(format!(
                    "block {block_idx} scanned after flush"
                )));
            }
            Some(RowBlock::Resident(b)) => b.clone(),
            Some(RowBlock::Spilled { path, .. }) => {
                let batch = spill_read(path)?;
                if flush {
                    let _ = std::fs::remove_file(path);
                }
                batch
            }
        };
        if flush {
            *slot = None;
        }
        Ok(BlockScanner {
            batch,
            base: self.offsets[block_idx],
            consumed: 0,
        })
    }

    /// Drop every remaining block and delete any spill files.
    pub fn release_all(&self) {
        for slot in &self.slots {
            if let Ok(mut slot) = slot.lock() {
                if let Some(RowBlock::Spilled { path, .. }) = slot.take() {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
    }
}

impl Drop for BlockCollection {
    fn drop(&mut self) {
        // Groups abandoned by cancellation still clean up their spill files.
        self.release_all();
    }
}

/// Streaming cursor over one row block.
#[derive(Debug)]
pub struct BlockScanner {
    batch: RecordBatch,
    base: usize,
    consumed: usize,
}

impl BlockScanner {
    /// Global row position of the next unscanned row.
    pub fn scanned(&self) -> usize {
        self.base + self.consumed
    }

    /// Rows left in this block.
    pub fn remaining(&self) -> usize {
        self.batch.num_rows() - self.consumed
    }

    /// Scan the block's rows; `None` once exhausted.
    pub fn scan(&mut self) -> Option<RecordBatch> {
        if self.consumed >= self.batch.num_rows() {
            return None;
        }
        self.consumed = self.batch.num_rows();
        Some(self.batch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    fn block(values: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(values.to_vec())) as _],
        )
        .expect("batch")
    }

    #[test]
    fn offsets_accumulate_across_blocks() {
        let b1 = block(&[1, 2, 3]);
        let schema = b1.schema();
        let coll = BlockCollection::new(
            schema,
            vec![RowBlock::Resident(b1), RowBlock::Resident(block(&[4, 5]))],
        );
        assert_eq!(coll.count(), 5);
        assert_eq!(coll.scan(0, false).expect("scan").scanned(), 0);
        assert_eq!(coll.scan(1, false).expect("scan").scanned(), 3);
    }

    #[test]
    fn build_scan_can_repeat_flush_scan_cannot() {
        let b = block(&[1, 2]);
        let coll = BlockCollection::new(b.schema(), vec![RowBlock::Resident(b)]);
        assert!(coll.scan(0, false).is_ok());
        assert!(coll.scan(0, false).is_ok());
        let mut s = coll.scan(0, true).expect("flush scan");
        assert_eq!(s.scan().expect("rows").num_rows(), 2);
        assert!(s.scan().is_none());
        assert!(coll.scan(0, false).is_err());
    }

    #[test]
    fn spill_roundtrip_and_flush_removes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bin0_block0.ipc");
        let b = block(&[7, 8, 9]);
        spill_write(&b, &path).expect("spill");
        let coll = BlockCollection::new(
            b.schema(),
            vec![RowBlock::Spilled {
                path: path.clone(),
                rows: 3,
            }],
        );
        assert_eq!(coll.count(), 3);
        let mut s = coll.scan(0, true).expect("scan");
        assert_eq!(s.scan().expect("rows").num_rows(), 3);
        assert!(!path.exists());
    }
}
