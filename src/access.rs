//! Access layer: record-oriented views over the buffer pool.
//!
//! - **HeapFile**: fixed-width records in slotted pages with a free-page list
//! - **HeapScan**: sequential scan over every live record of a heap file
//! - **BTreeIndex**: ordered index from fixed-width keys to rids
//!
//! Both access paths address data by `Rid` and request pages exclusively
//! through the buffer pool.

pub mod btree;
pub mod heap;
pub mod record;
pub mod scan;

pub use btree::BTreeIndex;
pub use heap::HeapFile;
pub use record::{Record, Rid};
pub use scan::HeapScan;
