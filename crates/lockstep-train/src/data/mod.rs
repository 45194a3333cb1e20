pub mod dataset;
pub mod prefetch;
pub mod shard;

pub use dataset::{batch_seed, Batch, Dataset, ShardBatches, ShardDataset};
pub use prefetch::{token_file_loader, PrefetchTicket, ShardLoader, ShardPrefetcher};
pub use shard::{assign, ShardCatalog, SHARD_MARKER};
