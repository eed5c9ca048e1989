pub mod local_file;
pub mod parquet_store;
pub mod rki_client;

pub use local_file::JsonFileStore;
pub use parquet_store::ParquetStore;
pub use rki_client::{RkiClient, SourceConfig};
