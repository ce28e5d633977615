pub mod error;
pub mod ledger;
pub mod paths;
pub mod schema;
pub mod snapshot;

pub use error::{Result, StoreError};
pub use ledger::SqliteLedger;
pub use paths::{DB_FILE, default_base_dir, default_db_path};
pub use snapshot::{SNAPSHOT_VERSION, Snapshot};
