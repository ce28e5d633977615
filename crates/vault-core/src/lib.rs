//! Personal data vault services: access control, memories, contexts and
//! the dividend ledger that pays users for the use of their data.
//!
//! Every service persists through a [`LedgerStore`] handed to it at
//! construction. The crate does no file or network I/O of its own;
//! [`MemoryLedger`] is the in-process store used by tests and embedders.

pub mod context;
pub mod dividend;
pub mod error;
pub mod gatekeeper;
pub mod ledger;
pub mod memory;
pub mod memory_ledger;
pub mod merge;
pub mod rates;
pub mod signal;
pub mod time;
pub mod vault;

pub use context::{Context, ContextManager, ContextUpdate};
pub use dividend::{DividendCalculation, DividendEngine, Earnings, PAYOUT_PENDING, Payout};
pub use error::{Error, Result};
pub use gatekeeper::{Consent, Gatekeeper, Permission, UsageLog};
pub use ledger::{
    Filter, LedgerError, LedgerResult, LedgerStore, Op, Order, Query, Range, Record, Table,
};
pub use memory::{Memory, MemoryStore, MemoryUpdate, ScoredMemory};
pub use memory_ledger::MemoryLedger;
pub use merge::{MergeStrategy, merge_data};
pub use rates::{DEFAULT_KEY, RateTable, STANDARD_RATES};
pub use signal::{DataSource, ProcessorLog, Signal, SignalProcessor};
pub use time::{DateRange, Timestamp, TimestampError};
pub use vault::{NewVaultEntry, SchemaField, SchemaRegistryEntry, Vault, VaultEntry};
