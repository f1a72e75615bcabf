//! Durable storage for the shared canvas.
//!
//! ```text
//! ┌──────────────┐  persist_one / remove   ┌──────────────┐
//! │ SyncEngine   │ ──────────────────────► │ ElementStore │
//! │ SharedState  │  snapshot batch (timer) │ (RocksDB)    │
//! └──────▲───────┘ ──────────────────────► └──────┬───────┘
//!        │ load() on startup                      │
//!        └────────────────────────────────────────┘
//!                     CF "elements": id → {seq, json} (LZ4)
//!                     CF "metadata": next insertion sequence
//! ```

pub mod rocks;

pub use rocks::{ElementStore, StoreConfig, StoreError, StoreStats};
