//! KVSYNC Events - Change Notification Bus and Cross-Tab Bridge
//!
//! Consumers of the same key learn about each other's writes through the
//! [`ChangeBus`] instead of polling. Writes made by other processes sharing
//! the local store reach the bus through the [`CrossTabBridge`].
//!
//! ```text
//!  tab A: update(k) ──► local store ──► StorageSignal ──┐
//!                                                        ▼
//!  tab B:                         CrossTabBridge ──► ChangeBus ──► subscribers of k
//! ```

mod bridge;
mod bus;

pub use bridge::{BridgeHandle, BridgeOutcome, CrossTabBridge};
pub use bus::{ChangeBus, ChangeNotice, NoticeCallback, NoticeKind, NoticeSource, Subscription};
