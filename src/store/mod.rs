//! Persistence for puppets, portals, bridged messages and users.

pub mod error;
pub mod filestore;
pub mod memory;
pub mod traits;

pub use error::StoreError;
pub use filestore::FileStore;
pub use memory::MemoryStore;
pub use traits::{
    Backend, MessageRecord, MessageStore, PortalRecord, PortalStore, PuppetRecord, PuppetStore,
    UserRecord, UserStore,
};
