pub mod basic;
pub mod message;
pub mod router;
pub mod traits;
pub mod unimplemented;
