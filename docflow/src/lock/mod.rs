//! Entity lock manager.
//!
//! At most one live holder per entity id. Locks carry a TTL so a crashed
//! holder cannot block an entity forever; long-running holders renew, and a
//! holder whose renewal fails must stop writing for that entity.

mod keepalive;
mod manager;

pub use keepalive::{LockKeepAlive, LOCK_LOST_REASON};
pub use manager::{EntityLock, EntityLockManager, LockToken};
