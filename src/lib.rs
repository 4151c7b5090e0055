#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[macro_use]
extern crate static_assertions;

pub mod frwlock;
mod spinlock;

pub use frwlock::{ReadGuard, RwLock, WriteGuard};
