#![macro_use]
#![cfg_attr(not(feature = "std"), no_std)]
//! Drogue Mesh Bearer is an async, no-alloc BLE Mesh advertising bearer for embedded devices. It integrates with [embassy](https://github.com/embassy-rs/embassy), the embedded async project.
//!
//! The crate is split in three layers:
//!
//! * [`kernel`] holds a cooperative work queue with delayable items and a counting semaphore.
//! * [`drivers::ble::mesh::buf`] holds a fixed-capacity pool of reference-counted byte buffers.
//! * [`drivers::ble::mesh::adv`] holds the advertising bearer, which serializes mesh PDUs and
//!   connectable GATT adverts onto a single controller advertising set.
//!
//! # Example
//!
//! ```ignore
//! static POOL: StaticCell<AdvPool<'static, 16>> = StaticCell::new();
//!
//! let pool = POOL.init(AdvPool::new());
//! let bearer = AdvBearer::new(controller, (), pool);
//!
//! // Run the bearer loop in its own task.
//! spawner.spawn(bearer_task(bearer)).unwrap();
//!
//! bearer.enable();
//! let mut adv = bearer
//!     .create(AdvType::Data, AdvTag::Local, Transmit::new(2, 20), Duration::from_millis(100))
//!     .await?;
//! adv.get_mut().unwrap().add_mem(&pdu);
//! bearer.send(adv, None)?;
//! ```

pub(crate) mod fmt;

pub mod drivers;
pub mod kernel;

pub use drivers::ble::mesh::adv::{
    Adv, AdvBearer, AdvError, AdvPool, AdvTag, AdvType, SendCallbacks, Transmit,
};
pub use kernel::{
    sem::Semaphore,
    work::{DelayableWork, Work, WorkQueue},
};

#[cfg(feature = "std")]
pub mod testutil;
