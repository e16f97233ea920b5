//! Fixed-capacity pool of reference-counted byte buffers.
//!
//! A [`Buf`] handle owns one reference to a pool slot. Cloning a handle retains the slot and
//! dropping it releases; the slot returns to the pool when the last handle is gone. Each slot
//! carries a user data value of type `U` next to its bytes.

mod simple;

pub use simple::{BufSimple, BufState};

use core::cell::{Cell, RefCell, UnsafeCell};
use core::future::poll_fn;
use core::ops::Deref;
use core::task::{Context, Poll};
use critical_section::{CriticalSection, Mutex};
use embassy_sync::waitqueue::MultiWakerRegistration;
use embassy_time::{with_timeout, Duration};

const MAX_WAITERS: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AllocError {
    Empty,
}

struct Slot<U, const SIZE: usize> {
    refs: Mutex<Cell<u8>>,
    buf: UnsafeCell<BufSimple<SIZE>>,
    user: UnsafeCell<U>,
}

// SAFETY: `buf` is only written through a handle holding the sole reference, and `user` is only
// replaced while the slot is unreferenced. Both transitions happen under the critical section
// that guards `refs`.
unsafe impl<U: Send + Sync, const SIZE: usize> Sync for Slot<U, SIZE> {}

struct Shared {
    free: Mutex<Cell<usize>>,
    waiters: Mutex<RefCell<MultiWakerRegistration<MAX_WAITERS>>>,
}

pub struct Pool<U, const N: usize, const SIZE: usize> {
    shared: Shared,
    slots: [Slot<U, SIZE>; N],
}

impl<U: Default, const N: usize, const SIZE: usize> Default for Pool<U, N, SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U: Default, const N: usize, const SIZE: usize> Pool<U, N, SIZE> {
    pub fn new() -> Self {
        Self {
            shared: Shared {
                free: Mutex::new(Cell::new(N)),
                waiters: Mutex::new(RefCell::new(MultiWakerRegistration::new())),
            },
            slots: core::array::from_fn(|_| Slot {
                refs: Mutex::new(Cell::new(0)),
                buf: UnsafeCell::new(BufSimple::new()),
                user: UnsafeCell::new(U::default()),
            }),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn free_count(&self) -> usize {
        critical_section::with(|cs| self.shared.free.borrow(cs).get())
    }

    /// Take a free buffer without waiting.
    pub fn try_alloc(&self) -> Result<Buf<'_, U, SIZE>, AllocError> {
        critical_section::with(|cs| self.alloc_in(cs)).ok_or(AllocError::Empty)
    }

    /// Take a free buffer, waiting up to `timeout` for one to be released.
    pub async fn alloc(&self, timeout: Duration) -> Result<Buf<'_, U, SIZE>, AllocError> {
        if let Ok(buf) = self.try_alloc() {
            return Ok(buf);
        }
        with_timeout(timeout, poll_fn(|cx| self.poll_alloc(cx)))
            .await
            .map_err(|_| {
                warn!("buffer pool exhausted");
                AllocError::Empty
            })
    }

    fn poll_alloc(&self, cx: &mut Context<'_>) -> Poll<Buf<'_, U, SIZE>> {
        critical_section::with(|cs| match self.alloc_in(cs) {
            Some(buf) => Poll::Ready(buf),
            None => {
                self.shared.waiters.borrow_ref_mut(cs).register(cx.waker());
                Poll::Pending
            }
        })
    }

    fn alloc_in(&self, cs: CriticalSection) -> Option<Buf<'_, U, SIZE>> {
        let free = self.shared.free.borrow(cs);
        if free.get() == 0 {
            return None;
        }
        let (id, slot) = self
            .slots
            .iter()
            .enumerate()
            .find(|(_, slot)| slot.refs.borrow(cs).get() == 0)?;

        slot.refs.borrow(cs).set(1);
        free.set(free.get() - 1);
        // SAFETY: the slot had no references, so no handle can observe it.
        unsafe {
            (*slot.buf.get()).reset();
            *slot.user.get() = U::default();
        }
        Some(Buf {
            shared: &self.shared,
            slot,
            id,
        })
    }
}

/// Handle to a pooled buffer.
pub struct Buf<'p, U, const SIZE: usize> {
    shared: &'p Shared,
    slot: &'p Slot<U, SIZE>,
    id: usize,
}

impl<'p, U, const SIZE: usize> Buf<'p, U, SIZE> {
    /// Index of the backing slot within its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn ref_count(&self) -> u8 {
        critical_section::with(|cs| self.slot.refs.borrow(cs).get())
    }

    pub fn user_data(&self) -> &U {
        // SAFETY: user data is only replaced while the slot is unreferenced.
        unsafe { &*self.slot.user.get() }
    }

    /// Mutable access to the bytes, available only while this is the sole handle.
    pub fn get_mut(&mut self) -> Option<&mut BufSimple<SIZE>> {
        if self.ref_count() == 1 {
            // SAFETY: no other handle exists and `self` is borrowed mutably.
            Some(unsafe { &mut *self.slot.buf.get() })
        } else {
            None
        }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        core::ptr::eq(a.slot, b.slot)
    }
}

impl<'p, U, const SIZE: usize> Deref for Buf<'p, U, SIZE> {
    type Target = BufSimple<SIZE>;

    fn deref(&self) -> &Self::Target {
        // SAFETY: writes require the sole handle through `get_mut`, which borrows it mutably.
        unsafe { &*self.slot.buf.get() }
    }
}

impl<'p, U, const SIZE: usize> Clone for Buf<'p, U, SIZE> {
    fn clone(&self) -> Self {
        critical_section::with(|cs| {
            let refs = self.slot.refs.borrow(cs);
            assert!(refs.get() < u8::MAX, "buf {} reference overflow", self.id);
            refs.set(refs.get() + 1);
        });
        Self {
            shared: self.shared,
            slot: self.slot,
            id: self.id,
        }
    }
}

impl<'p, U, const SIZE: usize> Drop for Buf<'p, U, SIZE> {
    fn drop(&mut self) {
        critical_section::with(|cs| {
            let refs = self.slot.refs.borrow(cs);
            match refs.get() {
                0 => {
                    error!("buf {} released with no references", self.id);
                    debug_assert!(false);
                }
                1 => {
                    refs.set(0);
                    let free = self.shared.free.borrow(cs);
                    free.set(free.get() + 1);
                    self.shared.waiters.borrow_ref_mut(cs).wake();
                }
                n => refs.set(n - 1),
            }
        })
    }
}
