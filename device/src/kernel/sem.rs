use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;
use critical_section::Mutex;
use embassy_sync::waitqueue::MultiWakerRegistration;
use embassy_time::{with_timeout, Duration};

const MAX_WAITERS: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SemaphoreError {
    Timeout,
}

struct Permits {
    count: usize,
    limit: usize,
    waiters: MultiWakerRegistration<MAX_WAITERS>,
}

/// Counting semaphore bounded by `limit`.
///
/// Gives beyond the limit are dropped, so a binary semaphore is `Semaphore::new(1, 1)`.
pub struct Semaphore {
    permits: Mutex<RefCell<Permits>>,
}

impl Semaphore {
    pub const fn new(initial: usize, limit: usize) -> Self {
        Self {
            permits: Mutex::new(RefCell::new(Permits {
                count: initial,
                limit,
                waiters: MultiWakerRegistration::new(),
            })),
        }
    }

    pub fn try_take(&self) -> bool {
        critical_section::with(|cs| {
            let mut permits = self.permits.borrow_ref_mut(cs);
            if permits.count > 0 {
                permits.count -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Wait until a permit is available.
    pub async fn take(&self) {
        poll_fn(|cx| {
            critical_section::with(|cs| {
                let mut permits = self.permits.borrow_ref_mut(cs);
                if permits.count > 0 {
                    permits.count -= 1;
                    Poll::Ready(())
                } else {
                    permits.waiters.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }

    pub async fn take_timeout(&self, timeout: Duration) -> Result<(), SemaphoreError> {
        if self.try_take() {
            return Ok(());
        }
        with_timeout(timeout, self.take())
            .await
            .map_err(|_| SemaphoreError::Timeout)
    }

    pub fn give(&self) {
        critical_section::with(|cs| {
            let mut permits = self.permits.borrow_ref_mut(cs);
            if permits.count < permits.limit {
                permits.count += 1;
            }
            permits.waiters.wake();
        })
    }

    pub fn count(&self) -> usize {
        critical_section::with(|cs| self.permits.borrow_ref(cs).count)
    }
}
