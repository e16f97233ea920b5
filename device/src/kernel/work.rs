//! Cooperative work queue.
//!
//! Work items are statically owned by their subsystem and borrowed by the queue while they are
//! pending. A single consumer drains the queue and runs handlers one at a time, so handlers never
//! run concurrently with each other. Delayable items sit on a timer list until their deadline
//! passes, then move to the back of the run list.

use core::cell::{Cell, RefCell};
use core::future::pending;
use core::ops::Deref;
use core::ptr;
use critical_section::{CriticalSection, Mutex};
use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use heapless::{Deque, Vec};

const NO_DELAY: Duration = Duration::from_ticks(0);

/// Where a running item goes once its handler returns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Followup {
    Idle,
    Queued,
    Delayed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WorkState {
    Idle,
    Queued,
    Delayed,
    Running(Followup),
    Canceling,
}

impl From<Followup> for WorkState {
    fn from(followup: Followup) -> Self {
        match followup {
            Followup::Idle => WorkState::Idle,
            Followup::Queued => WorkState::Queued,
            Followup::Delayed => WorkState::Delayed,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Submitted {
    /// Newly placed on the run list.
    Accepted,
    /// Already on the run list, nothing changed.
    AlreadyQueued,
    /// Handler is executing and will run once more afterwards.
    Requeued,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WorkError {
    Canceling,
    QueueFull,
}

/// A unit of deferred work.
pub struct Work<'a> {
    handler: &'a (dyn Fn() + Sync),
    state: Mutex<Cell<WorkState>>,
}

impl<'a> Work<'a> {
    pub const fn new(handler: &'a (dyn Fn() + Sync)) -> Self {
        Self {
            handler,
            state: Mutex::new(Cell::new(WorkState::Idle)),
        }
    }

    pub fn state(&self) -> WorkState {
        critical_section::with(|cs| self.state.borrow(cs).get())
    }

    pub fn is_pending(&self) -> bool {
        self.state() != WorkState::Idle
    }

    /// Make an item torn down by [`WorkQueue::teardown`] submittable again.
    pub fn reset(&self) {
        critical_section::with(|cs| {
            let state = self.state.borrow(cs);
            if state.get() == WorkState::Canceling {
                state.set(WorkState::Idle);
            }
        })
    }
}

#[derive(Copy, Clone)]
struct Timing {
    start: Instant,
    period: Duration,
}

/// A [`Work`] item that can also be scheduled to run after a delay.
pub struct DelayableWork<'a> {
    work: Work<'a>,
    timing: Mutex<Cell<Timing>>,
}

impl<'a> DelayableWork<'a> {
    pub const fn new(handler: &'a (dyn Fn() + Sync)) -> Self {
        Self {
            work: Work::new(handler),
            timing: Mutex::new(Cell::new(Timing {
                start: Instant::from_ticks(0),
                period: NO_DELAY,
            })),
        }
    }

    /// Time left until the pending delay expires, zero once it has.
    pub fn remaining(&self) -> Duration {
        let timing = critical_section::with(|cs| self.timing.borrow(cs).get());
        let elapsed = Instant::now().saturating_duration_since(timing.start);
        if elapsed >= timing.period {
            NO_DELAY
        } else {
            timing.period - elapsed
        }
    }

    fn deadline(&self, cs: CriticalSection) -> Instant {
        let timing = self.timing.borrow(cs).get();
        timing.start + timing.period
    }
}

impl<'a> Deref for DelayableWork<'a> {
    type Target = Work<'a>;

    fn deref(&self) -> &Self::Target {
        &self.work
    }
}

enum Kick {
    None,
    Notify,
    Rearm,
}

/// Single-consumer queue of [`Work`] items with room for `N` pending entries.
pub struct WorkQueue<'a, const N: usize> {
    pending: Mutex<RefCell<Deque<&'a Work<'a>, N>>>,
    timers: Mutex<RefCell<Vec<&'a DelayableWork<'a>, N>>>,
    notify: Channel<CriticalSectionRawMutex, (), N>,
    rearm: Signal<CriticalSectionRawMutex, ()>,
}

impl<'a, const N: usize> Default for WorkQueue<'a, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> WorkQueue<'a, N> {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(RefCell::new(Deque::new())),
            timers: Mutex::new(RefCell::new(Vec::new())),
            notify: Channel::new(),
            rearm: Signal::new(),
        }
    }

    /// Place `work` at the back of the run list.
    pub fn submit(&self, work: &'a Work<'a>) -> Result<Submitted, WorkError> {
        let result = critical_section::with(|cs| {
            let state = work.state.borrow(cs);
            match state.get() {
                WorkState::Canceling => Err(WorkError::Canceling),
                WorkState::Queued | WorkState::Running(Followup::Queued) => {
                    Ok(Submitted::AlreadyQueued)
                }
                WorkState::Idle => {
                    self.enqueue(cs, work)?;
                    state.set(WorkState::Queued);
                    Ok(Submitted::Accepted)
                }
                WorkState::Delayed => {
                    self.enqueue(cs, work)?;
                    self.disarm(cs, work);
                    state.set(WorkState::Queued);
                    Ok(Submitted::Accepted)
                }
                WorkState::Running(followup) => {
                    self.enqueue(cs, work)?;
                    if followup == Followup::Delayed {
                        self.disarm(cs, work);
                    }
                    state.set(WorkState::Running(Followup::Queued));
                    Ok(Submitted::Requeued)
                }
            }
        });
        if let Ok(Submitted::Accepted | Submitted::Requeued) = result {
            self.kick(Kick::Notify);
        }
        result
    }

    /// Run `work` after `delay`. Does nothing if the item is already queued or delayed.
    pub fn schedule(&self, work: &'a DelayableWork<'a>, delay: Duration) -> Result<(), WorkError> {
        let kick = critical_section::with(|cs| match work.state.borrow(cs).get() {
            WorkState::Canceling => Err(WorkError::Canceling),
            WorkState::Idle => self.start_timing(cs, work, delay, false),
            WorkState::Running(Followup::Idle) => self.start_timing(cs, work, delay, true),
            _ => Ok(Kick::None),
        })?;
        self.kick(kick);
        Ok(())
    }

    /// Like [`WorkQueue::schedule`], but replaces any delay that is already pending.
    pub fn reschedule(
        &self,
        work: &'a DelayableWork<'a>,
        delay: Duration,
    ) -> Result<(), WorkError> {
        let kick = critical_section::with(|cs| {
            let state = work.state.borrow(cs);
            let running = match state.get() {
                WorkState::Canceling => return Err(WorkError::Canceling),
                WorkState::Idle => false,
                WorkState::Running(Followup::Idle) => true,
                WorkState::Delayed => {
                    self.disarm(cs, work);
                    false
                }
                WorkState::Running(Followup::Delayed) => {
                    self.disarm(cs, work);
                    true
                }
                WorkState::Queued | WorkState::Running(Followup::Queued) if delay == NO_DELAY => {
                    work.timing.borrow(cs).set(Timing {
                        start: Instant::now(),
                        period: NO_DELAY,
                    });
                    return Ok(Kick::None);
                }
                WorkState::Queued => {
                    self.dequeue(cs, work);
                    false
                }
                WorkState::Running(Followup::Queued) => {
                    self.dequeue(cs, work);
                    true
                }
            };
            state.set(if running {
                WorkState::Running(Followup::Idle)
            } else {
                WorkState::Idle
            });
            self.start_timing(cs, work, delay, running)
        })?;
        self.kick(kick);
        Ok(())
    }

    /// Withdraw a pending submission or delay. A handler that is already executing finishes.
    pub fn cancel(&self, work: &'a Work<'a>) {
        critical_section::with(|cs| {
            let state = work.state.borrow(cs);
            match state.get() {
                WorkState::Queued => {
                    self.dequeue(cs, work);
                    state.set(WorkState::Idle);
                }
                WorkState::Delayed => {
                    self.disarm(cs, work);
                    state.set(WorkState::Idle);
                }
                WorkState::Running(Followup::Queued) => {
                    self.dequeue(cs, work);
                    state.set(WorkState::Running(Followup::Idle));
                }
                WorkState::Running(Followup::Delayed) => {
                    self.disarm(cs, work);
                    state.set(WorkState::Running(Followup::Idle));
                }
                _ => {}
            }
        })
    }

    /// Pop the item at the head of the run list and execute it. Returns `false` if the list was empty.
    pub fn process_one(&self) -> bool {
        let work = critical_section::with(|cs| {
            let work = self.pending.borrow_ref_mut(cs).pop_front()?;
            work.state
                .borrow(cs)
                .set(WorkState::Running(Followup::Idle));
            Some(work)
        });

        let work = match work {
            Some(work) => work,
            None => return false,
        };

        (work.handler)();

        critical_section::with(|cs| {
            let state = work.state.borrow(cs);
            if let WorkState::Running(followup) = state.get() {
                state.set(followup.into());
            }
        });
        true
    }

    /// Consume one pending notification and execute the item it announced.
    pub fn try_process(&self) -> bool {
        match self.notify.try_receive() {
            Ok(_) => {
                self.process_one();
                true
            }
            Err(_) => false,
        }
    }

    /// Move every delayed item whose deadline has passed onto the run list.
    pub fn expire_timers(&self) -> usize {
        let now = Instant::now();
        let queued = critical_section::with(|cs| {
            let mut timers = self.timers.borrow_ref_mut(cs);
            let mut queued = 0;
            let mut i = 0;
            while i < timers.len() {
                let work = timers[i];
                if work.deadline(cs) > now {
                    i += 1;
                    continue;
                }
                timers.swap_remove(i);
                work.timing.borrow(cs).set(Timing {
                    start: now,
                    period: NO_DELAY,
                });

                let state = work.state.borrow(cs);
                let next = match state.get() {
                    WorkState::Delayed => WorkState::Queued,
                    WorkState::Running(Followup::Delayed) => WorkState::Running(Followup::Queued),
                    other => {
                        warn!("expired work in unexpected state {:?}", other);
                        continue;
                    }
                };
                if self.enqueue(cs, work).is_err() {
                    error!("work queue full, dropping expired work");
                    state.set(match next {
                        WorkState::Queued => WorkState::Idle,
                        _ => WorkState::Running(Followup::Idle),
                    });
                    continue;
                }
                state.set(next);
                queued += 1;
            }
            queued
        });
        for _ in 0..queued {
            self.kick(Kick::Notify);
        }
        queued
    }

    /// Earliest deadline on the timer list.
    pub fn next_deadline(&self) -> Option<Instant> {
        critical_section::with(|cs| {
            self.timers
                .borrow_ref(cs)
                .iter()
                .map(|work| work.deadline(cs))
                .min()
        })
    }

    /// Drive the queue forever: run submitted items in order and expire delays as they come due.
    pub async fn run(&self) -> ! {
        loop {
            let deadline = self.next_deadline();
            let timer = async {
                match deadline {
                    Some(at) => Timer::at(at).await,
                    None => pending().await,
                }
            };
            match select3(self.notify.receive(), timer, self.rearm.wait()).await {
                Either3::First(_) => {
                    self.process_one();
                }
                Either3::Second(_) => {
                    self.expire_timers();
                }
                Either3::Third(_) => {
                    // timer list changed
                }
            }
        }
    }

    /// Drop every pending item and delay. Affected items refuse submission until [`Work::reset`].
    pub fn teardown(&self) {
        critical_section::with(|cs| {
            let mut pending = self.pending.borrow_ref_mut(cs);
            while let Some(work) = pending.pop_front() {
                work.state.borrow(cs).set(WorkState::Canceling);
            }
            let mut timers = self.timers.borrow_ref_mut(cs);
            for work in timers.iter() {
                work.state.borrow(cs).set(WorkState::Canceling);
            }
            timers.clear();
        });
        while self.notify.try_receive().is_ok() {}
        info!("work queue torn down");
    }

    fn start_timing(
        &self,
        cs: CriticalSection,
        work: &'a DelayableWork<'a>,
        delay: Duration,
        running: bool,
    ) -> Result<Kick, WorkError> {
        work.timing.borrow(cs).set(Timing {
            start: Instant::now(),
            period: delay,
        });
        let state = work.state.borrow(cs);
        if delay == NO_DELAY {
            self.enqueue(cs, work)?;
            state.set(if running {
                WorkState::Running(Followup::Queued)
            } else {
                WorkState::Queued
            });
            Ok(Kick::Notify)
        } else {
            self.timers
                .borrow_ref_mut(cs)
                .push(work)
                .map_err(|_| WorkError::QueueFull)?;
            state.set(if running {
                WorkState::Running(Followup::Delayed)
            } else {
                WorkState::Delayed
            });
            Ok(Kick::Rearm)
        }
    }

    fn enqueue(&self, cs: CriticalSection, work: &'a Work<'a>) -> Result<(), WorkError> {
        self.pending
            .borrow_ref_mut(cs)
            .push_back(work)
            .map_err(|_| WorkError::QueueFull)
    }

    fn dequeue(&self, cs: CriticalSection, work: &Work<'a>) {
        let mut pending = self.pending.borrow_ref_mut(cs);
        for _ in 0..pending.len() {
            if let Some(entry) = pending.pop_front() {
                if !ptr::eq(entry, work) {
                    // keeps relative order of the remaining entries
                    let _ = pending.push_back(entry);
                }
            }
        }
    }

    fn disarm(&self, cs: CriticalSection, work: &Work<'a>) {
        self.timers
            .borrow_ref_mut(cs)
            .retain(|entry| !ptr::eq(&entry.work, work));
    }

    fn kick(&self, kick: Kick) {
        match kick {
            Kick::None => {}
            Kick::Notify => {
                if self.notify.try_send(()).is_err() {
                    error!("work queue notification dropped");
                }
            }
            Kick::Rearm => self.rearm.signal(()),
        }
    }
}
