//! Test doubles for driving the advertising bearer without a radio.
use crate::drivers::ble::mesh::adv::controller::{
    AdvSet, AdvState, Controller, SetParams, StateChange, Status,
};
use crate::drivers::ble::mesh::adv::data::LEGACY_ADV_MAX_LEN;
use crate::drivers::ble::mesh::adv::{AdvError, SendCallbacks};
use core::cell::{Cell, RefCell};
use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::Duration;
use std::vec::Vec;

pub type Payload = heapless::Vec<u8, LEGACY_ADV_MAX_LEN>;

/// A request the bearer made to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerCall {
    Create(SetParams),
    Start {
        set: AdvSet,
        adv_data: Payload,
        scan_rsp: Option<Payload>,
    },
    Stop(AdvSet),
    Remove(AdvSet),
}

/// Controller that records every request so tests can await and inspect them.
pub struct MockController {
    calls: Channel<CriticalSectionRawMutex, ControllerCall, 32>,
    fail_create: Mutex<Cell<Option<Status>>>,
    fail_start: Mutex<Cell<Option<Status>>>,
}

impl Default for MockController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockController {
    pub const fn new() -> Self {
        Self {
            calls: Channel::new(),
            fail_create: Mutex::new(Cell::new(None)),
            fail_start: Mutex::new(Cell::new(None)),
        }
    }

    /// Reject the next create request with `status`.
    pub fn fail_next_create(&self, status: Status) {
        critical_section::with(|cs| self.fail_create.borrow(cs).set(Some(status)));
    }

    /// Reject the next start request with `status`.
    pub fn fail_next_start(&self, status: Status) {
        critical_section::with(|cs| self.fail_start.borrow(cs).set(Some(status)));
    }

    pub async fn next_call(&self) -> ControllerCall {
        self.calls.receive().await
    }

    pub fn try_next_call(&self) -> Option<ControllerCall> {
        self.calls.try_receive().ok()
    }

    fn record(&self, call: ControllerCall) {
        if self.calls.try_send(call).is_err() {
            panic!("mock controller call log overflow");
        }
    }
}

fn payload(data: &[u8]) -> Payload {
    Payload::from_slice(data).unwrap_or_default()
}

impl Controller for MockController {
    fn create(&self, params: &SetParams) -> Result<(), Status> {
        if let Some(status) = critical_section::with(|cs| self.fail_create.borrow(cs).take()) {
            return Err(status);
        }
        self.record(ControllerCall::Create(*params));
        Ok(())
    }

    fn start(&self, set: AdvSet, adv_data: &[u8], scan_rsp: Option<&[u8]>) -> Result<(), Status> {
        if let Some(status) = critical_section::with(|cs| self.fail_start.borrow(cs).take()) {
            return Err(status);
        }
        self.record(ControllerCall::Start {
            set,
            adv_data: payload(adv_data),
            scan_rsp: scan_rsp.map(payload),
        });
        Ok(())
    }

    fn stop(&self, set: AdvSet) -> Result<(), Status> {
        self.record(ControllerCall::Stop(set));
        Ok(())
    }

    fn remove(&self, set: AdvSet) -> Result<(), Status> {
        self.record(ControllerCall::Remove(set));
        Ok(())
    }
}

/// Shorthand for a controller state change on `set`.
pub fn state_change(set: u8, state: AdvState, reason: Status) -> StateChange {
    StateChange {
        set: AdvSet(set),
        state,
        reason,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Callback {
    Start(Result<(), AdvError>),
    End(Result<(), AdvError>),
}

/// [`SendCallbacks`] that records invocations in order.
pub struct RecordingCallbacks {
    events: Mutex<RefCell<Vec<Callback>>>,
    duration: Mutex<Cell<Option<Duration>>>,
}

impl Default for RecordingCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingCallbacks {
    pub const fn new() -> Self {
        Self {
            events: Mutex::new(RefCell::new(Vec::new())),
            duration: Mutex::new(Cell::new(None)),
        }
    }

    pub fn events(&self) -> Vec<Callback> {
        critical_section::with(|cs| self.events.borrow_ref(cs).clone())
    }

    /// Duration reported by the start callback.
    pub fn duration(&self) -> Option<Duration> {
        critical_section::with(|cs| self.duration.borrow(cs).get())
    }
}

impl SendCallbacks for RecordingCallbacks {
    fn start(&self, duration: Duration, result: Result<(), AdvError>) {
        critical_section::with(|cs| {
            self.duration.borrow(cs).set(Some(duration));
            self.events.borrow_ref_mut(cs).push(Callback::Start(result));
        })
    }

    fn end(&self, result: Result<(), AdvError>) {
        critical_section::with(|cs| self.events.borrow_ref_mut(cs).push(Callback::End(result)))
    }
}
