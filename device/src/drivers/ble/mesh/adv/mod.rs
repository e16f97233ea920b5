//! BLE Mesh advertising bearer.
//!
//! Mesh PDUs are wrapped in pooled [`Adv`] buffers, queued on the [`AdvBearer`] and transmitted
//! one at a time through a single controller advertising set. Connectable GATT adverts share the
//! same set and run whenever no mesh PDU is pending.

use crate::drivers::ble::mesh::buf::{AllocError, Buf, BufSimple, Pool};
use crate::drivers::ble::mesh::{InsufficientBuffer, MESH_BEACON, MESH_MESSAGE, PB_ADV, URI};
use core::cell::RefCell;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};
use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Duration;

mod bearer;
pub mod controller;
pub mod data;

pub use bearer::AdvBearer;
use controller::{AdvParams, Status};
use data::AdPayload;

/// Largest mesh PDU carried in one advertisement.
pub const ADV_DATA_SIZE: usize = 29;
/// Depth of the bearer's outbound queue.
pub const ADV_QUEUE_SIZE: usize = 16;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvType {
    Prov,
    #[default]
    Data,
    Beacon,
    Uri,
}

impl AdvType {
    /// AD type byte the payload is wrapped in.
    pub fn ad_type(&self) -> u8 {
        match self {
            AdvType::Prov => PB_ADV,
            AdvType::Data => MESH_MESSAGE,
            AdvType::Beacon => MESH_BEACON,
            AdvType::Uri => URI,
        }
    }
}

/// Origin of an advertisement, used for statistics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvTag {
    #[default]
    Local,
    Relay,
    Proxy,
    Friend,
    Prov,
}

impl AdvTag {
    const COUNT: usize = 5;

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Network transmit parameter: 3 bits of retransmission count, 5 bits of 10 ms interval steps.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Transmit(pub u8);

impl Transmit {
    pub const fn new(count: u8, interval_ms: u32) -> Self {
        let steps = (interval_ms / 10).saturating_sub(1) & 0x1F;
        Transmit((count & 0x07) | ((steps as u8) << 3))
    }

    /// Number of retransmissions after the first transmission.
    pub fn count(&self) -> u8 {
        self.0 & 0x07
    }

    pub fn interval_ms(&self) -> u32 {
        ((self.0 as u32 >> 3) + 1) * 10
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvError {
    InvalidParam,
    AdTooLong,
    Suspended,
    QueueFull,
    Alloc(AllocError),
    Controller(Status),
}

impl From<AllocError> for AdvError {
    fn from(error: AllocError) -> Self {
        AdvError::Alloc(error)
    }
}

impl From<InsufficientBuffer> for AdvError {
    fn from(_: InsufficientBuffer) -> Self {
        AdvError::AdTooLong
    }
}

impl From<Status> for AdvError {
    fn from(status: Status) -> Self {
        AdvError::Controller(status)
    }
}

/// Transmission progress notifications for one advertisement.
///
/// `start` fires once, when the advertisement goes on air or fails to. `end` fires once
/// afterwards. Both run on the bearer task or the controller event path and must not block.
pub trait SendCallbacks {
    fn start(&self, duration: Duration, result: Result<(), AdvError>) {
        let _ = (duration, result);
    }

    fn end(&self, result: Result<(), AdvError>) {
        let _ = result;
    }
}

pub type Callbacks<'a> = &'a (dyn SendCallbacks + Sync);

/// Signal-backed [`SendCallbacks`] for tasks that want to await completion.
pub struct SendCompletion {
    started: Signal<CriticalSectionRawMutex, Result<(), AdvError>>,
    ended: Signal<CriticalSectionRawMutex, Result<(), AdvError>>,
}

impl Default for SendCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl SendCompletion {
    pub const fn new() -> Self {
        Self {
            started: Signal::new(),
            ended: Signal::new(),
        }
    }

    pub async fn started(&self) -> Result<(), AdvError> {
        self.started.wait().await
    }

    pub async fn ended(&self) -> Result<(), AdvError> {
        self.ended.wait().await
    }
}

impl SendCallbacks for SendCompletion {
    fn start(&self, _: Duration, result: Result<(), AdvError>) {
        self.started.signal(result);
    }

    fn end(&self, result: Result<(), AdvError>) {
        self.ended.signal(result);
    }
}

/// A connectable advert ready to go on air.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectableAdvert {
    pub params: AdvParams,
    pub ad: AdPayload,
    pub sd: AdPayload,
}

/// Source of connectable adverts (provisioning or proxy service) run between mesh PDUs.
pub trait GattAdvertiser {
    /// The advert to run now, if any. `params.timeout` bounds how long it stays on air
    /// before the source is asked again; zero means until the next mesh PDU.
    fn connectable_advert(&self) -> Option<ConnectableAdvert>;
}

impl GattAdvertiser for () {
    fn connectable_advert(&self) -> Option<ConnectableAdvert> {
        None
    }
}

impl<G: GattAdvertiser> GattAdvertiser for &G {
    fn connectable_advert(&self) -> Option<ConnectableAdvert> {
        G::connectable_advert(self)
    }
}

#[derive(Default)]
struct CtxState<'a> {
    kind: AdvType,
    tag: AdvTag,
    xmit: Transmit,
    private: bool,
    busy: bool,
    started: bool,
    cb: Option<Callbacks<'a>>,
}

/// Per-buffer advertising context, stored as the pool slot's user data.
pub struct AdvCtx<'a> {
    state: Mutex<RefCell<CtxState<'a>>>,
}

impl<'a> Default for AdvCtx<'a> {
    fn default() -> Self {
        Self {
            state: Mutex::new(RefCell::new(CtxState::default())),
        }
    }
}

impl<'a> AdvCtx<'a> {
    fn with<R>(&self, f: impl FnOnce(&mut CtxState<'a>) -> R) -> R {
        critical_section::with(|cs| f(&mut *self.state.borrow_ref_mut(cs)))
    }

    fn init(&self, kind: AdvType, tag: AdvTag, xmit: Transmit) {
        self.with(|ctx| {
            *ctx = CtxState {
                kind,
                tag,
                xmit,
                ..Default::default()
            }
        })
    }

    fn prepare_send(&self, cb: Option<Callbacks<'a>>) {
        self.with(|ctx| {
            ctx.cb = cb;
            ctx.busy = true;
        })
    }

    /// Clear the busy flag, returning whether it was set.
    fn take_busy(&self) -> bool {
        self.with(|ctx| core::mem::replace(&mut ctx.busy, false))
    }

    /// Withdraw a queued advertisement before dispatch.
    fn cancel(&self) -> bool {
        self.with(|ctx| {
            if ctx.busy {
                ctx.busy = false;
                ctx.cb = None;
                true
            } else {
                false
            }
        })
    }

    fn clear_callbacks(&self) {
        self.with(|ctx| ctx.cb = None)
    }

    /// Fire the start callback unless it already fired. Returns whether this call fired it.
    fn send_start(&self, duration: Duration, result: Result<(), AdvError>) -> bool {
        let cb = self.with(|ctx| {
            if ctx.started {
                None
            } else {
                ctx.started = true;
                Some(ctx.cb)
            }
        });
        match cb {
            Some(cb) => {
                if let Some(cb) = cb {
                    cb.start(duration, result);
                }
                true
            }
            None => false,
        }
    }

    fn send_end(&self, result: Result<(), AdvError>) {
        let cb = self.with(|ctx| {
            if ctx.started {
                ctx.started = false;
                ctx.cb.take()
            } else {
                None
            }
        });
        if let Some(cb) = cb {
            cb.end(result);
        }
    }
}

pub type AdvPool<'a, const N: usize> = Pool<AdvCtx<'a>, N, ADV_DATA_SIZE>;

/// A pooled mesh advertisement. Cloning retains the buffer.
#[derive(Clone)]
pub struct Adv<'a> {
    buf: Buf<'a, AdvCtx<'a>, ADV_DATA_SIZE>,
}

impl<'a> Adv<'a> {
    fn ctx(&self) -> &AdvCtx<'a> {
        self.buf.user_data()
    }

    pub fn kind(&self) -> AdvType {
        self.ctx().with(|ctx| ctx.kind)
    }

    pub fn tag(&self) -> AdvTag {
        self.ctx().with(|ctx| ctx.tag)
    }

    pub fn xmit(&self) -> Transmit {
        self.ctx().with(|ctx| ctx.xmit)
    }

    /// Send from a non-resolvable private address.
    pub fn set_private(&self, private: bool) {
        self.ctx().with(|ctx| ctx.private = private)
    }

    pub fn is_private(&self) -> bool {
        self.ctx().with(|ctx| ctx.private)
    }

    /// Queued and not yet dispatched.
    pub fn is_busy(&self) -> bool {
        self.ctx().with(|ctx| ctx.busy)
    }

    pub fn ref_count(&self) -> u8 {
        self.buf.ref_count()
    }

    pub fn get_mut(&mut self) -> Option<&mut BufSimple<ADV_DATA_SIZE>> {
        self.buf.get_mut()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Buf::ptr_eq(&a.buf, &b.buf)
    }
}

impl<'a> Deref for Adv<'a> {
    type Target = BufSimple<ADV_DATA_SIZE>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

/// Per-tag transmission counters.
pub struct AdvStats {
    planned: [AtomicU32; AdvTag::COUNT],
    succeeded: [AtomicU32; AdvTag::COUNT],
}

impl Default for AdvStats {
    fn default() -> Self {
        Self::new()
    }
}

impl AdvStats {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU32 = AtomicU32::new(0);

    pub const fn new() -> Self {
        Self {
            planned: [Self::ZERO; AdvTag::COUNT],
            succeeded: [Self::ZERO; AdvTag::COUNT],
        }
    }

    /// Advertisements queued for sending.
    pub fn planned(&self, tag: AdvTag) -> u32 {
        self.planned[tag.index()].load(Ordering::Relaxed)
    }

    /// Advertisements that went on air.
    pub fn succeeded(&self, tag: AdvTag) -> u32 {
        self.succeeded[tag.index()].load(Ordering::Relaxed)
    }

    fn record_planned(&self, tag: AdvTag) {
        self.planned[tag.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_succeeded(&self, tag: AdvTag) {
        self.succeeded[tag.index()].fetch_add(1, Ordering::Relaxed);
    }
}
