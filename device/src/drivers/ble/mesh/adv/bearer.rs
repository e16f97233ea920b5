use super::controller::{
    scan_units, AdvParams, AdvProperties, AdvSet, AdvState, Controller, OwnAddress, SetParams,
    StateChange, Status,
};
use super::data::{AdPayload, AdStructure};
use super::{
    Adv, AdvError, AdvPool, AdvStats, AdvTag, AdvType, Callbacks, ConnectableAdvert,
    GattAdvertiser, Transmit, ADV_QUEUE_SIZE,
};
use crate::kernel::sem::Semaphore;
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{with_timeout, Duration};

const NO_TIMEOUT: Duration = Duration::from_ticks(0);

/// State of the single advertising set, shared by the bearer task and the controller event path.
struct AdvEnv<'a> {
    state: AdvState,
    set: AdvSet,
    ad: AdPayload,
    sd: AdPayload,
    adv: Option<Adv<'a>>,
    started: bool,
    duration: Duration,
    reason: Option<AdvError>,
    gatt_active: bool,
    gatt_start_pending: bool,
    gatt_stop_pending: bool,
}

impl<'a> AdvEnv<'a> {
    const fn new() -> Self {
        Self {
            state: AdvState::Idle,
            set: AdvSet::INVALID,
            ad: AdPayload::new(),
            sd: AdPayload::new(),
            adv: None,
            started: false,
            duration: NO_TIMEOUT,
            reason: None,
            gatt_active: false,
            gatt_start_pending: false,
            gatt_stop_pending: false,
        }
    }

    fn fail(&mut self, error: AdvError) {
        if self.reason.is_none() {
            self.reason = Some(error);
        }
    }

    /// Return to idle, handing back whatever completion work is owed for the previous user.
    fn reset(&mut self) -> Completion<'a> {
        let completion = Completion {
            adv: self.adv.take(),
            started: self.started,
            duration: self.duration,
            result: self.reason.map_or(Ok(()), Err),
            renudge: self.gatt_start_pending,
        };
        *self = Self::new();
        completion
    }
}

/// Callbacks and buffer release owed after the set went idle. Executed outside the lock.
struct Completion<'a> {
    adv: Option<Adv<'a>>,
    started: bool,
    duration: Duration,
    result: Result<(), AdvError>,
    renudge: bool,
}

enum Action {
    None,
    Complete,
    Start {
        set: AdvSet,
        ad: AdPayload,
        sd: AdPayload,
    },
    Stop(AdvSet),
    Remove(AdvSet),
}

/// Advertising bearer driving one controller advertising set.
///
/// Queued mesh advertisements are sent strictly one at a time and in order. While the queue is
/// empty the set is lent to connectable adverts from `G`.
pub struct AdvBearer<'a, C, G, const N: usize>
where
    C: Controller,
    G: GattAdvertiser,
{
    controller: C,
    gatt: G,
    pool: &'a AdvPool<'a, N>,
    queue: Channel<CriticalSectionRawMutex, Option<Adv<'a>>, ADV_QUEUE_SIZE>,
    env: Mutex<RefCell<AdvEnv<'a>>>,
    // guards the advertising set, held from create until it is idle again
    set_lock: Semaphore,
    enabled: AtomicBool,
    suspended: AtomicBool,
    stats: AdvStats,
}

impl<'a, C, G, const N: usize> AdvBearer<'a, C, G, N>
where
    C: Controller,
    G: GattAdvertiser,
{
    pub fn new(controller: C, gatt: G, pool: &'a AdvPool<'a, N>) -> Self {
        Self {
            controller,
            gatt,
            pool,
            queue: Channel::new(),
            env: Mutex::new(RefCell::new(AdvEnv::new())),
            set_lock: Semaphore::new(1, 1),
            enabled: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            stats: AdvStats::new(),
        }
    }

    pub fn stats(&self) -> &AdvStats {
        &self.stats
    }

    pub fn state(&self) -> AdvState {
        critical_section::with(|cs| self.env.borrow_ref(cs).state)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Stop taking new advertisements from the pool.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    /// Let queued advertisements go on air.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        info!("advertising enabled");
        self.gatt_update();
    }

    /// Drop queued advertisements at dequeue time instead of sending them.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        info!("advertising disabled");
        self.gatt_update();
    }

    /// Allocate an advertisement, waiting up to `timeout` for a free buffer.
    pub async fn create(
        &self,
        kind: AdvType,
        tag: AdvTag,
        xmit: Transmit,
        timeout: Duration,
    ) -> Result<Adv<'a>, AdvError> {
        if self.is_suspended() {
            warn!("refusing to allocate advertisement while suspended");
            return Err(AdvError::Suspended);
        }
        let buf = self.pool.alloc(timeout).await?;
        let adv = Adv { buf };
        adv.ctx().init(kind, tag, xmit);
        Ok(adv)
    }

    /// Queue `adv` for transmission. The bearer keeps the handle until the advertisement has
    /// been sent or dropped.
    pub fn send(&self, adv: Adv<'a>, cb: Option<Callbacks<'a>>) -> Result<(), AdvError> {
        trace!(
            "send {:?} len {}: {:?}",
            adv.kind(),
            adv.len(),
            adv.data()
        );
        if self.is_suspended() {
            warn!("sending advertisement while suspended");
        }
        let tag = adv.tag();
        adv.ctx().prepare_send(cb);
        self.queue.try_send(Some(adv)).map_err(|_| {
            error!("advertising queue full");
            AdvError::QueueFull
        })?;
        self.stats.record_planned(tag);
        Ok(())
    }

    /// Withdraw an advertisement. A queued one is dropped at dequeue time, an active one is
    /// stopped. Neither reports callbacks afterwards.
    pub fn terminate(&self, adv: &Adv<'a>) -> Result<(), AdvError> {
        let stop = critical_section::with(|cs| {
            let env = self.env.borrow_ref(cs);
            match &env.adv {
                Some(active) if Adv::ptr_eq(active, adv) => {
                    adv.ctx().clear_callbacks();
                    if env.state == AdvState::Started {
                        Some(env.set)
                    } else {
                        None
                    }
                }
                _ => {
                    if adv.ctx().cancel() {
                        debug!("queued advertisement canceled");
                    }
                    None
                }
            }
        });
        match stop {
            Some(set) => self.controller.stop(set).map_err(AdvError::Controller),
            None => Ok(()),
        }
    }

    /// Ask the bearer task to re-evaluate connectable advertising.
    pub fn gatt_update(&self) {
        if self.queue.try_send(None).is_err() {
            debug!("advertising queue full, gatt update skipped");
        }
    }

    /// Put a raw advertisement on air for `num_events` events, bypassing the queue.
    pub async fn send_data(
        &self,
        num_events: u8,
        interval_ms: u32,
        ad: &[AdStructure<'_>],
    ) -> Result<(), AdvError> {
        let payload = AdPayload::pack(ad)?;
        let interval = scan_units(interval_ms);
        let params = AdvParams {
            own_address: OwnAddress::Static,
            properties: AdvProperties::NON_CONNECTABLE,
            interval_min: interval,
            interval_max: interval.saturating_add(scan_units(10)),
            max_events: num_events,
            timeout: NO_TIMEOUT,
        };

        self.set_lock.take().await;
        if let Err(e) = self.start_set(&params, &payload, &AdPayload::new()) {
            error!("raw advertisement failed: {:?}", e);
            self.abort(e);
            return Err(e);
        }
        Ok(())
    }

    /// Disable advertising and drop everything that is queued.
    ///
    /// An advertisement already handed to the controller runs to completion. Later sends are
    /// accepted but dropped at dequeue until [`AdvBearer::enable`] is called again.
    pub fn teardown(&self) {
        self.enabled.store(false, Ordering::Release);
        while let Ok(msg) = self.queue.try_receive() {
            if let Some(adv) = msg {
                adv.ctx().cancel();
            }
        }
        info!("advertising bearer torn down");
    }

    /// Controller event entry point.
    pub fn on_state_change(&self, change: StateChange) {
        let mut completion = None;
        let action = critical_section::with(|cs| {
            let mut env = self.env.borrow_ref_mut(cs);
            let old = env.state;
            debug!(
                "adv state {:?} => {:?}, reason {:?}",
                old, change.state, change.reason
            );
            env.state = change.state;

            if change.state == AdvState::Idle {
                if old == AdvState::Creating {
                    error!("advertising set creation failed: {:?}", change.reason);
                }
                if !change.reason.is_success() {
                    env.fail(AdvError::Controller(change.reason));
                }
                completion = Some(env.reset());
                return Action::Complete;
            }

            if !change.reason.is_success() && change.reason != Status::TIMEOUT {
                error!("advertising set error: {:?}", change.reason);
                env.fail(AdvError::Controller(change.reason));
                return Action::Remove(change.set);
            }

            if env.gatt_stop_pending && change.state == AdvState::Started {
                env.gatt_stop_pending = false;
                return Action::Stop(env.set);
            }

            match (old, change.state) {
                (AdvState::Creating, AdvState::Created) => {
                    env.set = change.set;
                    Action::Start {
                        set: change.set,
                        ad: env.ad.clone(),
                        sd: env.sd.clone(),
                    }
                }
                (AdvState::Started, AdvState::Created) => Action::Remove(change.set),
                _ => Action::None,
            }
        });

        match action {
            Action::None => {}
            Action::Complete => {
                if let Some(completion) = completion {
                    self.complete(completion);
                }
                self.set_lock.give();
            }
            Action::Start { set, ad, sd } => self.start(set, &ad, &sd),
            Action::Stop(set) => {
                if let Err(status) = self.controller.stop(set) {
                    error!("advertising stop failed: {:?}", status);
                }
            }
            Action::Remove(set) => self.remove(set),
        }
    }

    /// Bearer task. Never returns.
    ///
    /// Whenever the queue runs dry the set is offered to connectable advertising until the
    /// next message arrives.
    pub async fn run(&self) -> ! {
        loop {
            let mut msg = self.queue.try_receive().ok().flatten();
            let adv = loop {
                match msg {
                    Some(adv) => break adv,
                    None => {
                        msg = match self.gatt_send().await {
                            Some(timeout) => with_timeout(timeout, self.queue.receive())
                                .await
                                .unwrap_or(None),
                            None => self.queue.receive().await,
                        };
                        self.gatt_stop();
                    }
                }
            };

            if !self.is_enabled() {
                debug!("advertising disabled, dropping advertisement");
                continue;
            }
            if !adv.ctx().take_busy() {
                debug!("advertisement terminated before dispatch");
                continue;
            }
            if let Err(e) = self.dispatch(adv).await {
                warn!("advertisement dispatch failed: {:?}", e);
            }
        }
    }

    async fn dispatch(&self, adv: Adv<'a>) -> Result<(), AdvError> {
        self.set_lock.take().await;

        let xmit = adv.xmit();
        let interval = xmit.interval_ms();
        let max_events = xmit.count() + 1;
        let params = AdvParams {
            own_address: if adv.is_private() {
                OwnAddress::NonResolvablePrivate
            } else {
                OwnAddress::Static
            },
            properties: AdvProperties::NON_CONNECTABLE,
            interval_min: scan_units(interval),
            interval_max: scan_units(interval) + scan_units(10),
            max_events,
            timeout: NO_TIMEOUT,
        };

        let mut ad = AdPayload::new();
        if let Err(e) = ad.push(adv.kind().ad_type(), adv.data()) {
            let e = AdvError::from(e);
            critical_section::with(|cs| self.env.borrow_ref_mut(cs).adv = Some(adv));
            self.abort(e);
            return Err(e);
        }

        critical_section::with(|cs| {
            let mut env = self.env.borrow_ref_mut(cs);
            env.adv = Some(adv);
            env.duration = Duration::from_millis(interval as u64 * max_events as u64);
        });
        if let Err(e) = self.start_set(&params, &ad, &AdPayload::new()) {
            self.abort(e);
            return Err(e);
        }
        Ok(())
    }

    /// Evaluate connectable advertising. Returns how long to wait for queued work before
    /// evaluating again, or `None` to wait indefinitely.
    async fn gatt_send(&self) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        let active = critical_section::with(|cs| {
            let mut env = self.env.borrow_ref_mut(cs);
            if env.gatt_active {
                env.gatt_start_pending = true;
                Some(env.duration)
            } else {
                None
            }
        });
        if let Some(duration) = active {
            return non_zero(duration);
        }

        let advert = self.gatt.connectable_advert()?;
        match self.gatt_start(&advert).await {
            Ok(()) => non_zero(advert.params.timeout),
            Err(e) => {
                warn!("connectable advertising failed: {:?}", e);
                None
            }
        }
    }

    /// Put a connectable advert on air. Waits until the set is free.
    pub async fn gatt_start(&self, advert: &ConnectableAdvert) -> Result<(), AdvError> {
        self.set_lock.take().await;
        debug!("connectable advertising");
        critical_section::with(|cs| {
            let mut env = self.env.borrow_ref_mut(cs);
            env.gatt_active = true;
            env.duration = advert.params.timeout;
        });
        if let Err(e) = self.start_set(&advert.params, &advert.ad, &advert.sd) {
            self.abort(e);
            return Err(e);
        }
        Ok(())
    }

    /// Stop the connectable advert, or latch the request until the set has started.
    pub fn gatt_stop(&self) {
        let set = critical_section::with(|cs| {
            let mut env = self.env.borrow_ref_mut(cs);
            if !env.gatt_active {
                None
            } else if env.state == AdvState::Started {
                Some(env.set)
            } else {
                env.gatt_stop_pending = true;
                None
            }
        });
        if let Some(set) = set {
            if let Err(status) = self.controller.stop(set) {
                error!("connectable advertising stop failed: {:?}", status);
            }
        }
    }

    /// Store the payloads and request a new advertising set. Caller holds the set lock.
    fn start_set(
        &self,
        params: &AdvParams,
        ad: &AdPayload,
        sd: &AdPayload,
    ) -> Result<(), AdvError> {
        if ad.is_empty() {
            error!("advertising without payload");
            return Err(AdvError::InvalidParam);
        }
        let set_params = SetParams::from(params);
        critical_section::with(|cs| {
            let mut env = self.env.borrow_ref_mut(cs);
            env.ad = ad.clone();
            env.sd = sd.clone();
            env.state = AdvState::Creating;
        });
        trace!("adv data len {}: {:?}", ad.len(), ad.as_bytes());
        self.controller
            .create(&set_params)
            .map_err(AdvError::Controller)
    }

    fn start(&self, set: AdvSet, ad: &AdPayload, sd: &AdPayload) {
        let scan_rsp = if sd.is_empty() {
            None
        } else {
            Some(sd.as_bytes())
        };
        if let Err(status) = self.controller.start(set, ad.as_bytes(), scan_rsp) {
            error!("advertising start failed: {:?}", status);
            critical_section::with(|cs| {
                self.env
                    .borrow_ref_mut(cs)
                    .fail(AdvError::Controller(status))
            });
            self.remove(set);
            return;
        }

        let (adv, duration) = critical_section::with(|cs| {
            let mut env = self.env.borrow_ref_mut(cs);
            env.started = true;
            (env.adv.clone(), env.duration)
        });
        if let Some(adv) = adv {
            if adv.ctx().send_start(duration, Ok(())) {
                self.stats.record_succeeded(adv.tag());
            }
        }
    }

    fn remove(&self, set: AdvSet) {
        if let Err(status) = self.controller.remove(set) {
            error!("advertising set remove failed: {:?}", status);
        }
    }

    /// Give up on the current request before the controller took it.
    fn abort(&self, error: AdvError) {
        let completion = critical_section::with(|cs| {
            let mut env = self.env.borrow_ref_mut(cs);
            env.fail(error);
            env.reset()
        });
        self.complete(completion);
        self.set_lock.give();
    }

    fn complete(&self, completion: Completion<'a>) {
        if let Some(adv) = completion.adv {
            if !completion.started {
                adv.ctx().send_start(completion.duration, completion.result);
            }
            adv.ctx().send_end(completion.result);
        }
        if completion.renudge {
            self.gatt_update();
        }
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    if duration == NO_TIMEOUT {
        None
    } else {
        Some(duration)
    }
}
