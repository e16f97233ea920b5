use embassy_time::Duration;

/// Controller status code carried by requests and state change events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x00);
    /// Advertising duration or event budget exhausted.
    pub const TIMEOUT: Status = Status(0x45);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

/// Handle of a controller advertising set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvSet(pub u8);

impl AdvSet {
    pub const INVALID: AdvSet = AdvSet(0xFF);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AdvState {
    Idle = 0,
    Creating = 1,
    Created = 2,
    AdvDataSet = 3,
    ScanRspDataSet = 4,
    PerAdvDataSet = 5,
    Started = 6,
}

impl TryFrom<u8> for AdvState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => AdvState::Idle,
            1 => AdvState::Creating,
            2 => AdvState::Created,
            3 => AdvState::AdvDataSet,
            4 => AdvState::ScanRspDataSet,
            5 => AdvState::PerAdvDataSet,
            6 => AdvState::Started,
            _ => return Err(value),
        })
    }
}

/// Asynchronous notification from the controller about an advertising set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StateChange {
    pub set: AdvSet,
    pub state: AdvState,
    pub reason: Status,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OwnAddress {
    Static,
    NonResolvablePrivate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

/// Legacy advertising event properties.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvProperties(pub u16);

impl AdvProperties {
    pub const NON_CONNECTABLE: AdvProperties = AdvProperties(0x0000);
    pub const CONNECTABLE: AdvProperties = AdvProperties(0x0001);
    pub const SCANNABLE: AdvProperties = AdvProperties(0x0002);
    pub const UNDIRECTED_CONNECTABLE: AdvProperties = AdvProperties(0x0003);

    pub fn is_connectable(&self) -> bool {
        self.0 & Self::CONNECTABLE.0 != 0
    }
}

/// Request-level advertising parameters, intervals in 0.625 ms units.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvParams {
    pub own_address: OwnAddress,
    pub properties: AdvProperties,
    pub interval_min: u32,
    pub interval_max: u32,
    /// Zero means unlimited.
    pub max_events: u8,
    /// Zero means no timeout.
    pub timeout: Duration,
}

pub const INTERVAL_MIN: u32 = 0x20;
pub const INTERVAL_MAX: u32 = 0xFF_FFFF;
pub const CHANNEL_MAP_ALL: u8 = 0x07;

/// Convert milliseconds to 0.625 ms scan units, saturating at `u32::MAX`.
pub const fn scan_units(ms: u32) -> u32 {
    let units = ms as u64 * 8 / 5;
    if units > u32::MAX as u64 {
        u32::MAX
    } else {
        units as u32
    }
}

/// Parameters for creating an advertising set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetParams {
    pub own_address: OwnAddress,
    pub properties: AdvProperties,
    pub channel_map: u8,
    pub primary_phy: Phy,
    pub secondary_phy: Phy,
    pub interval_min: u32,
    pub interval_max: u32,
    pub max_events: u8,
    /// Advertising duration in 10 ms units, zero for none.
    pub duration: u16,
}

impl From<&AdvParams> for SetParams {
    fn from(params: &AdvParams) -> Self {
        let interval_min = params.interval_min.clamp(INTERVAL_MIN, INTERVAL_MAX);
        let interval_max = params.interval_max.clamp(INTERVAL_MIN, INTERVAL_MAX);
        let duration = ((params.timeout.as_millis() + 9) / 10).min(u16::MAX as u64) as u16;
        Self {
            own_address: params.own_address,
            properties: params.properties,
            channel_map: CHANNEL_MAP_ALL,
            primary_phy: Phy::Le1M,
            secondary_phy: Phy::Le1M,
            interval_min,
            interval_max,
            max_events: params.max_events,
            duration,
        }
    }
}

/// Advertising set operations of a BLE controller.
///
/// Every call only submits a request. Progress is reported back through
/// [`AdvBearer::on_state_change`](super::AdvBearer::on_state_change).
pub trait Controller {
    fn create(&self, params: &SetParams) -> Result<(), Status>;

    fn start(&self, set: AdvSet, adv_data: &[u8], scan_rsp: Option<&[u8]>) -> Result<(), Status>;

    fn stop(&self, set: AdvSet) -> Result<(), Status>;

    fn remove(&self, set: AdvSet) -> Result<(), Status>;
}

impl<C: Controller> Controller for &C {
    fn create(&self, params: &SetParams) -> Result<(), Status> {
        C::create(self, params)
    }

    fn start(&self, set: AdvSet, adv_data: &[u8], scan_rsp: Option<&[u8]>) -> Result<(), Status> {
        C::start(self, set, adv_data, scan_rsp)
    }

    fn stop(&self, set: AdvSet) -> Result<(), Status> {
        C::stop(self, set)
    }

    fn remove(&self, set: AdvSet) -> Result<(), Status> {
        C::remove(self, set)
    }
}
