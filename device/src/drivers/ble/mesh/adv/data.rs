use crate::drivers::ble::mesh::InsufficientBuffer;
use heapless::Vec;

pub const LEGACY_ADV_MAX_LEN: usize = 31;
const AD_HEADER_SIZE: usize = 2;

pub const FLAGS: u8 = 0x01;
pub const UUID16_ALL: u8 = 0x03;
pub const SERVICE_DATA16: u8 = 0x16;
pub const COMPLETE_NAME: u8 = 0x09;

/// One AD structure before packing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdStructure<'d> {
    pub ty: u8,
    pub data: &'d [u8],
}

impl<'d> AdStructure<'d> {
    pub const fn new(ty: u8, data: &'d [u8]) -> Self {
        Self { ty, data }
    }
}

/// Packed legacy advertising (or scan response) payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdPayload {
    bytes: Vec<u8, LEGACY_ADV_MAX_LEN>,
}

impl AdPayload {
    pub const fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn pack(structures: &[AdStructure<'_>]) -> Result<Self, InsufficientBuffer> {
        let mut payload = Self::new();
        for ad in structures {
            payload.push(ad.ty, ad.data)?;
        }
        Ok(payload)
    }

    /// Append `[len + 1, ty, data..]`.
    pub fn push(&mut self, ty: u8, data: &[u8]) -> Result<(), InsufficientBuffer> {
        if self.bytes.len() + AD_HEADER_SIZE + data.len() > LEGACY_ADV_MAX_LEN {
            warn!("ad structure {} does not fit ({} bytes)", ty, data.len());
            return Err(InsufficientBuffer);
        }
        self.bytes
            .push(data.len() as u8 + 1)
            .map_err(|_| InsufficientBuffer)?;
        self.bytes.push(ty).map_err(|_| InsufficientBuffer)?;
        self.bytes
            .extend_from_slice(data)
            .map_err(|_| InsufficientBuffer)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
