//! MeshCore companion-radio command and response payloads.
//!
//! Only the subset the gateway exposes as capabilities is modelled here.
//! Byte 0 of every payload is the command code (app -> radio) or the response /
//! push code (radio -> app). Push codes (>= 0x80) arrive unsolicited.

use serde::Serialize;

use crate::transport::TransportError;

pub mod cmd {
    pub const APP_START: u8 = 1;
    pub const GET_CONTACTS: u8 = 4;
    pub const GET_DEVICE_TIME: u8 = 5;
    pub const SET_DEVICE_TIME: u8 = 6;
    pub const SEND_SELF_ADVERT: u8 = 7;
    pub const SET_ADVERT_NAME: u8 = 8;
    pub const REBOOT: u8 = 19;
    pub const GET_BATTERY_VOLTAGE: u8 = 20;
}

pub mod resp {
    pub const OK: u8 = 0;
    pub const ERR: u8 = 1;
    pub const CONTACTS_START: u8 = 2;
    pub const CONTACT: u8 = 3;
    pub const END_OF_CONTACTS: u8 = 4;
    pub const SELF_INFO: u8 = 5;
    pub const CURR_TIME: u8 = 9;
    pub const BATTERY_VOLTAGE: u8 = 12;
}

/// First code of the unsolicited push range.
pub const PUSH_CODE_MIN: u8 = 0x80;

const APP_VERSION: u8 = 1;
const PUBLIC_KEY_LEN: usize = 32;
const OUT_PATH_LEN: usize = 64;
const ADV_NAME_LEN: usize = 32;

pub fn app_start(app_name: &str) -> Vec<u8> {
    let mut out = vec![cmd::APP_START, APP_VERSION, 0, 0, 0, 0, 0, 0];
    out.extend_from_slice(app_name.as_bytes());
    out
}

pub fn get_contacts() -> Vec<u8> {
    vec![cmd::GET_CONTACTS]
}

pub fn get_device_time() -> Vec<u8> {
    vec![cmd::GET_DEVICE_TIME]
}

pub fn set_device_time(epoch_secs: u32) -> Vec<u8> {
    let mut out = vec![cmd::SET_DEVICE_TIME];
    out.extend_from_slice(&epoch_secs.to_le_bytes());
    out
}

/// `flood` selects a flood-routed advert, otherwise zero-hop.
pub fn send_self_advert(flood: bool) -> Vec<u8> {
    vec![cmd::SEND_SELF_ADVERT, u8::from(flood)]
}

/// The radio stores the name NUL-terminated in a fixed field.
pub fn set_advert_name(name: &str) -> Result<Vec<u8>, TransportError> {
    if name.len() >= ADV_NAME_LEN {
        return Err(TransportError::Protocol(format!(
            "advert name must be shorter than {} bytes",
            ADV_NAME_LEN
        )));
    }
    let mut out = vec![cmd::SET_ADVERT_NAME];
    out.extend_from_slice(name.as_bytes());
    Ok(out)
}

pub fn reboot() -> Vec<u8> {
    let mut out = vec![cmd::REBOOT];
    out.extend_from_slice(b"reboot");
    out
}

pub fn get_battery_voltage() -> Vec<u8> {
    vec![cmd::GET_BATTERY_VOLTAGE]
}

/// A contact record as reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub public_key: String,
    #[serde(rename = "type")]
    pub kind: u8,
    pub flags: u8,
    pub out_path_len: i8,
    pub out_path: String,
    pub adv_name: String,
    pub last_advert: u32,
    pub adv_lat: i32,
    pub adv_lon: i32,
    pub last_mod: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfInfo {
    #[serde(rename = "type")]
    pub kind: u8,
    pub tx_power: u8,
    pub max_tx_power: u8,
    pub public_key: String,
    pub adv_lat: i32,
    pub adv_lon: i32,
    pub manual_add_contacts: u8,
    pub radio_freq: u32,
    pub radio_bw: u32,
    pub radio_sf: u8,
    pub radio_cr: u8,
    pub name: String,
}

/// Checked little-endian cursor over a response payload (code byte excluded).
pub struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], TransportError> {
        if self.remaining() < n {
            return Err(TransportError::Protocol(format!(
                "short frame: wanted {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, TransportError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, TransportError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, TransportError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, TransportError> {
        Ok(self.read_u32_le()? as i32)
    }

    /// Fixed-width, NUL-padded string field.
    pub fn read_cstring(&mut self, width: usize) -> Result<String, TransportError> {
        let raw = self.read_bytes(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// Remainder of the payload as text.
    pub fn read_rest_string(&mut self) -> String {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        String::from_utf8_lossy(&rest[..end]).into_owned()
    }
}

pub fn parse_contact(body: &[u8]) -> Result<Contact, TransportError> {
    let mut r = FrameReader::new(body);
    let public_key = hex::encode(r.read_bytes(PUBLIC_KEY_LEN)?);
    let kind = r.read_u8()?;
    let flags = r.read_u8()?;
    let out_path_len = r.read_i8()?;
    let path_raw = r.read_bytes(OUT_PATH_LEN)?;
    // Negative length means no known path (flood routing).
    let used = usize::try_from(out_path_len).unwrap_or(0).min(OUT_PATH_LEN);
    let out_path = hex::encode(&path_raw[..used]);
    let adv_name = r.read_cstring(ADV_NAME_LEN)?;
    Ok(Contact {
        public_key,
        kind,
        flags,
        out_path_len,
        out_path,
        adv_name,
        last_advert: r.read_u32_le()?,
        adv_lat: r.read_i32_le()?,
        adv_lon: r.read_i32_le()?,
        last_mod: r.read_u32_le()?,
    })
}

pub fn parse_self_info(body: &[u8]) -> Result<SelfInfo, TransportError> {
    let mut r = FrameReader::new(body);
    let kind = r.read_u8()?;
    let tx_power = r.read_u8()?;
    let max_tx_power = r.read_u8()?;
    let public_key = hex::encode(r.read_bytes(PUBLIC_KEY_LEN)?);
    let adv_lat = r.read_i32_le()?;
    let adv_lon = r.read_i32_le()?;
    r.read_bytes(3)?; // reserved
    Ok(SelfInfo {
        kind,
        tx_power,
        max_tx_power,
        public_key,
        adv_lat,
        adv_lon,
        manual_add_contacts: r.read_u8()?,
        radio_freq: r.read_u32_le()?,
        radio_bw: r.read_u32_le()?,
        radio_sf: r.read_u8()?,
        radio_cr: r.read_u8()?,
        name: r.read_rest_string(),
    })
}

pub fn parse_curr_time(body: &[u8]) -> Result<u32, TransportError> {
    FrameReader::new(body).read_u32_le()
}

pub fn parse_battery_millivolts(body: &[u8]) -> Result<u16, TransportError> {
    FrameReader::new(body).read_u16_le()
}

/// Error code carried by an `ERR` response, 0 when the radio sent none.
pub fn parse_err_code(body: &[u8]) -> u8 {
    body.first().copied().unwrap_or(0)
}
