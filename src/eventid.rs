use std::{
    fmt,
    process,
    str::FromStr,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Raw layout: 4-byte big-endian seconds since the Unix epoch, 3-byte machine
/// fingerprint, 2-byte process id, 3-byte counter. Byte-wise comparison is
/// time-ordered, and so is the encoded form.
pub const RAW_LEN: usize = 12;
pub const ENCODED_LEN: usize = 20;

const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

static MACHINE_ID: Lazy<[u8; 3]> = Lazy::new(machine_fingerprint);
static COUNTER: Lazy<AtomicU32> = Lazy::new(|| {
    let mut rng = rand::thread_rng();
    AtomicU32::new(rng.next_u32())
});

/// Globally unique, lexicographically time-sortable event identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId([u8; RAW_LEN]);

impl EventId {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Identifier for a specific instant. The counter still advances so two
    /// calls within the same second stay ordered.
    pub fn at(when: DateTime<Utc>) -> Self {
        let seconds = when.timestamp().max(0) as u32;
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
        let pid = process::id() as u16;

        let mut raw = [0u8; RAW_LEN];
        raw[0..4].copy_from_slice(&seconds.to_be_bytes());
        raw[4..7].copy_from_slice(&*MACHINE_ID);
        raw[7..9].copy_from_slice(&pid.to_be_bytes());
        raw[9] = (counter >> 16) as u8;
        raw[10] = (counter >> 8) as u8;
        raw[11] = counter as u8;
        Self(raw)
    }

    pub fn from_raw(raw: [u8; RAW_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> &[u8; RAW_LEN] {
        &self.0
    }

    /// Seconds-since-epoch component.
    pub fn seconds(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(i64::from(self.seconds()), 0).unwrap()
    }

    /// The oldest identifier that could have been allocated at
    /// `timestamp(self) - lag`: the timestamp is shifted back and the
    /// machine, process, and counter fields are cleared.
    ///
    /// Used by the lag-window logic to re-read a suffix wide enough to cover
    /// transactions that committed out of id order.
    pub fn delayed(&self, lag: Duration) -> Self {
        let millis = u64::from(self.seconds()) * 1_000;
        let delayed = millis.saturating_sub(lag.as_millis() as u64);
        let seconds = (delayed / 1_000) as u32;

        let mut raw = [0u8; RAW_LEN];
        raw[0..4].copy_from_slice(&seconds.to_be_bytes());
        Self(raw)
    }

    /// Derives the identifier for the `ordinal`-th entry of a multi-event
    /// document by offsetting the counter field. Feed-side only; stored ids
    /// are always allocated through [`EventId::new`]. Fails when the offset
    /// would overflow the 3-byte counter: a wrapped counter would sort the
    /// derived id below its own document.
    pub fn with_ordinal(&self, ordinal: u8) -> Result<Self, StoreError> {
        let counter = (u32::from(self.0[9]) << 16) | (u32::from(self.0[10]) << 8)
            | u32::from(self.0[11]);
        let counter = counter + u32::from(ordinal);
        if counter > 0x00FF_FFFF {
            return Err(StoreError::InvalidEventId(format!(
                "ordinal {ordinal} overflows the counter of {self}"
            )));
        }

        let mut raw = self.0;
        raw[9] = (counter >> 16) as u8;
        raw[10] = (counter >> 8) as u8;
        raw[11] = counter as u8;
        Ok(Self(raw))
    }

    fn encode(&self) -> String {
        let mut out = [0u8; ENCODED_LEN];
        let mut acc: u32 = 0;
        let mut bits: u32 = 0;
        let mut idx = 0;
        for &byte in &self.0 {
            acc = (acc << 8) | u32::from(byte);
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out[idx] = ALPHABET[((acc >> bits) & 0x1F) as usize];
                idx += 1;
            }
        }
        if bits > 0 {
            out[idx] = ALPHABET[((acc << (5 - bits)) & 0x1F) as usize];
        }
        String::from_utf8(out.to_vec()).expect("alphabet is ascii")
    }

    fn decode(input: &str) -> Result<Self, StoreError> {
        if input.len() != ENCODED_LEN {
            return Err(StoreError::InvalidEventId(format!(
                "expected {} characters, got {}",
                ENCODED_LEN,
                input.len()
            )));
        }

        let mut raw = [0u8; RAW_LEN];
        let mut acc: u32 = 0;
        let mut bits: u32 = 0;
        let mut idx = 0;
        for ch in input.bytes() {
            let value = match ch {
                b'0'..=b'9' => ch - b'0',
                b'a'..=b'v' => ch - b'a' + 10,
                _ => {
                    return Err(StoreError::InvalidEventId(format!(
                        "invalid character '{}'",
                        ch as char
                    )));
                }
            };
            acc = (acc << 5) | u32::from(value);
            bits += 5;
            if bits >= 8 && idx < RAW_LEN {
                bits -= 8;
                raw[idx] = ((acc >> bits) & 0xFF) as u8;
                idx += 1;
            }
        }
        Ok(Self(raw))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self([0u8; RAW_LEN])
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventId").field(&self.encode()).finish()
    }
}

impl FromStr for EventId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse::<EventId>()
            .map_err(|err| serde::de::Error::custom(err.to_string()))
    }
}

fn machine_fingerprint() -> [u8; 3] {
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("pid-{}", process::id()));
    let digest = Sha256::digest(hostname.as_bytes());
    [digest[0], digest[1], digest[2]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_to_twenty_sortable_characters() {
        let earlier = EventId::at(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        let later = EventId::at(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 5).unwrap());

        assert_eq!(earlier.to_string().len(), ENCODED_LEN);
        assert!(earlier < later);
        assert!(earlier.to_string() < later.to_string());
    }

    #[test]
    fn round_trips_through_string() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("short".parse::<EventId>().is_err());
        assert!("ZZZZZZZZZZZZZZZZZZZZ".parse::<EventId>().is_err());
    }

    #[test]
    fn ids_are_monotonic_within_a_second() {
        let now = Utc::now();
        let first = EventId::at(now);
        let second = EventId::at(now);
        assert!(first < second);
    }

    #[test]
    fn delayed_shifts_timestamp_and_clears_tail() {
        let id = EventId::at(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 10).unwrap());
        let delayed = id.delayed(Duration::from_secs(3));

        assert_eq!(delayed.seconds(), id.seconds() - 3);
        assert_eq!(&delayed.as_raw()[4..], &[0u8; 8]);
        assert!(delayed < id);
    }

    #[test]
    fn delayed_sub_second_lag_floors_to_previous_second() {
        let id = EventId::at(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 10).unwrap());
        let delayed = id.delayed(Duration::from_millis(200));
        assert_eq!(delayed.seconds(), id.seconds() - 1);
    }

    #[test]
    fn ordinal_offsets_counter() {
        let mut raw = [0u8; RAW_LEN];
        raw[0..4].copy_from_slice(&1_700_000_000u32.to_be_bytes());
        raw[11] = 0x10;
        let base = EventId::from_raw(raw);

        let third = base.with_ordinal(2).unwrap();
        assert!(base < third);
        assert_eq!(base.seconds(), third.seconds());
    }

    #[test]
    fn ordinal_overflowing_the_counter_is_rejected() {
        let mut raw = [0u8; RAW_LEN];
        raw[9] = 0xFF;
        raw[10] = 0xFF;
        raw[11] = 0xFE;
        let base = EventId::from_raw(raw);

        assert!(base.with_ordinal(1).is_ok());
        assert!(base.with_ordinal(2).is_err());
    }
}
