//! Encoding and decoding of the two uevent wire formats carried over
//! `NETLINK_KOBJECT_UEVENT`.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::rule::Action;

pub const MAGIC_PREFIX: &[u8; 8] = b"libudev\0";
pub const MAGIC_VALUE: u32 = 0xfeed_cafe;

/// Size in bytes of the libudev netlink header: 8-byte prefix plus
/// magic/header_size/properties_off/properties_len/filter_subsystem_hash/
/// filter_devtype_hash/filter_tag_bloom_hi/filter_tag_bloom_lo, each a
/// big-endian `u32`.
const HEADER_SIZE: u32 = 40;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message has no header line")]
    MissingHeader,
    #[error("header line is not ACTION@DEVPATH")]
    MalformedHeader,
    #[error("unrecognized action {0:?}")]
    UnknownAction(String),
    #[error("libudev header is truncated")]
    TruncatedLibudevHeader,
    #[error("libudev magic value mismatch")]
    BadMagic,
    #[error("properties block exceeds buffer length")]
    PropertiesOutOfBounds,
}

/// A decoded uevent, in either wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UEventMessage {
    pub action: Action,
    pub devpath: String,
    pub properties: HashMap<String, String>,
    /// Present only for libudev-origin messages; kernel-origin messages
    /// carry no bloom filter and the receiver must rebuild one from the
    /// device's current tag set.
    pub tag_bloom: Option<u64>,
}

impl UEventMessage {
    pub fn new(action: Action, devpath: impl Into<String>) -> Self {
        Self {
            action,
            devpath: devpath.into(),
            properties: HashMap::new(),
            tag_bloom: None,
        }
    }

    /// Strip the property environment, keeping only action/devpath. Used
    /// when forwarding an event whose `ENV` component was already shipped
    /// separately via `SYNC`.
    pub fn stripped_of_env(&self) -> Self {
        Self {
            action: self.action,
            devpath: self.devpath.clone(),
            properties: HashMap::new(),
            tag_bloom: self.tag_bloom,
        }
    }

    fn header_line(&self) -> String {
        format!("{}@{}", self.action.as_str(), self.devpath)
    }

    /// Encode as a raw kernel-format uevent: `ACTION@DEVPATH\0` followed
    /// by `\0`-separated `KEY=VALUE` properties, no libudev header.
    pub fn encode_kernel(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.header_line().as_bytes());
        out.push(0);
        for (k, v) in &self.properties {
            out.extend_from_slice(format!("{k}={v}").as_bytes());
            out.push(0);
        }
        out
    }

    /// Encode as a libudev-format message: magic header, then the same
    /// `ACTION@DEVPATH\0`-prefixed property block so kernel-format
    /// consumers can still parse it.
    pub fn encode_libudev(&self) -> Vec<u8> {
        let mut properties = Vec::new();
        properties.extend_from_slice(self.header_line().as_bytes());
        properties.push(0);
        properties.extend_from_slice(b"ACTION=");
        properties.extend_from_slice(self.action.as_str().as_bytes());
        properties.push(0);
        properties.extend_from_slice(b"DEVPATH=");
        properties.extend_from_slice(self.devpath.as_bytes());
        properties.push(0);
        for (k, v) in &self.properties {
            if k == "ACTION" || k == "DEVPATH" {
                continue;
            }
            properties.extend_from_slice(format!("{k}={v}").as_bytes());
            properties.push(0);
        }

        let bloom = self.tag_bloom.unwrap_or(0);

        let mut out = Vec::with_capacity(HEADER_SIZE as usize + properties.len());
        out.extend_from_slice(MAGIC_PREFIX);
        out.extend_from_slice(&MAGIC_VALUE.to_be_bytes());
        out.extend_from_slice(&HEADER_SIZE.to_be_bytes());
        out.extend_from_slice(&HEADER_SIZE.to_be_bytes()); // properties offset
        out.extend_from_slice(&(properties.len() as u32).to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // filter_subsystem_hash, unused
        out.extend_from_slice(&0u32.to_be_bytes()); // filter_devtype_hash, unused
        out.extend_from_slice(&((bloom >> 32) as u32).to_be_bytes());
        out.extend_from_slice(&(bloom as u32).to_be_bytes());
        out.extend_from_slice(&properties);
        out
    }

    /// Decode either wire form. Returns the message plus whether the
    /// receiver must rebuild the tag bloom from the device itself (true
    /// for kernel-origin messages, which carry none).
    pub fn decode(buf: &[u8]) -> Result<(Self, bool), DecodeError> {
        if buf.starts_with(MAGIC_PREFIX) {
            Self::decode_libudev(buf)
        } else {
            Self::decode_kernel(buf).map(|msg| (msg, true))
        }
    }

    fn decode_kernel(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut fields = buf.split(|&b| b == 0).filter(|f| !f.is_empty());
        let header = fields.next().ok_or(DecodeError::MissingHeader)?;
        let header = std::str::from_utf8(header).map_err(|_| DecodeError::MalformedHeader)?;
        let (action, devpath) = header.split_once('@').ok_or(DecodeError::MalformedHeader)?;
        let action = Action::parse(action).ok_or_else(|| DecodeError::UnknownAction(action.to_string()))?;

        let mut properties = HashMap::new();
        for field in fields {
            let field = String::from_utf8_lossy(field);
            if let Some((k, v)) = field.split_once('=') {
                properties.insert(k.to_string(), v.to_string());
            }
        }

        Ok(Self {
            action,
            devpath: devpath.to_string(),
            properties,
            tag_bloom: None,
        })
    }

    fn decode_libudev(buf: &[u8]) -> Result<(Self, bool), DecodeError> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(DecodeError::TruncatedLibudevHeader);
        }
        let magic = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        if magic != MAGIC_VALUE {
            return Err(DecodeError::BadMagic);
        }
        let properties_off = u32::from_be_bytes(buf[16..20].try_into().unwrap()) as usize;
        let properties_len = u32::from_be_bytes(buf[20..24].try_into().unwrap()) as usize;
        // buf[24..28] / buf[28..32] are filter_subsystem_hash / filter_devtype_hash, unused.
        let bloom_hi = u32::from_be_bytes(buf[32..36].try_into().unwrap()) as u64;
        let bloom_lo = u32::from_be_bytes(buf[36..40].try_into().unwrap()) as u64;

        let end = properties_off
            .checked_add(properties_len)
            .filter(|&end| end <= buf.len())
            .ok_or(DecodeError::PropertiesOutOfBounds)?;
        let properties_buf = &buf[properties_off..end];

        let mut msg = Self::decode_kernel(properties_buf)?;
        msg.tag_bloom = Some((bloom_hi << 32) | bloom_lo);
        Ok((msg, false))
    }
}

/// Compute the 64-bit tag bloom filter udev consumers use for cheap
/// subscription filtering.
pub fn tag_bloom(tags: &BTreeSet<String>) -> u64 {
    let mut bloom: u64 = 0;
    for tag in tags {
        bloom |= bloom_bits(tag);
    }
    bloom
}

fn bloom_bits(tag: &str) -> u64 {
    // Two independent hashes of the tag each set one bit, the classic
    // two-hash bloom-filter construction.
    let h1 = fnv1a(tag, 0x811c_9dc5) % 64;
    let h2 = fnv1a(tag, 0x9e37_79b9) % 64;
    (1u64 << h1) | (1u64 << h2)
}

fn fnv1a(s: &str, seed: u32) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ seed as u64;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Test whether `tag` may be a member of a bloom filter built by
/// [`tag_bloom`]. False positives are possible; false negatives are not.
pub fn bloom_may_contain(bloom: u64, tag: &str) -> bool {
    bloom & bloom_bits(tag) == bloom_bits(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UEventMessage {
        let mut msg = UEventMessage::new(Action::Add, "/devices/virtual/sound/card0/pcmC0D0p");
        msg.properties.insert("SUBSYSTEM".into(), "sound".into());
        msg.properties.insert("GROUP".into(), "audio".into());
        msg
    }

    #[test]
    fn kernel_round_trip() {
        let msg = sample();
        let buf = msg.encode_kernel();
        let (decoded, needs_bloom) = UEventMessage::decode(&buf).unwrap();
        assert!(needs_bloom);
        assert_eq!(decoded.action, msg.action);
        assert_eq!(decoded.devpath, msg.devpath);
        assert_eq!(decoded.properties, msg.properties);
        assert_eq!(decoded.tag_bloom, None);
    }

    #[test]
    fn libudev_round_trip_carries_bloom() {
        let mut msg = sample();
        let tags: BTreeSet<String> = ["seat", "uaccess"].into_iter().map(String::from).collect();
        msg.tag_bloom = Some(tag_bloom(&tags));
        let buf = msg.encode_libudev();
        assert!(buf.starts_with(MAGIC_PREFIX));
        let (decoded, needs_bloom) = UEventMessage::decode(&buf).unwrap();
        assert!(!needs_bloom);
        assert_eq!(decoded.action, msg.action);
        assert_eq!(decoded.devpath, msg.devpath);
        assert_eq!(decoded.properties, msg.properties);
        assert_eq!(decoded.tag_bloom, msg.tag_bloom);
    }

    #[test]
    fn libudev_decode_rejects_bad_magic() {
        let mut buf = sample().encode_libudev();
        buf[8] = 0;
        assert_eq!(UEventMessage::decode(&buf).unwrap_err(), DecodeError::BadMagic);
    }

    #[test]
    fn bloom_filter_has_no_false_negatives() {
        let tags: BTreeSet<String> = ["seat", "uaccess", "power-switch"]
            .into_iter()
            .map(String::from)
            .collect();
        let bloom = tag_bloom(&tags);
        for tag in &tags {
            assert!(bloom_may_contain(bloom, tag));
        }
    }

    #[test]
    fn stripped_of_env_keeps_action_and_devpath() {
        let msg = sample();
        let stripped = msg.stripped_of_env();
        assert!(stripped.properties.is_empty());
        assert_eq!(stripped.devpath, msg.devpath);
    }
}
