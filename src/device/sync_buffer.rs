//! The compact carrier used to ship a slice of [`Device`](super::Device)
//! state across the host/container boundary.

use std::collections::{BTreeSet, HashMap};

use bitflags::bitflags;

bitflags! {
    /// Which components of a device's state a [`SyncBuffer`] carries.
    /// `E` is the property environment, `G` is the tag set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncSelector: u8 {
        const ENV  = 0b01;
        const TAGS = 0b10;
    }
}

impl SyncSelector {
    /// Parse the `forward`/`cgroups`-style string tokens used in rule
    /// contexts (`"ENV"`, `"TAGS"`) into a selector.
    pub fn from_tokens<'a>(tokens: impl IntoIterator<Item = &'a str>) -> Self {
        let mut selector = SyncSelector::empty();
        for token in tokens {
            match token {
                "ENV" => selector |= SyncSelector::ENV,
                "TAGS" => selector |= SyncSelector::TAGS,
                _ => {}
            }
        }
        selector
    }
}

/// A serialized slice of device state selected by [`SyncSelector`].
///
/// Wire format: one line per selected component, newline-separated,
/// `KEY=VALUE` pairs for `ENV` and a space-separated tag list for `TAGS`,
/// each component prefixed with its one-letter tag so a receiver who only
/// asked for one component can still skip the other safely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncBuffer {
    pub env: Option<HashMap<String, String>>,
    pub tags: Option<BTreeSet<String>>,
}

impl SyncBuffer {
    pub fn serialize(
        selector: SyncSelector,
        env: &HashMap<String, String>,
        tags: &BTreeSet<String>,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        if selector.contains(SyncSelector::ENV) {
            out.extend_from_slice(b"E");
            for (k, v) in env {
                out.extend_from_slice(k.as_bytes());
                out.push(b'=');
                out.extend_from_slice(v.as_bytes());
                out.push(b'\0');
            }
            out.push(b'\n');
        }
        if selector.contains(SyncSelector::TAGS) {
            out.extend_from_slice(b"G");
            for tag in tags {
                out.extend_from_slice(tag.as_bytes());
                out.push(b'\0');
            }
            out.push(b'\n');
        }
        out
    }

    pub fn deserialize(buf: &[u8]) -> Self {
        let mut result = SyncBuffer::default();
        for line in buf.split(|&b| b == b'\n') {
            let Some((&tag, rest)) = line.split_first() else {
                continue;
            };
            match tag {
                b'E' => {
                    let mut env = HashMap::new();
                    for field in rest.split(|&b| b == 0).filter(|f| !f.is_empty()) {
                        if let Some(eq) = field.iter().position(|&b| b == b'=') {
                            let key = String::from_utf8_lossy(&field[..eq]).into_owned();
                            let value = String::from_utf8_lossy(&field[eq + 1..]).into_owned();
                            env.insert(key, value);
                        }
                    }
                    result.env = Some(env);
                }
                b'G' => {
                    let mut tags = BTreeSet::new();
                    for field in rest.split(|&b| b == 0).filter(|f| !f.is_empty()) {
                        tags.insert(String::from_utf8_lossy(field).into_owned());
                    }
                    result.tags = Some(tags);
                }
                _ => {}
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (HashMap<String, String>, BTreeSet<String>) {
        let mut env = HashMap::new();
        env.insert("SUBSYSTEM".to_string(), "sound".to_string());
        env.insert("GROUP".to_string(), "audio".to_string());
        let tags: BTreeSet<String> = ["seat", "uaccess"].into_iter().map(String::from).collect();
        (env, tags)
    }

    #[test]
    fn round_trip_both_components() {
        let (env, tags) = sample();
        let sel = SyncSelector::ENV | SyncSelector::TAGS;
        let buf = SyncBuffer::serialize(sel, &env, &tags);
        let out = SyncBuffer::deserialize(&buf);
        assert_eq!(out.env.unwrap(), env);
        assert_eq!(out.tags.unwrap(), tags);
    }

    #[test]
    fn round_trip_env_only_leaves_tags_unset() {
        let (env, tags) = sample();
        let buf = SyncBuffer::serialize(SyncSelector::ENV, &env, &tags);
        let out = SyncBuffer::deserialize(&buf);
        assert_eq!(out.env.unwrap(), env);
        assert!(out.tags.is_none());
    }

    #[test]
    fn round_trip_tags_only_leaves_env_unset() {
        let (env, tags) = sample();
        let buf = SyncBuffer::serialize(SyncSelector::TAGS, &env, &tags);
        let out = SyncBuffer::deserialize(&buf);
        assert!(out.env.is_none());
        assert_eq!(out.tags.unwrap(), tags);
    }

    #[test]
    fn round_trip_empty_selector_is_empty_buffer() {
        let (env, tags) = sample();
        let buf = SyncBuffer::serialize(SyncSelector::empty(), &env, &tags);
        assert!(buf.is_empty());
        let out = SyncBuffer::deserialize(&buf);
        assert!(out.env.is_none() && out.tags.is_none());
    }
}
