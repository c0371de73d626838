/// Escape a sysfs-derived string (a devpath, typically) into a single safe
/// filesystem path component, using the same hexadecimal scheme udev uses
/// for devnode names. Used to derive persistence filenames for devices
/// that have no devnum.
pub fn escape_path(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                result.push(b as char);
            }
            _ => result.push_str(&format!("\\x{b:02x}")),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_path_leaves_safe_characters_alone() {
        assert_eq!(escape_path("card0-pcm0"), "card0-pcm0");
    }

    #[test]
    fn escape_path_hex_escapes_everything_else() {
        assert_eq!(escape_path("/devices/x"), "\\x2fdevices\\x2fx");
    }
}
