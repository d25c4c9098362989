//! Auto-accept sequence decoding (SPEC_FULL.md §4.4): maps an agent's
//! `auto_accept_mode` string to the raw bytes sent to the terminal shortly
//! after the agent command is launched.

/// Returns the bytes to send, or `None` when the mode is empty/disabled.
pub fn decode_auto_accept(mode: &str) -> Option<Vec<u8>> {
    let normalized = mode.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "" | "none" | "optional" | "disabled" => None,
        "supported" | "enter" | "return" => Some(b"\n".to_vec()),
        "tab" => Some(b"\t".to_vec()),
        "shift+tab" | "shift-tab" | "backtab" => Some(b"\x1b[Z".to_vec()),
        "ctrl+c" | "ctrl-c" => Some(b"\x03".to_vec()),
        _ if mode.contains('\\') => Some(decode_c_escapes(mode)),
        _ => Some(mode.as_bytes().to_vec()),
    }
}

fn decode_c_escapes(raw: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c as u8);
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some('e') => out.push(0x1b),
            Some('\\') => out.push(b'\\'),
            Some(other) => {
                out.push(b'\\');
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => out.push(b'\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_modes_send_nothing() {
        for mode in ["", "none", "optional", "disabled"] {
            assert_eq!(decode_auto_accept(mode), None);
        }
    }

    #[test]
    fn named_modes_map_to_expected_bytes() {
        assert_eq!(decode_auto_accept("enter"), Some(b"\n".to_vec()));
        assert_eq!(decode_auto_accept("Tab"), Some(b"\t".to_vec()));
        assert_eq!(decode_auto_accept("shift-tab"), Some(b"\x1b[Z".to_vec()));
        assert_eq!(decode_auto_accept("ctrl+c"), Some(b"\x03".to_vec()));
    }

    #[test]
    fn backslash_sequences_decode_as_c_escapes() {
        assert_eq!(decode_auto_accept("y\\n"), Some(b"y\n".to_vec()));
    }

    #[test]
    fn verbatim_strings_pass_through() {
        assert_eq!(decode_auto_accept("y"), Some(b"y".to_vec()));
    }
}
