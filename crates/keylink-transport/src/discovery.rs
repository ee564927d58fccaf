//! Serial-number matching against advertised service UUIDs.

/// Number of trailing characters of a service UUID that encode the serial.
const SERIAL_SUFFIX_LEN: usize = 14;

/// Whether `service_uuid`'s last 14 characters match `serial`,
/// case-insensitively.
///
/// `serial` is the dashed `NNNNNNNN-NNNNNN` form; the UUID encodes it
/// without the dash, so the dash is stripped before comparing.
#[must_use]
pub fn serial_matches(service_uuid: &str, serial: &str) -> bool {
    let uuid_suffix = suffix(service_uuid);
    let serial_suffix = suffix(&serial.replace('-', ""));
    let matched = uuid_suffix.eq_ignore_ascii_case(&serial_suffix);
    tracing::trace!(service_uuid, serial, matched, "checked advertised service UUID against serial");
    matched
}

fn suffix(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let start = chars.len().saturating_sub(SERIAL_SUFFIX_LEN);
    chars[start..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_identical_suffix_case_insensitively() {
        assert!(serial_matches(
            "0000-1111-2222-ABCDEF12345678",
            "abcdef12345678"
        ));
    }

    #[test]
    fn rejects_mismatched_suffix() {
        assert!(!serial_matches(
            "0000-1111-2222-ABCDEF12345678",
            "00000000000000"
        ));
    }

    #[test]
    fn handles_serial_shorter_than_suffix_len() {
        assert!(serial_matches("AB12", "AB12"));
    }

    #[test]
    fn matches_dashed_serial_against_dash_free_uuid_encoding() {
        assert!(serial_matches(
            "0000-ABCDEF-12345678123456",
            "12345678-123456"
        ));
    }

    #[test]
    fn rejects_dashed_serial_when_uuid_encodes_a_different_serial() {
        assert!(!serial_matches(
            "0000-ABCDEF-00000000000000",
            "12345678-123456"
        ));
    }
}
