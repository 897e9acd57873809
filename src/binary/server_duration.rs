//! Server-duration frame value coding.
//!
//! The server reports how long it spent on a command as a 16-bit value
//! computed as `(micros * 2) ^ (1 / 1.74)`, saturating at 65535.

use std::time::Duration;

pub fn encode_server_duration(duration: Duration) -> u16 {
    let encoded = ((duration.as_micros() as f64) * 2.0).powf(1.0 / 1.74);
    if encoded > 65535.0 {
        return 65535;
    }
    encoded as u16
}

pub fn decode_server_duration(encoded: u16) -> Duration {
    let decoded = f64::from(encoded).powf(1.74) / 2.0;
    Duration::from_micros(decoded as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturates_at_u16_max() {
        assert_eq!(encode_server_duration(Duration::from_secs(3600)), 65535);
    }

    #[test]
    fn zero_round_trips() {
        assert_eq!(decode_server_duration(encode_server_duration(Duration::ZERO)), Duration::ZERO);
    }

    #[test]
    fn round_trip_stays_within_one_quantization_step() {
        for micros in [1u64, 10, 100, 1_000, 25_000, 750_000, 10_000_000, 119_000_000] {
            let original = Duration::from_micros(micros);
            let encoded = encode_server_duration(original);
            let decoded = decode_server_duration(encoded);
            let step = decode_server_duration(encoded.saturating_add(1))
                .saturating_sub(decode_server_duration(encoded));
            let delta = decoded.abs_diff(original);
            assert!(
                delta <= step + Duration::from_micros(1),
                "micros={micros} encoded={encoded} decoded={decoded:?} delta={delta:?} step={step:?}"
            );
        }
    }

    #[test]
    fn encoding_is_monotonic() {
        let mut previous = 0;
        for micros in [0u64, 1, 10, 100, 1_000, 100_000, 1_000_000, 60_000_000] {
            let encoded = encode_server_duration(Duration::from_micros(micros));
            assert!(encoded >= previous);
            previous = encoded;
        }
    }
}
