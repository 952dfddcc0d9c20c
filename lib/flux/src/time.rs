use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current unix timestamp as a float, used for the capture timestamp
/// carried in `SlicedIndication` messages.
#[inline]
pub fn timestamp_f64() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_agree_to_the_second() {
        let secs = timestamp_secs();
        let f64_secs = timestamp_f64();
        assert!((f64_secs - secs as f64).abs() < 2.0);
    }
}
