//! What's a project without a util module.

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};

// 2000-01-01T00:00:00Z
static POSTGRES_EPOCH: i64 = 946684800000000000;

/// Number of microseconds since Postgres epoch.
pub fn postgres_now() -> i64 {
    let start = DateTime::from_timestamp_nanos(POSTGRES_EPOCH).fixed_offset();
    let now = Utc::now().fixed_offset();
    // Panic if overflow.
    (now - start).num_microseconds().unwrap()
}

/// Generate a random string of length n.
pub fn random_string(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_postgres_now() {
        let start = DateTime::parse_from_rfc3339("2000-01-01T00:00:00Z")
            .unwrap()
            .fixed_offset();
        assert_eq!(
            DateTime::from_timestamp_nanos(POSTGRES_EPOCH).fixed_offset(),
            start,
        );
        let _now = postgres_now();
    }
}
