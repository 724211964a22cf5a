use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::SchemaError;

/// `major.minor.patch` schema version, ordered numerically.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SchemaVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for SchemaVersion {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemaError::InvalidVersion(s.to_string());

        let mut parts = [0u64; 3];
        let mut count = 0;
        for part in s.split('.') {
            if count == 3 || part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            parts[count] = part.parse().map_err(|_| invalid())?;
            count += 1;
        }
        if count != 3 {
            return Err(invalid());
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl core::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_three_numeric_parts() {
        assert_eq!("1.10.0".parse::<SchemaVersion>().unwrap(), SchemaVersion::new(1, 10, 0));
    }

    #[test]
    fn rejects_malformed_versions() {
        for bad in ["1.0", "1.0.0.0", "v1.0.0", "1..0", "1.0.x", "", "1.0.-1", " 1.0.0"] {
            let err = bad.parse::<SchemaVersion>().unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("Invalid semantic version: {bad}. Expected format: major.minor.patch")
            );
        }
    }

    #[test]
    fn orders_numerically_not_lexically() {
        let v2: SchemaVersion = "1.2.0".parse().unwrap();
        let v10: SchemaVersion = "1.10.0".parse().unwrap();
        assert!(v10 > v2);
    }

    proptest! {
        #[test]
        fn display_parse_round_trip(major in 0u64..10_000, minor in 0u64..10_000, patch in 0u64..10_000) {
            let version = SchemaVersion::new(major, minor, patch);
            prop_assert_eq!(version.to_string().parse::<SchemaVersion>().unwrap(), version);
        }

        #[test]
        fn ordering_matches_component_tuples(
            a in (0u64..50, 0u64..50, 0u64..50),
            b in (0u64..50, 0u64..50, 0u64..50),
        ) {
            let va = SchemaVersion::new(a.0, a.1, a.2);
            let vb = SchemaVersion::new(b.0, b.1, b.2);
            prop_assert_eq!(va.cmp(&vb), a.cmp(&b));
        }
    }
}
