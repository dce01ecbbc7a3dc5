use std::fmt::Display;
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Deserializer, Serializer};

pub mod add;
pub mod annotations;
pub mod check;
pub mod config;
pub mod delete;
pub mod error;
pub mod identity;
pub mod ipam;
pub mod netlink;
pub mod netns;
pub mod nodename;
pub mod response;
pub mod types;
pub mod version;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;


/// Version emitted when the network config does not pin one.
pub const CNI_VERSION: Version = Version::new(0, 3, 1);

pub const SUPPORTED_CNI_VERSIONS: [Version; 3] = [
    Version::new(0, 2, 0),
    Version::new(0, 3, 0),
    Version::new(0, 3, 1),
];

pub fn serialize_to_string<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

pub fn deserialize_from_str<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

pub fn serialize_to_string_slice<T, S>(values: &[T], serializer: S) -> Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.collect_seq(values.iter().map(|v| v.to_string()))
}

pub fn deserialize_from_str_vec<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    let strings = Vec::<String>::deserialize(deserializer)?;
    strings
        .into_iter()
        .map(|s| s.parse().map_err(serde::de::Error::custom))
        .collect()
}
