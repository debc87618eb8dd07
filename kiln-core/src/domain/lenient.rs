//! Deserializers for numeric fields the control plane sends either as JSON
//! numbers or as numeric strings.

use serde::{Deserialize, Deserializer, de::Error};

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(u64),
    Str(String),
}

impl NumOrStr {
    fn into_u32<E: Error>(self) -> Result<u32, E> {
        let value = match self {
            NumOrStr::Num(n) => n,
            NumOrStr::Str(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| E::custom(format!("expected a number, got '{}'", s)))?,
        };
        u32::try_from(value).map_err(|_| E::custom(format!("{} is out of range", value)))
    }
}

pub(crate) fn u32_from_any<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    NumOrStr::deserialize(deserializer)?.into_u32()
}

pub(crate) fn opt_u32_from_any<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<NumOrStr>::deserialize(deserializer)?
        .map(NumOrStr::into_u32)
        .transpose()
}
