//! `#[serde(with = "serde_hex")]` for addresses. Addresses are written as
//! `"0x..."` strings so reports stay readable, and either form is accepted
//! when reading one back.

use std::fmt;

use serde::{de::Visitor, Deserializer, Serializer};

use crate::Addr;

pub fn serialize<S>(value: &Addr, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&format_args!("{value:#x}"))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Addr, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> Visitor<'de> for V {
        type Value = Addr;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an address, as an integer or a 0x-prefixed hex string")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Addr::try_from(v).map_err(|_| E::custom(format!("address {v:#x} does not fit")))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let digits = v
                .strip_prefix("0x")
                .or_else(|| v.strip_prefix("0X"))
                .ok_or_else(|| E::custom(format!("missing 0x prefix in {v:?}")))?;
            Addr::from_str_radix(digits, 16).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(V)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper(#[serde(with = "super")] usize);

    #[test]
    fn accepts_integers_and_hex_strings() {
        assert_eq!(serde_json::to_string(&Wrapper(255)).unwrap(), "\"0xff\"");
        assert_eq!(serde_json::from_str::<Wrapper>("\"0xff\"").unwrap(), Wrapper(255));
        assert_eq!(serde_json::from_str::<Wrapper>("4096").unwrap(), Wrapper(4096));
        assert!(serde_json::from_str::<Wrapper>("\"ff\"").is_err());
    }
}
