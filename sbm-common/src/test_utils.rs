//! Feature-gated roundtrip helpers shared across crate boundaries.

/// JSON roundtrip proptest helpers.
pub mod roundtrip {
    use std::fmt::Debug;

    use proptest::arbitrary::{any, Arbitrary};
    use proptest::strategy::Strategy;
    use proptest::test_runner::Config;
    use proptest::{prop_assert_eq, proptest};
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    /// Quickly create a [`serde_json::Value`] canonical roundtrip proptest.
    /// Useful for dictionary-like types that serialize to/from a JSON object,
    /// since the serialized json string doesn't guarantee field order is
    /// preserved, whereas `Value` comparison is field order-invariant.
    pub fn json_value_canonical_proptest<T>()
    where
        T: Arbitrary + PartialEq + Serialize + DeserializeOwned,
    {
        json_value_custom(any::<T>(), Config::default());
    }

    pub fn json_value_custom<S, T>(strategy: S, config: Config)
    where
        S: Strategy<Value = T>,
        T: PartialEq + Serialize + DeserializeOwned + Debug,
    {
        proptest!(config, |(value1 in strategy)| {
            let json_value1 = serde_json::to_value(&value1).unwrap();
            let value2 = serde_json::from_value(json_value1.clone()).unwrap();
            let json_value2 = serde_json::to_value(&value2).unwrap();

            prop_assert_eq!(&value1, &value2);
            prop_assert_eq!(&json_value1, &json_value2);
        });
    }

    /// Quickly create a JSON string roundtrip proptest. Useful for simple
    /// data types that map to/from a single base JSON type (string, int, ..).
    pub fn json_string_roundtrip_proptest<T>()
    where
        T: Arbitrary + PartialEq + Serialize + DeserializeOwned,
    {
        json_string_custom(any::<T>(), Config::default());
    }

    pub fn json_string_custom<S, T>(strategy: S, config: Config)
    where
        S: Strategy<Value = T>,
        T: PartialEq + Serialize + DeserializeOwned + Debug,
    {
        proptest!(config, |(value1 in strategy)| {
            let json_value1 = serde_json::to_string(&value1).unwrap();
            let value2 = serde_json::from_str::<T>(&json_value1).unwrap();
            prop_assert_eq!(&value1, &value2);
        });
    }
}
