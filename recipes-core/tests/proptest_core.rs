//! Property-based tests for launch environment and config overrides.

use proptest::prelude::*;
use std::collections::HashMap;

use recipes_core::config::parse_override;
use recipes_core::launch::{self, LaunchEnv};

proptest! {
    #[test]
    fn preset_variables_are_never_defaulted(
        rank in 0usize..64,
        extra in 1usize..64,
        port in 1024u16..65535,
    ) {
        let world_size = rank + extra;
        let mut vars = HashMap::new();
        vars.insert(launch::RANK.to_string(), rank.to_string());
        vars.insert(launch::WORLD_SIZE.to_string(), world_size.to_string());
        vars.insert(launch::MASTER_PORT.to_string(), port.to_string());
        let lookup = |name: &str| vars.get(name).cloned();

        let missing = launch::missing_defaults(lookup);
        for (name, _) in &missing {
            prop_assert!(!vars.contains_key(*name));
        }
        prop_assert_eq!(missing.len(), 3);

        let env = LaunchEnv::from_lookup(lookup).unwrap();
        prop_assert_eq!(env.rank, rank);
        prop_assert_eq!(env.world_size, world_size);
        prop_assert_eq!(env.master_port, port);
    }

    #[test]
    fn non_numeric_rank_is_rejected(value in "[a-z]{1,8}") {
        let lookup = |name: &str| (name == launch::RANK).then(|| value.clone());
        prop_assert!(LaunchEnv::from_lookup(lookup).is_err());
    }

    #[test]
    fn integer_overrides_keep_their_type(key in "[a-z]{1,6}\\.[a-z_]{1,10}", n in 0i64..1_000_000) {
        let (parsed_key, value) = parse_override(&format!("{key}={n}")).unwrap();
        prop_assert_eq!(parsed_key, key);
        prop_assert_eq!(value, toml::Value::Integer(n));
    }
}
