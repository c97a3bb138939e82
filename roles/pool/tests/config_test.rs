//! Integration test for pool configuration parsing
//!
//! Verifies that:
//! 1. The example config file can be parsed
//! 2. The stratum port table deserializes with defaults applied
//! 3. Optional sections behave when present and absent

use std::fs;

#[test]
fn test_parse_example_config() {
    let config_path = "config-examples/pool-config-example.toml";
    let config_str =
        fs::read_to_string(config_path).expect("Failed to read pool-config-example.toml");

    let config: toml::Value = toml::from_str(&config_str).expect("Failed to parse TOML config file");

    assert_eq!(config.get("network").and_then(|v| v.as_str()), Some("mainnet"));
    assert!(config.get("node_rpc_url").is_some(), "node_rpc_url should be present");
    assert!(config.get("pool_address").is_some(), "pool_address should be present");

    let fee = config
        .get("pool_fee_bps")
        .and_then(|v| v.as_integer())
        .expect("pool_fee_bps should be an integer");
    assert_eq!(fee, 200, "example config documents a 2% fee");

    let stratum = config
        .get("stratum")
        .and_then(|v| v.as_array())
        .expect("stratum port table should be present");
    assert_eq!(stratum.len(), 2);
    assert!(
        stratum[1]
            .get("allow_custom_difficulty")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        "second port is the designated configuration port"
    );
}

#[test]
fn test_port_table_defaults() {
    let minimal = r#"
        network = "testnet-10"
        node_rpc_url = "ws://127.0.0.1:17210"
        pool_address = "kaspatest:qq000"
        pool_tag = "kpool"
        pool_fee_bps = 100
        rebate_bps = 0
        database_url = "postgres://localhost/kpool"

        [[stratum]]
        port = 4444
        initial_difficulty = 64
        shares_per_minute = 20.0
        min_diff = 4
        max_diff = 32768
    "#;

    let config: pool_kas::config::PoolConfig =
        toml::from_str(minimal).expect("minimal config should deserialize");
    let port = &config.stratum[0];
    assert_eq!(port.extra_nonce_size, 2, "extranonce defaults to two bytes");
    assert!(!port.clamp_pow2);
    assert!(!port.var_diff);
    assert!(!port.allow_custom_difficulty);
    assert_eq!(config.template_cache_size, 256);
    assert_eq!(config.rpc_retry_interval_secs, 5);
    assert_eq!(config.treasury_workers, 10);
}

#[test]
fn test_rest_api_url_is_optional() {
    let without = r#"
        network = "mainnet"
        node_rpc_url = "ws://127.0.0.1:17110"
        pool_address = "kaspa:qq000"
        pool_tag = "kpool"
        pool_fee_bps = 200
        rebate_bps = 330
        database_url = "postgres://localhost/kpool"

        [[stratum]]
        port = 4444
        initial_difficulty = 64
        shares_per_minute = 20.0
        min_diff = 4
        max_diff = 32768
    "#;

    let config: pool_kas::config::PoolConfig =
        toml::from_str(without).expect("config without rest_api_url should deserialize");
    assert!(config.rest_api_url.is_none());
}
