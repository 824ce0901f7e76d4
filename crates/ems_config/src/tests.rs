use super::*;
use crate::settings::{PartialClientSettings, PartialQueueSettings, PartialSettings};

#[test]
fn defaults_are_valid() {
    let s = Settings::default();
    assert!(s.validate().is_ok());
    assert_eq!(s.server.tcp_address, "0.0.0.0:4150");
    assert_eq!(s.queue.mem_queue_size, 10_000);
    assert_eq!(s.scan.selection_count, 20);
    assert_eq!(s.client.max_rdy_count, 2500);
    assert!(s.lookup.lookupd_tcp_addresses.is_empty());
}

#[test]
fn partial_overlay_keeps_unset_fields() {
    let partial = PartialSettings {
        queue: Some(PartialQueueSettings {
            mem_queue_size: Some(2),
            data_path: Some("/tmp/ems-test".into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let s = Settings::default().merged(partial);
    assert_eq!(s.queue.mem_queue_size, 2);
    assert_eq!(s.queue.data_path, "/tmp/ems-test");
    // untouched sections keep defaults
    assert_eq!(s.queue.sync_every, 2500);
    assert_eq!(s.server.http_address, "0.0.0.0:4151");
}

#[test]
fn validate_rejects_inverted_timeouts() {
    let partial = PartialSettings {
        client: Some(PartialClientSettings {
            msg_timeout_ms: Some(60_000),
            max_msg_timeout_ms: Some(1_000),
            ..Default::default()
        }),
        ..Default::default()
    };
    let s = Settings::default().merged(partial);
    assert!(s.validate().is_err());
}

#[test]
fn load_config_from_file_overrides_defaults() {
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    // Create a temporary directory and set it as current dir so load_config
    // will pick up config/default.toml from there.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [server]
        tcp_address = "127.0.0.1:14150"

        [queue]
        mem_queue_size = 5
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config().expect("load_config failed");
    assert_eq!(cfg.server.tcp_address, "127.0.0.1:14150");
    assert_eq!(cfg.queue.mem_queue_size, 5);
    assert_eq!(cfg.scan.interval_ms, 100);

    env::set_current_dir(orig).expect("restore cwd");
}
