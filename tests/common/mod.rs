#![allow(dead_code)]

use sessile::{DriverKind, DriverRegistry, RequestContext, SessionConfig, SessionDriver};
use tempfile::TempDir;

pub fn files_config(dir: &TempDir, match_ip: bool) -> SessionConfig {
    SessionConfig::build()
        .save_path(dir.path().to_str().unwrap())
        .cookie_name("test_sess")
        .match_ip(match_ip)
        .lifetime(60)
}

pub async fn files_driver(dir: &TempDir, match_ip: bool) -> Box<dyn SessionDriver> {
    let config = files_config(dir, match_ip);
    let registry = DriverRegistry::new();
    let mut driver = registry.build(DriverKind::Files, &config).unwrap();
    driver
        .open(&config.save_path, &config.cookie_name)
        .await
        .unwrap();
    driver
}

pub fn ctx(addr: &str) -> RequestContext {
    RequestContext::from_addr(addr.parse().unwrap())
}

pub fn no_ctx() -> RequestContext {
    RequestContext::default()
}
