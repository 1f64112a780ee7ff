use std::net::SocketAddr;

use sysinfo::System;

const WARDEN_TOKEN: &str = "WARDEN_TOKEN";

const WARDEN_ENDPOINT: &str = "WARDEN_ENDPOINT";

const WARDEN_HUB_BIND: &str = "WARDEN_HUB_BIND";

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

pub fn env_token() -> Option<String> {
    non_empty_var(WARDEN_TOKEN)
}

pub fn env_endpoint() -> Option<String> {
    non_empty_var(WARDEN_ENDPOINT)
}

pub fn env_hub_bind() -> Option<SocketAddr> {
    non_empty_var(WARDEN_HUB_BIND).and_then(|addr| addr.parse().ok())
}

pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| String::from("unknown"))
}
