use std::net::Ipv4Addr;

const WS_PORT: &str = "COLLECTOR_WS_PORT";

const DEFAULT_WS_PORT: u16 = 51280;

pub fn get_ws_port() -> u16 {
    let port_from_env = std::env::var(WS_PORT);
    port_from_env.map_or(DEFAULT_WS_PORT, |res| res.parse().unwrap_or(DEFAULT_WS_PORT))
}

const BIND_ADDR: &str = "COLLECTOR_ADDR";

const DEFAULT_ADDR: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

pub fn get_addr() -> Ipv4Addr {
    let addr_from_env = std::env::var(BIND_ADDR);
    addr_from_env.map_or(DEFAULT_ADDR, |res| res.parse().unwrap_or(DEFAULT_ADDR))
}
