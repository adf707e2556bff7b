use std::{
    borrow::Cow,
    net::{IpAddr, Ipv4Addr},
};

/// Normalize a bind/listen address.
///
/// Accepts the shorthand `":PORT"` to mean "bind on all interfaces". Rust's
/// `SocketAddr` parsing and Tokio bind APIs do not accept `":PORT"`, so we
/// normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Best-effort lookup of a non-loopback IPv4 address of this host, for display.
///
/// Enumeration failures are not fatal; the caller just gets `None`.
pub fn discover_host_ipv4() -> Option<Ipv4Addr> {
    match get_if_addrs::get_if_addrs() {
        Ok(ifaces) => first_non_loopback_ipv4(ifaces.iter().map(|i| i.ip())),
        Err(err) => {
            tracing::debug!(err = %err, "net: interface enumeration failed");
            None
        }
    }
}

fn first_non_loopback_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|ip| match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
        _ => None,
    })
}
