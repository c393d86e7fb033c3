//! Stream methods known to the transfer engine.

use parley_shared::constants::ns;

use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// SOCKS5 bytestreams (XEP-0065).
    Bytestreams,
    /// In-band bytestreams (XEP-0047).
    Ibb,
}

impl Method {
    pub const ALL: [Method; 2] = [Method::Bytestreams, Method::Ibb];

    pub fn namespace(self) -> &'static str {
        match self {
            Method::Bytestreams => ns::BYTESTREAMS,
            Method::Ibb => ns::IBB,
        }
    }

    /// Preference when receiving; higher wins.
    pub fn score(self) -> u8 {
        match self {
            Method::Bytestreams => 1,
            Method::Ibb => 0,
        }
    }

    pub fn from_namespace(namespace: &str) -> Option<Method> {
        Method::ALL.into_iter().find(|m| m.namespace() == namespace)
    }
}

/// Best supported method among those offered. Ties go to the one offered
/// first.
pub(crate) fn choose_recv_method(offered: &[String]) -> Option<Method> {
    let mut best: Option<Method> = None;
    for method in offered.iter().filter_map(|o| Method::from_namespace(o)) {
        if best.map_or(true, |b| method.score() > b.score()) {
            best = Some(method);
        }
    }
    best
}

/// Methods we can currently send with. Bytestreams need a proxy.
pub(crate) fn send_methods(config: &SessionConfig) -> Vec<Method> {
    Method::ALL
        .into_iter()
        .filter(|m| match m {
            Method::Bytestreams => !config.file_transfer_proxies.is_empty(),
            Method::Ibb => true,
        })
        .collect()
}
