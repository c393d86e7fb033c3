/// Application name, advertised in service discovery and version replies.
pub const APP_NAME: &str = "Parley";

/// Default lifetime of an outstanding IQ request in seconds.
pub const DEFAULT_IQ_TIMEOUT_SECS: u64 = 30;

/// Interval between two scans of the request timeout table, in milliseconds.
pub const DEFAULT_TIMEOUT_CHECK_MS: u64 = 1_000;

/// Per-subscriber event buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 100;

/// Initial in-band-bytes block size in bytes (XEP-0047).
pub const DEFAULT_IBB_BLOCK_SIZE: usize = 4096;

/// Number of in-band-bytes units sent per scheduling tick.
pub const IBB_BURST: usize = 5;

/// Delay between two in-band-bytes bursts, in milliseconds.
pub const DEFAULT_IBB_SEND_INTERVAL_MS: u64 = 200;

/// How long a single in-band-bytes acknowledgement is waited for (5 minutes).
pub const DEFAULT_IBB_ACK_TIMEOUT_SECS: u64 = 300;

/// Per-streamhost connection timeout for the byte-stream method.
pub const DEFAULT_BYTESTREAM_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Read/write chunk used on an established byte-stream connection (64 KiB).
pub const DEFAULT_BYTESTREAM_CHUNK_SIZE: usize = 64 * 1024;

/// XML namespaces used by the session core.
pub mod ns {
    pub const CLIENT: &str = "jabber:client";
    pub const STREAMS: &str = "http://etherx.jabber.org/streams";
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";

    pub const ROSTER: &str = "jabber:iq:roster";
    pub const VERSION: &str = "jabber:iq:version";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const PING: &str = "urn:xmpp:ping";
    pub const BOB: &str = "urn:xmpp:bob";
    pub const CAPS: &str = "http://jabber.org/protocol/caps";
    pub const VCARD: &str = "vcard-temp";
    pub const DATA_FORMS: &str = "jabber:x:data";
    pub const DELAY: &str = "urn:xmpp:delay";
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";

    pub const SI: &str = "http://jabber.org/protocol/si";
    pub const SI_FILE_TRANSFER: &str = "http://jabber.org/protocol/si/profile/file-transfer";
    pub const SI_DIRECTORY_TRANSFER: &str =
        "http://jabber.org/protocol/si/profile/directory-transfer";
    pub const FEATURE_NEG: &str = "http://jabber.org/protocol/feature-neg";
    pub const IBB: &str = "http://jabber.org/protocol/ibb";
    pub const BYTESTREAMS: &str = "http://jabber.org/protocol/bytestreams";
}
