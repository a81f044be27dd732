//! Wire tokens and the single-byte string dictionary.

/// Empty list, or the empty string in string position
pub const LIST_EMPTY: u8 = 0;
/// Device-addressed JID: u16 device, user string, server string
pub const AD_JID: u8 = 247;
/// List with a u8 size
pub const LIST_8: u8 = 248;
/// List with a u16 size
pub const LIST_16: u8 = 249;
/// User-level JID: user string, server string
pub const JID_PAIR: u8 = 250;
/// Byte string with a u8 length
pub const BINARY_8: u8 = 252;
/// Byte string with a 20-bit length
pub const BINARY_20: u8 = 253;
/// Byte string with a u32 length
pub const BINARY_32: u8 = 254;

/// Strings encoded as a single byte. Index 0 is reserved for [`LIST_EMPTY`].
///
/// Append only: reordering changes the wire format.
pub const SINGLE_BYTE_TOKENS: &[&str] = &[
    "",
    "iq",
    "type",
    "id",
    "from",
    "to",
    "result",
    "error",
    "set",
    "get",
    "xmlns",
    "message",
    "enc",
    "msg",
    "pkmsg",
    "v",
    "ack",
    "receipt",
    "class",
    "notification",
    "success",
    "failure",
    "stream:error",
    "code",
    "text",
    "reason",
    "t",
    "notify",
    "participant",
    "md",
    "pair-device",
    "pair-success",
    "pair-device-sign",
    "ref",
    "device-identity",
    "key-index",
    "platform",
    "biz",
    "name",
    "device",
    "jid",
    "ping",
    "urn:xmpp:ping",
    "conflict",
    "replaced",
    "retry",
    "count",
    "offline",
    "ib",
    "passive",
    "active",
    "delivery",
    "read",
    "s.tether.net",
    "tether.net",
    "401",
    "500",
    "515",
    "lid",
    "edge_routing",
    "dirty",
    "encrypt",
];

/// Look up the dictionary index of `s`
pub fn index_of(s: &str) -> Option<u8> {
    SINGLE_BYTE_TOKENS
        .iter()
        .skip(1)
        .position(|t| *t == s)
        .map(|i| (i + 1) as u8)
}

/// Resolve a dictionary byte
pub fn get(index: u8) -> Option<&'static str> {
    if index == LIST_EMPTY {
        return None;
    }
    SINGLE_BYTE_TOKENS.get(index as usize).copied()
}
