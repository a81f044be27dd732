//! Node serialization.

use super::node::{Content, Node};
use super::token;
use crate::types::Jid;

/// Largest length a `BINARY_20` header can carry
const BINARY_20_MAX: usize = 1 << 20;

/// Serialize a node tree
pub fn marshal(node: &Node) -> Vec<u8> {
    let mut encoder = Encoder::default();
    encoder.write_node(node);
    encoder.data
}

#[derive(Default)]
struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    fn write_node(&mut self, node: &Node) {
        let has_content = !matches!(node.content, Content::None);
        let list_size = 1 + 2 * node.attrs.len() + usize::from(has_content);

        self.write_list_start(list_size);
        self.write_string(&node.tag);
        for (key, value) in &node.attrs {
            self.write_string(key);
            self.write_string(value);
        }

        match &node.content {
            Content::None => {}
            Content::Bytes(bytes) => self.write_bytes(bytes),
            Content::Nodes(children) => {
                self.write_list_start(children.len());
                for child in children {
                    self.write_node(child);
                }
            }
        }
    }

    fn write_list_start(&mut self, size: usize) {
        if size == 0 {
            self.data.push(token::LIST_EMPTY);
        } else if size < 256 {
            self.data.push(token::LIST_8);
            self.data.push(size as u8);
        } else {
            self.data.push(token::LIST_16);
            self.data.extend_from_slice(&(size as u16).to_be_bytes());
        }
    }

    fn write_string(&mut self, s: &str) {
        if s.contains('@') {
            if let Ok(jid) = s.parse::<Jid>() {
                // Only when decoding reproduces the exact text
                if jid.to_string() == s && !jid.user.is_empty() {
                    self.write_jid(&jid);
                    return;
                }
            }
        }
        self.write_plain_string(s);
    }

    fn write_plain_string(&mut self, s: &str) {
        if s.is_empty() {
            self.data.push(token::LIST_EMPTY);
            return;
        }
        if let Some(index) = token::index_of(s) {
            self.data.push(index);
            return;
        }
        self.write_bytes(s.as_bytes());
    }

    fn write_jid(&mut self, jid: &Jid) {
        if jid.is_ad() {
            self.data.push(token::AD_JID);
            self.data.extend_from_slice(&jid.device.to_be_bytes());
        } else {
            self.data.push(token::JID_PAIR);
        }
        self.write_plain_string(&jid.user);
        self.write_plain_string(&jid.server);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        let len = bytes.len();
        if len < 256 {
            self.data.push(token::BINARY_8);
            self.data.push(len as u8);
        } else if len < BINARY_20_MAX {
            self.data.push(token::BINARY_20);
            self.data.push(((len >> 16) & 0x0F) as u8);
            self.data.push(((len >> 8) & 0xFF) as u8);
            self.data.push((len & 0xFF) as u8);
        } else {
            self.data.push(token::BINARY_32);
            self.data.extend_from_slice(&(len as u32).to_be_bytes());
        }
        self.data.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_single_bytes() {
        let bytes = marshal(&Node::new("iq").attr("type", "result"));
        // LIST_8, size 3, "iq", "type", "result"
        assert_eq!(bytes.len(), 5);
        assert_eq!(bytes[0], token::LIST_8);
        assert_eq!(bytes[1], 3);
    }

    #[test]
    fn test_jid_attribute_uses_pair_token() {
        let bytes = marshal(&Node::new("message").attr("from", "15550001@s.tether.net"));
        assert!(bytes.contains(&token::JID_PAIR));

        let bytes = marshal(&Node::new("message").attr("from", "15550001:2@s.tether.net"));
        assert!(bytes.contains(&token::AD_JID));
    }

    #[test]
    fn test_non_canonical_jid_text_stays_a_string() {
        let bytes = marshal(&Node::new("message").attr("from", "15550001:02@s.tether.net"));
        assert!(!bytes.contains(&token::AD_JID));
    }

    #[test]
    fn test_server_with_at_sign_decodes() {
        let node = Node::new("message").attr("from", "a@b@c");
        assert_eq!(super::super::unmarshal(&marshal(&node)).unwrap(), node);
    }

    #[test]
    fn test_large_binary_header() {
        let node = Node::new("enc").bytes_content(vec![7u8; 70_000]);
        let bytes = marshal(&node);
        assert!(bytes.contains(&token::BINARY_20));
    }
}
