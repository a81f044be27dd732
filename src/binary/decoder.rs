//! Node deserialization.

use super::node::{Attrs, Content, Node};
use super::token;
use super::{BinaryError, BinaryResult};

/// Deserialize a node tree, rejecting trailing bytes
pub fn unmarshal(data: &[u8]) -> BinaryResult<Node> {
    let mut decoder = Decoder {
        data,
        pos: 0,
        depth: 0,
    };
    let node = decoder.read_node()?;
    if decoder.pos != data.len() {
        return Err(BinaryError::TrailingData(data.len() - decoder.pos));
    }
    Ok(node)
}

/// Deepest child list accepted before decoding gives up
const MAX_DEPTH: usize = 64;

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    fn read_u8(&mut self) -> BinaryResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(BinaryError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_slice(&mut self, len: usize) -> BinaryResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(BinaryError::UnexpectedEof)?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(BinaryError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> BinaryResult<u16> {
        let bytes = self.read_slice(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_list_size(&mut self, tag: u8) -> BinaryResult<usize> {
        match tag {
            token::LIST_EMPTY => Ok(0),
            token::LIST_8 => Ok(self.read_u8()? as usize),
            token::LIST_16 => Ok(self.read_u16()? as usize),
            other => Err(BinaryError::InvalidToken(other)),
        }
    }

    fn read_node(&mut self) -> BinaryResult<Node> {
        let tag = self.read_u8()?;
        let list_size = self.read_list_size(tag)?;
        if list_size == 0 {
            return Err(BinaryError::InvalidNode("empty list in node position"));
        }

        let tag = self.read_string()?;
        if tag.is_empty() {
            return Err(BinaryError::InvalidNode("missing tag"));
        }

        let mut attrs = Attrs::new();
        for _ in 0..(list_size - 1) / 2 {
            let key = self.read_string()?;
            let value = self.read_string()?;
            attrs.insert(key, value);
        }

        let content = if list_size % 2 == 0 {
            self.read_content()?
        } else {
            Content::None
        };

        Ok(Node {
            tag,
            attrs,
            content,
        })
    }

    fn read_content(&mut self) -> BinaryResult<Content> {
        let tag = self.read_u8()?;
        match tag {
            token::LIST_EMPTY | token::LIST_8 | token::LIST_16 => {
                let size = self.read_list_size(tag)?;
                if self.depth >= MAX_DEPTH {
                    return Err(BinaryError::InvalidNode("nesting too deep"));
                }
                self.depth += 1;
                let mut children = Vec::with_capacity(size.min(64));
                for _ in 0..size {
                    children.push(self.read_node()?);
                }
                self.depth -= 1;
                Ok(Content::Nodes(children))
            }
            token::BINARY_8 | token::BINARY_20 | token::BINARY_32 => {
                Ok(Content::Bytes(self.read_binary(tag)?.to_vec()))
            }
            other => Err(BinaryError::InvalidToken(other)),
        }
    }

    fn read_binary(&mut self, tag: u8) -> BinaryResult<&'a [u8]> {
        let len = match tag {
            token::BINARY_8 => self.read_u8()? as usize,
            token::BINARY_20 => {
                let b = self.read_slice(3)?;
                (((b[0] & 0x0F) as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize
            }
            token::BINARY_32 => {
                let b = self.read_slice(4)?;
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            other => return Err(BinaryError::InvalidToken(other)),
        };
        self.read_slice(len)
    }

    fn read_string(&mut self) -> BinaryResult<String> {
        self.read_string_part(true)
    }

    /// JID halves are plain strings, never another JID
    fn read_string_part(&mut self, allow_jid: bool) -> BinaryResult<String> {
        let tag = self.read_u8()?;
        if !allow_jid && (tag == token::JID_PAIR || tag == token::AD_JID) {
            return Err(BinaryError::InvalidNode("jid inside jid"));
        }
        match tag {
            token::LIST_EMPTY => Ok(String::new()),
            token::BINARY_8 | token::BINARY_20 | token::BINARY_32 => {
                let bytes = self.read_binary(tag)?;
                String::from_utf8(bytes.to_vec()).map_err(|_| BinaryError::InvalidUtf8)
            }
            token::JID_PAIR => {
                let user = self.read_string_part(false)?;
                let server = self.read_string_part(false)?;
                Ok(format!("{}@{}", user, server))
            }
            token::AD_JID => {
                let device = self.read_u16()?;
                let user = self.read_string_part(false)?;
                let server = self.read_string_part(false)?;
                Ok(format!("{}:{}@{}", user, device, server))
            }
            index => token::get(index)
                .map(str::to_string)
                .ok_or(BinaryError::InvalidToken(index)),
        }
    }
}
