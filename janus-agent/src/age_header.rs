//! age v1 header parsing.
//!
//! Only the text header is read.  The binary payload that follows the MAC
//! line is left untouched; [`Header::payload_offset`] says where it starts.
//!
//! ```text
//! age-encryption.org/v1
//! -> ssh-ed25519 Xyz123 <ephemeral share>
//! <base64 body, 64 columns per line, final line shorter (maybe empty)>
//! --- <base64 MAC>
//! <payload>
//! ```

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;

use crate::error::{Error, Result};

pub const VERSION_LINE: &str = "age-encryption.org/v1";

const STANZA_PREFIX: &str = "->";
const MAC_PREFIX: &str = "---";
const BODY_COLUMNS: usize = 64;
const MAC_LEN: usize = 32;

/// One recipient stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    pub tag: String,
    pub args: Vec<String>,
    pub body: Vec<u8>,
}

/// Parsed age header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub recipients: Vec<Stanza>,
    pub mac: [u8; MAC_LEN],
    payload_offset: usize,
}

impl Header {
    /// Parse the header at the start of `input`.
    pub fn parse(input: &[u8]) -> Result<Self> {
        let mut lines = Lines { input, pos: 0 };

        let version = lines.next_line()?;
        if version != VERSION_LINE {
            return Err(malformed("missing or unsupported version line"));
        }

        let mut recipients = Vec::new();
        let mut pending = lines.next_line()?;
        loop {
            if let Some(rest) = pending.strip_prefix(MAC_PREFIX) {
                let mac = parse_mac(rest)?;
                return Ok(Self {
                    recipients,
                    mac,
                    payload_offset: lines.pos,
                });
            }
            let Some(rest) = pending.strip_prefix(STANZA_PREFIX) else {
                return Err(malformed("expected a stanza or MAC line"));
            };
            let (tag, args) = parse_stanza_line(rest)?;
            let body = parse_body(&mut lines)?;
            recipients.push(Stanza { tag, args, body });
            pending = lines.next_line()?;
        }
    }

    /// Byte offset of the payload in the parsed input.
    pub fn payload_offset(&self) -> usize {
        self.payload_offset
    }
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedHeader(msg.into())
}

struct Lines<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Lines<'a> {
    /// Next `\n`-terminated line, without the terminator.
    fn next_line(&mut self) -> Result<&'a str> {
        let rest = &self.input[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| malformed("unexpected end of header"))?;
        let line = &rest[..end];
        if !line.iter().all(|b| (0x20..=0x7e).contains(b)) {
            return Err(malformed("header line contains non-printable bytes"));
        }
        self.pos += end + 1;
        // Printable ASCII is valid UTF-8.
        std::str::from_utf8(line).map_err(|_| malformed("header line is not UTF-8"))
    }
}

/// `rest` is everything after `->` on the stanza line.
fn parse_stanza_line(rest: &str) -> Result<(String, Vec<String>)> {
    let Some(rest) = rest.strip_prefix(' ') else {
        return Err(malformed("stanza line without a type"));
    };
    let mut fields = Vec::new();
    for field in rest.split(' ') {
        if field.is_empty() {
            return Err(malformed("empty stanza argument"));
        }
        fields.push(field.to_string());
    }
    let mut fields = fields.into_iter();
    let tag = fields
        .next()
        .ok_or_else(|| malformed("stanza line without a type"))?;
    Ok((tag, fields.collect()))
}

/// Body lines up to and including the first one shorter than 64 columns.
fn parse_body(lines: &mut Lines<'_>) -> Result<Vec<u8>> {
    let mut encoded = String::new();
    loop {
        let line = lines.next_line()?;
        if line.len() > BODY_COLUMNS {
            return Err(malformed("stanza body line longer than 64 columns"));
        }
        encoded.push_str(line);
        if line.len() < BODY_COLUMNS {
            break;
        }
    }
    STANDARD_NO_PAD
        .decode(encoded.as_bytes())
        .map_err(|e| malformed(format!("invalid stanza body: {e}")))
}

fn parse_mac(rest: &str) -> Result<[u8; MAC_LEN]> {
    let encoded = rest
        .strip_prefix(' ')
        .ok_or_else(|| malformed("MAC line without a MAC"))?;
    let bytes = STANDARD_NO_PAD
        .decode(encoded.as_bytes())
        .map_err(|e| malformed(format!("invalid MAC encoding: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| malformed("MAC has the wrong length"))
}
