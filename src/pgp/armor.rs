//! ASCII armor (RFC 4880 §6)

use crate::error::PgpError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Kind of armored block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArmorKind {
    /// `PGP MESSAGE`
    Message,
    /// `PGP PUBLIC KEY BLOCK`
    PublicKey,
    /// `PGP PRIVATE KEY BLOCK`
    PrivateKey,
    /// `PGP SIGNATURE`
    Signature,
}

impl ArmorKind {
    fn label(self) -> &'static str {
        match self {
            ArmorKind::Message => "PGP MESSAGE",
            ArmorKind::PublicKey => "PGP PUBLIC KEY BLOCK",
            ArmorKind::PrivateKey => "PGP PRIVATE KEY BLOCK",
            ArmorKind::Signature => "PGP SIGNATURE",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "PGP MESSAGE" => Some(ArmorKind::Message),
            "PGP PUBLIC KEY BLOCK" => Some(ArmorKind::PublicKey),
            "PGP PRIVATE KEY BLOCK" | "PGP SECRET KEY BLOCK" => Some(ArmorKind::PrivateKey),
            "PGP SIGNATURE" => Some(ArmorKind::Signature),
            _ => None,
        }
    }
}

const CRC24_INIT: u32 = 0x00B7_04CE;
const CRC24_POLY: u32 = 0x0186_4CFB;

fn crc24(data: &[u8]) -> u32 {
    let mut crc = CRC24_INIT;
    for byte in data {
        crc ^= u32::from(*byte) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24_POLY;
            }
        }
    }
    crc & 0x00FF_FFFF
}

/// Wrap binary data in ASCII armor
pub fn encode(kind: ArmorKind, data: &[u8]) -> String {
    let label = kind.label();
    let body = STANDARD.encode(data);
    let crc = crc24(data).to_be_bytes();

    let mut out = String::with_capacity(body.len() + body.len() / 64 + 128);
    out.push_str("-----BEGIN ");
    out.push_str(label);
    out.push_str("-----\n\n");
    for line in body.as_bytes().chunks(64) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push('=');
    out.push_str(&STANDARD.encode(&crc[1..]));
    out.push_str("\n-----END ");
    out.push_str(label);
    out.push_str("-----\n");
    out
}

/// True when `data` starts (after whitespace) with an armor header line
pub fn is_armored(data: &[u8]) -> bool {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    data[start..].starts_with(b"-----BEGIN PGP ")
}

/// Decode every armored block in `text`, in order
pub fn decode_all(text: &[u8]) -> Result<Vec<(ArmorKind, Vec<u8>)>, PgpError> {
    let text = std::str::from_utf8(text)
        .map_err(|_| PgpError::Armor("armored input is not valid UTF-8".to_string()))?;
    let mut lines = text.lines().map(str::trim_end);
    let mut blocks = Vec::new();

    while let Some(line) = lines.next() {
        let Some(label) = line
            .strip_prefix("-----BEGIN ")
            .and_then(|l| l.strip_suffix("-----"))
        else {
            continue;
        };
        let kind = ArmorKind::from_label(label)
            .ok_or_else(|| PgpError::Armor(format!("unknown armor label '{label}'")))?;

        let mut body = String::new();
        let mut checksum: Option<&str> = None;
        let mut in_headers = true;
        let mut closed = false;

        for line in lines.by_ref() {
            if line.starts_with("-----END ") {
                closed = true;
                break;
            }
            if in_headers {
                if line.is_empty() {
                    in_headers = false;
                    continue;
                }
                if line.contains(": ") {
                    continue;
                }
                // No header block at all
                in_headers = false;
            }
            if let Some(crc) = line.strip_prefix('=') {
                checksum = Some(crc);
            } else {
                body.push_str(line.trim());
            }
        }

        if !closed {
            return Err(PgpError::Armor(format!("missing END line for {label}")));
        }

        let data = STANDARD
            .decode(body.as_bytes())
            .map_err(|e| PgpError::Armor(format!("invalid base64: {e}")))?;

        if let Some(crc) = checksum {
            let expected = STANDARD
                .decode(crc.as_bytes())
                .map_err(|e| PgpError::Armor(format!("invalid checksum encoding: {e}")))?;
            let actual = crc24(&data).to_be_bytes();
            if expected.as_slice() != &actual[1..] {
                return Err(PgpError::Armor("checksum mismatch".to_string()));
            }
        }

        blocks.push((kind, data));
    }

    if blocks.is_empty() {
        return Err(PgpError::Armor("no armored block found".to_string()));
    }
    Ok(blocks)
}

/// Decode the first armored block
pub fn decode(text: &[u8]) -> Result<(ArmorKind, Vec<u8>), PgpError> {
    decode_all(text)?
        .into_iter()
        .next()
        .ok_or_else(|| PgpError::Armor("no armored block found".to_string()))
}

/// Binary input passes through; armored input is decoded
pub fn dearmor(data: &[u8]) -> Result<Vec<u8>, PgpError> {
    if is_armored(data) {
        Ok(decode(data)?.1)
    } else {
        Ok(data.to_vec())
    }
}
