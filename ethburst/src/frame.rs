//! Test frame construction.
//!
//! Without a custom frame the payload is random bytes; the receiver never
//! inspects it, the randomness just defeats any link-layer compression.

use std::path::Path;

use rand::RngCore;

use crate::{Error, Result};

/// Ethernet payloads below this get padded out by the kernel or NIC.
pub const MIN_FRAME_SZ: u32 = 46;
/// Above this the device needs baby giant or jumbo frame support.
pub const STD_FRAME_SZ: u32 = 1514;

pub fn random_frame(len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; len];
    rand::rng().fill_bytes(&mut frame);
    frame
}

/// Load a frame from a file of whitespace-separated hex octets, with or
/// without `0x` prefixes. Reading stops at `max` octets, matching the
/// largest frame the transports will move.
pub fn load_hex_frame(path: &Path, max: usize) -> Result<Vec<u8>> {
    let text = std::fs::read_to_string(path)?;
    let mut frame = Vec::new();

    for token in text.split_whitespace() {
        if frame.len() >= max {
            break;
        }
        let digits = token.strip_prefix("0x").unwrap_or(token);
        let byte = u8::from_str_radix(digits, 16)
            .map_err(|_| Error::FrameFile(format!("invalid hex octet {token:?}")))?;
        frame.push(byte);
    }

    if frame.is_empty() {
        return Err(Error::FrameFile(format!(
            "{} holds no hex octets",
            path.display()
        )));
    }
    Ok(frame)
}
