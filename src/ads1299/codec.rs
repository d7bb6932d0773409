//! Byte-level framing for the ADC, its relay and the socket wire format.

use crate::ads1299::registers::{cmd, CHANNELS, FRAME_LEN, STATUS_MARKER};
use crate::drivers::{ReaderError, Result, ValidationError};

/// Sign-extends a big-endian 24-bit two's-complement code to `i32`.
///
/// The top byte of the result replicates the sign bit of `bytes[0]`.
pub fn sign_extend_24(bytes: [u8; 3]) -> i32 {
    let sign = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    i32::from_be_bytes([sign, bytes[0], bytes[1], bytes[2]])
}

/// Inverse of [`sign_extend_24`] for values in `-0x80_0000..=0x7F_FFFF`.
pub fn encode_24(value: i32) -> [u8; 3] {
    let [_, hi, mid, lo] = value.to_be_bytes();
    [hi, mid, lo]
}

/// Decodes one RDATAC frame (status word + 8 channels) into volts.
pub fn decode_frame(frame: &[u8], scale: f32) -> Result<[f32; CHANNELS]> {
    if frame.len() != FRAME_LEN {
        return Err(ReaderError::protocol(
            "decode sample",
            format!("frame is {} bytes, expected {FRAME_LEN}", frame.len()),
        ));
    }
    if frame[0] & 0xF0 != STATUS_MARKER {
        return Err(ReaderError::protocol(
            "decode sample",
            format!("bad status word {:02x}{:02x}{:02x}", frame[0], frame[1], frame[2]),
        ));
    }
    let mut out = [0.0f32; CHANNELS];
    for (value, chunk) in out.iter_mut().zip(frame[3..].chunks_exact(3)) {
        let code = sign_extend_24([chunk[0], chunk[1], chunk[2]]);
        *value = code as f32 * scale;
    }
    Ok(out)
}

/// Splits a relay batch (`n_batch x 8` little-endian `i32`) into scaled samples.
pub fn decode_relay_batch(raw: &[u8], scale: f32) -> Result<Vec<[f32; CHANNELS]>> {
    let row_bytes = 4 * CHANNELS;
    if raw.is_empty() || raw.len() % row_bytes != 0 {
        return Err(ReaderError::protocol(
            "decode relay batch",
            format!("{} bytes is not a whole number of samples", raw.len()),
        ));
    }
    Ok(raw
        .chunks_exact(row_bytes)
        .map(|row| {
            let mut sample = [0.0f32; CHANNELS];
            for (value, word) in sample.iter_mut().zip(row.chunks_exact(4)) {
                let code = i32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                *value = code as f32 * scale;
            }
            sample
        })
        .collect())
}

/// `WREG` frame writing `values` to consecutive registers starting at `reg`.
pub fn write_registers_frame(reg: u8, values: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(values.len() + 2);
    frame.push(cmd::WREG | reg);
    frame.push(values.len().saturating_sub(1) as u8);
    frame.extend_from_slice(values);
    frame
}

/// `RREG` frame for `count` registers, padded with clock-out bytes.
pub fn read_registers_frame(reg: u8, count: usize) -> Vec<u8> {
    let mut frame = vec![0u8; count + 2];
    frame[0] = cmd::RREG | reg;
    frame[1] = count.saturating_sub(1) as u8;
    frame
}

/// Relay command slot: `WREG, reg, payload..`, at most 4 bytes.
pub fn relay_command(reg: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let len = payload.len() + 2;
    if len > 4 {
        return Err(ValidationError::CommandTooLong(len).into());
    }
    let mut command = Vec::with_capacity(len);
    command.push(cmd::WREG);
    command.push(reg);
    command.extend_from_slice(payload);
    Ok(command)
}

/// Decodes a socket frame of `4 x n_channel` little-endian `f32`.
pub fn decode_f32_le(frame: &[u8]) -> Vec<f32> {
    frame
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub fn encode_f32_le(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_extension_covers_extremes() {
        assert_eq!(sign_extend_24([0x80, 0x00, 0x00]), -8_388_608);
        assert_eq!(sign_extend_24([0x7F, 0xFF, 0xFF]), 8_388_607);
        assert_eq!(sign_extend_24([0xFF, 0xFF, 0xFF]), -1);
        assert_eq!(sign_extend_24([0x00, 0x00, 0x01]), 1);
        assert_eq!(sign_extend_24([0xFF, 0xFF, 0x85]), -123);
        assert_eq!(encode_24(-123), [0xFF, 0xFF, 0x85]);
        assert_eq!(sign_extend_24(encode_24(-8_388_608)), -8_388_608);
    }

    #[test]
    fn frame_decode_scales_each_channel() {
        let mut frame = vec![0xC0, 0x00, 0x00];
        for code in [1, -1, 0x7F_FFFF, -0x80_0000, 0, 2, -2, 100] {
            frame.extend_from_slice(&encode_24(code));
        }
        let volts = decode_frame(&frame, 1.0).unwrap();
        assert_eq!(
            volts,
            [1.0, -1.0, 8_388_607.0, -8_388_608.0, 0.0, 2.0, -2.0, 100.0]
        );
    }

    #[test]
    fn frame_with_bad_status_is_protocol_error() {
        let frame = vec![0u8; FRAME_LEN];
        assert!(matches!(
            decode_frame(&frame, 1.0),
            Err(ReaderError::Protocol { .. })
        ));
        assert!(matches!(
            decode_frame(&frame[..10], 1.0),
            Err(ReaderError::Protocol { .. })
        ));
    }

    #[test]
    fn register_frames_follow_opcode_layout() {
        assert_eq!(write_registers_frame(0x01, &[0x96]), vec![0x41, 0x00, 0x96]);
        assert_eq!(
            write_registers_frame(0x05, &[0x60; 8])[..2],
            [0x45u8, 0x07]
        );
        assert_eq!(read_registers_frame(0x05, 8).len(), 10);
        assert_eq!(read_registers_frame(0x00, 1), vec![0x20, 0x00, 0x00]);
    }

    #[test]
    fn relay_commands_fit_one_slot() {
        assert_eq!(relay_command(0x50, &[0b110]).unwrap(), vec![0x40, 0x50, 0b110]);
        assert!(relay_command(0x58, &[1, 1]).is_ok());
        assert!(relay_command(0x58, &[1, 1, 1]).is_err());
    }

    #[test]
    fn relay_batch_decodes_little_endian_words() {
        let mut raw = Vec::new();
        for i in 0..16i32 {
            raw.extend_from_slice(&(i - 8).to_le_bytes());
        }
        let samples = decode_relay_batch(&raw, 0.5).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0][0], -4.0);
        assert_eq!(samples[1][7], 3.5);
        assert!(decode_relay_batch(&raw[..5], 1.0).is_err());
    }
}
