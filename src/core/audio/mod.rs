//! Audio codec utilities for the telephony media path.
//!
//! The TTS side of the bridge produces 16-bit linear PCM at 24 kHz; the
//! phone channel carries 8-bit G.711 µ-law at 8 kHz. Everything in this
//! module is a pure function over byte slices so the call pipeline can
//! convert incrementally as chunks stream in.
//!
//! # Formats
//!
//! - Linear PCM: 16-bit signed little-endian, mono
//! - µ-law: G.711 PCMU, 8 kHz, mono, 8 bits per sample

/// Bytes of µ-law per outbound media frame (20 ms at 8 kHz).
pub const MULAW_FRAME_BYTES: usize = 160;

/// µ-law encoding bias.
const BIAS: i32 = 0x84;

/// Maximum linear magnitude representable before clipping.
const CLIP: i32 = 32635;

/// Downsample 24 kHz PCM16 to 8 kHz PCM16 by decimation.
///
/// Keeps the first sample of every group of three. No anti-alias filter is
/// applied: the upstream synthesis is narrowband-friendly and the phone
/// channel is 8 kHz anyway. Only whole 6-byte units (three source samples)
/// are consumed; for an input of `n` bytes the output is exactly
/// `floor(n / 6) * 2` bytes. Trailing partial units must be carried over
/// by the caller.
pub fn downsample_24k_to_8k(pcm: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len() / 3 + 2);
    for unit in pcm.chunks_exact(6) {
        out.push(unit[0]);
        out.push(unit[1]);
    }
    out
}

/// Encode a single linear PCM16 sample as G.711 µ-law.
pub fn pcm_to_mulaw(sample: i16) -> u8 {
    let mut value = i32::from(sample);
    let sign: u8 = if value < 0 {
        value = -value;
        0x80
    } else {
        0
    };
    if value > CLIP {
        value = CLIP;
    }
    value += BIAS;

    // Exponent is the position of the highest set bit, scanned from bit 14
    // downward; the biased value always has bit 7 set so this terminates
    // at zero.
    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (value & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((value >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decode a single G.711 µ-law byte back to linear PCM16.
pub fn mulaw_to_pcm(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = byte & 0x0F;

    let mut value = ((i32::from(mantissa) << 3) + BIAS) << exponent;
    value -= BIAS;

    if sign != 0 { -value as i16 } else { value as i16 }
}

/// Encode a buffer of PCM16 little-endian bytes to µ-law.
///
/// A trailing odd byte, which cannot form a sample, is ignored.
pub fn encode_mulaw(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .map(|pair| pcm_to_mulaw(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Decode a buffer of µ-law bytes to PCM16 little-endian bytes.
pub fn decode_mulaw(mulaw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(mulaw.len() * 2);
    for &byte in mulaw {
        out.extend_from_slice(&mulaw_to_pcm(byte).to_le_bytes());
    }
    out
}
