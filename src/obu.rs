// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Open Bitstream Unit (OBU) framing: the 1-byte packed header, the LEB128
//! variable-length size field, and optional trimming and extension fields.

use symphonia_core::errors::{decode_error, Result};
use symphonia_core::io::ReadBytes;

/// Number of buffered bytes guaranteed to be rewindable when reading an OBU header that may
/// need to be re-read by a later phase.
pub const OBU_SEEKBACK_LEN: usize = 4096;

/// OBU types as coded in the upper 5 bits of the header byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ObuType {
    CodecConfig,
    AudioElement,
    MixPresentation,
    ParameterBlock,
    TemporalDelimiter,
    /// Audio frame with an explicit leading substream id.
    AudioFrame,
    /// Audio frame with the substream id implied by the OBU type (0..=17).
    AudioFrameId(u8),
    Reserved(u8),
    SequenceHeader,
}

impl ObuType {
    pub fn from_raw(raw: u8) -> ObuType {
        match raw & 0x1f {
            0 => ObuType::CodecConfig,
            1 => ObuType::AudioElement,
            2 => ObuType::MixPresentation,
            3 => ObuType::ParameterBlock,
            4 => ObuType::TemporalDelimiter,
            5 => ObuType::AudioFrame,
            n @ 6..=23 => ObuType::AudioFrameId(n - 6),
            31 => ObuType::SequenceHeader,
            n => ObuType::Reserved(n),
        }
    }

    pub fn into_raw(self) -> u8 {
        match self {
            ObuType::CodecConfig => 0,
            ObuType::AudioElement => 1,
            ObuType::MixPresentation => 2,
            ObuType::ParameterBlock => 3,
            ObuType::TemporalDelimiter => 4,
            ObuType::AudioFrame => 5,
            ObuType::AudioFrameId(n) => 6 + n,
            ObuType::Reserved(n) => n,
            ObuType::SequenceHeader => 31,
        }
    }

    /// Returns true for OBU types that only occur in the per-frame phase of a stream. These
    /// terminate the descriptor phase. Reserved types do not: they are skipped in either phase.
    pub fn is_frame_phase(self) -> bool {
        matches!(
            self,
            ObuType::ParameterBlock
                | ObuType::TemporalDelimiter
                | ObuType::AudioFrame
                | ObuType::AudioFrameId(_)
        )
    }
}

/// A fully decoded OBU header. The payload of the OBU is the `size` bytes that follow it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ObuHeader {
    pub obu_type: ObuType,
    /// Payload size in bytes, after the trimming and extension fields have been accounted for.
    pub size: u32,
    /// Number of samples to trim from the start of the decoded frame.
    pub skip_samples: u32,
    /// Number of samples to trim from the end of the decoded frame.
    pub discard_padding: u32,
}

/// Reads an unsigned LEB128 value.
///
/// At most 8 continuation groups are accepted, and the decoded value must fit the positive range
/// of a 32-bit signed integer.
pub fn read_leb128<B: ReadBytes>(reader: &mut B) -> Result<u32> {
    let mut value = 0u64;

    for i in 0..8 {
        let byte = reader.read_byte()?;

        value |= u64::from(byte & 0x7f) << (7 * i);

        if byte & 0x80 == 0 {
            if value > i32::MAX as u64 {
                return decode_error("iamf: leb128 value out of range");
            }
            return Ok(value as u32);
        }
    }

    decode_error("iamf: leb128 too long")
}

/// Appends the LEB128 encoding of `value` to `buf`.
pub fn write_leb128(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Number of bytes the LEB128 encoding of `value` occupies.
pub fn leb128_len(value: u32) -> usize {
    let mut len = 1;
    let mut value = value >> 7;
    while value != 0 {
        len += 1;
        value >>= 7;
    }
    len
}

/// Reads an OBU header from the stream.
///
/// On return the stream is positioned at the first byte of the OBU payload.
pub fn read_obu_header<B: ReadBytes>(reader: &mut B) -> Result<ObuHeader> {
    let byte = reader.read_byte()?;
    read_obu_header_after(byte, reader)
}

/// Continues reading an OBU header when its first byte has already been consumed.
pub fn read_obu_header_after<B: ReadBytes>(first: u8, reader: &mut B) -> Result<ObuHeader> {
    let obu_type = ObuType::from_raw(first >> 3);
    // Bit 2 flags a redundant copy and is ignored.
    let has_trimming = first & 0x2 != 0;
    let has_extension = first & 0x1 != 0;

    let size = read_leb128(reader)?;

    let start = reader.pos();

    let mut skip_samples = 0;
    let mut discard_padding = 0;

    if has_trimming {
        // The on-wire order is trim-at-end first, trim-at-start second.
        discard_padding = read_leb128(reader)?;
        skip_samples = read_leb128(reader)?;
    }

    if has_extension {
        let extension_bytes = read_leb128(reader)?;
        reader.ignore_bytes(u64::from(extension_bytes))?;
    }

    let consumed = reader.pos() - start;

    if consumed > u64::from(size) {
        return decode_error("iamf: obu size too small for header fields");
    }

    Ok(ObuHeader { obu_type, size: size - consumed as u32, skip_samples, discard_padding })
}

/// Appends an OBU with the given payload to `buf`, including optional trimming information.
///
/// `trimming` carries `(skip_samples, discard_padding)`.
pub fn write_obu(buf: &mut Vec<u8>, obu_type: ObuType, trimming: Option<(u32, u32)>, payload: &[u8]) {
    let mut first = obu_type.into_raw() << 3;

    let mut trim = Vec::new();
    if let Some((skip_samples, discard_padding)) = trimming {
        first |= 0x2;
        write_leb128(&mut trim, discard_padding);
        write_leb128(&mut trim, skip_samples);
    }

    buf.push(first);
    write_leb128(buf, (trim.len() + payload.len()) as u32);
    buf.extend_from_slice(&trim);
    buf.extend_from_slice(payload);
}
