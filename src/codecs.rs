// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Codec config descriptors: the per-codec decoder configuration records embedded in a codec
//! config OBU, and the extra-data patching substreams require.

use symphonia_core::codecs::{
    CodecParameters, CodecType, CODEC_TYPE_AAC, CODEC_TYPE_FLAC, CODEC_TYPE_NULL,
    CODEC_TYPE_OPUS, CODEC_TYPE_PCM_S16BE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24BE,
    CODEC_TYPE_PCM_S24LE, CODEC_TYPE_PCM_S32BE, CODEC_TYPE_PCM_S32LE,
};
use symphonia_core::errors::{decode_error, unsupported_error, Result};
use symphonia_core::io::{BitReaderLtr, BufReader, FiniteStream, ReadBitsLtr, ReadBytes};
use symphonia_core::units::TimeBase;

use crate::obu::{read_leb128, write_leb128};

/// Number of samples an Opus decoder needs to converge after a seek.
const OPUS_PREROLL_SAMPLES: u32 = 3840;

const AAC_SAMPLE_RATES: [u32; 16] =
    [96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350, 0, 0, 0];

/// A codec config descriptor. One is shared by all substreams of the audio elements that
/// reference it.
#[derive(Clone, Debug, PartialEq)]
pub struct CodecConfig {
    pub id: u32,
    pub codec: CodecType,
    pub codec_tag: [u8; 4],
    pub sample_rate: u32,
    /// Frame duration in samples. Every audio frame OBU of a referencing substream decodes to
    /// this many samples before trimming.
    pub samples_per_frame: u32,
    /// Number of prior frames a decoder must process before output is valid. Negative values
    /// indicate pre-roll.
    pub audio_roll_distance: i16,
    /// Decoder extra data in the host representation. For Opus this includes the identification
    /// header magic, which is not part of the on-wire record.
    pub extra_data: Option<Box<[u8]>>,
}

impl CodecConfig {
    /// Pre-roll duration in samples, derived from the roll distance.
    pub fn seek_preroll(&self) -> u32 {
        if self.audio_roll_distance < 0 {
            u32::from(self.audio_roll_distance.unsigned_abs()) * self.samples_per_frame
        }
        else {
            0
        }
    }

    /// Builds the shared codec parameters for a substream of this codec config. The channel
    /// layout is assigned later, when the audio element claims its substreams.
    pub fn codec_params(&self) -> Result<CodecParameters> {
        if self.sample_rate == 0 {
            return decode_error("iamf: invalid sample rate");
        }

        let mut params = CodecParameters::new();

        params
            .for_codec(self.codec)
            .with_sample_rate(self.sample_rate)
            .with_time_base(TimeBase::new(1, self.sample_rate))
            .with_frames_per_block(u64::from(self.samples_per_frame))
            .with_max_frames_per_packet(u64::from(self.samples_per_frame));

        match self.codec {
            CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => {
                params.with_bits_per_sample(16);
            }
            CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => {
                params.with_bits_per_sample(24);
            }
            CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => {
                params.with_bits_per_sample(32);
            }
            _ => {
                if let Some(extra) = &self.extra_data {
                    params.with_extra_data(extra.clone());
                }
            }
        }

        Ok(params)
    }

    /// Builds a codec config draft from host codec parameters for muxing.
    ///
    /// The extra data is stamped with a stereo placeholder channel layout, so that identical
    /// configs of substreams with differing channel counts deduplicate to one descriptor. The
    /// id is assigned when the draft is added to a descriptor set.
    pub fn draft(params: &CodecParameters) -> Result<CodecConfig> {
        let sample_rate = match params.sample_rate {
            Some(rate) if rate > 0 => rate,
            _ => return decode_error("iamf: muxing requires a sample rate"),
        };

        let samples_per_frame = match params.max_frames_per_packet {
            Some(frames) if frames > 0 && frames <= u64::from(u32::MAX) => frames as u32,
            _ => return decode_error("iamf: muxing requires a frame duration"),
        };

        let codec_tag = match params.codec {
            CODEC_TYPE_OPUS => *b"Opus",
            CODEC_TYPE_AAC => *b"mp4a",
            CODEC_TYPE_FLAC => *b"fLaC",
            CODEC_TYPE_PCM_S16BE | CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S24BE
            | CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S32BE | CODEC_TYPE_PCM_S32LE => *b"ipcm",
            _ => return unsupported_error("iamf: codec cannot be muxed"),
        };

        let audio_roll_distance = match params.codec {
            CODEC_TYPE_OPUS => {
                -(((OPUS_PREROLL_SAMPLES + samples_per_frame - 1) / samples_per_frame) as i16)
            }
            CODEC_TYPE_AAC => -1,
            _ => 0,
        };

        let mut extra_data = params.extra_data.clone();

        // Stamp the stereo placeholder.
        match params.codec {
            CODEC_TYPE_OPUS | CODEC_TYPE_AAC | CODEC_TYPE_FLAC => {
                let extra = match extra_data.as_mut() {
                    Some(extra) => extra,
                    None => return decode_error("iamf: muxing requires codec extra data"),
                };
                patch_channel_count(params.codec, extra, 2)?;
            }
            _ => (),
        }

        Ok(CodecConfig {
            id: 0,
            codec: params.codec,
            codec_tag,
            sample_rate,
            samples_per_frame,
            audio_roll_distance,
            extra_data,
        })
    }
}

/// Reads a codec config OBU payload.
///
/// A record with an unrecognized codec fourcc is accepted, but yields a null codec type.
pub fn read_codec_config(reader: &mut BufReader<'_>) -> Result<CodecConfig> {
    let id = read_leb128(reader)?;

    let mut codec_tag = [0u8; 4];
    reader.read_buf_exact(&mut codec_tag)?;

    let samples_per_frame = read_leb128(reader)?;
    let audio_roll_distance = reader.read_be_u16()? as i16;

    let left = reader.bytes_available() as usize;

    let mut config = CodecConfig {
        id,
        codec: CODEC_TYPE_NULL,
        codec_tag,
        sample_rate: 0,
        samples_per_frame,
        audio_roll_distance,
        extra_data: None,
    };

    match &codec_tag {
        b"Opus" => read_opus_config(reader, left, &mut config)?,
        b"mp4a" => read_aac_config(reader, left, &mut config)?,
        b"fLaC" => read_flac_config(reader, left, &mut config)?,
        b"ipcm" => read_pcm_config(reader, left, &mut config)?,
        _ => {
            // Unknown codecs keep the descriptor table consistent, but any audio element that
            // references one is dropped.
            reader.ignore_bytes(left as u64)?;
        }
    }

    Ok(config)
}

fn read_opus_config(reader: &mut BufReader<'_>, left: usize, config: &mut CodecConfig) -> Result<()> {
    if left < 11 {
        return decode_error("iamf: invalid opus decoder config");
    }

    // The on-wire record is an identification header with the magic stripped. Restore it for
    // decoders.
    let mut extra = vec![0u8; 8 + left];
    extra[..8].copy_from_slice(b"OpusHead");
    reader.read_buf_exact(&mut extra[8..])?;

    config.codec = CODEC_TYPE_OPUS;
    config.sample_rate = 48000;
    config.extra_data = Some(extra.into_boxed_slice());

    Ok(())
}

fn read_aac_config(reader: &mut BufReader<'_>, left: usize, config: &mut CodecConfig) -> Result<()> {
    // The record is an ISO/IEC 14496-1 DecoderConfigDescriptor.
    if reader.read_byte()? != 0x04 {
        return decode_error("iamf: invalid aac decoder config descriptor");
    }

    if reader.read_byte()? != 0x40 {
        return decode_error("iamf: invalid aac object type indication");
    }

    let stream_type = reader.read_byte()?;
    if (stream_type >> 2) != 5 || (stream_type >> 1) & 1 != 0 {
        return decode_error("iamf: invalid aac stream type");
    }

    // Buffer size and bitrate fields.
    reader.ignore_bytes(3 + 4 + 4)?;

    if reader.read_byte()? != 0x05 {
        return decode_error("iamf: invalid aac decoder specific info tag");
    }

    let asc_len = left.checked_sub(15).filter(|&n| n > 0);

    let extra = match asc_len {
        Some(len) => reader.read_boxed_slice_exact(len)?,
        None => return decode_error("iamf: missing aac audio specific config"),
    };

    config.codec = CODEC_TYPE_AAC;
    config.sample_rate = read_asc_sample_rate(&extra)?;
    config.extra_data = Some(extra);

    Ok(())
}

fn read_flac_config(reader: &mut BufReader<'_>, left: usize, config: &mut CodecConfig) -> Result<()> {
    // METADATA_BLOCK_HEADER, then a STREAMINFO block.
    reader.ignore_bytes(4)?;

    let left = match left.checked_sub(4) {
        Some(n) if n >= 34 => n,
        _ => return decode_error("iamf: invalid flac decoder config"),
    };

    let extra = reader.read_boxed_slice_exact(left)?;

    let sample_rate = (u32::from(extra[10]) << 16 | u32::from(extra[11]) << 8 | u32::from(extra[12])) >> 4;

    config.codec = CODEC_TYPE_FLAC;
    config.sample_rate = sample_rate;
    config.extra_data = Some(extra);

    Ok(())
}

fn read_pcm_config(reader: &mut BufReader<'_>, left: usize, config: &mut CodecConfig) -> Result<()> {
    if left != 6 {
        return decode_error("iamf: invalid pcm decoder config");
    }

    let sample_format = reader.read_byte()?;
    let sample_size = reader.read_byte()?;

    config.codec = match (sample_format, sample_size) {
        (0, 16) => CODEC_TYPE_PCM_S16BE,
        (0, 24) => CODEC_TYPE_PCM_S24BE,
        (0, 32) => CODEC_TYPE_PCM_S32BE,
        (1, 16) => CODEC_TYPE_PCM_S16LE,
        (1, 24) => CODEC_TYPE_PCM_S24LE,
        (1, 32) => CODEC_TYPE_PCM_S32LE,
        _ => return decode_error("iamf: invalid pcm sample format"),
    };

    config.sample_rate = reader.read_be_u32()?;

    Ok(())
}

/// Extracts the sample rate from an AAC AudioSpecificConfig.
fn read_asc_sample_rate(asc: &[u8]) -> Result<u32> {
    let mut bs = BitReaderLtr::new(asc);

    // Audio object type, with one escape.
    if bs.read_bits_leq32(5)? == 31 {
        bs.ignore_bits(6)?;
    }

    let index = bs.read_bits_leq32(4)?;

    let rate = if index == 15 {
        bs.read_bits_leq32(24)?
    }
    else {
        AAC_SAMPLE_RATES[index as usize]
    };

    if rate == 0 {
        return decode_error("iamf: invalid aac sample rate");
    }

    Ok(rate)
}

/// Serializes a codec config descriptor into an OBU payload.
pub fn write_codec_config(config: &CodecConfig, buf: &mut Vec<u8>) -> Result<()> {
    write_leb128(buf, config.id);
    buf.extend_from_slice(&config.codec_tag);
    write_leb128(buf, config.samples_per_frame);
    buf.extend_from_slice(&(config.audio_roll_distance as u16).to_be_bytes());

    match config.codec {
        CODEC_TYPE_OPUS => {
            let extra = match &config.extra_data {
                Some(extra) if extra.len() >= 19 => extra,
                _ => return decode_error("iamf: invalid opus extra data"),
            };
            // The identification header magic is not written.
            buf.extend_from_slice(&extra[8..]);
        }
        CODEC_TYPE_AAC => return unsupported_error("iamf: aac descriptor muxing"),
        CODEC_TYPE_FLAC => {
            let extra = match &config.extra_data {
                Some(extra) if extra.len() >= 34 => extra,
                _ => return decode_error("iamf: invalid flac extra data"),
            };
            // Last-block flag and a zero STREAMINFO block type.
            buf.push(0x80);
            buf.extend_from_slice(&(extra.len() as u32).to_be_bytes()[1..]);
            buf.extend_from_slice(extra);
        }
        CODEC_TYPE_PCM_S16BE | CODEC_TYPE_PCM_S24BE | CODEC_TYPE_PCM_S32BE => {
            write_pcm_config(config, 0, buf);
        }
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S32LE => {
            write_pcm_config(config, 1, buf);
        }
        _ => return unsupported_error("iamf: codec cannot be muxed"),
    }

    Ok(())
}

fn write_pcm_config(config: &CodecConfig, sample_format: u8, buf: &mut Vec<u8>) {
    let sample_size = match config.codec {
        CODEC_TYPE_PCM_S16BE | CODEC_TYPE_PCM_S16LE => 16,
        CODEC_TYPE_PCM_S24BE | CODEC_TYPE_PCM_S24LE => 24,
        _ => 32,
    };

    buf.push(sample_format);
    buf.push(sample_size);
    buf.extend_from_slice(&config.sample_rate.to_be_bytes());
}

/// Rewrites the channel count field of codec extra data in place.
pub fn patch_channel_count(codec: CodecType, extra: &mut [u8], channels: u32) -> Result<()> {
    match codec {
        CODEC_TYPE_OPUS => {
            if extra.len() < 10 {
                return decode_error("iamf: invalid opus extra data");
            }
            extra[9] = channels as u8;
        }
        CODEC_TYPE_AAC => {
            // Locate the 4-bit channel configuration in the AudioSpecificConfig.
            let mut bs = BitReaderLtr::new(extra);
            let mut offset = 5;

            if bs.read_bits_leq32(5)? == 31 {
                bs.ignore_bits(6)?;
                offset += 6;
            }

            offset += 4;
            if bs.read_bits_leq32(4)? == 15 {
                bs.ignore_bits(24)?;
                offset += 24;
            }

            bs.read_bits_leq32(4)?;

            set_bits(extra, offset, 4, channels & 0xf);
        }
        CODEC_TYPE_FLAC => {
            if extra.len() < 13 || channels == 0 {
                return decode_error("iamf: invalid flac extra data");
            }
            // The 3-bit channels-1 field follows the block sizes, frame sizes and sample rate
            // of the STREAMINFO block.
            set_bits(extra, 16 + 16 + 24 + 24 + 20, 3, (channels - 1) & 0x7);
        }
        _ => (),
    }

    Ok(())
}

/// Overwrites `width` bits of `buf` at `bit_offset` with the low bits of `value`, most
/// significant bit first.
fn set_bits(buf: &mut [u8], bit_offset: usize, width: u32, value: u32) {
    for i in 0..width as usize {
        let pos = bit_offset + i;
        let mask = 0x80 >> (pos & 0x7);
        let bit = (value >> (width as usize - 1 - i)) & 1;

        if bit != 0 {
            buf[pos >> 3] |= mask;
        }
        else {
            buf[pos >> 3] &= !mask;
        }
    }
}
