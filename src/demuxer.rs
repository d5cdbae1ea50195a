// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use log::debug;

use symphonia_core::errors::{decode_error, end_of_stream_error, seek_error, Result, SeekErrorKind};
use symphonia_core::formats::{
    Cue, FormatOptions, FormatReader, Packet, SeekMode, SeekTo, SeekedTo, Track,
};
use symphonia_core::io::{BufReader, MediaSourceStream, ReadBytes};
use symphonia_core::meta::{Metadata, MetadataLog};
use symphonia_core::probe::{Descriptor, Instantiate, QueryDescriptor};
use symphonia_core::support_format;

use crate::descriptors::{read_descriptors, DescriptorSet};
use crate::obu::{read_leb128, read_obu_header_after, ObuType};
use crate::param::{read_parameter_block, ParameterBlock, ParameterBlockData};

/// Maximum number of bytes scanned for the next audio frame OBU before giving up.
const MAX_PACKET_SCAN_BYTES: u64 = 16 * 1024 * 1024;

/// The parameter values in effect for a packet.
///
/// Parameter block OBUs apply to the audio frames that follow them, until a temporal delimiter
/// resets them. A snapshot is taken for each demuxed packet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PacketParameters {
    pub mix_gain: Option<ParameterBlock>,
    pub demixing: Option<ParameterBlock>,
    pub recon_gain: Option<ParameterBlock>,
}

struct SubstreamState {
    /// Timestamp of the next packet.
    ts: u64,
    /// Frame duration in samples.
    dur: u64,
}

/// Immersive Audio Model and Formats (IAMF) standalone stream reader.
///
/// `IamfReader` implements a demuxer for standalone IAMF bitstreams. Every coded substream of
/// the stream's audio elements is exposed as a track.
pub struct IamfReader {
    reader: MediaSourceStream,
    tracks: Vec<Track>,
    cues: Vec<Cue>,
    metadata: MetadataLog,
    descriptors: DescriptorSet,
    states: BTreeMap<u32, SubstreamState>,
    pending: PacketParameters,
    last: PacketParameters,
    enable_gapless: bool,
}

impl IamfReader {
    /// Gets the descriptors of the stream.
    pub fn descriptors(&self) -> &DescriptorSet {
        &self.descriptors
    }

    /// Gets the parameter values that were in effect for the last demuxed packet.
    pub fn last_packet_parameters(&self) -> &PacketParameters {
        &self.last
    }

    fn stage_parameter_block(&mut self, block: ParameterBlock) {
        match block.data {
            ParameterBlockData::MixGain(_) => self.pending.mix_gain = Some(block),
            ParameterBlockData::Demixing(_) => self.pending.demixing = Some(block),
            ParameterBlockData::ReconGain(_) => self.pending.recon_gain = Some(block),
        }
    }

    fn emit_packet(
        &mut self,
        substream_id: u32,
        skip_samples: u32,
        discard_padding: u32,
        data: Box<[u8]>,
    ) -> Result<Packet> {
        let state = match self.states.get_mut(&substream_id) {
            Some(state) => state,
            None => return decode_error("iamf: audio frame for an unknown substream"),
        };

        let packet = if self.enable_gapless {
            let trimmed = u64::from(skip_samples) + u64::from(discard_padding);
            let dur = state.dur.saturating_sub(trimmed);

            Packet::new_trimmed_from_boxed_slice(
                substream_id,
                state.ts,
                dur,
                skip_samples,
                discard_padding,
                data,
            )
        }
        else {
            Packet::new_from_boxed_slice(substream_id, state.ts, state.dur, data)
        };

        state.ts += packet.dur;

        self.last = self.pending.clone();

        Ok(packet)
    }
}

impl QueryDescriptor for IamfReader {
    fn query() -> &'static [Descriptor] {
        &[support_format!(
            "iamf",
            "Immersive Audio Model and Formats",
            &["iamf"],
            &["audio/iamf"],
            &[b"\xf8\x06iamf", b"\xfc\x06iamf"]
        )]
    }

    fn score(_context: &[u8]) -> u8 {
        255
    }
}

impl FormatReader for IamfReader {
    fn try_new(mut source: MediaSourceStream, options: &FormatOptions) -> Result<Self> {
        let descriptors = read_descriptors(&mut source)?;

        let mut tracks = Vec::new();
        let mut states = BTreeMap::new();

        for element in descriptors.audio_elements() {
            let config = match descriptors.codec_config(element.codec_config_id) {
                Some(config) => config,
                None => return decode_error("iamf: audio element references a missing codec config"),
            };

            for substream in &element.substreams {
                tracks.push(Track::new(substream.id, substream.params.clone()));
                states.insert(
                    substream.id,
                    SubstreamState { ts: 0, dur: u64::from(config.samples_per_frame) },
                );
            }
        }

        if tracks.is_empty() {
            return decode_error("iamf: no usable audio elements");
        }

        Ok(IamfReader {
            reader: source,
            tracks,
            cues: Vec::new(),
            metadata: MetadataLog::default(),
            descriptors,
            states,
            pending: PacketParameters::default(),
            last: PacketParameters::default(),
            enable_gapless: options.enable_gapless,
        })
    }

    fn next_packet(&mut self) -> Result<Packet> {
        let mut scanned = 0u64;

        loop {
            if scanned > MAX_PACKET_SCAN_BYTES {
                return decode_error("iamf: no audio frame found");
            }

            let first = match self.reader.read_byte() {
                Ok(byte) => byte,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return end_of_stream_error();
                }
                Err(err) => return Err(err.into()),
            };

            let header = read_obu_header_after(first, &mut self.reader)?;
            let len = u64::from(header.size);

            scanned += len + 1;

            match header.obu_type {
                ObuType::AudioFrame => {
                    let start = self.reader.pos();
                    let substream_id = read_leb128(&mut self.reader)?;

                    let left = match len.checked_sub(self.reader.pos() - start) {
                        Some(left) => left,
                        None => return decode_error("iamf: invalid audio frame size"),
                    };

                    let data = self.reader.read_boxed_slice_exact(left as usize)?;

                    return self.emit_packet(
                        substream_id,
                        header.skip_samples,
                        header.discard_padding,
                        data,
                    );
                }
                ObuType::AudioFrameId(n) => {
                    let data = self.reader.read_boxed_slice_exact(len as usize)?;

                    return self.emit_packet(
                        u32::from(n),
                        header.skip_samples,
                        header.discard_padding,
                        data,
                    );
                }
                ObuType::ParameterBlock => {
                    let buf = self.reader.read_boxed_slice_exact(len as usize)?;

                    let block =
                        read_parameter_block(&mut BufReader::new(&buf), &self.descriptors)?;

                    if let Some(block) = block {
                        self.stage_parameter_block(block);
                    }
                }
                ObuType::TemporalDelimiter => {
                    self.reader.ignore_bytes(len)?;
                    self.pending = PacketParameters::default();
                }
                _ => {
                    // Redundant descriptors and reserved OBUs.
                    debug!("skipping obu type {} in the frame phase", header.obu_type.into_raw());
                    self.reader.ignore_bytes(len)?;
                }
            }
        }
    }

    fn metadata(&mut self) -> Metadata<'_> {
        self.metadata.metadata()
    }

    fn cues(&self) -> &[Cue] {
        &self.cues
    }

    fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    fn seek(&mut self, _mode: SeekMode, _to: SeekTo) -> Result<SeekedTo> {
        // Standalone streams carry no index, and frames of the substreams are interleaved at
        // the muxer's discretion.
        seek_error(SeekErrorKind::Unseekable)
    }

    fn into_inner(self: Box<Self>) -> MediaSourceStream {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obu::{write_leb128, write_obu};
    use crate::param::{MixGainAnimation, MixGainSubblock};

    use std::io::Cursor;

    fn descriptor_stream() -> Vec<u8> {
        let mut stream = Vec::new();

        write_obu(&mut stream, ObuType::SequenceHeader, None, b"iamf\x00\x00");

        // PCM codec config 0, 64 samples per frame.
        let mut payload = Vec::new();
        write_leb128(&mut payload, 0);
        payload.extend_from_slice(b"ipcm");
        payload.push(64);
        payload.extend_from_slice(&[0, 0, 0, 16]);
        payload.extend_from_slice(&48000u32.to_be_bytes());
        write_obu(&mut stream, ObuType::CodecConfig, None, &payload);

        // Element 1 with substreams 0 and 1 in one 5.1 layer, and a non-fixed mix gain
        // parameter declared by the mix presentation below.
        let mut payload = Vec::new();
        write_leb128(&mut payload, 1);
        payload.push(0x00);
        write_leb128(&mut payload, 0);
        write_leb128(&mut payload, 2);
        write_leb128(&mut payload, 0);
        write_leb128(&mut payload, 1);
        write_leb128(&mut payload, 0);
        payload.push(1 << 5);
        payload.push(2 << 4); // 5.1
        payload.push(2); // substreams
        payload.push(2); // coupled
        write_obu(&mut stream, ObuType::AudioElement, None, &payload);

        let mut payload = Vec::new();
        write_leb128(&mut payload, 2); // mix id
        write_leb128(&mut payload, 0); // no labels
        write_leb128(&mut payload, 1); // submixes
        write_leb128(&mut payload, 1); // elements
        write_leb128(&mut payload, 1); // element id
        payload.push(0);
        write_leb128(&mut payload, 0);
        write_leb128(&mut payload, 100); // element mix gain, parameter 100
        write_leb128(&mut payload, 48000);
        payload.push(0x80);
        payload.extend_from_slice(&[0, 0]);
        write_leb128(&mut payload, 101); // output mix gain, parameter 101
        write_leb128(&mut payload, 48000);
        payload.push(0x80);
        payload.extend_from_slice(&[0, 0]);
        write_leb128(&mut payload, 1); // layouts
        payload.push(1 << 6 | 1 << 2); // stereo sound system
        payload.push(0);
        payload.extend_from_slice(&[0, 0, 0, 0]);
        write_obu(&mut stream, ObuType::MixPresentation, None, &payload);

        stream
    }

    fn reader_for(stream: Vec<u8>, options: &FormatOptions) -> Result<IamfReader> {
        let mss = MediaSourceStream::new(Box::new(Cursor::new(stream)), Default::default());
        IamfReader::try_new(mss, options)
    }

    #[test]
    fn verify_tracks() {
        let reader = reader_for(descriptor_stream(), &Default::default()).unwrap();

        let tracks = reader.tracks();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].id, 0);
        assert_eq!(tracks[1].id, 1);
        assert_eq!(tracks[0].codec_params.sample_rate, Some(48000));
    }

    #[test]
    fn verify_packet_demuxing() {
        let mut stream = descriptor_stream();
        write_obu(&mut stream, ObuType::AudioFrameId(0), None, &[0x11; 8]);
        write_obu(&mut stream, ObuType::AudioFrameId(1), None, &[0x22; 8]);
        write_obu(&mut stream, ObuType::AudioFrameId(0), None, &[0x33; 8]);

        let mut reader = reader_for(stream, &Default::default()).unwrap();

        let packet = reader.next_packet().unwrap();
        assert_eq!(packet.track_id(), 0);
        assert_eq!(packet.ts, 0);
        assert_eq!(packet.dur, 64);
        assert_eq!(packet.buf(), &[0x11; 8]);

        let packet = reader.next_packet().unwrap();
        assert_eq!(packet.track_id(), 1);
        assert_eq!(packet.ts, 0);

        // Timestamps advance per substream.
        let packet = reader.next_packet().unwrap();
        assert_eq!(packet.track_id(), 0);
        assert_eq!(packet.ts, 64);

        assert!(reader.next_packet().is_err());
    }

    #[test]
    fn verify_explicit_substream_id_frame() {
        let mut stream = descriptor_stream();

        let mut payload = Vec::new();
        write_leb128(&mut payload, 1);
        payload.extend_from_slice(&[0x55; 8]);
        write_obu(&mut stream, ObuType::AudioFrame, None, &payload);

        let mut reader = reader_for(stream, &Default::default()).unwrap();

        let packet = reader.next_packet().unwrap();
        assert_eq!(packet.track_id(), 1);
        assert_eq!(packet.buf(), &[0x55; 8]);
    }

    #[test]
    fn verify_unknown_substream_rejected() {
        let mut stream = descriptor_stream();
        write_obu(&mut stream, ObuType::AudioFrameId(7), None, &[0u8; 8]);

        let mut reader = reader_for(stream, &Default::default()).unwrap();
        assert!(reader.next_packet().is_err());
    }

    #[test]
    fn verify_trimming() {
        let mut stream = descriptor_stream();
        write_obu(&mut stream, ObuType::AudioFrameId(0), Some((10, 4)), &[0u8; 8]);

        let options = FormatOptions { enable_gapless: true, ..Default::default() };
        let mut reader = reader_for(stream.clone(), &options).unwrap();

        let packet = reader.next_packet().unwrap();
        assert_eq!(packet.trim_start(), 10);
        assert_eq!(packet.trim_end(), 4);
        assert_eq!(packet.dur, 50);
        assert_eq!(packet.block_dur(), 64);

        // With gapless playback disabled the trims are not applied.
        let options = FormatOptions { enable_gapless: false, ..Default::default() };
        let mut reader = reader_for(stream, &options).unwrap();

        let packet = reader.next_packet().unwrap();
        assert_eq!(packet.trim_start(), 0);
        assert_eq!(packet.dur, 64);
    }

    #[test]
    fn verify_parameter_snapshots() {
        let mut stream = descriptor_stream();

        // A mix gain block for parameter 100, then two frames, a temporal delimiter, and a
        // final frame.
        let mut payload = Vec::new();
        write_leb128(&mut payload, 100);
        write_leb128(&mut payload, 64); // duration
        write_leb128(&mut payload, 64); // constant subblock duration
        write_leb128(&mut payload, 0); // step animation
        payload.extend_from_slice(&(-256i16 as u16).to_be_bytes());
        write_obu(&mut stream, ObuType::ParameterBlock, None, &payload);

        write_obu(&mut stream, ObuType::AudioFrameId(0), None, &[0u8; 8]);
        write_obu(&mut stream, ObuType::AudioFrameId(1), None, &[0u8; 8]);
        write_obu(&mut stream, ObuType::TemporalDelimiter, None, &[]);
        write_obu(&mut stream, ObuType::AudioFrameId(0), None, &[0u8; 8]);

        let mut reader = reader_for(stream, &Default::default()).unwrap();

        reader.next_packet().unwrap();

        let expected = ParameterBlock {
            parameter_id: 100,
            data: ParameterBlockData::MixGain(vec![MixGainSubblock {
                duration: 64,
                animation: MixGainAnimation::Step { start: -256 },
            }]),
        };

        assert_eq!(reader.last_packet_parameters().mix_gain.as_ref(), Some(&expected));

        // The snapshot persists for following packets in the same temporal unit.
        reader.next_packet().unwrap();
        assert_eq!(reader.last_packet_parameters().mix_gain.as_ref(), Some(&expected));

        // The temporal delimiter clears it.
        reader.next_packet().unwrap();
        assert_eq!(reader.last_packet_parameters().mix_gain, None);
    }

    #[test]
    fn verify_unknown_parameter_block_skipped() {
        let mut stream = descriptor_stream();

        let mut payload = Vec::new();
        write_leb128(&mut payload, 999);
        payload.extend_from_slice(&[0xff; 4]);
        write_obu(&mut stream, ObuType::ParameterBlock, None, &payload);

        write_obu(&mut stream, ObuType::AudioFrameId(0), None, &[0u8; 8]);

        let mut reader = reader_for(stream, &Default::default()).unwrap();

        let packet = reader.next_packet().unwrap();
        assert_eq!(packet.track_id(), 0);
        assert_eq!(reader.last_packet_parameters().mix_gain, None);
    }
}
