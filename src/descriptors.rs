// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The descriptor set: every codec config, audio element, mix presentation, and parameter
//! definition declared by the descriptor phase of a stream.

use log::{debug, warn};

use symphonia_core::errors::{decode_error, Result};
use symphonia_core::io::{BufReader, MediaSourceStream, ReadBytes, SeekBuffered};

use crate::codecs::{read_codec_config, CodecConfig};
use crate::element::{read_audio_element, AudioElement};
use crate::mix::{read_mix_presentation, MixPresentation};
use crate::obu::{read_obu_header_after, ObuType, OBU_SEEKBACK_LEN};
use crate::param::ParamDefinition;

/// The sequence header magic.
pub const IAMF_MAGIC: [u8; 4] = *b"iamf";

/// All descriptors of a stream, keyed by their ids.
#[derive(Clone, Debug, Default)]
pub struct DescriptorSet {
    pub primary_profile: u8,
    pub additional_profile: u8,
    codec_configs: Vec<CodecConfig>,
    audio_elements: Vec<AudioElement>,
    mix_presentations: Vec<MixPresentation>,
    param_definitions: Vec<ParamDefinition>,
}

impl DescriptorSet {
    pub fn codec_config(&self, id: u32) -> Option<&CodecConfig> {
        self.codec_configs.iter().find(|c| c.id == id)
    }

    pub fn audio_element(&self, id: u32) -> Option<&AudioElement> {
        self.audio_elements.iter().find(|e| e.id == id)
    }

    pub fn mix_presentation(&self, id: u32) -> Option<&MixPresentation> {
        self.mix_presentations.iter().find(|m| m.id == id)
    }

    pub fn param_definition(&self, parameter_id: u32) -> Option<&ParamDefinition> {
        self.param_definitions.iter().find(|p| p.parameter_id == parameter_id)
    }

    pub fn codec_configs(&self) -> &[CodecConfig] {
        &self.codec_configs
    }

    pub fn audio_elements(&self) -> &[AudioElement] {
        &self.audio_elements
    }

    pub fn mix_presentations(&self) -> &[MixPresentation] {
        &self.mix_presentations
    }

    /// Finds the audio element owning a substream.
    pub fn substream_owner(&self, substream_id: u32) -> Option<&AudioElement> {
        self.audio_elements.iter().find(|e| e.substream(substream_id).is_some())
    }

    pub fn add_codec_config(&mut self, config: CodecConfig) -> Result<()> {
        if self.codec_config(config.id).is_some() {
            return decode_error("iamf: duplicate codec config id");
        }
        self.codec_configs.push(config);
        Ok(())
    }

    pub fn add_audio_element(&mut self, element: AudioElement) -> Result<()> {
        if self.audio_element(element.id).is_some() {
            return decode_error("iamf: duplicate audio element id");
        }

        // Substream ids are track ids, and must be unique across elements.
        for substream in &element.substreams {
            if self.substream_owner(substream.id).is_some() {
                return decode_error("iamf: duplicate substream id");
            }
        }

        self.audio_elements.push(element);
        Ok(())
    }

    pub fn add_mix_presentation(&mut self, mix: MixPresentation) -> Result<()> {
        if self.mix_presentation(mix.id).is_some() {
            return decode_error("iamf: duplicate mix presentation id");
        }
        self.mix_presentations.push(mix);
        Ok(())
    }

    /// Registers a parameter definition. Re-declaring a parameter id is allowed only when the
    /// new definition is identical to the registered one.
    pub fn register_param_definition(&mut self, def: ParamDefinition) -> Result<()> {
        if let Some(existing) = self.param_definition(def.parameter_id) {
            if !existing.is_consistent_with(&def) {
                return decode_error("iamf: inconsistent parameter definitions");
            }
            return Ok(());
        }

        self.param_definitions.push(def);
        Ok(())
    }
}

/// Reads the descriptor phase of a stream.
///
/// The stream must start with a sequence header OBU. Reading stops at the first per-frame OBU,
/// which is left unconsumed, or at the end of the stream.
pub fn read_descriptors(reader: &mut MediaSourceStream) -> Result<DescriptorSet> {
    let mut set = DescriptorSet::default();
    let mut have_sequence_header = false;

    loop {
        reader.ensure_seekback_buffer(OBU_SEEKBACK_LEN);

        let start = reader.pos();

        let first = match reader.read_byte() {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        };

        let header = read_obu_header_after(first, reader)?;

        if !have_sequence_header && header.obu_type != ObuType::SequenceHeader {
            return decode_error("iamf: missing sequence header");
        }

        if header.obu_type.is_frame_phase() {
            reader.seek_buffered(start);
            break;
        }

        let len = u64::from(header.size);

        match header.obu_type {
            ObuType::SequenceHeader => {
                if have_sequence_header {
                    // Redundant copy.
                    debug!("skipping redundant sequence header");
                    reader.ignore_bytes(len)?;
                }
                else {
                    // Magic plus two profile bytes.
                    if header.size < 6 {
                        return decode_error("iamf: invalid sequence header");
                    }

                    let mut magic = [0u8; 4];
                    reader.read_buf_exact(&mut magic)?;

                    if magic != IAMF_MAGIC {
                        return decode_error("iamf: invalid sequence header");
                    }

                    set.primary_profile = reader.read_byte()?;
                    set.additional_profile = reader.read_byte()?;

                    reader.ignore_bytes(len.saturating_sub(6))?;
                    have_sequence_header = true;
                }
            }
            ObuType::CodecConfig => {
                let buf = reader.read_boxed_slice_exact(header.size as usize)?;
                let mut payload = BufReader::new(&buf);

                let config = read_codec_config(&mut payload)?;
                warn_underread("codec config", &payload, len);

                set.add_codec_config(config)?;
            }
            ObuType::AudioElement => {
                let buf = reader.read_boxed_slice_exact(header.size as usize)?;
                let mut payload = BufReader::new(&buf);

                let element = read_audio_element(&mut payload, &mut set)?;
                warn_underread("audio element", &payload, len);

                if let Some(element) = element {
                    set.add_audio_element(element)?;
                }
            }
            ObuType::MixPresentation => {
                let buf = reader.read_boxed_slice_exact(header.size as usize)?;
                let mut payload = BufReader::new(&buf);

                let mix = read_mix_presentation(&mut payload, &mut set)?;
                warn_underread("mix presentation", &payload, len);

                set.add_mix_presentation(mix)?;
            }
            ObuType::Reserved(n) => {
                debug!("skipping reserved obu type {}", n);
                reader.ignore_bytes(len)?;
            }
            _ => unreachable!(),
        }
    }

    if !have_sequence_header {
        return decode_error("iamf: missing sequence header");
    }

    Ok(set)
}

fn warn_underread(what: &str, payload: &BufReader<'_>, len: u64) {
    let left = len.saturating_sub(payload.pos());
    if left > 0 {
        warn!("underread in {} obu, {} bytes left", what, left);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obu::{write_leb128, write_obu};
    use crate::param::{ParamType, read_param_definition};

    use std::io::Cursor;

    use symphonia_core::io::MediaSourceStream;

    fn sequence_header() -> Vec<u8> {
        let mut buf = Vec::new();
        write_obu(&mut buf, ObuType::SequenceHeader, None, b"iamf\x00\x00");
        buf
    }

    fn pcm_codec_config_obu(id: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        write_leb128(&mut payload, id);
        payload.extend_from_slice(b"ipcm");
        payload.push(64);
        payload.extend_from_slice(&[0, 0, 0, 16]);
        payload.extend_from_slice(&48000u32.to_be_bytes());

        let mut buf = Vec::new();
        write_obu(&mut buf, ObuType::CodecConfig, None, &payload);
        buf
    }

    fn read(stream: Vec<u8>) -> Result<DescriptorSet> {
        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(stream)), Default::default());
        read_descriptors(&mut mss)
    }

    #[test]
    fn verify_descriptor_phase() {
        let mut stream = sequence_header();
        stream.extend_from_slice(&pcm_codec_config_obu(0));

        let set = read(stream).unwrap();

        assert!(set.codec_config(0).is_some());
        assert_eq!(set.primary_profile, 0);
    }

    #[test]
    fn verify_missing_sequence_header_rejected() {
        assert!(read(pcm_codec_config_obu(0)).is_err());
        assert!(read(Vec::new()).is_err());
    }

    #[test]
    fn verify_undersized_sequence_header_rejected() {
        use symphonia_core::errors::Error;

        // A sequence header too short for the magic and profile bytes must not consume bytes
        // of the following OBU.
        let mut stream = Vec::new();
        write_obu(&mut stream, ObuType::SequenceHeader, None, b"iamf");
        stream.extend_from_slice(&pcm_codec_config_obu(0));

        match read(stream) {
            Err(Error::DecodeError(_)) => (),
            result => panic!("unexpected result: {:?}", result),
        }
    }

    #[test]
    fn verify_bad_magic_rejected() {
        let mut stream = Vec::new();
        write_obu(&mut stream, ObuType::SequenceHeader, None, b"ifma\x00\x00");

        assert!(read(stream).is_err());
    }

    #[test]
    fn verify_duplicate_codec_config_rejected() {
        let mut stream = sequence_header();
        stream.extend_from_slice(&pcm_codec_config_obu(0));
        stream.extend_from_slice(&pcm_codec_config_obu(0));

        assert!(read(stream).is_err());
    }

    #[test]
    fn verify_redundant_sequence_header_skipped() {
        let mut stream = sequence_header();
        stream.extend_from_slice(&pcm_codec_config_obu(0));
        stream.extend_from_slice(&sequence_header());
        stream.extend_from_slice(&pcm_codec_config_obu(1));

        let set = read(stream).unwrap();

        assert!(set.codec_config(0).is_some());
        assert!(set.codec_config(1).is_some());
    }

    #[test]
    fn verify_reserved_obu_skipped() {
        let mut stream = sequence_header();
        write_obu(&mut stream, ObuType::Reserved(24), None, &[0xee; 5]);
        stream.extend_from_slice(&pcm_codec_config_obu(0));

        let set = read(stream).unwrap();
        assert!(set.codec_config(0).is_some());
    }

    #[test]
    fn verify_reader_stops_at_frame_phase() {
        let mut stream = sequence_header();
        stream.extend_from_slice(&pcm_codec_config_obu(0));
        write_obu(&mut stream, ObuType::AudioFrameId(0), None, &[0u8; 16]);

        let set = read(stream).unwrap();
        assert!(set.codec_config(0).is_some());
    }

    #[test]
    fn verify_param_registration_is_idempotent() {
        let mut payload = Vec::new();
        write_leb128(&mut payload, 7);
        write_leb128(&mut payload, 48000);
        payload.push(0);
        write_leb128(&mut payload, 960);
        write_leb128(&mut payload, 960);

        let def = read_param_definition(&mut BufReader::new(&payload), ParamType::MixGain, None)
            .unwrap();

        let mut set = DescriptorSet::default();
        set.register_param_definition(def.clone()).unwrap();
        set.register_param_definition(def.clone()).unwrap();

        // A definition with the same id but different timing must be rejected.
        let mut other = def;
        other.constant_subblock_duration = 480;
        assert!(set.register_param_definition(other).is_err());
    }
}
