// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;

use symphonia_core::errors::{decode_error, unsupported_error, Result};

use crate::codecs::{write_codec_config, CodecConfig};
use crate::descriptors::{DescriptorSet, IAMF_MAGIC};
use crate::element::{write_audio_element, AudioElement, Ambisonics, ElementType, MAX_LAYERS};
use crate::mix::{write_mix_presentation, MixPresentation};
use crate::obu::{write_leb128, write_obu, ObuType};
use crate::param::{write_parameter_block, ParamDefinition, ParamType, ParameterBlock};

/// Highest substream id that has a dedicated audio frame OBU type.
const MAX_IMPLICIT_SUBSTREAM_ID: u32 = 17;

/// Immersive Audio Model and Formats (IAMF) standalone stream writer.
///
/// Descriptors are accumulated with the `add_*` methods, and validated against each other as
/// they are added. `write_descriptors` then serializes the descriptor phase, after which audio
/// frames and parameter blocks may be written.
#[derive(Default)]
pub struct IamfMuxer {
    descriptors: DescriptorSet,
}

impl IamfMuxer {
    pub fn new() -> IamfMuxer {
        IamfMuxer::default()
    }

    /// Builds a muxer around an existing descriptor set, such as one read from another stream.
    pub fn from_descriptors(descriptors: DescriptorSet) -> IamfMuxer {
        IamfMuxer { descriptors }
    }

    pub fn descriptors(&self) -> &DescriptorSet {
        &self.descriptors
    }

    /// Adds a codec config and returns its assigned id.
    ///
    /// A config identical to an already added one is deduplicated to the existing id.
    pub fn add_codec_config(&mut self, mut config: CodecConfig) -> Result<u32> {
        for existing in self.descriptors.codec_configs() {
            config.id = existing.id;
            if *existing == config {
                return Ok(existing.id);
            }
        }

        config.id = self.descriptors.codec_configs().len() as u32;

        let id = config.id;
        self.descriptors.add_codec_config(config)?;

        Ok(id)
    }

    /// Adds an audio element, along with its demixing and recon gain parameter definitions.
    ///
    /// Unset parameter rates and durations default to the codec config of the element. The
    /// element's parameter ids are updated to match the registered definitions.
    pub fn add_audio_element(
        &mut self,
        mut element: AudioElement,
        demixing: Option<ParamDefinition>,
        recon_gain: Option<ParamDefinition>,
    ) -> Result<()> {
        let config = match self.descriptors.codec_config(element.codec_config_id) {
            Some(config) => config.clone(),
            None => return decode_error("iamf: audio element references a missing codec config"),
        };

        match element.element_type {
            ElementType::Channel => {
                if element.layers.is_empty() || element.layers.len() > usize::from(MAX_LAYERS) {
                    return decode_error("iamf: invalid layer count");
                }

                let claimed: u32 = element.layers.iter().map(|l| u32::from(l.substream_count)).sum();
                if claimed != element.substreams.len() as u32 {
                    return decode_error("iamf: layers do not cover all substreams");
                }

                if element.layers.iter().any(|l| l.channels().is_none()) {
                    return decode_error("iamf: layer has no canonical loudspeaker layout");
                }
            }
            ElementType::Scene => {
                match &element.ambisonics {
                    Some(Ambisonics::Mono { channel_map }) => {
                        if element.substreams.len() != channel_map.len() {
                            return decode_error("iamf: invalid ambisonics substream count");
                        }
                    }
                    Some(Ambisonics::Projection { .. }) => {
                        return unsupported_error("iamf: projection ambisonics muxing");
                    }
                    None => return decode_error("iamf: scene element without an ambisonics config"),
                }
            }
            ElementType::Reserved(_) => {
                return unsupported_error("iamf: reserved audio element type");
            }
        }

        element.demixing_parameter_id =
            self.register_element_param(demixing, ParamType::Demixing, &element, &config)?;
        element.recon_gain_parameter_id =
            self.register_element_param(recon_gain, ParamType::ReconGain, &element, &config)?;

        self.descriptors.add_audio_element(element)
    }

    fn register_element_param(
        &mut self,
        def: Option<ParamDefinition>,
        param_type: ParamType,
        element: &AudioElement,
        config: &CodecConfig,
    ) -> Result<Option<u32>> {
        let mut def = match def {
            Some(def) => def,
            None => return Ok(None),
        };

        if def.param_type != param_type {
            return decode_error("iamf: mismatched parameter definition type");
        }

        default_param_timing(&mut def, config);

        if def.num_subblocks() != 1 {
            return decode_error("iamf: element parameters must have a single subblock");
        }

        def.audio_element_id = Some(element.id);

        let parameter_id = def.parameter_id;
        self.descriptors.register_param_definition(def)?;

        Ok(Some(parameter_id))
    }

    /// Adds a mix presentation, registering the mix gain parameter definitions it embeds.
    pub fn add_mix_presentation(&mut self, mix: MixPresentation) -> Result<()> {
        if mix.annotations.len() != mix.language_labels.len() {
            return decode_error("iamf: mismatched annotation count");
        }

        for submix in &mix.submixes {
            for element in &submix.elements {
                if self.descriptors.audio_element(element.audio_element_id).is_none() {
                    return decode_error("iamf: submix references a missing audio element");
                }

                if element.annotations.len() != mix.language_labels.len() {
                    return decode_error("iamf: mismatched annotation count");
                }

                self.register_mix_gain(&element.mix_gain)?;
            }

            self.register_mix_gain(&submix.output_mix_gain)?;
        }

        self.descriptors.add_mix_presentation(mix)
    }

    fn register_mix_gain(&mut self, def: &ParamDefinition) -> Result<()> {
        if def.param_type != ParamType::MixGain {
            return decode_error("iamf: mismatched parameter definition type");
        }

        // Mix gains have no owning element to default the rate from.
        if def.rate == 0 {
            return decode_error("iamf: invalid parameter rate");
        }

        self.descriptors.register_param_definition(def.clone())
    }

    /// Writes the sequence header and all descriptor OBUs.
    pub fn write_descriptors<W: io::Write>(&self, out: &mut W) -> Result<()> {
        let mut stream = Vec::new();

        // Both profile fields advertise the base profile unless more than one audio element is
        // present.
        let profile = u8::from(self.descriptors.audio_elements().len() > 1);

        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&IAMF_MAGIC);
        payload.push(profile);
        payload.push(profile);
        write_obu(&mut stream, ObuType::SequenceHeader, None, &payload);

        for config in self.descriptors.codec_configs() {
            let mut payload = Vec::new();
            write_codec_config(config, &mut payload)?;
            write_obu(&mut stream, ObuType::CodecConfig, None, &payload);
        }

        for element in self.descriptors.audio_elements() {
            let mut payload = Vec::new();
            write_audio_element(element, &self.descriptors, &mut payload)?;
            write_obu(&mut stream, ObuType::AudioElement, None, &payload);
        }

        for mix in self.descriptors.mix_presentations() {
            let mut payload = Vec::new();
            write_mix_presentation(mix, &self.descriptors, &mut payload)?;
            write_obu(&mut stream, ObuType::MixPresentation, None, &payload);
        }

        out.write_all(&stream)?;
        Ok(())
    }

    /// Writes one audio frame for a substream, with optional trimming.
    pub fn write_audio_frame<W: io::Write>(
        &self,
        out: &mut W,
        substream_id: u32,
        skip_samples: u32,
        discard_padding: u32,
        data: &[u8],
    ) -> Result<()> {
        if self.descriptors.substream_owner(substream_id).is_none() {
            return decode_error("iamf: audio frame for an unknown substream");
        }

        let trimming = if skip_samples > 0 || discard_padding > 0 {
            Some((skip_samples, discard_padding))
        }
        else {
            None
        };

        let mut buf = Vec::new();

        if substream_id <= MAX_IMPLICIT_SUBSTREAM_ID {
            write_obu(&mut buf, ObuType::AudioFrameId(substream_id as u8), trimming, data);
        }
        else {
            let mut payload = Vec::with_capacity(data.len() + 4);
            write_leb128(&mut payload, substream_id);
            payload.extend_from_slice(data);
            write_obu(&mut buf, ObuType::AudioFrame, trimming, &payload);
        }

        out.write_all(&buf)?;
        Ok(())
    }

    /// Writes a parameter block for a registered parameter.
    pub fn write_parameter_block<W: io::Write>(
        &self,
        out: &mut W,
        block: &ParameterBlock,
    ) -> Result<()> {
        let mut payload = Vec::new();
        write_parameter_block(block, &self.descriptors, &mut payload)?;

        let mut buf = Vec::new();
        write_obu(&mut buf, ObuType::ParameterBlock, None, &payload);

        out.write_all(&buf)?;
        Ok(())
    }

    /// Writes a temporal delimiter, sealing the current temporal unit.
    pub fn write_temporal_delimiter<W: io::Write>(&self, out: &mut W) -> Result<()> {
        let mut buf = Vec::new();
        write_obu(&mut buf, ObuType::TemporalDelimiter, None, &[]);

        out.write_all(&buf)?;
        Ok(())
    }
}

/// Applies the codec config defaults to unset timing fields of a parameter definition.
fn default_param_timing(def: &mut ParamDefinition, config: &CodecConfig) {
    if def.rate == 0 {
        def.rate = config.sample_rate;
    }

    if def.fixed {
        if def.duration == 0 {
            def.duration = config.samples_per_frame;
        }
        if def.constant_subblock_duration == 0 && def.subblock_durations.is_empty() {
            def.constant_subblock_duration = config.samples_per_frame;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::CodecConfig;
    use crate::element::{Layer, Substream};
    use crate::mix::{LayoutKind, Loudness, Submix, SubmixElement, SubmixLayout};
    use crate::param::{DefaultDemixing, MixGainAnimation, MixGainSubblock, ParameterBlockData};

    use std::io::Cursor;

    use symphonia_core::codecs::CODEC_TYPE_PCM_S16BE;
    use symphonia_core::formats::{FormatOptions, FormatReader};
    use symphonia_core::io::MediaSourceStream;

    use crate::demuxer::IamfReader;

    fn pcm_config() -> CodecConfig {
        CodecConfig {
            id: 0,
            codec: CODEC_TYPE_PCM_S16BE,
            codec_tag: *b"ipcm",
            sample_rate: 48000,
            samples_per_frame: 64,
            audio_roll_distance: 0,
            extra_data: None,
        }
    }

    fn stereo_element(id: u32, substream_id: u32, codec_config_id: u32) -> AudioElement {
        let config = pcm_config();

        AudioElement {
            id,
            element_type: ElementType::Channel,
            codec_config_id,
            substreams: vec![Substream {
                id: substream_id,
                params: config.codec_params().unwrap(),
            }],
            layers: vec![Layer {
                loudspeaker_layout: 1,
                substream_count: 1,
                coupled_substream_count: 1,
                output_gain: None,
                recon_gain: false,
            }],
            ambisonics: None,
            demixing_parameter_id: None,
            recon_gain_parameter_id: None,
            default_w: 0,
        }
    }

    fn mix_gain(parameter_id: u32) -> ParamDefinition {
        ParamDefinition {
            parameter_id,
            param_type: ParamType::MixGain,
            rate: 48000,
            fixed: false,
            duration: 0,
            constant_subblock_duration: 0,
            subblock_durations: Vec::new(),
            audio_element_id: None,
            default_demixing: None,
        }
    }

    fn stereo_mix(id: u32, audio_element_id: u32) -> MixPresentation {
        MixPresentation {
            id,
            language_labels: vec!["en-us".to_string()],
            annotations: vec!["Test Mix".to_string()],
            submixes: vec![Submix {
                elements: vec![SubmixElement {
                    audio_element_id,
                    annotations: vec!["Bed".to_string()],
                    headphones_rendering_mode: 0,
                    mix_gain: mix_gain(100),
                    default_mix_gain: 0,
                }],
                output_mix_gain: mix_gain(101),
                default_mix_gain: -256,
                layouts: vec![SubmixLayout {
                    kind: LayoutKind::Loudspeakers(1),
                    loudness: Loudness::default(),
                }],
            }],
        }
    }

    #[test]
    fn verify_codec_config_deduplication() {
        let mut muxer = IamfMuxer::new();

        assert_eq!(muxer.add_codec_config(pcm_config()).unwrap(), 0);
        assert_eq!(muxer.add_codec_config(pcm_config()).unwrap(), 0);

        let mut other = pcm_config();
        other.samples_per_frame = 128;
        assert_eq!(muxer.add_codec_config(other).unwrap(), 1);
    }

    #[test]
    fn verify_element_validation() {
        let mut muxer = IamfMuxer::new();
        let id = muxer.add_codec_config(pcm_config()).unwrap();

        // A layer claiming fewer substreams than declared.
        let mut element = stereo_element(1, 0, id);
        element.substreams.push(Substream {
            id: 9,
            params: pcm_config().codec_params().unwrap(),
        });

        assert!(muxer.add_audio_element(element, None, None).is_err());

        // A missing codec config.
        let element = stereo_element(1, 0, 5);
        assert!(muxer.add_audio_element(element, None, None).is_err());
    }

    #[test]
    fn verify_element_param_defaulting() {
        let mut muxer = IamfMuxer::new();
        let id = muxer.add_codec_config(pcm_config()).unwrap();

        let demixing = ParamDefinition {
            parameter_id: 50,
            param_type: ParamType::Demixing,
            rate: 0,
            fixed: true,
            duration: 0,
            constant_subblock_duration: 0,
            subblock_durations: Vec::new(),
            audio_element_id: None,
            default_demixing: Some(DefaultDemixing { dmixp_mode: 1, default_w: 2 }),
        };

        muxer.add_audio_element(stereo_element(1, 0, id), Some(demixing), None).unwrap();

        let def = muxer.descriptors().param_definition(50).unwrap();
        assert_eq!(def.rate, 48000);
        assert_eq!(def.duration, 64);
        assert_eq!(def.constant_subblock_duration, 64);
        assert_eq!(def.audio_element_id, Some(1));

        let element = muxer.descriptors().audio_element(1).unwrap();
        assert_eq!(element.demixing_parameter_id, Some(50));
    }

    #[test]
    fn verify_descriptor_round_trip() {
        let mut muxer = IamfMuxer::new();

        let id = muxer.add_codec_config(pcm_config()).unwrap();
        muxer.add_audio_element(stereo_element(1, 0, id), None, None).unwrap();
        muxer.add_mix_presentation(stereo_mix(2, 1)).unwrap();

        let mut stream = Vec::new();
        muxer.write_descriptors(&mut stream).unwrap();

        let mss = MediaSourceStream::new(Box::new(Cursor::new(stream)), Default::default());
        let reader = IamfReader::try_new(mss, &Default::default()).unwrap();

        let set = reader.descriptors();

        let config = set.codec_config(0).unwrap();
        assert_eq!(*config, pcm_config());

        let element = set.audio_element(1).unwrap();
        assert_eq!(element.element_type, ElementType::Channel);
        assert_eq!(element.substreams.len(), 1);
        assert_eq!(element.substreams[0].id, 0);
        assert_eq!(element.layers, stereo_element(1, 0, 0).layers);

        let mix = set.mix_presentation(2).unwrap();
        assert_eq!(*mix, stereo_mix(2, 1));

        // One element keeps the profile fields at zero.
        assert_eq!(set.primary_profile, 0);
        assert_eq!(set.additional_profile, 0);
    }

    #[test]
    fn verify_frame_and_parameter_writing() {
        let mut muxer = IamfMuxer::new();

        let id = muxer.add_codec_config(pcm_config()).unwrap();
        muxer.add_audio_element(stereo_element(1, 0, id), None, None).unwrap();
        muxer.add_mix_presentation(stereo_mix(2, 1)).unwrap();

        let mut stream = Vec::new();
        muxer.write_descriptors(&mut stream).unwrap();

        let block = ParameterBlock {
            parameter_id: 100,
            data: ParameterBlockData::MixGain(vec![MixGainSubblock {
                duration: 64,
                animation: MixGainAnimation::Linear { start: 0, end: -512 },
            }]),
        };

        muxer.write_parameter_block(&mut stream, &block).unwrap();
        muxer.write_audio_frame(&mut stream, 0, 16, 0, &[0xab; 8]).unwrap();
        muxer.write_temporal_delimiter(&mut stream).unwrap();

        // An unknown substream is rejected.
        assert!(muxer.write_audio_frame(&mut stream, 3, 0, 0, &[0; 8]).is_err());

        let mss = MediaSourceStream::new(Box::new(Cursor::new(stream)), Default::default());
        let options = FormatOptions { enable_gapless: true, ..Default::default() };
        let mut reader = IamfReader::try_new(mss, &options).unwrap();

        let packet = reader.next_packet().unwrap();
        assert_eq!(packet.track_id(), 0);
        assert_eq!(packet.trim_start(), 16);
        assert_eq!(packet.buf(), &[0xab; 8]);

        assert_eq!(reader.last_packet_parameters().mix_gain.as_ref(), Some(&block));
    }
}
