// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Audio element descriptors: substreams, scalable channel layers, and ambisonics
//! configurations.

use log::debug;

use symphonia_core::audio::Channels;
use symphonia_core::codecs::{CodecParameters, CODEC_TYPE_NULL};
use symphonia_core::errors::{decode_error, unsupported_error, Result};
use symphonia_core::io::{BufReader, ReadBytes};

use crate::codecs::{patch_channel_count, CodecConfig};
use crate::descriptors::DescriptorSet;
use crate::layout::{scalable_layout_channels, NUM_SCALABLE_LAYOUTS};
use crate::obu::{read_leb128, write_leb128};
use crate::param::{read_param_definition, write_param_definition, ParamType};

pub const MAX_LAYERS: u8 = 6;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ElementType {
    Channel,
    Scene,
    Reserved(u8),
}

impl ElementType {
    pub fn from_raw(raw: u8) -> ElementType {
        match raw & 0x7 {
            0 => ElementType::Channel,
            1 => ElementType::Scene,
            n => ElementType::Reserved(n),
        }
    }

    pub fn into_raw(self) -> u8 {
        match self {
            ElementType::Channel => 0,
            ElementType::Scene => 1,
            ElementType::Reserved(n) => n,
        }
    }
}

/// One coded substream of an audio element. Each substream is exposed as a track.
#[derive(Clone, Debug)]
pub struct Substream {
    pub id: u32,
    pub params: CodecParameters,
}

/// Output gain applied to the downmixed channels of a scalable layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutputGain {
    /// 6-bit flags selecting the channels the gain applies to.
    pub flags: u8,
    /// Gain in Q7.8 fixed point.
    pub gain: i16,
}

/// One layer of a scalable channel layout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Layer {
    /// The on-wire loudspeaker layout index. Values at or above `NUM_SCALABLE_LAYOUTS` carry
    /// no canonical speaker positions.
    pub loudspeaker_layout: u8,
    pub substream_count: u8,
    pub coupled_substream_count: u8,
    pub output_gain: Option<OutputGain>,
    /// Whether recon gain parameter blocks carry values for this layer.
    pub recon_gain: bool,
}

impl Layer {
    /// The canonical channels of this layer, when the layout index has them.
    pub fn channels(&self) -> Option<Channels> {
        scalable_layout_channels(self.loudspeaker_layout)
    }

    /// Number of coded channels the layer adds.
    pub fn num_channels(&self) -> u32 {
        u32::from(self.substream_count) + u32::from(self.coupled_substream_count)
    }
}

/// Ambisonics configuration of a scene-based audio element.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Ambisonics {
    /// Each ambisonics channel maps onto one mono substream channel.
    Mono { channel_map: Vec<u8> },
    /// Substream channels are mixed into ambisonics channels through a demixing matrix of
    /// Q7.8 coefficients, one row per substream channel.
    Projection { output_channel_count: u8, coupled_substream_count: u8, demixing_matrix: Vec<i16> },
}

impl Ambisonics {
    pub fn output_channel_count(&self) -> u8 {
        match self {
            Ambisonics::Mono { channel_map } => channel_map.len() as u8,
            Ambisonics::Projection { output_channel_count, .. } => *output_channel_count,
        }
    }
}

/// An audio element descriptor.
#[derive(Clone, Debug)]
pub struct AudioElement {
    pub id: u32,
    pub element_type: ElementType,
    pub codec_config_id: u32,
    pub substreams: Vec<Substream>,
    pub layers: Vec<Layer>,
    pub ambisonics: Option<Ambisonics>,
    pub demixing_parameter_id: Option<u32>,
    pub recon_gain_parameter_id: Option<u32>,
    /// Default weight of the surround-to-height demixer, from the demixing parameter
    /// definition.
    pub default_w: u8,
}

impl AudioElement {
    pub fn substream(&self, id: u32) -> Option<&Substream> {
        self.substreams.iter().find(|s| s.id == id)
    }
}

/// Reads an audio element OBU payload.
///
/// Elements that reference a codec config with an unrecognized codec are skipped and yield
/// `None`. The element is not added to the descriptor set; parameter definitions it carries
/// are registered as a side effect.
pub fn read_audio_element(
    reader: &mut BufReader<'_>,
    set: &mut DescriptorSet,
) -> Result<Option<AudioElement>> {
    let id = read_leb128(reader)?;

    if set.audio_element(id).is_some() {
        return decode_error("iamf: duplicate audio element id");
    }

    let element_type = ElementType::from_raw(reader.read_byte()? >> 5);
    let codec_config_id = read_leb128(reader)?;

    let config = match set.codec_config(codec_config_id) {
        Some(config) => config.clone(),
        None => return decode_error("iamf: audio element references a missing codec config"),
    };

    if config.codec == CODEC_TYPE_NULL {
        debug!("ignoring audio element {} with an unknown codec", id);
        return Ok(None);
    }

    let num_substreams = read_leb128(reader)?;

    let mut element = AudioElement {
        id,
        element_type,
        codec_config_id,
        substreams: Vec::new(),
        layers: Vec::new(),
        ambisonics: None,
        demixing_parameter_id: None,
        recon_gain_parameter_id: None,
        default_w: 0,
    };

    for _ in 0..num_substreams {
        let substream_id = read_leb128(reader)?;

        if element.substream(substream_id).is_some() {
            return decode_error("iamf: duplicate substream id");
        }

        element.substreams.push(Substream { id: substream_id, params: config.codec_params()? });
    }

    let num_parameters = read_leb128(reader)?;

    if num_parameters > 0 && element_type != ElementType::Channel {
        return decode_error("iamf: invalid parameter count for a scene representation");
    }

    for _ in 0..num_parameters {
        match ParamType::from_raw(read_leb128(reader)?) {
            Some(ParamType::MixGain) => {
                return decode_error("iamf: mix gain parameter in an audio element");
            }
            Some(param_type) => {
                let mut def = read_param_definition(reader, param_type, Some(config.sample_rate))?;
                def.audio_element_id = Some(id);

                if let Some(demixing) = def.default_demixing {
                    element.default_w = demixing.default_w;
                }

                match param_type {
                    ParamType::Demixing => element.demixing_parameter_id = Some(def.parameter_id),
                    _ => element.recon_gain_parameter_id = Some(def.parameter_id),
                }

                set.register_param_definition(def)?;
            }
            None => {
                let size = read_leb128(reader)?;
                reader.ignore_bytes(u64::from(size))?;
            }
        }
    }

    match element_type {
        ElementType::Channel => read_scalable_layout(reader, &config, &mut element)?,
        ElementType::Scene => read_ambisonics_config(reader, &config, &mut element)?,
        ElementType::Reserved(_) => {
            let size = read_leb128(reader)?;
            reader.ignore_bytes(u64::from(size))?;
        }
    }

    Ok(Some(element))
}

fn read_scalable_layout(
    reader: &mut BufReader<'_>,
    config: &CodecConfig,
    element: &mut AudioElement,
) -> Result<()> {
    let num_layers = reader.read_byte()? >> 5;

    if num_layers > MAX_LAYERS {
        return decode_error("iamf: invalid layer count");
    }

    let mut next = 0;

    for _ in 0..num_layers {
        let byte = reader.read_byte()?;

        let loudspeaker_layout = byte >> 4;
        let output_gain_is_present = byte >> 3 & 1 == 1;
        let recon_gain = byte >> 2 & 1 == 1;

        let substream_count = reader.read_byte()?;
        let coupled_substream_count = reader.read_byte()?;

        let output_gain = if output_gain_is_present {
            let flags = reader.read_byte()? >> 2;
            let gain = reader.read_be_u16()? as i16;
            Some(OutputGain { flags, gain })
        }
        else {
            None
        };

        element.layers.push(Layer {
            loudspeaker_layout,
            substream_count,
            coupled_substream_count,
            output_gain,
            recon_gain,
        });

        next = claim_substreams(config, element, next, substream_count, coupled_substream_count)?;
    }

    if next != element.substreams.len() {
        return decode_error("iamf: layers do not cover all substreams");
    }

    Ok(())
}

fn read_ambisonics_config(
    reader: &mut BufReader<'_>,
    config: &CodecConfig,
    element: &mut AudioElement,
) -> Result<()> {
    let mode = read_leb128(reader)?;

    if mode > 1 {
        return unsupported_error("iamf: reserved ambisonics mode");
    }

    let output_channel_count = reader.read_byte()?;
    let substream_count = reader.read_byte()?;

    if usize::from(substream_count) != element.substreams.len() {
        return decode_error("iamf: invalid ambisonics substream count");
    }

    // All spherical harmonics up to the order must be present.
    let order = (0u32..=16).find(|o| (o + 1) * (o + 1) >= u32::from(output_channel_count));
    if order.map(|o| (o + 1) * (o + 1)) != Some(u32::from(output_channel_count)) {
        return decode_error("iamf: incomplete ambisonics order");
    }

    if mode == 0 {
        let mut channel_map = vec![0u8; usize::from(output_channel_count)];
        reader.read_buf_exact(&mut channel_map)?;

        element.ambisonics = Some(Ambisonics::Mono { channel_map });
        element.layers.push(Layer {
            loudspeaker_layout: NUM_SCALABLE_LAYOUTS,
            substream_count,
            coupled_substream_count: 0,
            output_gain: None,
            recon_gain: false,
        });

        claim_substreams(config, element, 0, substream_count, 0)?;
    }
    else {
        let coupled_substream_count = reader.read_byte()?;

        let rows = usize::from(substream_count) + usize::from(coupled_substream_count);
        let size = rows * usize::from(output_channel_count);

        let mut demixing_matrix = Vec::with_capacity(size);
        for _ in 0..size {
            demixing_matrix.push(reader.read_be_u16()? as i16);
        }

        element.ambisonics = Some(Ambisonics::Projection {
            output_channel_count,
            coupled_substream_count,
            demixing_matrix,
        });
        element.layers.push(Layer {
            loudspeaker_layout: NUM_SCALABLE_LAYOUTS,
            substream_count,
            coupled_substream_count,
            output_gain: None,
            recon_gain: false,
        });

        claim_substreams(config, element, 0, substream_count, coupled_substream_count)?;
    }

    Ok(())
}

/// Assigns channel layouts to the next `count` unclaimed substreams. The first `coupled`
/// substreams are stereo pairs, the rest are mono.
fn claim_substreams(
    config: &CodecConfig,
    element: &mut AudioElement,
    next: usize,
    count: u8,
    coupled: u8,
) -> Result<usize> {
    let mut coupled = u32::from(coupled);

    for i in 0..usize::from(count) {
        let substream = match element.substreams.get_mut(next + i) {
            Some(substream) => substream,
            None => return decode_error("iamf: layers claim more substreams than declared"),
        };

        let channels = if coupled > 0 {
            coupled -= 1;
            Channels::FRONT_LEFT | Channels::FRONT_RIGHT
        }
        else {
            Channels::FRONT_LEFT
        };

        substream.params.with_channels(channels);

        if let Some(extra) = substream.params.extra_data.as_mut() {
            patch_channel_count(config.codec, extra, channels.count() as u32)?;
        }
    }

    Ok(next + usize::from(count))
}

/// Serializes an audio element descriptor into an OBU payload.
pub fn write_audio_element(
    element: &AudioElement,
    set: &DescriptorSet,
    buf: &mut Vec<u8>,
) -> Result<()> {
    write_leb128(buf, element.id);
    buf.push(element.element_type.into_raw() << 5);
    write_leb128(buf, element.codec_config_id);

    write_leb128(buf, element.substreams.len() as u32);
    for substream in &element.substreams {
        write_leb128(buf, substream.id);
    }

    let params = [
        (ParamType::Demixing, element.demixing_parameter_id),
        (ParamType::ReconGain, element.recon_gain_parameter_id),
    ];

    write_leb128(buf, params.iter().filter(|(_, id)| id.is_some()).count() as u32);

    for (param_type, parameter_id) in params.iter() {
        let parameter_id = match parameter_id {
            Some(id) => *id,
            None => continue,
        };

        let def = match set.param_definition(parameter_id) {
            Some(def) if def.param_type == *param_type => def,
            _ => return decode_error("iamf: audio element references an unregistered parameter"),
        };

        write_leb128(buf, param_type.into_raw());
        write_param_definition(def, buf);

        if *param_type == ParamType::Demixing {
            // The parser reads one pair per subblock of the definition.
            let demixing = def.default_demixing.unwrap_or_default();
            for _ in 0..def.num_subblocks() {
                buf.push(demixing.dmixp_mode << 5);
                buf.push(demixing.default_w << 4);
            }
        }
    }

    match element.element_type {
        ElementType::Channel => write_scalable_layout(element, buf),
        ElementType::Scene => write_ambisonics_config(element, buf),
        ElementType::Reserved(_) => unsupported_error("iamf: reserved audio element type"),
    }
}

fn write_scalable_layout(element: &AudioElement, buf: &mut Vec<u8>) -> Result<()> {
    if element.layers.is_empty() || element.layers.len() > usize::from(MAX_LAYERS) {
        return decode_error("iamf: invalid layer count");
    }

    buf.push((element.layers.len() as u8) << 5);

    for layer in &element.layers {
        if layer.loudspeaker_layout >= NUM_SCALABLE_LAYOUTS {
            return decode_error("iamf: layer has no canonical loudspeaker layout");
        }

        let mut byte = layer.loudspeaker_layout << 4;
        byte |= u8::from(layer.output_gain.is_some()) << 3;
        byte |= u8::from(layer.recon_gain) << 2;

        buf.push(byte);
        buf.push(layer.substream_count);
        buf.push(layer.coupled_substream_count);

        if let Some(output_gain) = &layer.output_gain {
            buf.push(output_gain.flags << 2);
            buf.extend_from_slice(&(output_gain.gain as u16).to_be_bytes());
        }
    }

    Ok(())
}

fn write_ambisonics_config(element: &AudioElement, buf: &mut Vec<u8>) -> Result<()> {
    let ambisonics = match &element.ambisonics {
        Some(ambisonics) => ambisonics,
        None => return decode_error("iamf: scene element without an ambisonics config"),
    };

    match ambisonics {
        Ambisonics::Mono { channel_map } => {
            write_leb128(buf, 0);
            buf.push(channel_map.len() as u8);
            buf.push(element.substreams.len() as u8);
            buf.extend_from_slice(channel_map);
        }
        Ambisonics::Projection { output_channel_count, coupled_substream_count, demixing_matrix } => {
            write_leb128(buf, 1);
            buf.push(*output_channel_count);
            buf.push(element.substreams.len() as u8);
            buf.push(*coupled_substream_count);
            for &coeff in demixing_matrix {
                buf.extend_from_slice(&(coeff as u16).to_be_bytes());
            }
        }
    }

    Ok(())
}
