// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parameter definitions and parameter blocks.
//!
//! A parameter definition declares an animated side-channel (mix gain, demixing info, or recon
//! gain) and optionally fixes its subblock timing. Parameter block OBUs then deliver the values
//! per frame.

use log::debug;

use symphonia_core::errors::{decode_error, Result};
use symphonia_core::io::{BufReader, ReadBytes};

use crate::descriptors::DescriptorSet;
use crate::obu::{read_leb128, write_leb128};

/// Converts a Q7.8 fixed-point value to floating point.
pub fn q7_8_to_f32(value: i16) -> f32 {
    f32::from(value) / 256.0
}

/// Parameter definition types as coded on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParamType {
    MixGain,
    Demixing,
    ReconGain,
}

impl ParamType {
    pub fn from_raw(raw: u32) -> Option<ParamType> {
        match raw {
            0 => Some(ParamType::MixGain),
            1 => Some(ParamType::Demixing),
            2 => Some(ParamType::ReconGain),
            _ => None,
        }
    }

    pub fn into_raw(self) -> u32 {
        match self {
            ParamType::MixGain => 0,
            ParamType::Demixing => 1,
            ParamType::ReconGain => 2,
        }
    }
}

/// Default demixing values carried by a demixing parameter definition.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DefaultDemixing {
    pub dmixp_mode: u8,
    pub default_w: u8,
}

/// A parameter definition.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamDefinition {
    pub parameter_id: u32,
    pub param_type: ParamType,
    /// Parameter clock rate in Hz.
    pub rate: u32,
    /// When true the subblock timing below is fixed by the definition, and parameter blocks
    /// omit their own timing fields.
    pub fixed: bool,
    pub duration: u32,
    pub constant_subblock_duration: u32,
    /// Explicit per-subblock durations. Only populated when `constant_subblock_duration` is
    /// zero.
    pub subblock_durations: Vec<u32>,
    /// The audio element that owns this definition, for demixing and recon gain parameters.
    pub audio_element_id: Option<u32>,
    pub default_demixing: Option<DefaultDemixing>,
}

impl ParamDefinition {
    /// Number of subblocks per parameter block under this definition.
    pub fn num_subblocks(&self) -> usize {
        if !self.fixed {
            0
        }
        else if self.constant_subblock_duration == 0 {
            self.subblock_durations.len()
        }
        else {
            (self.duration / self.constant_subblock_duration) as usize
        }
    }

    /// The fixed subblock durations, when the definition carries them.
    pub fn subblock_layout(&self) -> Vec<u32> {
        if !self.fixed {
            Vec::new()
        }
        else if self.constant_subblock_duration == 0 {
            self.subblock_durations.clone()
        }
        else {
            vec![self.constant_subblock_duration; self.num_subblocks()]
        }
    }

    /// Two definitions for the same parameter id must agree on everything but ownership.
    pub fn is_consistent_with(&self, other: &ParamDefinition) -> bool {
        self.parameter_id == other.parameter_id
            && self.param_type == other.param_type
            && self.rate == other.rate
            && self.fixed == other.fixed
            && self.duration == other.duration
            && self.constant_subblock_duration == other.constant_subblock_duration
            && self.subblock_durations == other.subblock_durations
            && self.default_demixing == other.default_demixing
    }
}

/// Reads a parameter definition.
///
/// `fallback_rate` substitutes for a zero on-wire rate, and is derived from the owning audio
/// element's codec config when there is one.
pub fn read_param_definition(
    reader: &mut BufReader<'_>,
    param_type: ParamType,
    fallback_rate: Option<u32>,
) -> Result<ParamDefinition> {
    let parameter_id = read_leb128(reader)?;

    let mut rate = read_leb128(reader)?;
    if rate == 0 {
        rate = match fallback_rate {
            Some(rate) if rate > 0 => rate,
            _ => return decode_error("iamf: invalid parameter rate"),
        };
    }

    let fixed = reader.read_byte()? >> 7 == 0;

    let mut def = ParamDefinition {
        parameter_id,
        param_type,
        rate,
        fixed,
        duration: 0,
        constant_subblock_duration: 0,
        subblock_durations: Vec::new(),
        audio_element_id: None,
        default_demixing: None,
    };

    if !fixed {
        return Ok(def);
    }

    def.duration = read_leb128(reader)?;
    if def.duration == 0 {
        return decode_error("iamf: invalid parameter duration");
    }

    def.constant_subblock_duration = read_leb128(reader)?;

    let num_subblocks = if def.constant_subblock_duration == 0 {
        read_leb128(reader)?
    }
    else {
        if def.duration % def.constant_subblock_duration != 0 {
            return decode_error("iamf: subblocks do not cover the parameter duration");
        }
        def.duration / def.constant_subblock_duration
    };

    for _ in 0..num_subblocks {
        if def.constant_subblock_duration == 0 {
            def.subblock_durations.push(read_leb128(reader)?);
        }

        if def.param_type == ParamType::Demixing {
            let dmixp_mode = reader.read_byte()? >> 5;
            let default_w = reader.read_byte()? >> 4;
            def.default_demixing = Some(DefaultDemixing { dmixp_mode, default_w });
        }
    }

    if def.constant_subblock_duration == 0 {
        let total = def.subblock_durations.iter().try_fold(0u32, |acc, &d| acc.checked_add(d));

        if total != Some(def.duration) {
            return decode_error("iamf: subblocks do not cover the parameter duration");
        }
    }

    Ok(def)
}

/// Serializes a parameter definition. The default demixing values are not part of the
/// definition record and are written separately by the audio element.
pub fn write_param_definition(def: &ParamDefinition, buf: &mut Vec<u8>) {
    write_leb128(buf, def.parameter_id);
    write_leb128(buf, def.rate);

    if !def.fixed {
        buf.push(0x80);
        return;
    }

    buf.push(0);
    write_leb128(buf, def.duration);
    write_leb128(buf, def.constant_subblock_duration);

    if def.constant_subblock_duration == 0 {
        write_leb128(buf, def.subblock_durations.len() as u32);
        for &duration in &def.subblock_durations {
            write_leb128(buf, duration);
        }
    }
}

/// Mix gain animation over one subblock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MixGainAnimation {
    Step { start: i16 },
    Linear { start: i16, end: i16 },
    Bezier { start: i16, end: i16, control: i16, control_relative_time: u8 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MixGainSubblock {
    pub duration: u32,
    pub animation: MixGainAnimation,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DemixingSubblock {
    pub duration: u32,
    pub dmixp_mode: u8,
}

/// Recon gains for one scalable layer. A set bit in `flags` selects a channel of the layer,
/// and `gains` holds one value per set bit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayerReconGain {
    pub flags: u32,
    pub gains: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconGainSubblock {
    pub duration: u32,
    pub gains: Vec<LayerReconGain>,
}

/// A decoded parameter block OBU.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterBlock {
    pub parameter_id: u32,
    pub data: ParameterBlockData,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParameterBlockData {
    MixGain(Vec<MixGainSubblock>),
    Demixing(Vec<DemixingSubblock>),
    ReconGain(Vec<ReconGainSubblock>),
}

/// Reads a parameter block OBU payload.
///
/// Blocks that reference an undeclared parameter id are skipped and yield `None`.
pub fn read_parameter_block(
    reader: &mut BufReader<'_>,
    set: &DescriptorSet,
) -> Result<Option<ParameterBlock>> {
    let parameter_id = read_leb128(reader)?;

    let def = match set.param_definition(parameter_id) {
        Some(def) => def,
        None => {
            debug!("skipping parameter block for undeclared parameter {}", parameter_id);
            return Ok(None);
        }
    };

    // When the definition does not fix the timing, the block carries its own.
    let mut explicit = false;
    let mut duration = def.duration;
    let mut durations = def.subblock_layout();
    let num_subblocks;

    if def.fixed {
        num_subblocks = durations.len();
    }
    else {
        duration = read_leb128(reader)?;
        if duration == 0 {
            return decode_error("iamf: invalid parameter duration");
        }

        let constant = read_leb128(reader)?;

        if constant == 0 {
            explicit = true;
            num_subblocks = read_leb128(reader)? as usize;
        }
        else {
            if duration % constant != 0 {
                return decode_error("iamf: subblocks do not cover the parameter duration");
            }
            num_subblocks = (duration / constant) as usize;
            durations = vec![constant; num_subblocks];
        }
    }

    let mut total = 0u32;

    let data = match def.param_type {
        ParamType::MixGain => {
            let mut subblocks = Vec::new();
            for i in 0..num_subblocks {
                let duration = next_duration(reader, &durations, i, explicit, &mut total)?;
                let animation = read_mix_gain_animation(reader)?;
                subblocks.push(MixGainSubblock { duration, animation });
            }
            ParameterBlockData::MixGain(subblocks)
        }
        ParamType::Demixing => {
            let mut subblocks = Vec::new();
            for i in 0..num_subblocks {
                let duration = next_duration(reader, &durations, i, explicit, &mut total)?;
                let dmixp_mode = reader.read_byte()? >> 5;
                subblocks.push(DemixingSubblock { duration, dmixp_mode });
            }
            ParameterBlockData::Demixing(subblocks)
        }
        ParamType::ReconGain => {
            let element = match def.audio_element_id.and_then(|id| set.audio_element(id)) {
                Some(element) => element,
                None => return decode_error("iamf: recon gain parameter has no owner"),
            };

            let num_layers = element.layers.iter().filter(|l| l.recon_gain).count();

            let mut subblocks = Vec::new();
            for i in 0..num_subblocks {
                let duration = next_duration(reader, &durations, i, explicit, &mut total)?;

                let mut gains = Vec::new();
                for _ in 0..num_layers {
                    let flags = read_leb128(reader)?;
                    let mut layer_gains = vec![0u8; flags.count_ones() as usize];
                    reader.read_buf_exact(&mut layer_gains)?;
                    gains.push(LayerReconGain { flags, gains: layer_gains });
                }

                subblocks.push(ReconGainSubblock { duration, gains });
            }
            ParameterBlockData::ReconGain(subblocks)
        }
    };

    if explicit && total != duration {
        return decode_error("iamf: subblocks do not cover the parameter duration");
    }

    Ok(Some(ParameterBlock { parameter_id, data }))
}

fn next_duration(
    reader: &mut BufReader<'_>,
    durations: &[u32],
    index: usize,
    explicit: bool,
    total: &mut u32,
) -> Result<u32> {
    let duration = if explicit { read_leb128(reader)? } else { durations[index] };

    *total = match total.checked_add(duration) {
        Some(total) => total,
        None => return decode_error("iamf: invalid subblock duration"),
    };

    Ok(duration)
}

fn read_mix_gain_animation(reader: &mut BufReader<'_>) -> Result<MixGainAnimation> {
    let animation = match read_leb128(reader)? {
        0 => MixGainAnimation::Step { start: reader.read_be_u16()? as i16 },
        1 => MixGainAnimation::Linear {
            start: reader.read_be_u16()? as i16,
            end: reader.read_be_u16()? as i16,
        },
        2 => MixGainAnimation::Bezier {
            start: reader.read_be_u16()? as i16,
            end: reader.read_be_u16()? as i16,
            control: reader.read_be_u16()? as i16,
            control_relative_time: reader.read_byte()?,
        },
        _ => return decode_error("iamf: invalid mix gain animation type"),
    };

    Ok(animation)
}

/// Serializes a parameter block against its registered definition.
///
/// Blocks under a non-fixed definition are written with an explicit subblock duration list.
pub fn write_parameter_block(
    block: &ParameterBlock,
    set: &DescriptorSet,
    buf: &mut Vec<u8>,
) -> Result<()> {
    let def = match set.param_definition(block.parameter_id) {
        Some(def) => def,
        None => return decode_error("iamf: parameter block for undeclared parameter"),
    };

    write_leb128(buf, block.parameter_id);

    let durations: Vec<u32> = match &block.data {
        ParameterBlockData::MixGain(s) => s.iter().map(|s| s.duration).collect(),
        ParameterBlockData::Demixing(s) => s.iter().map(|s| s.duration).collect(),
        ParameterBlockData::ReconGain(s) => s.iter().map(|s| s.duration).collect(),
    };

    if !def.fixed {
        let total = durations.iter().try_fold(0u32, |acc, &d| acc.checked_add(d));

        match total {
            Some(total) if total > 0 => write_leb128(buf, total),
            _ => return decode_error("iamf: invalid parameter duration"),
        }

        write_leb128(buf, 0);
        write_leb128(buf, durations.len() as u32);
    }
    else if durations.len() != def.num_subblocks() {
        return decode_error("iamf: parameter block does not match its definition");
    }

    match &block.data {
        ParameterBlockData::MixGain(subblocks) => {
            if def.param_type != ParamType::MixGain {
                return decode_error("iamf: parameter block does not match its definition");
            }
            for sub in subblocks {
                if !def.fixed {
                    write_leb128(buf, sub.duration);
                }
                write_mix_gain_animation(&sub.animation, buf);
            }
        }
        ParameterBlockData::Demixing(subblocks) => {
            if def.param_type != ParamType::Demixing {
                return decode_error("iamf: parameter block does not match its definition");
            }
            for sub in subblocks {
                if !def.fixed {
                    write_leb128(buf, sub.duration);
                }
                buf.push(sub.dmixp_mode << 5);
            }
        }
        ParameterBlockData::ReconGain(subblocks) => {
            if def.param_type != ParamType::ReconGain {
                return decode_error("iamf: parameter block does not match its definition");
            }
            for sub in subblocks {
                if !def.fixed {
                    write_leb128(buf, sub.duration);
                }
                for layer in &sub.gains {
                    if layer.gains.len() != layer.flags.count_ones() as usize {
                        return decode_error("iamf: invalid recon gain flags");
                    }
                    write_leb128(buf, layer.flags);
                    buf.extend_from_slice(&layer.gains);
                }
            }
        }
    }

    Ok(())
}

fn write_mix_gain_animation(animation: &MixGainAnimation, buf: &mut Vec<u8>) {
    match *animation {
        MixGainAnimation::Step { start } => {
            write_leb128(buf, 0);
            buf.extend_from_slice(&(start as u16).to_be_bytes());
        }
        MixGainAnimation::Linear { start, end } => {
            write_leb128(buf, 1);
            buf.extend_from_slice(&(start as u16).to_be_bytes());
            buf.extend_from_slice(&(end as u16).to_be_bytes());
        }
        MixGainAnimation::Bezier { start, end, control, control_relative_time } => {
            write_leb128(buf, 2);
            buf.extend_from_slice(&(start as u16).to_be_bytes());
            buf.extend_from_slice(&(end as u16).to_be_bytes());
            buf.extend_from_slice(&(control as u16).to_be_bytes());
            buf.push(control_relative_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_def(payload: &[u8], param_type: ParamType) -> Result<ParamDefinition> {
        read_param_definition(&mut BufReader::new(payload), param_type, None)
    }

    #[test]
    fn verify_fixed_definition_with_constant_subblocks() {
        // id 5, rate 48000, mode 0, duration 960, constant subblock duration 240.
        let mut payload = vec![0x05];
        write_leb128(&mut payload, 48000);
        payload.push(0);
        write_leb128(&mut payload, 960);
        write_leb128(&mut payload, 240);

        let def = parse_def(&payload, ParamType::MixGain).unwrap();

        assert_eq!(def.parameter_id, 5);
        assert_eq!(def.rate, 48000);
        assert!(def.fixed);
        assert_eq!(def.num_subblocks(), 4);
        assert_eq!(def.subblock_layout(), vec![240; 4]);
    }

    #[test]
    fn verify_fixed_definition_with_explicit_subblocks() {
        let mut payload = vec![0x05];
        write_leb128(&mut payload, 48000);
        payload.push(0);
        write_leb128(&mut payload, 960);
        write_leb128(&mut payload, 0);
        write_leb128(&mut payload, 2);
        write_leb128(&mut payload, 720);
        write_leb128(&mut payload, 240);

        let def = parse_def(&payload, ParamType::MixGain).unwrap();
        assert_eq!(def.subblock_layout(), vec![720, 240]);
    }

    #[test]
    fn verify_definition_rejects_short_subblocks() {
        // Explicit subblocks summing to less than the duration.
        let mut payload = vec![0x05];
        write_leb128(&mut payload, 48000);
        payload.push(0);
        write_leb128(&mut payload, 960);
        write_leb128(&mut payload, 0);
        write_leb128(&mut payload, 2);
        write_leb128(&mut payload, 500);
        write_leb128(&mut payload, 400);

        assert!(parse_def(&payload, ParamType::MixGain).is_err());
    }

    #[test]
    fn verify_definition_rejects_non_dividing_subblocks() {
        let mut payload = vec![0x05];
        write_leb128(&mut payload, 48000);
        payload.push(0);
        write_leb128(&mut payload, 960);
        write_leb128(&mut payload, 700);

        assert!(parse_def(&payload, ParamType::MixGain).is_err());
    }

    #[test]
    fn verify_definition_rate_fallback() {
        let mut payload = vec![0x05];
        write_leb128(&mut payload, 0);
        payload.push(0x80);

        let def =
            read_param_definition(&mut BufReader::new(&payload), ParamType::MixGain, Some(44100))
                .unwrap();
        assert_eq!(def.rate, 44100);
        assert!(!def.fixed);

        // Without a fallback a zero rate is an error.
        assert!(parse_def(&payload, ParamType::MixGain).is_err());
    }

    #[test]
    fn verify_demixing_defaults() {
        let mut payload = vec![0x09];
        write_leb128(&mut payload, 48000);
        payload.push(0);
        write_leb128(&mut payload, 960);
        write_leb128(&mut payload, 960);
        payload.push(0x3 << 5);
        payload.push(0x1 << 4);

        let def = parse_def(&payload, ParamType::Demixing).unwrap();

        assert_eq!(def.default_demixing, Some(DefaultDemixing { dmixp_mode: 3, default_w: 1 }));
    }

    #[test]
    fn verify_block_rejects_mismatched_subblock_sum() {
        // A non-fixed mix gain definition: blocks carry their own timing.
        let mut set = DescriptorSet::default();
        set.register_param_definition(ParamDefinition {
            parameter_id: 100,
            param_type: ParamType::MixGain,
            rate: 48000,
            fixed: false,
            duration: 0,
            constant_subblock_duration: 0,
            subblock_durations: Vec::new(),
            audio_element_id: None,
            default_demixing: None,
        })
        .unwrap();

        let block = |durations: &[u32]| {
            let mut payload = Vec::new();
            write_leb128(&mut payload, 100);
            write_leb128(&mut payload, 100); // duration
            write_leb128(&mut payload, 0); // explicit subblock list
            write_leb128(&mut payload, durations.len() as u32);
            for &duration in durations {
                write_leb128(&mut payload, duration);
                write_leb128(&mut payload, 0); // step animation
                payload.extend_from_slice(&[0, 0]);
            }
            payload
        };

        // An explicit list summing short of the duration is rejected, even by one.
        assert!(read_parameter_block(&mut BufReader::new(&block(&[30, 30])), &set).is_err());
        assert!(read_parameter_block(&mut BufReader::new(&block(&[70, 29])), &set).is_err());

        let parsed =
            read_parameter_block(&mut BufReader::new(&block(&[70, 30])), &set).unwrap().unwrap();
        assert_eq!(parsed.parameter_id, 100);
    }

    #[test]
    fn verify_definition_round_trip() {
        let def = ParamDefinition {
            parameter_id: 42,
            param_type: ParamType::MixGain,
            rate: 48000,
            fixed: true,
            duration: 960,
            constant_subblock_duration: 0,
            subblock_durations: vec![480, 480],
            audio_element_id: None,
            default_demixing: None,
        };

        let mut buf = Vec::new();
        write_param_definition(&def, &mut buf);

        let parsed = parse_def(&buf, ParamType::MixGain).unwrap();
        assert!(parsed.is_consistent_with(&def));
    }
}
