// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mix presentation descriptors: submixes, rendering targets, and loudness information.

use log::debug;

use symphonia_core::errors::{decode_error, Result};
use symphonia_core::io::{BufReader, ReadBytes};

use crate::descriptors::DescriptorSet;
use crate::layout::NUM_SOUND_SYSTEMS;
use crate::obu::{read_leb128, write_leb128};
use crate::param::{read_param_definition, write_param_definition, ParamDefinition, ParamType};

/// Longest accepted annotation or language label, including the terminator.
const MAX_LABEL_LEN: usize = 128;

/// An anchored loudness measurement.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AnchorElement {
    Dialogue,
    Album,
}

/// Loudness information measured for one rendering layout. All levels are Q7.8 fixed point.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Loudness {
    pub integrated: i16,
    pub digital_peak: i16,
    pub true_peak: Option<i16>,
    pub anchored: Vec<(AnchorElement, i16)>,
}

/// The rendering target of a submix layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LayoutKind {
    /// A loudspeaker sound system, by its on-wire index.
    Loudspeakers(u8),
    Binaural,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubmixLayout {
    pub kind: LayoutKind,
    pub loudness: Loudness,
}

/// An audio element rendered by a submix.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmixElement {
    pub audio_element_id: u32,
    /// One annotation per mix presentation language label.
    pub annotations: Vec<String>,
    pub headphones_rendering_mode: u8,
    pub mix_gain: ParamDefinition,
    /// Default mix gain in Q7.8 fixed point, applied while no parameter block is active.
    pub default_mix_gain: i16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Submix {
    pub elements: Vec<SubmixElement>,
    pub output_mix_gain: ParamDefinition,
    pub default_mix_gain: i16,
    pub layouts: Vec<SubmixLayout>,
}

/// A mix presentation descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct MixPresentation {
    pub id: u32,
    pub language_labels: Vec<String>,
    /// One localized name per language label.
    pub annotations: Vec<String>,
    pub submixes: Vec<Submix>,
}

/// Reads a null-terminated label.
fn read_label(reader: &mut BufReader<'_>) -> Result<String> {
    let mut buf = Vec::new();

    loop {
        match reader.read_byte()? {
            0 => break,
            byte => buf.push(byte),
        }

        if buf.len() >= MAX_LABEL_LEN {
            return decode_error("iamf: label too long");
        }
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn write_label(label: &str, buf: &mut Vec<u8>) {
    buf.extend_from_slice(label.as_bytes());
    buf.push(0);
}

/// Reads a mix presentation OBU payload. Mix gain parameter definitions it carries are
/// registered as a side effect.
pub fn read_mix_presentation(
    reader: &mut BufReader<'_>,
    set: &mut DescriptorSet,
) -> Result<MixPresentation> {
    let id = read_leb128(reader)?;

    if set.mix_presentation(id).is_some() {
        return decode_error("iamf: duplicate mix presentation id");
    }

    let count_label = read_leb128(reader)?;

    let mut language_labels = Vec::new();
    for _ in 0..count_label {
        language_labels.push(read_label(reader)?);
    }

    let mut annotations = Vec::new();
    for _ in 0..count_label {
        annotations.push(read_label(reader)?);
    }

    let mut mix = MixPresentation { id, language_labels, annotations, submixes: Vec::new() };

    let num_submixes = read_leb128(reader)?;

    for _ in 0..num_submixes {
        let num_elements = read_leb128(reader)?;

        let mut elements = Vec::new();

        for _ in 0..num_elements {
            let audio_element_id = read_leb128(reader)?;

            if set.audio_element(audio_element_id).is_none() {
                return decode_error("iamf: submix references a missing audio element");
            }

            let mut annotations = Vec::new();
            for _ in 0..count_label {
                annotations.push(read_label(reader)?);
            }

            let headphones_rendering_mode = reader.read_byte()? >> 6;

            let rendering_config_size = read_leb128(reader)?;
            reader.ignore_bytes(u64::from(rendering_config_size))?;

            let mix_gain = read_param_definition(reader, ParamType::MixGain, None)?;
            set.register_param_definition(mix_gain.clone())?;

            let default_mix_gain = reader.read_be_u16()? as i16;

            elements.push(SubmixElement {
                audio_element_id,
                annotations,
                headphones_rendering_mode,
                mix_gain,
                default_mix_gain,
            });
        }

        let output_mix_gain = read_param_definition(reader, ParamType::MixGain, None)?;
        set.register_param_definition(output_mix_gain.clone())?;

        let default_mix_gain = reader.read_be_u16()? as i16;

        let num_layouts = read_leb128(reader)?;

        let mut layouts = Vec::new();

        for _ in 0..num_layouts {
            let byte = reader.read_byte()?;

            let kind = match byte >> 6 {
                1 => {
                    let sound_system = byte >> 2 & 0xf;
                    if sound_system >= NUM_SOUND_SYSTEMS {
                        return decode_error("iamf: invalid sound system");
                    }
                    LayoutKind::Loudspeakers(sound_system)
                }
                2 => LayoutKind::Binaural,
                _ => return decode_error("iamf: invalid layout type"),
            };

            let info_type = reader.read_byte()?;

            let mut loudness = Loudness {
                integrated: reader.read_be_u16()? as i16,
                digital_peak: reader.read_be_u16()? as i16,
                true_peak: None,
                anchored: Vec::new(),
            };

            if info_type & 1 != 0 {
                loudness.true_peak = Some(reader.read_be_u16()? as i16);
            }

            if info_type & 2 != 0 {
                let num_anchors = reader.read_byte()?;

                for _ in 0..num_anchors {
                    let anchor = reader.read_byte()?;
                    let level = reader.read_be_u16()? as i16;

                    match anchor {
                        1 => loudness.anchored.push((AnchorElement::Dialogue, level)),
                        2 => loudness.anchored.push((AnchorElement::Album, level)),
                        _ => debug!("ignoring unknown loudness anchor {}", anchor),
                    }
                }
            }

            if info_type & 0xfc != 0 {
                let size = read_leb128(reader)?;
                reader.ignore_bytes(u64::from(size))?;
            }

            layouts.push(SubmixLayout { kind, loudness });
        }

        mix.submixes.push(Submix { elements, output_mix_gain, default_mix_gain, layouts });
    }

    Ok(mix)
}

/// Serializes a mix presentation descriptor into an OBU payload.
pub fn write_mix_presentation(
    mix: &MixPresentation,
    set: &DescriptorSet,
    buf: &mut Vec<u8>,
) -> Result<()> {
    if mix.annotations.len() != mix.language_labels.len() {
        return decode_error("iamf: mismatched annotation count");
    }

    write_leb128(buf, mix.id);
    write_leb128(buf, mix.language_labels.len() as u32);

    for label in &mix.language_labels {
        write_label(label, buf);
    }

    for annotation in &mix.annotations {
        write_label(annotation, buf);
    }

    write_leb128(buf, mix.submixes.len() as u32);

    for submix in &mix.submixes {
        write_leb128(buf, submix.elements.len() as u32);

        for element in &submix.elements {
            if set.audio_element(element.audio_element_id).is_none() {
                return decode_error("iamf: submix references a missing audio element");
            }

            if element.annotations.len() != mix.language_labels.len() {
                return decode_error("iamf: mismatched annotation count");
            }

            write_leb128(buf, element.audio_element_id);

            for annotation in &element.annotations {
                write_label(annotation, buf);
            }

            buf.push(element.headphones_rendering_mode << 6);
            write_leb128(buf, 0); // rendering config extension

            write_param_definition(&element.mix_gain, buf);
            buf.extend_from_slice(&(element.default_mix_gain as u16).to_be_bytes());
        }

        write_param_definition(&submix.output_mix_gain, buf);
        buf.extend_from_slice(&(submix.default_mix_gain as u16).to_be_bytes());

        write_leb128(buf, submix.layouts.len() as u32);

        for layout in &submix.layouts {
            match layout.kind {
                LayoutKind::Loudspeakers(sound_system) => {
                    if sound_system >= NUM_SOUND_SYSTEMS {
                        return decode_error("iamf: invalid sound system");
                    }
                    buf.push(1 << 6 | sound_system << 2);
                }
                LayoutKind::Binaural => buf.push(2 << 6),
            }

            let loudness = &layout.loudness;

            let mut info_type = 0u8;
            info_type |= u8::from(loudness.true_peak.is_some());
            info_type |= u8::from(!loudness.anchored.is_empty()) << 1;

            buf.push(info_type);
            buf.extend_from_slice(&(loudness.integrated as u16).to_be_bytes());
            buf.extend_from_slice(&(loudness.digital_peak as u16).to_be_bytes());

            if let Some(true_peak) = loudness.true_peak {
                buf.extend_from_slice(&(true_peak as u16).to_be_bytes());
            }

            if !loudness.anchored.is_empty() {
                buf.push(loudness.anchored.len() as u8);

                for (anchor, level) in &loudness.anchored {
                    buf.push(match anchor {
                        AnchorElement::Dialogue => 1,
                        AnchorElement::Album => 2,
                    });
                    buf.extend_from_slice(&(*level as u16).to_be_bytes());
                }
            }
        }
    }

    Ok(())
}
