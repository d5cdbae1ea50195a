// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical speaker layout tables: the scalable loudspeaker layouts used by channel-based
//! audio elements, and the sound systems a mix presentation may target.

use symphonia_core::audio::Channels;

const STEREO: u32 = Channels::FRONT_LEFT.bits() | Channels::FRONT_RIGHT.bits();

const SURROUND_5_1: u32 = STEREO
    | Channels::FRONT_CENTRE.bits()
    | Channels::LFE1.bits()
    | Channels::SIDE_LEFT.bits()
    | Channels::SIDE_RIGHT.bits();

const SURROUND_5_1_2: u32 =
    SURROUND_5_1 | Channels::TOP_FRONT_LEFT.bits() | Channels::TOP_FRONT_RIGHT.bits();

const SURROUND_5_1_4: u32 =
    SURROUND_5_1_2 | Channels::TOP_REAR_LEFT.bits() | Channels::TOP_REAR_RIGHT.bits();

const SURROUND_7_1: u32 =
    SURROUND_5_1 | Channels::REAR_LEFT.bits() | Channels::REAR_RIGHT.bits();

const SURROUND_7_1_2: u32 =
    SURROUND_7_1 | Channels::TOP_FRONT_LEFT.bits() | Channels::TOP_FRONT_RIGHT.bits();

const SURROUND_7_1_4: u32 =
    SURROUND_7_1_2 | Channels::TOP_REAR_LEFT.bits() | Channels::TOP_REAR_RIGHT.bits();

const SURROUND_3_1_2: u32 = STEREO
    | Channels::FRONT_CENTRE.bits()
    | Channels::LFE1.bits()
    | Channels::TOP_FRONT_LEFT.bits()
    | Channels::TOP_FRONT_RIGHT.bits();

const SURROUND_7_2_3: u32 = SURROUND_7_1
    | Channels::LFE2.bits()
    | Channels::TOP_FRONT_LEFT.bits()
    | Channels::TOP_FRONT_RIGHT.bits()
    | Channels::TOP_REAR_CENTRE.bits();

const SURROUND_9_1_4: u32 = SURROUND_7_1_4
    | Channels::FRONT_LEFT_WIDE.bits()
    | Channels::FRONT_RIGHT_WIDE.bits();

const SURROUND_9_1_6: u32 =
    SURROUND_9_1_4 | Channels::TOP_FRONT_CENTRE.bits() | Channels::TOP_REAR_CENTRE.bits();

const SURROUND_22_2: u32 = SURROUND_9_1_6
    | Channels::FRONT_LEFT_CENTRE.bits()
    | Channels::FRONT_RIGHT_CENTRE.bits()
    | Channels::FRONT_CENTRE_HIGH.bits()
    | Channels::LFE2.bits()
    | Channels::REAR_CENTRE.bits()
    | Channels::REAR_LEFT_CENTRE.bits()
    | Channels::REAR_RIGHT_CENTRE.bits()
    | Channels::TOP_CENTRE.bits();

/// Number of loudspeaker layouts a scalable layer may name canonically. On-wire values at or
/// above this count carry a channel count but no canonical speaker positions.
pub const NUM_SCALABLE_LAYOUTS: u8 = 10;

/// Loudspeaker layouts addressable by the 4-bit `loudspeaker_layout` field of a scalable
/// channel layer. Index 9 is binaural, represented as a stereo pair.
const SCALABLE_LAYOUTS: [u32; NUM_SCALABLE_LAYOUTS as usize] = [
    Channels::FRONT_LEFT.bits(),
    STEREO,
    SURROUND_5_1,
    SURROUND_5_1_2,
    SURROUND_5_1_4,
    SURROUND_7_1,
    SURROUND_7_1_2,
    SURROUND_7_1_4,
    SURROUND_3_1_2,
    STEREO,
];

/// Number of sound systems addressable by the 4-bit `sound_system` field of a mix presentation
/// layout. On-wire values at or above this count are invalid.
pub const NUM_SOUND_SYSTEMS: u8 = 13;

/// Sound systems a loudspeaker mix presentation layout may target, indexed by the on-wire
/// `sound_system` value.
const SOUND_SYSTEMS: [u32; NUM_SOUND_SYSTEMS as usize] = [
    Channels::FRONT_LEFT.bits(),
    STEREO,
    SURROUND_5_1,
    SURROUND_5_1_2,
    SURROUND_5_1_4,
    SURROUND_7_1,
    SURROUND_7_1_2,
    SURROUND_7_1_4,
    SURROUND_7_2_3,
    SURROUND_9_1_4,
    SURROUND_9_1_6,
    SURROUND_22_2,
    SURROUND_3_1_2,
];

/// Gets the channels of a canonical scalable loudspeaker layout, or `None` if the on-wire index
/// has no canonical speaker positions assigned.
pub fn scalable_layout_channels(index: u8) -> Option<Channels> {
    SCALABLE_LAYOUTS
        .get(usize::from(index))
        .map(|&bits| Channels::from_bits_truncate(bits))
}

/// Finds the on-wire scalable layout index for a set of channels.
pub fn scalable_layout_index(channels: Channels) -> Option<u8> {
    SCALABLE_LAYOUTS.iter().position(|&bits| bits == channels.bits()).map(|i| i as u8)
}

/// Gets the channels of a sound system by its on-wire index.
pub fn sound_system_channels(index: u8) -> Option<Channels> {
    SOUND_SYSTEMS.get(usize::from(index)).map(|&bits| Channels::from_bits_truncate(bits))
}
