// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]
// The following lints are allowed in all Symphonia crates. Please see clippy.toml for their
// justification.
#![allow(clippy::comparison_chain)]
#![allow(clippy::excessive_precision)]
#![allow(clippy::identity_op)]
#![allow(clippy::manual_range_contains)]

//! A demuxer and muxer for standalone Immersive Audio Model and Formats (IAMF) bitstreams.
//!
//! An IAMF stream is a sequence of Open Bitstream Units (OBUs). A descriptor phase at the start
//! of the stream declares codec configurations, audio elements, mix presentations, and parameter
//! definitions. The frame phase that follows carries coded audio frames, parameter blocks, and
//! temporal delimiters.
//!
//! [`IamfReader`] parses the descriptors and demuxes the frame phase, exposing every coded
//! substream as a track. [`IamfMuxer`] builds a descriptor set from codec parameters and writes
//! a standalone bitstream.

pub mod codecs;
pub mod descriptors;
pub mod element;
pub mod layout;
pub mod mix;
pub mod obu;
pub mod param;

mod demuxer;
mod muxer;

pub use demuxer::{IamfReader, PacketParameters};
pub use descriptors::DescriptorSet;
pub use muxer::IamfMuxer;
