// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod avb;
pub mod bootimage;
pub mod bsdiff;
pub mod compression;
pub mod hashtree;
pub mod padding;
pub mod payload;
