// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024-2025 Jarkko Sakkinen
// Copyright (c) 2025 Opinsys Oy

pub mod activate;
pub mod caps;
pub mod create;
pub mod create_primary;
pub mod evict;
pub mod flush;
pub mod make_cred;
pub mod nv_read;
pub mod read_public;
