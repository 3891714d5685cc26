// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process configuration loaded from the environment.
//!
//! All knobs are environment variables with the `MUL_IN_ONE_` prefix kept
//! from the service's deployment surface; `DATABASE_URL` is the only
//! required one.  An optional `.env` file in the working directory is
//! loaded first (existing process variables win).

mod settings;

pub use settings::{RuntimeMode, SessionRepoKind, Settings};
