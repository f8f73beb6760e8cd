// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! FluxION Envoy - polling client for Enphase Envoy solar gateways
//!
//! Acquires and refreshes the Envoy access token, fetches the device endpoints
//! with per-endpoint cache lifetimes, normalizes the JSON/XML payloads into
//! named metrics through path expressions, and optionally follows the live
//! meter stream.

pub mod auth;
pub mod commands;
pub mod config;
pub mod endpoints;
pub mod errors;
pub mod fetcher;
pub mod parsers;
pub mod path;
pub mod profile;
pub mod reader;
pub mod storage;
pub mod stream;
pub mod transport;

pub use auth::{Authenticator, SessionAuthority, SessionCredentials, TokenClaims, TokenTier};
pub use commands::{DpelSettings, GridProfiles, StorageMode};
pub use config::{AuthFlow, DeviceDataSource, EnvoyConfig};
pub use endpoints::{EndpointDescriptor, EndpointRegistry, EndpointSource};
pub use errors::{EnvoyError, EnvoyResult};
pub use fetcher::EndpointFetcher;
pub use path::PathExpr;
pub use profile::{DeviceProfile, EnvoyModel, ProfileKind};
pub use reader::EnvoyReader;
pub use storage::{JsonFileTokenStore, MemoryTokenStore, TokenStore};
pub use stream::{DeltaTracker, MeterStream, RealtimeLoop, StreamFrame, StreamOutcome};
pub use transport::EnvoyTransport;
