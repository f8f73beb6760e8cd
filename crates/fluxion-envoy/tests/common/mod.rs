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

//! Shared helpers for the Envoy integration tests

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use fluxion_envoy::{EnvoyConfig, EnvoyReader, MemoryTokenStore};
use std::sync::Arc;

/// Unsigned JWT carrying the claims the reader inspects.
pub fn token(user: &str, valid_for_secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + valid_for_secs;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::json!({"enphaseUser": user, "exp": exp})
            .to_string()
            .as_bytes(),
    );
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

/// Reader talking to a mock Envoy with a stored, valid owner token.
pub fn owner_reader(base_url: &str) -> EnvoyReader {
    let mut config = EnvoyConfig::new("envoy.test");
    config.base_url = Some(base_url.to_string());
    let store = Arc::new(MemoryTokenStore::with_token(token("owner", 3600)));
    EnvoyReader::new(config, store).unwrap()
}
