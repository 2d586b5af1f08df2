// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

// WG Tunnel Manager - Authentication Module
// Shared-secret token checked on every API request

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};
use uuid::Uuid;
use wg_tunnel_common::AUTH_HEADER;
use zeroize::Zeroizing;

use crate::permissions;

/// The daemon's API token. Cloning shares the same zeroized buffer.
#[derive(Clone)]
pub struct ApiToken {
    secret: Arc<Zeroizing<String>>,
}

impl ApiToken {
    pub fn new(secret: String) -> Self {
        Self {
            secret: Arc::new(Zeroizing::new(secret)),
        }
    }

    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Load the token at `path`, creating one if the file is missing or empty.
    /// Returns the token and whether it was newly created.
    pub fn load_or_create(path: &Path) -> Result<(Self, bool)> {
        if path.exists() {
            let contents = Zeroizing::new(
                fs::read_to_string(path).context("Failed to read authentication token file")?,
            );
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                info!("Loaded authentication token from: {}", path.display());
                return Ok((Self::new(trimmed.to_string()), false));
            }
            warn!("Token file exists but is empty, regenerating");
        }

        let token = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create token directory")?;
        }
        fs::write(path, token.expose()).context("Failed to write token file")?;
        permissions::set_file_permissions_private(path)?;

        info!(
            "Generated new authentication token {} (full token in {})",
            token.obfuscated(),
            path.display()
        );
        info!("Clients must send it in the {} header", AUTH_HEADER);
        Ok((token, true))
    }

    pub fn expose(&self) -> &str {
        self.secret.as_str()
    }

    /// Mask all but the last four characters for logging
    pub fn obfuscated(&self) -> String {
        let token = self.expose();
        let visible = if token.len() < 4 { 0 } else { 4 };
        let split = token.len() - visible;
        format!("{}{}", "*".repeat(split), &token[split..])
    }

    /// Compare without short-circuiting on the first mismatching byte
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = self.expose().as_bytes();
        let candidate = candidate.as_bytes();
        if expected.len() != candidate.len() {
            return false;
        }
        expected
            .iter()
            .zip(candidate)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Reject requests that lack a valid token header.
pub async fn require_token(
    State(token): State<ApiToken>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|h| h.to_str().ok());

    match provided {
        Some(value) if token.matches(value) => {
            tracing::trace!("Authentication successful");
            Ok(next.run(request).await)
        }
        Some(_) => {
            warn!("Authentication failed: invalid token");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Authentication failed: missing token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_obfuscated() {
        let token = ApiToken::new("abc123de-f456-7890-1234-567890abcdef".to_string());
        assert_eq!(token.obfuscated(), "********************************cdef");
        assert_eq!(ApiToken::new("1234".to_string()).obfuscated(), "1234");
        assert_eq!(ApiToken::new("abc".to_string()).obfuscated(), "***");
    }

    #[test]
    fn test_matches() {
        let token = ApiToken::new("secret-token".to_string());
        assert!(token.matches("secret-token"));
        assert!(!token.matches("secret-tokem"));
        assert!(!token.matches("secret"));
        assert!(!token.matches(""));
    }

    #[test]
    fn test_generated_token_is_uuid() {
        assert!(Uuid::parse_str(ApiToken::generate().expose()).is_ok());
    }

    #[test]
    fn test_load_or_create_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.token");

        let (token, created) = ApiToken::load_or_create(&path).unwrap();
        assert!(created);
        let (again, created_again) = ApiToken::load_or_create(&path).unwrap();
        assert!(!created_again);
        assert_eq!(token.expose(), again.expose());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_empty_token_file_is_regenerated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.token");
        fs::write(&path, "  \n").unwrap();

        let (token, created) = ApiToken::load_or_create(&path).unwrap();
        assert!(created);
        assert!(!token.expose().is_empty());
    }
}
