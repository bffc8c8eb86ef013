//! Invite codes and driver-device links.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of an invite code.
pub const INVITE_CODE_LEN: usize = 6;

/// Invite code symbols. `0`, `O`, `1`, `I` and `L` are left out so codes
/// survive being read aloud or copied from a screen.
pub const INVITE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Why an invite code was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InviteError {
    NotFound,
    AlreadyUsed,
    Expired,
    MalformedLength,
    InvalidCharacter,
}

impl InviteError {
    pub fn as_str(&self) -> &'static str {
        match self {
            InviteError::NotFound => "NOT_FOUND",
            InviteError::AlreadyUsed => "ALREADY_USED",
            InviteError::Expired => "EXPIRED",
            InviteError::MalformedLength => "MALFORMED_LENGTH",
            InviteError::InvalidCharacter => "INVALID_CHARACTER",
        }
    }
}

impl std::fmt::Display for InviteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            InviteError::NotFound => "Invite code not found",
            InviteError::AlreadyUsed => "Invite code has already been used",
            InviteError::Expired => "Invite code has expired",
            InviteError::MalformedLength => "Invite code must be 6 characters",
            InviteError::InvalidCharacter => "Invite code contains an invalid character",
        };
        f.write_str(message)
    }
}

/// Trim and upper-case a code typed by a driver, then check its shape.
pub fn normalize_code(raw: &str) -> Result<String, InviteError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.chars().count() != INVITE_CODE_LEN {
        return Err(InviteError::MalformedLength);
    }
    if !code.bytes().all(|b| INVITE_ALPHABET.contains(&b)) {
        return Err(InviteError::InvalidCharacter);
    }
    Ok(code)
}

/// A short-lived, single-use code letting a driver device join a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InviteCode {
    pub code: String,
    pub owner_id: String,
    #[serde(rename = "firestoreDriverId")]
    pub target_driver_cloud_id: String,
    pub driver_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub used: bool,
    #[serde(default)]
    pub used_by: Option<String>,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
}

impl InviteCode {
    /// Read-only check of whether the code may still be consumed at `now`.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), InviteError> {
        if self.used {
            return Err(InviteError::AlreadyUsed);
        }
        if now > self.expires_at {
            return Err(InviteError::Expired);
        }
        Ok(())
    }
}

/// Result of a successful read-only validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InviteValidation {
    pub code: String,
    pub owner_id: String,
    pub driver_cloud_id: String,
    pub driver_name: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&InviteCode> for InviteValidation {
    fn from(invite: &InviteCode) -> Self {
        Self {
            code: invite.code.clone(),
            owner_id: invite.owner_id.clone(),
            driver_cloud_id: invite.target_driver_cloud_id.clone(),
            driver_name: invite.driver_name.clone(),
            expires_at: invite.expires_at,
        }
    }
}

/// Authorises a driver device for a tenant in the cloud access rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverLink {
    #[serde(skip)]
    pub device_id: String,
    pub linked_owner_id: String,
    #[serde(rename = "firestoreDriverId")]
    pub driver_cloud_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn invite(now: DateTime<Utc>) -> InviteCode {
        InviteCode {
            code: "A7X9K2".into(),
            owner_id: "owner-1".into(),
            target_driver_cloud_id: "drv-1".into(),
            driver_name: "Raj".into(),
            created_at: now,
            expires_at: now + Duration::minutes(30),
            used: false,
            used_by: None,
            used_at: None,
        }
    }

    #[test]
    fn test_alphabet_excludes_ambiguous_glyphs() {
        for glyph in b"0O1IL" {
            assert!(!INVITE_ALPHABET.contains(glyph));
        }
        let mut sorted = INVITE_ALPHABET.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), INVITE_ALPHABET.len());
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(" a7x9k2 ").unwrap(), "A7X9K2");
        assert_eq!(normalize_code("A7X9K"), Err(InviteError::MalformedLength));
        assert_eq!(normalize_code("A7X9K22"), Err(InviteError::MalformedLength));
        assert_eq!(normalize_code("A7X9K0"), Err(InviteError::InvalidCharacter));
    }

    #[test]
    fn test_expiry_boundary() {
        let t0 = Utc::now();
        let code = invite(t0);
        assert!(code.check(code.expires_at - Duration::seconds(1)).is_ok());
        assert!(code.check(code.expires_at).is_ok());
        assert_eq!(
            code.check(code.expires_at + Duration::seconds(1)),
            Err(InviteError::Expired)
        );
    }

    #[test]
    fn test_used_wins_over_expired() {
        let t0 = Utc::now();
        let mut code = invite(t0);
        code.used = true;
        assert_eq!(
            code.check(t0 + Duration::hours(2)),
            Err(InviteError::AlreadyUsed)
        );
    }

    #[test]
    fn test_invite_document_shape() {
        let doc = serde_json::to_value(invite(Utc::now())).unwrap();
        assert_eq!(doc["firestoreDriverId"], "drv-1");
        assert_eq!(doc["driverName"], "Raj");
        assert_eq!(doc["used"], false);
        assert!(doc.get("expiresAt").is_some());
    }
}
