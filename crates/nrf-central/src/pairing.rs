//! Pairing parameter assembly and authentication sequencing
//!
//! The dongle implements the security manager itself. This module only
//! assembles the parameters it needs and issues the calls in order: one
//! `auth_set_params` per key-distribution role, then `auth_start`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use tracing::{debug, info, warn};

use crate::driver::DongleDriver;
use crate::error::{CentralError, Result};

/// Number of digits in a BLE passkey
pub const PASSKEY_LEN: usize = 6;

/// A six-digit passkey
///
/// Always exactly six ASCII digits; construct through [`Passkey::sanitize`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Passkey(String);

impl Passkey {
    /// Truncate or zero-pad to six characters and replace non-digits with `0`
    pub fn sanitize(input: &str) -> Self {
        let digits: String = input
            .chars()
            .chain(std::iter::repeat('0'))
            .take(PASSKEY_LEN)
            .map(|c| if c.is_ascii_digit() { c } else { '0' })
            .collect();
        Self(digits)
    }

    /// Passkey digits
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Passkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Passkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Passkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Passkey::sanitize(&raw))
    }
}

/// I/O capability class advertised during pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum IoCapabilities {
    /// Display only
    DisplayOnly = 0,
    /// Display with yes/no confirmation
    DisplayYesNo = 1,
    /// Keyboard only
    #[default]
    KeyboardOnly = 2,
    /// No input and no output
    NoInputNoOutput = 3,
    /// Keyboard and display
    KeyboardDisplay = 4,
}

impl IoCapabilities {
    /// Convert a raw capability value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(IoCapabilities::DisplayOnly),
            1 => Some(IoCapabilities::DisplayYesNo),
            2 => Some(IoCapabilities::KeyboardOnly),
            3 => Some(IoCapabilities::NoInputNoOutput),
            4 => Some(IoCapabilities::KeyboardDisplay),
            _ => None,
        }
    }
}

/// Which side of the link a key distribution applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyRole {
    /// Keys this central distributes
    Own,
    /// Keys the peripheral distributes
    Peer,
}

/// Key distribution flags for one role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDistribution {
    /// Long term key and master identification
    #[serde(default = "default_true")]
    pub enc: bool,
    /// Identity resolving key and identity address
    #[serde(default)]
    pub id: bool,
    /// Connection signature resolving key
    #[serde(default)]
    pub sign: bool,
    /// Derive the link key from the LTK
    #[serde(default)]
    pub link: bool,
}

fn default_true() -> bool {
    true
}

impl Default for KeyDistribution {
    fn default() -> Self {
        Self {
            enc: true,
            id: false,
            sign: false,
            link: false,
        }
    }
}

/// Arguments of one `auth_set_params` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityParams {
    /// LE secure connections
    pub lesc: bool,
    /// Out-of-band data available
    pub oob: bool,
    /// Man-in-the-middle protection
    pub mitm: bool,
    /// Role the distribution flags apply to
    pub role: KeyRole,
    /// Distribution flags for `role`
    pub distribution: KeyDistribution,
}

/// Security parameters negotiated for each connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Create a bond
    #[serde(default = "default_true")]
    pub bond: bool,
    /// Man-in-the-middle protection
    #[serde(default)]
    pub mitm: bool,
    /// LE secure connections
    #[serde(default)]
    pub lesc: bool,
    /// Keypress notifications
    #[serde(default)]
    pub keypress: bool,
    /// Out-of-band data available
    #[serde(default)]
    pub oob: bool,
    /// Local I/O capability class
    #[serde(default)]
    pub io_caps: IoCapabilities,
    /// Keys this central distributes
    #[serde(default)]
    pub own_keys: KeyDistribution,
    /// Keys the peripheral distributes
    #[serde(default)]
    pub peer_keys: KeyDistribution,
    /// Fixed passkey, if the peripheral expects one
    #[serde(default)]
    pub passkey: Option<Passkey>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bond: true,
            mitm: false,
            lesc: false,
            keypress: false,
            oob: false,
            io_caps: IoCapabilities::KeyboardOnly,
            own_keys: KeyDistribution::default(),
            peer_keys: KeyDistribution::default(),
            passkey: None,
        }
    }
}

impl AuthConfig {
    /// Parameters for the `auth_set_params` call of one role
    pub fn security_params(&self, role: KeyRole) -> SecurityParams {
        SecurityParams {
            lesc: self.lesc,
            oob: self.oob,
            mitm: self.mitm,
            role,
            distribution: match role {
                KeyRole::Own => self.own_keys,
                KeyRole::Peer => self.peer_keys,
            },
        }
    }
}

/// Result of an `on_authenticated` callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Link is encrypted and authenticated
    Authenticated,
    /// Pairing failed with the given status
    Failed(u8),
}

/// Drives the authentication stage of a session
#[derive(Debug)]
pub struct PairingCoordinator {
    config: AuthConfig,
    in_progress: bool,
    last_passkey: Option<String>,
}

impl PairingCoordinator {
    /// Create a coordinator for the given parameters
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            in_progress: false,
            last_passkey: None,
        }
    }

    /// Configured parameters
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Whether `auth_start` has been issued and no outcome has arrived yet
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Passkey most recently surfaced by the dongle
    pub fn last_passkey(&self) -> Option<&str> {
        self.last_passkey.as_deref()
    }

    /// Negotiate parameters for both roles, then start authentication
    pub async fn begin<D: DongleDriver + ?Sized>(&mut self, driver: &D) -> Result<()> {
        for role in [KeyRole::Own, KeyRole::Peer] {
            let params = self.config.security_params(role);
            debug!(?role, ?params, "Setting security parameters");
            driver
                .auth_set_params(&params)
                .await
                .map_err(|code| CentralError::Driver {
                    stage: "auth_set_params",
                    code,
                })?;
        }

        driver
            .auth_start(
                self.config.bond,
                self.config.keypress,
                self.config.io_caps,
                self.config.passkey.as_ref(),
            )
            .await
            .map_err(|code| CentralError::Driver {
                stage: "auth_start",
                code,
            })?;

        self.in_progress = true;
        info!(
            bond = self.config.bond,
            io_caps = ?self.config.io_caps,
            "Authentication started"
        );
        Ok(())
    }

    /// Record a passkey the dongle wants shown to the user
    pub fn on_passkey_required(&mut self, passkey: &str) {
        self.last_passkey = Some(passkey.to_string());
    }

    /// Interpret the dongle's authentication status
    pub fn on_authenticated(&mut self, status: u8) -> AuthOutcome {
        self.in_progress = false;
        if status == 0 {
            AuthOutcome::Authenticated
        } else {
            warn!(status, "Authentication failed");
            AuthOutcome::Failed(status)
        }
    }

    /// Forget per-connection state
    pub fn reset(&mut self) {
        self.in_progress = false;
        self.last_passkey = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverCode;
    use crate::test_utils::{DriverCall, MockDongle};

    #[test]
    fn test_passkey_pads_short_input() {
        assert_eq!(Passkey::sanitize("12").as_str(), "120000");
        assert_eq!(Passkey::sanitize("").as_str(), "000000");
    }

    #[test]
    fn test_passkey_replaces_non_digits() {
        assert_eq!(Passkey::sanitize("12a45b").as_str(), "120450");
    }

    #[test]
    fn test_passkey_truncates_long_input() {
        assert_eq!(Passkey::sanitize("6543219").as_str(), "654321");
    }

    #[test]
    fn test_passkey_deserializes_sanitized() {
        let passkey: Passkey = serde_json::from_str("\"9x\"").unwrap();
        assert_eq!(passkey.as_str(), "900000");
    }

    #[test]
    fn test_io_caps_from_u8() {
        assert_eq!(IoCapabilities::from_u8(2), Some(IoCapabilities::KeyboardOnly));
        assert_eq!(IoCapabilities::KeyboardOnly as u8, 2);
        assert_eq!(IoCapabilities::from_u8(5), None);
    }

    #[test]
    fn test_security_params_per_role() {
        let mut config = AuthConfig::default();
        config.peer_keys.id = true;

        let own = config.security_params(KeyRole::Own);
        let peer = config.security_params(KeyRole::Peer);
        assert_eq!(own.role, KeyRole::Own);
        assert!(!own.distribution.id);
        assert_eq!(peer.role, KeyRole::Peer);
        assert!(peer.distribution.id);
    }

    #[tokio::test]
    async fn test_begin_issues_both_roles_then_start() {
        let driver = MockDongle::new();
        let mut config = AuthConfig::default();
        config.passkey = Some(Passkey::sanitize("654321"));
        let mut pairing = PairingCoordinator::new(config);

        pairing.begin(&driver).await.unwrap();

        let calls = driver.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(&calls[0], DriverCall::AuthSetParams(p) if p.role == KeyRole::Own));
        assert!(matches!(&calls[1], DriverCall::AuthSetParams(p) if p.role == KeyRole::Peer));
        assert_eq!(
            calls[2],
            DriverCall::AuthStart {
                bond: true,
                keypress: false,
                io_caps: IoCapabilities::KeyboardOnly,
                passkey: Some("654321".to_string()),
            }
        );
        assert!(pairing.in_progress());
    }

    #[tokio::test]
    async fn test_begin_stops_at_first_failure() {
        let driver = MockDongle::new();
        driver.fail_next("auth_set_params", DriverCode::new(8));
        let mut pairing = PairingCoordinator::new(AuthConfig::default());

        let err = pairing.begin(&driver).await.unwrap_err();
        assert_eq!(err.driver_code(), Some(DriverCode::new(8)));
        assert_eq!(driver.calls().len(), 1);
        assert!(!pairing.in_progress());
    }

    #[test]
    fn test_authenticated_outcome() {
        let mut pairing = PairingCoordinator::new(AuthConfig::default());
        assert_eq!(pairing.on_authenticated(0), AuthOutcome::Authenticated);
        assert_eq!(pairing.on_authenticated(0x85), AuthOutcome::Failed(0x85));
    }
}
