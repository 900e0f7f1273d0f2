//! Report endpoints and their display labels
//!
//! An endpoint is addressed either by a plain attribute handle or by a
//! report reference pair plus handle. Labels encode the form by shape:
//!
//! - `"00a4"`: plain handle
//! - `"01 02 00a4"`: report reference `[0x01, 0x02]`, handle `0x00A4`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::config::{MAX_REPORT_ENTRIES, MAX_REPORT_REF_BYTES};
use crate::driver::ReportCharList;
use crate::error::{CentralError, Result};

/// How the dongle resolves an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum EndpointKey {
    /// Plain attribute handle
    Handle {
        /// Attribute handle
        handle: u16,
    },
    /// Report reference pair plus the handle it was found on
    ReportRef {
        /// Report ID and report type
        report_ref: [u8; 2],
        /// Attribute handle
        handle: u16,
    },
}

impl EndpointKey {
    /// Attribute handle of either form
    pub fn handle(&self) -> u16 {
        match self {
            EndpointKey::Handle { handle } | EndpointKey::ReportRef { handle, .. } => *handle,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKey::Handle { handle } => write!(f, "{:04x}", handle),
            EndpointKey::ReportRef { report_ref, handle } => {
                write!(f, "{:02x} {:02x} {:04x}", report_ref[0], report_ref[1], handle)
            }
        }
    }
}

fn label_error(label: &str, reason: impl Into<String>) -> CentralError {
    CentralError::InvalidEndpointLabel {
        label: label.to_string(),
        reason: reason.into(),
    }
}

fn parse_hex_u8(token: &str) -> Option<u8> {
    if token.is_empty() || token.len() > 2 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(token, 16).ok()
}

fn parse_hex_u16(token: &str) -> Option<u16> {
    if token.is_empty() || token.len() > 4 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(token, 16).ok()
}

impl FromStr for EndpointKey {
    type Err = CentralError;

    fn from_str(label: &str) -> Result<Self> {
        let tokens: Vec<&str> = label.split_whitespace().collect();
        match tokens.as_slice() {
            [handle] => {
                let handle =
                    parse_hex_u16(handle).ok_or_else(|| label_error(label, "bad handle"))?;
                Ok(EndpointKey::Handle { handle })
            }
            [r0, r1, handle] => {
                let r0 = parse_hex_u8(r0).ok_or_else(|| label_error(label, "bad report id"))?;
                let r1 = parse_hex_u8(r1).ok_or_else(|| label_error(label, "bad report type"))?;
                let handle =
                    parse_hex_u16(handle).ok_or_else(|| label_error(label, "bad handle"))?;
                Ok(EndpointKey::ReportRef {
                    report_ref: [r0, r1],
                    handle,
                })
            }
            _ => Err(label_error(
                label,
                format!("expected 1 or 3 tokens, got {}", tokens.len()),
            )),
        }
    }
}

/// Parse a space-separated hex byte string such as `"01 a0 ff"`
pub fn parse_hex_payload(input: &str) -> Result<Vec<u8>> {
    let bytes = input
        .split_whitespace()
        .map(|token| {
            parse_hex_u8(token).ok_or_else(|| CentralError::InvalidHexPayload {
                token: token.to_string(),
            })
        })
        .collect::<Result<Vec<u8>>>()?;

    if bytes.is_empty() {
        return Err(CentralError::InvalidHexPayload {
            token: String::new(),
        });
    }
    Ok(bytes)
}

/// Format bytes as space-separated lower-case hex
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A characteristic usable for data I/O
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEndpoint {
    /// Resolution key
    pub key: EndpointKey,
    /// Display label
    pub label: String,
}

impl From<EndpointKey> for ReportEndpoint {
    fn from(key: EndpointKey) -> Self {
        Self {
            label: key.to_string(),
            key,
        }
    }
}

/// Ordered endpoint list of the current session with its selection
///
/// Entries are stored in report-reference form. A plain handle label
/// resolves to the entry enabled on that handle and is addressed by handle.
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    endpoints: Vec<ReportEndpoint>,
    selected: Option<ReportEndpoint>,
}

impl EndpointTable {
    /// Build the table from the dongle's report list
    ///
    /// The list is clamped to [`MAX_REPORT_ENTRIES`] handles and
    /// [`MAX_REPORT_REF_BYTES`] reference bytes. Returns the table and the
    /// number of entries dropped. The first endpoint is selected.
    pub fn from_report_list(list: &ReportCharList) -> (Self, usize) {
        let usable = list
            .count
            .min(list.handles.len())
            .min(list.refs.len() / 2);
        let kept = usable
            .min(MAX_REPORT_ENTRIES)
            .min(MAX_REPORT_REF_BYTES / 2);
        let dropped = list.count.saturating_sub(kept);
        if dropped > 0 {
            warn!(
                reported = list.count,
                kept, "Report characteristic list truncated"
            );
        }

        let endpoints: Vec<ReportEndpoint> = (0..kept)
            .map(|i| {
                ReportEndpoint::from(EndpointKey::ReportRef {
                    report_ref: [list.refs[2 * i], list.refs[2 * i + 1]],
                    handle: list.handles[i],
                })
            })
            .collect();
        let selected = endpoints.first().cloned();

        (
            Self {
                endpoints,
                selected,
            },
            dropped,
        )
    }

    /// All endpoints in dongle order
    pub fn endpoints(&self) -> &[ReportEndpoint] {
        &self.endpoints
    }

    /// Number of endpoints
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Currently selected endpoint
    pub fn selected(&self) -> Option<&ReportEndpoint> {
        self.selected.as_ref()
    }

    /// Resolve a label against the enabled endpoints
    ///
    /// A three-token label must name an entry exactly. A one-token label
    /// matches the entry on that handle and keeps the plain-handle form.
    pub fn find(&self, label: &str) -> Result<ReportEndpoint> {
        let key: EndpointKey = label.parse()?;
        let found = match key {
            EndpointKey::ReportRef { .. } => self.endpoints.iter().any(|e| e.key == key),
            EndpointKey::Handle { handle } => {
                self.endpoints.iter().any(|e| e.key.handle() == handle)
            }
        };
        if found {
            Ok(ReportEndpoint::from(key))
        } else {
            Err(CentralError::UnknownEndpoint(label.to_string()))
        }
    }

    /// Select the endpoint matching `label`
    pub fn select(&mut self, label: &str) -> Result<&ReportEndpoint> {
        let endpoint = self.find(label)?;
        let selected: &ReportEndpoint = self.selected.insert(endpoint);
        Ok(selected)
    }

    /// Drop every endpoint
    pub fn clear(&mut self) {
        self.endpoints.clear();
        self.selected = None;
    }
}
