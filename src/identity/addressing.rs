//! Sender addressing: derive canonical phone and LID from a message key.

use crate::payload::MessageKey;
use std::fmt;

const LID_SERVER: &str = "lid";
const PHONE_SERVERS: [&str; 2] = ["s.whatsapp.net", "c.us"];
const GROUP_SERVER: &str = "g.us";
const BROADCAST_SERVER: &str = "broadcast";
const NEWSLETTER_SERVER: &str = "newsletter";

/// Which address the provider put in `remoteJid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Phone,
    Lid,
}

impl AddressingMode {
    fn parse(raw: Option<&str>) -> Option<Self> {
        match raw.map(str::trim) {
            Some(mode) if mode.eq_ignore_ascii_case("lid") => Some(Self::Lid),
            Some(mode) if mode.eq_ignore_ascii_case("pn") => Some(Self::Phone),
            _ => None,
        }
    }

    fn other(self) -> Self {
        match self {
            Self::Phone => Self::Lid,
            Self::Lid => Self::Phone,
        }
    }
}

/// Why a message has no individual sender to reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressingError {
    #[error("group chat")]
    GroupChat,
    #[error("broadcast or status chat")]
    Broadcast,
    #[error("sender has neither phone number nor LID")]
    Unaddressable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JidKind {
    Address(AddressingMode),
    Group,
    Broadcast,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Jid {
    user: String,
    kind: JidKind,
}

/// `user[:device][.agent]@server`; a bare user takes `bare_as`.
fn parse_jid(raw: &str, bare_as: AddressingMode) -> Option<Jid> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (user, server) = match trimmed.split_once('@') {
        Some((user, server)) => (user, Some(server.trim().to_ascii_lowercase())),
        None => (trimmed, None),
    };
    let user = user.split(':').next().unwrap_or_default();
    let user = user.split('.').next().unwrap_or_default();
    let digits: String = user.chars().filter(char::is_ascii_digit).collect();

    let kind = match server.as_deref() {
        None => JidKind::Address(bare_as),
        Some(LID_SERVER) => JidKind::Address(AddressingMode::Lid),
        Some(server) if PHONE_SERVERS.contains(&server) => JidKind::Address(AddressingMode::Phone),
        Some(GROUP_SERVER) => JidKind::Group,
        Some(BROADCAST_SERVER | NEWSLETTER_SERVER) => JidKind::Broadcast,
        Some(_) => JidKind::Unknown,
    };

    Some(Jid { user: digits, kind })
}

/// Canonical phone and LID of one sender, whichever was primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderAddressing {
    /// Bare phone digits.
    pub phone: Option<String>,
    /// Bare LID digits.
    pub lid: Option<String>,
}

impl SenderAddressing {
    pub fn from_key(key: &MessageKey) -> Result<Self, AddressingError> {
        let primary_mode =
            AddressingMode::parse(key.addressing_mode.as_deref()).unwrap_or(AddressingMode::Phone);

        let primary = key
            .remote_jid
            .as_deref()
            .and_then(|jid| parse_jid(jid, primary_mode));
        let alternate = key
            .remote_jid_alt
            .as_deref()
            .and_then(|jid| parse_jid(jid, primary_mode.other()));

        match primary.as_ref().map(|jid| &jid.kind) {
            Some(JidKind::Group) => return Err(AddressingError::GroupChat),
            Some(JidKind::Broadcast) => return Err(AddressingError::Broadcast),
            _ => {}
        }

        let mut phone = None;
        let mut lid = None;
        for jid in [primary.as_ref(), alternate.as_ref()].into_iter().flatten() {
            if jid.user.is_empty() {
                continue;
            }
            match jid.kind {
                JidKind::Address(AddressingMode::Phone) if phone.is_none() => {
                    phone = Some(jid.user.clone());
                }
                JidKind::Address(AddressingMode::Lid) if lid.is_none() => {
                    lid = Some(jid.user.clone());
                }
                _ => {}
            }
        }

        if phone.is_none() && lid.is_none() {
            return Err(AddressingError::Unaddressable);
        }

        Ok(Self { phone, lid })
    }

    /// Contact identifier form of the LID: `{lid}@lid`.
    pub fn identifier(&self) -> Option<String> {
        self.lid.as_ref().map(|lid| format!("{lid}@{LID_SERVER}"))
    }

    /// Contact phone form: `+digits`.
    pub fn e164_phone(&self) -> Option<String> {
        self.phone.as_ref().map(|phone| format!("+{phone}"))
    }

    /// Routing key for a new binding: the LID when known, else the phone.
    pub fn primary_source_id(&self) -> &str {
        self.lid
            .as_deref()
            .or(self.phone.as_deref())
            .unwrap_or_default()
    }
}

impl fmt::Display for SenderAddressing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "phone={} lid={}",
            self.phone.as_deref().unwrap_or("-"),
            self.lid.as_deref().unwrap_or("-")
        )
    }
}
