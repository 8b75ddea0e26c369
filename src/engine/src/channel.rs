use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::{Direction, IndexType};

/// Characters that may never appear in a mnemonic or a log identifier.
pub const BAD_IDENTIFIER_CHARS: &[char] = &['\'', '"', '<', '>', '/', '\\', '&'];

/// Longest mnemonic accepted, in bytes.
pub const MAX_MNEMONIC_LENGTH: usize = 256;

/// Most channels a log may carry, its index channel included.
pub const MAX_CHANNELS: usize = 4096;

/// LogId names a log through its parent well and wellbore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub well: String,
    pub wellbore: String,
    pub uid: String,
}

impl LogId {
    pub fn new(
        well: impl Into<String>,
        wellbore: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            well: well.into(),
            wellbore: wellbore.into(),
            uid: uid.into(),
        }
    }

    /// parse reads the `well/wellbore/uid` form produced by Display.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '/');
        let well = parts.next()?;
        let wellbore = parts.next()?;
        let uid = parts.next()?;
        Some(Self::new(well, wellbore, uid))
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("well uid", &self.well),
            ("wellbore uid", &self.wellbore),
            ("log uid", &self.uid),
        ] {
            if value.trim().is_empty() {
                return Err(Error::RequiredFieldEmpty(field.to_string()));
            }
            if value.contains(BAD_IDENTIFIER_CHARS) {
                return Err(Error::BadColumnIdentifier(value.clone()));
            }
        }
        Ok(())
    }
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.well, self.wellbore, self.uid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Double,
    Long,
    String,
}

/// ChannelValue is one non-null cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValue {
    Double(f64),
    Long(i64),
    Text(String),
}

impl ChannelValue {
    /// parse reads a cell token. A token equal to the null indicator, or an
    /// empty token, is null.
    pub fn parse(
        token: &str,
        data_type: DataType,
        null_value: &str,
        channel: &str,
    ) -> Result<Option<Self>> {
        let trimmed = token.trim();
        if trimmed.is_empty() || trimmed == null_value {
            return Ok(None);
        }

        let invalid = || Error::InvalidChannelValue {
            channel: channel.to_string(),
            value: token.to_string(),
        };

        let v = match data_type {
            DataType::Double => {
                let v: f64 = trimmed.parse().map_err(|_| invalid())?;
                if !v.is_finite() {
                    return Err(invalid());
                }
                Self::Double(v)
            }
            DataType::Long => Self::Long(trimmed.parse().map_err(|_| invalid())?),
            DataType::String => Self::Text(trimmed.to_string()),
        };
        Ok(Some(v))
    }
}

impl Display for ChannelValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Double(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", v),
        }
    }
}

/// ChannelDefinition describes a channel as supplied by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDefinition {
    pub mnemonic: String,
    pub unit: String,
    pub data_type: DataType,
    #[serde(default)]
    pub description: Option<String>,
}

impl ChannelDefinition {
    pub fn new(mnemonic: impl Into<String>, unit: impl Into<String>, data_type: DataType) -> Self {
        Self {
            mnemonic: mnemonic.into(),
            unit: unit.into(),
            data_type,
            description: None,
        }
    }
}

/// LogHeader is everything needed to create a log. The first channel is the
/// index channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogHeader {
    pub id: LogId,
    pub name: String,
    pub index_type: IndexType,
    pub direction: Direction,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub null_value: String,
    pub channels: Vec<ChannelDefinition>,
}

fn default_delimiter() -> char {
    ','
}

impl LogHeader {
    pub fn new(id: LogId, index_type: IndexType, direction: Direction) -> Self {
        Self {
            name: id.uid.clone(),
            id,
            index_type,
            direction,
            delimiter: default_delimiter(),
            null_value: String::new(),
            channels: Vec::new(),
        }
    }

    pub fn with_channel(mut self, channel: ChannelDefinition) -> Self {
        self.channels.push(channel);
        self
    }
}

/// validate_mnemonic rejects empty or over-long mnemonics and mnemonics
/// carrying reserved characters, the delimiter included.
pub fn validate_mnemonic(mnemonic: &str, delimiter: char) -> Result<()> {
    if mnemonic.trim().is_empty() {
        return Err(Error::RequiredFieldEmpty("channel mnemonic".to_string()));
    }
    if mnemonic.len() > MAX_MNEMONIC_LENGTH {
        let head: String = mnemonic.chars().take(16).collect();
        return Err(Error::BadColumnIdentifier(format!(
            "{}... ({} bytes, limit {})",
            head,
            mnemonic.len(),
            MAX_MNEMONIC_LENGTH
        )));
    }
    if mnemonic.contains(BAD_IDENTIFIER_CHARS) || mnemonic.contains(delimiter) {
        return Err(Error::BadColumnIdentifier(mnemonic.to_string()));
    }
    Ok(())
}

/// validate_channel_count rejects a log that would grow past [`MAX_CHANNELS`].
pub fn validate_channel_count(count: usize) -> Result<()> {
    if count > MAX_CHANNELS {
        return Err(Error::TooManyChannels {
            count,
            limit: MAX_CHANNELS,
        });
    }
    Ok(())
}

/// validate_delimiter rejects delimiters that collide with index or value text.
pub fn validate_delimiter(delimiter: char, null_value: &str) -> Result<()> {
    if delimiter.is_alphanumeric() || matches!(delimiter, '.' | '-' | '+' | ':' | '\n' | '\r') {
        return Err(Error::InvalidDelimiter(format!(
            "delimiter {:?} is reserved",
            delimiter
        )));
    }
    if null_value.contains(delimiter) {
        return Err(Error::InvalidDelimiter(format!(
            "null indicator {:?} contains the delimiter",
            null_value
        )));
    }
    Ok(())
}
