use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wellstore_utils::time::{format_unix_micros, parse_unix_micros, time_to_unix_micros};

use crate::error::{Error, Result};

/// MAX_DEPTH_SCALE is the largest number of decimal places a depth index keeps.
pub const MAX_DEPTH_SCALE: u32 = 9;

/// Keys are kept well inside i64 so chunk arithmetic never overflows.
const MAX_INDEX_KEY: i64 = i64::MAX >> 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Depth,
    Time,
}

impl Display for IndexType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Depth => write!(f, "depth"),
            Self::Time => write!(f, "time"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Increasing,
    Decreasing,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Increasing => write!(f, "increasing"),
            Self::Decreasing => write!(f, "decreasing"),
        }
    }
}

impl Direction {
    /// beyond returns true if key `a` lies strictly past key `b` in travel order.
    pub fn beyond(&self, a: i64, b: i64) -> bool {
        match self {
            Self::Increasing => a > b,
            Self::Decreasing => a < b,
        }
    }

    /// orient turns an ascending (min, max) pair into (start, end).
    pub fn orient<T>(&self, min: T, max: T) -> (T, T) {
        match self {
            Self::Increasing => (min, max),
            Self::Decreasing => (max, min),
        }
    }

    /// bounds turns an optional (start, end) pair given in travel order into an
    /// ascending inclusive (min, max) pair; a missing bound is open.
    pub fn bounds(&self, start: Option<i64>, end: Option<i64>) -> (i64, i64) {
        let (lo, hi) = match self {
            Self::Increasing => (start, end),
            Self::Decreasing => (end, start),
        };
        (lo.unwrap_or(i64::MIN), hi.unwrap_or(i64::MAX))
    }
}

/// IndexValue is one position on a log's index curve.
///
/// Depths are held as integers scaled by `10^scale`, times as microseconds
/// since the Unix epoch. Two depths that round to the same scaled integer are
/// the same index. Values of different index types are unordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexValue {
    index_type: IndexType,
    key: i64,
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.index_type != other.index_type {
            return None;
        }
        self.key.partial_cmp(&other.key)
    }
}

impl IndexValue {
    pub fn from_key(index_type: IndexType, key: i64) -> Self {
        Self { index_type, key }
    }

    pub fn depth(depth: f64, scale: u32) -> Option<Self> {
        depth_key(depth, scale).map(|key| Self::from_key(IndexType::Depth, key))
    }

    pub fn time(dt: &DateTime<Utc>) -> Self {
        Self::from_key(IndexType::Time, time_to_unix_micros(dt))
    }

    /// parse reads the text form of an index value of the given type.
    pub fn parse(text: &str, index_type: IndexType, scale: u32) -> Result<Self> {
        let mixed = || Error::MixedIndexTypes {
            value: text.to_string(),
            expected: index_type.to_string(),
        };

        let key = match index_type {
            IndexType::Depth => {
                let v: f64 = text.trim().parse().map_err(|_| mixed())?;
                depth_key(v, scale).ok_or_else(mixed)?
            }
            IndexType::Time => {
                let micros = parse_unix_micros(text).map_err(|_| mixed())?;
                if micros.abs() > MAX_INDEX_KEY {
                    return Err(mixed());
                }
                micros
            }
        };

        Ok(Self::from_key(index_type, key))
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// distance returns `self - other` in scaled units, or None when the two
    /// values are of different index types.
    pub fn distance(&self, other: &IndexValue) -> Option<i64> {
        if self.index_type != other.index_type {
            return None;
        }
        self.key.checked_sub(other.key)
    }

    pub fn to_f64(&self, scale: u32) -> f64 {
        match self.index_type {
            IndexType::Depth => self.key as f64 / 10f64.powi(scale as i32),
            IndexType::Time => self.key as f64,
        }
    }

    pub fn format(&self, scale: u32) -> String {
        format_key(self.index_type, self.key, scale)
    }
}

/// IndexArg is a caller supplied index bound before it is matched against a log.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexArg {
    Depth(f64),
    Time(DateTime<Utc>),
}

impl IndexArg {
    /// resolve converts the bound to a key of the log's index type.
    pub fn resolve(&self, index_type: IndexType, scale: u32) -> Result<i64> {
        let mixed = || Error::MixedIndexTypes {
            value: self.to_string(),
            expected: index_type.to_string(),
        };

        match (self, index_type) {
            (Self::Depth(v), IndexType::Depth) => depth_key(*v, scale).ok_or_else(mixed),
            (Self::Time(dt), IndexType::Time) => Ok(time_to_unix_micros(dt)),
            _ => Err(mixed()),
        }
    }
}

impl Display for IndexArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Depth(v) => write!(f, "{}", v),
            Self::Time(dt) => write!(f, "{}", dt.to_rfc3339()),
        }
    }
}

pub(crate) fn depth_key(depth: f64, scale: u32) -> Option<i64> {
    if !depth.is_finite() || scale > MAX_DEPTH_SCALE {
        return None;
    }
    let scaled = (depth * 10f64.powi(scale as i32)).round();
    if scaled.abs() > MAX_INDEX_KEY as f64 {
        return None;
    }
    Some(scaled as i64)
}

pub(crate) fn format_key(index_type: IndexType, key: i64, scale: u32) -> String {
    match index_type {
        IndexType::Time => format_unix_micros(key),
        IndexType::Depth => {
            if scale == 0 {
                return key.to_string();
            }
            let p = 10u64.pow(scale);
            let abs = key.unsigned_abs();
            let sign = if key < 0 { "-" } else { "" };
            let (int, frac) = (abs / p, abs % p);
            if frac == 0 {
                return format!("{}{}", sign, int);
            }
            let frac = format!("{:0width$}", frac, width = scale as usize);
            format!("{}{}.{}", sign, int, frac.trim_end_matches('0'))
        }
    }
}
