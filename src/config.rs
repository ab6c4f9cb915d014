/*!
 # Configuration record decoding

 Turns a complete message buffer into a validated [`ScheduleConfig`].
 Validation is ordered and stops at the first violation:

 1. not a well-formed JSON object: [`DecodeError::Malformed`]
 2. required field absent: [`DecodeError::MissingField`]
 3. required field of the wrong JSON type: [`DecodeError::WrongType`]
 4. numeric field out of range: [`DecodeError::OutOfRange`]
 5. time field not `HH:MM`: [`DecodeError::BadTimeFormat`]
 6. start equals end: [`DecodeError::DegenerateWindow`]
 7. weekday key absent: [`DecodeError::MissingWeekday`]

 The canonical record:

 ```json
 {"lightIntensity":80,"lightStart":"07:00","lightEnd":"21:30","timeNow":1744893150,
  "timezoneOffsetHours":1,"daylightSavingFlag":true,
  "Monday":true,"Tuesday":true,"Wednesday":true,"Thursday":true,"Friday":true,
  "Saturday":false,"Sunday":false}
 ```

 The mobile client names the main window `sunLightIntensity`, `sunlightStart`
 and `sunlightEnd`, and may add a second `redLight*` window. Both spellings
 are accepted. The red window is optional, but when any of its three fields
 is present all of them must be, and they go through the same checks.
*/

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::schedule::WEEKDAY_NAMES;

pub const FIELD_LIGHT_INTENSITY: &str = "lightIntensity";
pub const FIELD_LIGHT_START: &str = "lightStart";
pub const FIELD_LIGHT_END: &str = "lightEnd";
pub const FIELD_TIME_NOW: &str = "timeNow";
pub const FIELD_TIMEZONE_OFFSET: &str = "timezoneOffsetHours";
pub const FIELD_DAYLIGHT_SAVING: &str = "daylightSavingFlag";

pub const FIELD_RED_INTENSITY: &str = "redLightIntensity";
pub const FIELD_RED_START: &str = "redLightStart";
pub const FIELD_RED_END: &str = "redLightEnd";

/// Field names used by the mobile client, accepted as aliases
const FIELD_ALIASES: &[(&str, &str)] = &[
    (FIELD_LIGHT_INTENSITY, "sunLightIntensity"),
    (FIELD_LIGHT_START, "sunlightStart"),
    (FIELD_LIGHT_END, "sunlightEnd"),
    (FIELD_TIMEZONE_OFFSET, "timeZoneOffsetHrs"),
    (FIELD_DAYLIGHT_SAVING, "daylightSavingsTime"),
];

/// Allowed timezone offsets in hours
pub const TIMEZONE_OFFSET_RANGE: std::ops::RangeInclusive<i64> = -12..=14;

/// Latest accepted `timeNow`; the client sends an unsigned 32-bit timestamp
pub const MAX_TIME_NOW: i64 = u32::MAX as i64;

/// Reasons a configuration record is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not a well-formed JSON object
    #[error("Malformed configuration record: {0}")]
    Malformed(String),

    /// Required field absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Field present with the wrong type
    #[error("Field {0} has the wrong type")]
    WrongType(&'static str),

    /// Numeric field outside its declared range
    #[error("Field {0} is out of range")]
    OutOfRange(&'static str),

    /// Time field is not a zero-padded HH:MM string
    #[error("Field {0} is not in HH:MM format")]
    BadTimeFormat(&'static str),

    /// Window start equals window end
    #[error("Window start and end are the same")]
    DegenerateWindow,

    /// One of the seven weekday flags is absent
    #[error("Missing weekday: {0}")]
    MissingWeekday(&'static str),
}

/// A validated, zero-padded `HH:MM` time of day
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(String);

impl TimeOfDay {
    /// Parses a strict `HH:MM` string (hours 00-23, minutes 00-59)
    pub fn parse(value: &str) -> Option<Self> {
        let bytes = value.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return None;
        }
        let digits = [bytes[0], bytes[1], bytes[3], bytes[4]];
        if !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let hours = (digits[0] - b'0') * 10 + (digits[1] - b'0');
        let minutes = (digits[2] - b'0') * 10 + (digits[3] - b'0');
        if hours > 23 || minutes > 59 {
            return None;
        }
        Some(Self(value.to_owned()))
    }

    pub fn from_hm(hours: u8, minutes: u8) -> Option<Self> {
        Self::parse(&format!("{:02}:{:02}", hours, minutes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Minutes elapsed since local midnight
    pub fn minutes_since_midnight(&self) -> u16 {
        let b = self.0.as_bytes();
        let hours = u16::from(b[0] - b'0') * 10 + u16::from(b[1] - b'0');
        let minutes = u16::from(b[3] - b'0') * 10 + u16::from(b[4] - b'0');
        hours * 60 + minutes
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional second window, driven on the red-light channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedLightWindow {
    pub light_intensity: u8,
    pub window_start: TimeOfDay,
    pub window_end: TimeOfDay,
}

/// The validated schedule. Replaced as a whole on every accepted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Target duty in percent (0-100)
    pub light_intensity: u8,
    /// Window start, local time
    pub window_start: TimeOfDay,
    /// Window end, local time
    pub window_end: TimeOfDay,
    /// Offset from UTC in whole hours
    pub timezone_offset_hours: i8,
    /// Advisory only, never applied as an extra offset
    pub daylight_saving: bool,
    /// One flag per weekday, Monday first
    pub weekday_active: [bool; 7],
    /// Second window, shares the weekday flags
    pub red_light: Option<RedLightWindow>,
}

impl ScheduleConfig {
    /// Renders this schedule as a wire record carrying `time_now`
    pub fn to_message_json(&self, time_now: i64) -> String {
        let mut record = Map::new();
        record.insert(FIELD_LIGHT_INTENSITY.into(), self.light_intensity.into());
        record.insert(FIELD_LIGHT_START.into(), self.window_start.as_str().into());
        record.insert(FIELD_LIGHT_END.into(), self.window_end.as_str().into());
        record.insert(FIELD_TIME_NOW.into(), time_now.into());
        record.insert(
            FIELD_TIMEZONE_OFFSET.into(),
            self.timezone_offset_hours.into(),
        );
        record.insert(FIELD_DAYLIGHT_SAVING.into(), self.daylight_saving.into());
        if let Some(red) = &self.red_light {
            record.insert(FIELD_RED_INTENSITY.into(), red.light_intensity.into());
            record.insert(FIELD_RED_START.into(), red.window_start.as_str().into());
            record.insert(FIELD_RED_END.into(), red.window_end.as_str().into());
        }
        for (name, active) in WEEKDAY_NAMES.iter().zip(self.weekday_active) {
            record.insert((*name).into(), active.into());
        }
        Value::Object(record).to_string()
    }
}

/// A decoded record: the schedule plus the client's clock reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMessage {
    pub config: ScheduleConfig,
    /// Unix seconds at send time; only used to seed the clock once
    pub time_now: i64,
}

/// Decodes and validates a record, discarding the embedded timestamp
pub fn decode(buffer: &[u8]) -> Result<ScheduleConfig, DecodeError> {
    decode_message(buffer).map(|message| message.config)
}

/// Decodes and validates a complete record
#[instrument(skip(buffer), fields(len = buffer.len()))]
pub fn decode_message(buffer: &[u8]) -> Result<ConfigMessage, DecodeError> {
    let result = validate(buffer);
    match &result {
        Ok(message) => debug!("Decoded schedule: {:?}", message.config),
        Err(e) => warn!("Rejected configuration record: {}", e),
    }
    result
}

fn validate(buffer: &[u8]) -> Result<ConfigMessage, DecodeError> {
    let trimmed_len = buffer
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    let root: Value = serde_json::from_slice(&buffer[..trimmed_len])
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(record) = root else {
        return Err(DecodeError::Malformed("not an object".into()));
    };

    let fields = [
        FIELD_LIGHT_INTENSITY,
        FIELD_LIGHT_START,
        FIELD_LIGHT_END,
        FIELD_TIME_NOW,
        FIELD_TIMEZONE_OFFSET,
        FIELD_DAYLIGHT_SAVING,
    ];
    for field in fields {
        if lookup(&record, field).is_none() {
            return Err(DecodeError::MissingField(field));
        }
    }
    let red_fields = [FIELD_RED_INTENSITY, FIELD_RED_START, FIELD_RED_END];
    let has_red = red_fields.iter().any(|field| record.contains_key(*field));
    if has_red {
        for field in red_fields {
            if !record.contains_key(field) {
                return Err(DecodeError::MissingField(field));
            }
        }
    }

    let intensity = integer_field(&record, FIELD_LIGHT_INTENSITY)?;
    let start = string_field(&record, FIELD_LIGHT_START)?;
    let end = string_field(&record, FIELD_LIGHT_END)?;
    let time_now = integer_field(&record, FIELD_TIME_NOW)?;
    let offset = integer_field(&record, FIELD_TIMEZONE_OFFSET)?;
    let daylight_saving = bool_field(&record, FIELD_DAYLIGHT_SAVING)?;
    let red = if has_red {
        Some((
            integer_field(&record, FIELD_RED_INTENSITY)?,
            string_field(&record, FIELD_RED_START)?,
            string_field(&record, FIELD_RED_END)?,
        ))
    } else {
        None
    };

    let light_intensity = percent(intensity?, FIELD_LIGHT_INTENSITY)?;
    let red_intensity = match &red {
        Some((intensity, _, _)) => Some(percent(intensity.clone()?, FIELD_RED_INTENSITY)?),
        None => None,
    };
    let time_now = time_now?;
    if !(0..=MAX_TIME_NOW).contains(&time_now) {
        return Err(DecodeError::OutOfRange(FIELD_TIME_NOW));
    }
    let timezone_offset_hours = offset?;
    if !TIMEZONE_OFFSET_RANGE.contains(&timezone_offset_hours) {
        return Err(DecodeError::OutOfRange(FIELD_TIMEZONE_OFFSET));
    }
    let timezone_offset_hours = i8::try_from(timezone_offset_hours)
        .map_err(|_| DecodeError::OutOfRange(FIELD_TIMEZONE_OFFSET))?;

    let window_start =
        TimeOfDay::parse(start).ok_or(DecodeError::BadTimeFormat(FIELD_LIGHT_START))?;
    let window_end = TimeOfDay::parse(end).ok_or(DecodeError::BadTimeFormat(FIELD_LIGHT_END))?;
    let red_window = match (&red, red_intensity) {
        (Some((_, start, end)), Some(light_intensity)) => Some(RedLightWindow {
            light_intensity,
            window_start: TimeOfDay::parse(start)
                .ok_or(DecodeError::BadTimeFormat(FIELD_RED_START))?,
            window_end: TimeOfDay::parse(end).ok_or(DecodeError::BadTimeFormat(FIELD_RED_END))?,
        }),
        _ => None,
    };

    if window_start == window_end
        || red_window
            .as_ref()
            .is_some_and(|red| red.window_start == red.window_end)
    {
        return Err(DecodeError::DegenerateWindow);
    }

    let mut weekday_active = [false; 7];
    for (slot, day) in weekday_active.iter_mut().zip(WEEKDAY_NAMES) {
        *slot = match record.get(day) {
            None => return Err(DecodeError::MissingWeekday(day)),
            Some(Value::Bool(active)) => *active,
            Some(_) => return Err(DecodeError::WrongType(day)),
        };
    }

    Ok(ConfigMessage {
        config: ScheduleConfig {
            light_intensity,
            window_start,
            window_end,
            timezone_offset_hours,
            daylight_saving,
            weekday_active,
            red_light: red_window,
        },
        time_now,
    })
}

fn percent(value: i64, field: &'static str) -> Result<u8, DecodeError> {
    u8::try_from(value)
        .ok()
        .filter(|v| *v <= 100)
        .ok_or(DecodeError::OutOfRange(field))
}

fn lookup<'a>(record: &'a Map<String, Value>, field: &'static str) -> Option<&'a Value> {
    record.get(field).or_else(|| {
        FIELD_ALIASES
            .iter()
            .find(|(canonical, _)| *canonical == field)
            .and_then(|(_, alias)| record.get(*alias))
    })
}

/// Integer field: the outer error is a type error, the inner one a range error.
fn integer_field(
    record: &Map<String, Value>,
    field: &'static str,
) -> Result<Result<i64, DecodeError>, DecodeError> {
    match lookup(record, field) {
        Some(Value::Number(n)) if n.is_i64() => Ok(n.as_i64().ok_or(DecodeError::OutOfRange(field))),
        // Integral but beyond i64
        Some(Value::Number(n)) if n.is_u64() => Ok(Err(DecodeError::OutOfRange(field))),
        Some(_) => Err(DecodeError::WrongType(field)),
        None => Err(DecodeError::MissingField(field)),
    }
}

fn string_field<'a>(
    record: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, DecodeError> {
    match lookup(record, field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(DecodeError::WrongType(field)),
        None => Err(DecodeError::MissingField(field)),
    }
}

fn bool_field(record: &Map<String, Value>, field: &'static str) -> Result<bool, DecodeError> {
    match lookup(record, field) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(DecodeError::WrongType(field)),
        None => Err(DecodeError::MissingField(field)),
    }
}
