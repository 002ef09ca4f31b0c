use std::fs;
use std::path::PathBuf;

use anyhow::anyhow;
use chrono::{
  DateTime,
  Duration,
  LocalResult,
  NaiveDate,
  NaiveDateTime,
  NaiveTime,
  TimeZone,
  Utc
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

const TIMEZONE_ENV_VAR: &str =
  "DUEDO_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "DUEDO_TIME_CONFIG";
const SYSTEM_TIMEZONE_ENV_VAR: &str =
  "TZ";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// Resolves the zone that due dates and times are interpreted in.
///
/// Order: the `timezone` config value, `$DUEDO_TIMEZONE`, the toml file
/// named by `$DUEDO_TIME_CONFIG`, `$TZ`, then UTC.
pub fn resolve_timezone(
  configured: Option<&str>
) -> Tz {
  if let Some(raw) = configured
    && let Some(tz) =
      parse_timezone(raw, "config")
  {
    return tz;
  }

  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) = parse_timezone(
      &raw,
      TIMEZONE_ENV_VAR
    )
  {
    return tz;
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return tz;
  }

  if let Ok(raw) = std::env::var(
    SYSTEM_TIMEZONE_ENV_VAR
  ) && let Some(tz) = parse_timezone(
    &raw,
    SYSTEM_TIMEZONE_ENV_VAR
  ) {
    return tz;
  }

  tracing::debug!(
    "no timezone configured; using \
     UTC"
  );
  chrono_tz::UTC
}

fn timezone_config_path()
-> Option<PathBuf> {
  let raw = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  )
  .ok()?;
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    return None;
  }
  Some(PathBuf::from(trimmed))
}

fn load_timezone_from_file(
  path: &PathBuf
) -> Option<Tz> {
  if !path.exists() {
    tracing::info!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let parsed = match toml::from_str::<
    TimezoneConfig
  >(&raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let timezone =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    });
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::debug!(
        source,
        timezone = %trimmed,
        "resolved timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::warn!(
        source,
        timezone = %trimmed,
        error = %err,
        "invalid timezone; ignoring"
      );
      None
    }
  }
}

#[must_use]
pub fn local_now(
  now: DateTime<Utc>,
  tz: &Tz
) -> NaiveDateTime {
  now.with_timezone(tz).naive_local()
}

#[must_use]
pub fn local_today(
  now: DateTime<Utc>,
  tz: &Tz
) -> NaiveDate {
  now.with_timezone(tz).date_naive()
}

/// The instant a reminder for `date` at `time` fires in `tz`.
///
/// A DST fold resolves to the earlier instant; a DST gap has no instant and
/// yields `None`.
pub fn fire_moment(
  date: NaiveDate,
  time: NaiveTime,
  tz: &Tz
) -> Option<DateTime<Utc>> {
  let local_naive = date.and_time(time);
  match tz.from_local_datetime(
    &local_naive
  ) {
    | LocalResult::Single(local_dt) => {
      Some(local_dt.with_timezone(&Utc))
    }
    | LocalResult::Ambiguous(
      first,
      second
    ) => {
      tracing::warn!(
        local = %local_naive,
        first = %first,
        second = %second,
        "ambiguous local due time; using earliest"
      );
      let chosen = if first <= second {
        first
      } else {
        second
      };
      Some(chosen.with_timezone(&Utc))
    }
    | LocalResult::None => {
      tracing::warn!(
        local = %local_naive,
        timezone = %tz,
        "due time does not exist in \
         timezone"
      );
      None
    }
  }
}

/// Accepts `YYYY-MM-DD`, `today`, `tomorrow` and `+Nd`.
#[tracing::instrument(skip(today), fields(input = input))]
pub fn parse_due_date(
  input: &str,
  today: NaiveDate
) -> anyhow::Result<NaiveDate> {
  let token =
    input.trim().to_ascii_lowercase();

  match token.as_str() {
    | "today" => return Ok(today),
    | "tomorrow" => {
      return today
        .checked_add_signed(
          Duration::days(1)
        )
        .ok_or_else(|| {
          anyhow!("date out of range")
        });
    }
    | _ => {}
  }

  let rel_re =
    Regex::new(r"^\+(?P<num>\d+)d$")
      .map_err(|e| {
        anyhow!(
          "internal regex compile \
           failure: {e}"
        )
      })?;
  if let Some(caps) =
    rel_re.captures(&token)
  {
    let days = caps["num"]
      .parse::<i64>()
      .map_err(|e| {
        anyhow!(
          "invalid day offset: {e}"
        )
      })?;
    return today
      .checked_add_signed(
        Duration::days(days)
      )
      .ok_or_else(|| {
        anyhow!(
          "date out of range: {input}"
        )
      });
  }

  NaiveDate::parse_from_str(
    &token, "%Y-%m-%d"
  )
  .map_err(|_| {
    anyhow!(
      "unrecognized date: {input} \
       (expected YYYY-MM-DD, today, \
       tomorrow or +Nd)"
    )
  })
}

/// Accepts `HH:MM`, `HH:MM:SS` and `h:mm am|pm`.
#[tracing::instrument(fields(input = input))]
pub fn parse_due_time(
  input: &str
) -> anyhow::Result<NaiveTime> {
  parse_clock_time(input).ok_or_else(
    || {
      anyhow!(
        "unrecognized time: {input} \
         (expected HH:MM or h:mm am/pm)"
      )
    }
  )
}

fn parse_clock_time(
  token: &str
) -> Option<NaiveTime> {
  let clock_re = Regex::new(
    r"(?i)^(?P<hour>\d{1,2}):(?P<minute>\d{2})(?::(?P<second>\d{2}))?\s*(?P<ampm>[ap]m)?$",
  )
  .ok()?;
  let captures =
    clock_re.captures(token.trim())?;

  let raw_hour = captures
    .name("hour")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  let minute = captures
    .name("minute")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  let second = match captures
    .name("second")
  {
    | Some(raw) => {
      raw.as_str().parse::<u32>().ok()?
    }
    | None => 0
  };

  let hour = if let Some(ampm_match) =
    captures.name("ampm")
  {
    let ampm = ampm_match
      .as_str()
      .to_ascii_lowercase();
    if raw_hour == 0 || raw_hour > 12 {
      return None;
    }
    match ampm.as_str() {
      | "am" => {
        if raw_hour == 12 {
          0
        } else {
          raw_hour
        }
      }
      | "pm" => {
        if raw_hour == 12 {
          12
        } else {
          raw_hour + 12
        }
      }
      | _ => return None
    }
  } else {
    raw_hour
  };

  NaiveTime::from_hms_opt(
    hour, minute, second
  )
}

/// `Jan 5, 2025`
#[must_use]
pub fn format_due_date(
  date: NaiveDate
) -> String {
  date.format("%b %-d, %Y").to_string()
}

/// `9:00 AM`
#[must_use]
pub fn format_due_time(
  time: NaiveTime
) -> String {
  time.format("%-I:%M %p").to_string()
}

/// Wire format for `due_time` columns. Reads `HH:MM` or `HH:MM:SS`,
/// writes `HH:MM:SS`.
pub mod due_time_serde {
  use chrono::NaiveTime;
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };

  const WIRE_FORMAT: &str = "%H:%M:%S";

  pub fn serialize<S>(
    time: &Option<NaiveTime>,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    match time {
      | Some(value) => {
        serializer.serialize_str(
          &value
            .format(WIRE_FORMAT)
            .to_string()
        )
      }
      | None => {
        serializer.serialize_none()
      }
    }
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<Option<NaiveTime>, D::Error>
  where
    D: Deserializer<'de>
  {
    let opt =
      Option::<String>::deserialize(
        deserializer
      )?;
    match opt {
      | Some(raw) => {
        super::parse_clock_time(&raw)
          .map(Some)
          .ok_or_else(|| {
            serde::de::Error::custom(
              format!(
                "invalid time of day: \
                 {raw}"
              )
            )
          })
      }
      | None => Ok(None)
    }
  }

  pub mod patch {
    use chrono::NaiveTime;
    use serde::Serializer;

    pub fn serialize<S>(
      time: &Option<Option<NaiveTime>>,
      serializer: S
    ) -> Result<S::Ok, S::Error>
    where
      S: Serializer
    {
      match time {
        | Some(inner) => {
          super::serialize(
            inner, serializer
          )
        }
        | None => {
          serializer.serialize_none()
        }
      }
    }
  }
}
