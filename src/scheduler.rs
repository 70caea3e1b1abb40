use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, DurationRound, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{RepositoryError, ValidationError};
use crate::models::{Group, GroupSchedule, User};

/// A local wall-clock time of day, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScheduleTime {
    pub hour: u32,
    pub minute: u32,
}

impl FromStr for ScheduleTime {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidTime(value.to_string());

        let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
        let parse_part = |part: &str| -> Result<u32, ValidationError> {
            if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };
        let hour = parse_part(hour)?;
        let minute = parse_part(minute)?;

        if hour > 23 || minute > 59 {
            return Err(invalid());
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for ScheduleTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

pub fn floor_minute(value: DateTime<Utc>) -> DateTime<Utc> {
    value
        .duration_trunc(TimeDelta::minutes(1))
        .unwrap_or(value)
}

/// A schedule that fired on this tick, with everything needed to run it.
#[derive(Debug, Clone)]
pub struct DueSchedule {
    pub schedule: GroupSchedule,
    pub group: Group,
    pub user: User,
    pub scheduled_at: DateTime<Utc>,
}

pub struct Scheduler {
    db: Arc<Database>,
}

impl Scheduler {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Find every enabled schedule whose local time matches `now` and claim
    /// it for this minute. Calling `tick` again within the same minute, from
    /// this or another process, returns nothing for an already-claimed
    /// schedule.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<DueSchedule>, RepositoryError> {
        let scheduled_at = floor_minute(now);
        let mut due = Vec::new();

        for schedule in self.db.list_enabled_schedules().await? {
            let Some(group) = self.db.get_group(schedule.group_id).await? else {
                continue;
            };
            if !group.is_enabled {
                continue;
            }
            let Some(user) = self.db.get_user(group.user_id).await? else {
                continue;
            };

            if let Some(last) = schedule.last_fired_at {
                if floor_minute(last) == scheduled_at {
                    continue;
                }
            }

            let tz: Tz = match user.timezone.parse() {
                Ok(tz) => tz,
                Err(_) => {
                    warn!(
                        "Skipping schedule {}: user {} has unknown timezone '{}'",
                        schedule.id, user.id, user.timezone
                    );
                    continue;
                }
            };
            let time: ScheduleTime = match schedule.time_hhmm.parse() {
                Ok(time) => time,
                Err(e) => {
                    warn!("Skipping schedule {}: {}", schedule.id, e);
                    continue;
                }
            };

            let local = scheduled_at.with_timezone(&tz);
            if local.hour() != time.hour || local.minute() != time.minute {
                continue;
            }

            if !self.db.mark_schedule_fired(schedule.id, scheduled_at).await? {
                debug!("Schedule {} already fired at {}", schedule.id, scheduled_at);
                continue;
            }

            info!(
                "Schedule {} for group '{}' is due at {} ({} local)",
                schedule.id, group.name, scheduled_at, time
            );
            let schedule = GroupSchedule {
                last_fired_at: Some(scheduled_at),
                ..schedule
            };
            due.push(DueSchedule {
                schedule,
                group,
                user,
                scheduled_at,
            });
        }

        Ok(due)
    }
}
