/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Recurring schedules.
//!
//! A [`Schedule`] computes the next execution time from a completion (or
//! failure) instant. Schedules serialize with serde so they can be embedded
//! in a task's persisted payload, the self-describing form consumed by
//! [`RescheduleUsingTaskData`](crate::task::handlers::RescheduleUsingTaskData).

use chrono::{DateTime, Duration, NaiveTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// When a recurring task runs next.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fixed delay after each completion.
    FixedDelay { delay_seconds: u64 },
    /// Every day at the given UTC times.
    Daily { times: Vec<NaiveTime> },
    /// Standard five-field cron expression, evaluated in UTC.
    Cron { expression: String },
}

impl Schedule {
    pub fn fixed_delay(delay: std::time::Duration) -> Self {
        Schedule::FixedDelay {
            delay_seconds: delay.as_secs(),
        }
    }

    pub fn daily(times: Vec<NaiveTime>) -> Self {
        Schedule::Daily { times }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Cron {
            expression: expression.into(),
        }
    }

    /// The next execution time strictly after `from`.
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            Schedule::FixedDelay { delay_seconds } => {
                Ok(from + Duration::seconds(*delay_seconds as i64))
            }
            Schedule::Daily { times } => next_daily(times, from),
            Schedule::Cron { expression } => next_cron(expression, from),
        }
    }
}

fn next_daily(times: &[NaiveTime], from: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    if times.is_empty() {
        return Err(ScheduleError::EmptyDaily);
    }

    let mut sorted = times.to_vec();
    sorted.sort();

    let today = from.date_naive();
    for time in &sorted {
        let candidate = today.and_time(*time).and_utc();
        if candidate > from {
            return Ok(candidate);
        }
    }

    // All of today's times have passed; first time tomorrow.
    let tomorrow = today + Duration::days(1);
    Ok(tomorrow.and_time(sorted[0]).and_utc())
}

fn next_cron(expression: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let cron = Cron::new(expression)
        .parse()
        .map_err(|e| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            message: e.to_string(),
        })?;

    cron.find_next_occurrence(&from, false)
        .map_err(|_| ScheduleError::NoUpcomingOccurrence {
            expression: expression.to_string(),
        })
}
