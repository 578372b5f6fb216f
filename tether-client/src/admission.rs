//! Daily quota and pacing for outbound operations.
//!
//! [`AdmissionControl`] is consulted before every outbound operation. It
//! never sleeps and never fails: it either grants the operation, reporting
//! how long the caller should wait before performing it, or denies it with
//! a [`Denial`] explaining which policy blocked it.
//!
//! Counters are per calendar day, either in a configured UTC offset or in
//! the host's local time zone (re-evaluated on every check, so daylight
//! saving changes move midnight with them). The first check that observes a
//! new day zeroes all four counters at once.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::millis;
use crate::lock;

/// Upper bound of the jitter added when no pacing wait is needed.
const IDLE_JITTER_MS: u64 = 500;

// ─── QuotaConfig ──────────────────────────────────────────────────────────────

/// Per-account limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub max_messages_per_day:   u32,
    pub max_media_per_day:      u32,
    pub max_group_ops_per_day:  u32,
    pub max_friend_ops_per_day: u32,
    /// Minimum spacing between two outbound messages.
    #[serde(rename = "min_message_interval_ms", with = "millis")]
    pub min_message_interval:   Duration,
    /// Randomise pacing delays so traffic is never perfectly periodic.
    pub jitter:                 bool,
    /// When the account was registered; starts the silence period.
    pub account_created_at:     Option<DateTime<Utc>>,
    /// Days after `account_created_at` during which everything is denied.
    pub silence_days:           u32,
    /// Fixed offset used to decide what "today" is. `None` follows the
    /// host's local time zone.
    pub utc_offset_secs:        Option<i32>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_messages_per_day:   500,
            max_media_per_day:      100,
            max_group_ops_per_day:  20,
            max_friend_ops_per_day: 20,
            min_message_interval:   Duration::from_secs(1),
            jitter:                 true,
            account_created_at:     None,
            silence_days:           0,
            utc_offset_secs:        None,
        }
    }
}

// ─── Denial ───────────────────────────────────────────────────────────────────

/// Which daily counter a limit applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Messages,
    Media,
    Groups,
    Friends,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Messages => "message",
            Self::Media    => "media",
            Self::Groups   => "group operation",
            Self::Friends  => "friend operation",
        })
    }
}

/// Why an operation was refused. Not an I/O failure: retrying before the
/// policy changes (next day, end of silence) is pointless.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Denial {
    /// The account is still inside its post-registration silence window.
    SilencePeriod { until: DateTime<Utc> },
    /// Today's cap for `category` is used up.
    DailyLimit { category: Category, limit: u32 },
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SilencePeriod { until } => write!(f, "in silence period until {}", until.to_rfc3339()),
            Self::DailyLimit { category, limit } => write!(f, "daily {category} limit of {limit} reached"),
        }
    }
}

impl std::error::Error for Denial {}

// ─── DailyQuota ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct DailyQuota {
    date:            NaiveDate,
    messages:        u32,
    media:           u32,
    groups:          u32,
    friends:         u32,
    /// When the most recently granted message is scheduled to go out.
    last_message_at: Option<DateTime<Utc>>,
}

impl DailyQuota {
    fn new(date: NaiveDate) -> Self {
        Self { date, messages: 0, media: 0, groups: 0, friends: 0, last_message_at: None }
    }
}

/// Snapshot of today's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaStats {
    pub date:     NaiveDate,
    pub messages: u32,
    pub media:    u32,
    pub groups:   u32,
    pub friends:  u32,
}

// ─── AdmissionControl ─────────────────────────────────────────────────────────

/// Where calendar days begin.
#[derive(Clone, Copy, Debug)]
enum Zone {
    Fixed(FixedOffset),
    Local,
}

impl Zone {
    fn from_config(config: &QuotaConfig) -> Self {
        match config.utc_offset_secs {
            None => Self::Local,
            Some(secs) => match FixedOffset::east_opt(secs) {
                Some(offset) => Self::Fixed(offset),
                None => {
                    tracing::warn!("[admission] UTC offset of {secs}s is out of range, using local time");
                    Self::Local
                }
            },
        }
    }

    fn date_of(self, now: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Fixed(offset) => now.with_timezone(&offset).date_naive(),
            Self::Local         => now.with_timezone(&Local).date_naive(),
        }
    }
}

/// Quota and pacing engine for one account.
pub struct AdmissionControl {
    config: QuotaConfig,
    zone:   Zone,
    clock:  Arc<dyn Clock>,
    quota:  Mutex<DailyQuota>,
}

impl AdmissionControl {
    pub fn new(config: QuotaConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        let zone  = Zone::from_config(&config);
        let today = zone.date_of(clock.now());
        Self { config, zone, clock, quota: Mutex::new(DailyQuota::new(today)) }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Lock the counters, rolling them over first if the day changed.
    fn today(&self, now: DateTime<Utc>) -> MutexGuard<'_, DailyQuota> {
        let mut quota = lock(&self.quota);
        let today = self.zone.date_of(now);
        if quota.date != today {
            tracing::info!(
                "[admission] New day {today}: resetting counters (yesterday: {} msg, {} media, {} group, {} friend)",
                quota.messages, quota.media, quota.groups, quota.friends,
            );
            let last_message_at = quota.last_message_at;
            *quota = DailyQuota::new(today);
            quota.last_message_at = last_message_at;
        }
        quota
    }

    fn silence_until(&self) -> Option<DateTime<Utc>> {
        let created = self.config.account_created_at?;
        if self.config.silence_days == 0 {
            return None;
        }
        Some(created + TimeDelta::days(i64::from(self.config.silence_days)))
    }

    fn deny_if_silent(&self, now: DateTime<Utc>) -> Result<(), Denial> {
        match self.silence_until() {
            Some(until) if now < until => Err(Denial::SilencePeriod { until }),
            _                          => Ok(()),
        }
    }

    /// `true` while the account is inside its post-registration silence window.
    pub fn is_in_silence_period(&self) -> bool {
        self.deny_if_silent(self.clock.now()).is_err()
    }

    /// Gate one outbound message.
    ///
    /// On success the returned delay is how long the caller must wait before
    /// actually sending. Each grant books its send slot, so the next check
    /// is paced against that slot rather than against now: a burst of `n`
    /// back-to-back checks gets delays growing to roughly
    /// `n × min_message_interval`.
    pub fn check_message(&self) -> Result<Duration, Denial> {
        let now = self.clock.now();
        let mut quota = self.today(now);
        self.deny_if_silent(now)?;
        self.deny_if_exhausted(quota.messages, self.config.max_messages_per_day, Category::Messages)?;

        let delay = self.pacing_delay(quota.last_message_at, now);
        quota.messages += 1;
        quota.last_message_at = Some(now + to_delta(delay));
        Ok(delay)
    }

    /// Gate one outbound media message. Consumes both the message and the
    /// media counter.
    pub fn check_media(&self) -> Result<Duration, Denial> {
        let now = self.clock.now();
        let mut quota = self.today(now);
        self.deny_if_silent(now)?;
        self.deny_if_exhausted(quota.messages, self.config.max_messages_per_day, Category::Messages)?;
        self.deny_if_exhausted(quota.media, self.config.max_media_per_day, Category::Media)?;

        let delay = self.pacing_delay(quota.last_message_at, now);
        quota.messages += 1;
        quota.media += 1;
        quota.last_message_at = Some(now + to_delta(delay));
        Ok(delay)
    }

    /// Gate one group operation (create, invite, rename, …).
    pub fn check_group_operation(&self) -> Result<(), Denial> {
        let now = self.clock.now();
        let mut quota = self.today(now);
        self.deny_if_silent(now)?;
        self.deny_if_exhausted(quota.groups, self.config.max_group_ops_per_day, Category::Groups)?;
        quota.groups += 1;
        Ok(())
    }

    /// Gate one friend operation (add, accept, remove, …).
    pub fn check_friend_operation(&self) -> Result<(), Denial> {
        let now = self.clock.now();
        let mut quota = self.today(now);
        self.deny_if_silent(now)?;
        self.deny_if_exhausted(quota.friends, self.config.max_friend_ops_per_day, Category::Friends)?;
        quota.friends += 1;
        Ok(())
    }

    /// Messages still allowed today.
    pub fn remaining_messages(&self) -> u32 {
        let quota = self.today(self.clock.now());
        self.config.max_messages_per_day.saturating_sub(quota.messages)
    }

    pub fn stats(&self) -> QuotaStats {
        let quota = self.today(self.clock.now());
        QuotaStats {
            date:     quota.date,
            messages: quota.messages,
            media:    quota.media,
            groups:   quota.groups,
            friends:  quota.friends,
        }
    }

    fn deny_if_exhausted(&self, used: u32, limit: u32, category: Category) -> Result<(), Denial> {
        if used >= limit {
            tracing::debug!("[admission] Denied {category}: {used}/{limit} used today");
            return Err(Denial::DailyLimit { category, limit });
        }
        Ok(())
    }

    fn pacing_delay(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        let remaining = match last {
            Some(last) => (last + to_delta(self.config.min_message_interval) - now)
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        };
        if !self.config.jitter {
            return remaining;
        }
        let mut rng = rand::thread_rng();
        if remaining.is_zero() {
            Duration::from_millis(rng.gen_range(0..=IDLE_JITTER_MS))
        } else {
            remaining.mul_f64(rng.gen_range(0.5..=1.5))
        }
    }
}

impl fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionControl")
            .field("config", &self.config)
            .field("zone", &self.zone)
            .finish_non_exhaustive()
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn engine(config: QuotaConfig) -> (AdmissionControl, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(noon()));
        let config = QuotaConfig { utc_offset_secs: Some(0), ..config };
        (AdmissionControl::with_clock(config, clock.clone()), clock)
    }

    fn steady() -> QuotaConfig {
        QuotaConfig { jitter: false, ..QuotaConfig::default() }
    }

    #[test]
    fn fourth_message_is_denied_with_cap_of_three() {
        let (ac, clock) = engine(QuotaConfig { max_messages_per_day: 3, ..steady() });
        for _ in 0..3 {
            assert!(ac.check_message().is_ok());
            clock.advance(TimeDelta::seconds(5));
        }
        assert_eq!(
            ac.check_message(),
            Err(Denial::DailyLimit { category: Category::Messages, limit: 3 })
        );
        assert_eq!(ac.remaining_messages(), 0);
    }

    #[test]
    fn silence_period_blocks_everything() {
        let (ac, _clock) = engine(QuotaConfig {
            account_created_at: Some(noon() - TimeDelta::hours(24)),
            silence_days: 3,
            ..steady()
        });
        assert!(ac.is_in_silence_period());
        assert!(matches!(ac.check_message(), Err(Denial::SilencePeriod { .. })));
        assert!(matches!(ac.check_media(), Err(Denial::SilencePeriod { .. })));
        assert!(matches!(ac.check_group_operation(), Err(Denial::SilencePeriod { .. })));
        assert!(matches!(ac.check_friend_operation(), Err(Denial::SilencePeriod { .. })));
        assert_eq!(ac.stats().messages, 0, "denied checks must not consume quota");
    }

    #[test]
    fn silence_period_ends() {
        let (ac, clock) = engine(QuotaConfig {
            account_created_at: Some(noon() - TimeDelta::hours(24)),
            silence_days: 3,
            ..steady()
        });
        clock.advance(TimeDelta::days(2) + TimeDelta::seconds(1));
        assert!(!ac.is_in_silence_period());
        assert!(ac.check_friend_operation().is_ok());
    }

    #[test]
    fn silence_takes_precedence_over_exhausted_quota() {
        let (ac, _clock) = engine(QuotaConfig {
            max_group_ops_per_day: 0,
            account_created_at: Some(noon()),
            silence_days: 1,
            ..steady()
        });
        assert!(matches!(ac.check_group_operation(), Err(Denial::SilencePeriod { .. })));
    }

    #[test]
    fn all_counters_roll_over_together() {
        let (ac, clock) = engine(QuotaConfig {
            max_messages_per_day: 2,
            max_group_ops_per_day: 1,
            max_friend_ops_per_day: 1,
            ..steady()
        });
        ac.check_message().unwrap();
        ac.check_media().unwrap();
        ac.check_group_operation().unwrap();
        ac.check_friend_operation().unwrap();
        assert!(ac.check_message().is_err());
        assert!(ac.check_group_operation().is_err());

        clock.advance(TimeDelta::days(1));
        let stats = ac.stats();
        assert_eq!((stats.messages, stats.media, stats.groups, stats.friends), (0, 0, 0, 0));
        assert_eq!(stats.date, NaiveDate::from_ymd_opt(2024, 6, 2).unwrap());
        assert_eq!(ac.remaining_messages(), 2);
        assert!(ac.check_group_operation().is_ok());
        assert!(ac.check_message().is_ok());
    }

    #[test]
    fn day_boundary_follows_configured_offset() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 15, 30, 0).unwrap()));
        let config = QuotaConfig { max_messages_per_day: 1, utc_offset_secs: Some(8 * 3600), ..steady() };
        let ac = AdmissionControl::with_clock(config, clock.clone());
        ac.check_message().unwrap();
        assert!(ac.check_message().is_err());

        // 16:00 UTC is midnight at UTC+8.
        clock.advance(TimeDelta::minutes(30));
        assert!(ac.check_message().is_ok());
    }

    #[test]
    fn day_boundary_follows_local_zone_when_unset() {
        let start = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let ac = AdmissionControl::with_clock(QuotaConfig { max_messages_per_day: 1, ..steady() }, clock.clone());
        assert_eq!(ac.stats().date, start.with_timezone(&Local).date_naive());
        ac.check_message().unwrap();

        // Across a weekend that includes a daylight saving change in many zones.
        for hours in [6, 12, 18, 24, 30, 36, 42, 48] {
            clock.set(start + TimeDelta::hours(hours));
            let expected = clock.now().with_timezone(&Local).date_naive();
            assert_eq!(ac.stats().date, expected, "{hours}h in");
        }
        assert!(ac.check_message().is_ok(), "two days later is a new local day");
    }

    #[test]
    fn out_of_range_offset_falls_back_to_local() {
        let clock = Arc::new(ManualClock::new(noon()));
        let config = QuotaConfig { utc_offset_secs: Some(48 * 3600), ..steady() };
        let ac = AdmissionControl::with_clock(config, clock);
        assert_eq!(ac.stats().date, noon().with_timezone(&Local).date_naive());
    }

    #[test]
    fn media_consumes_both_counters_and_respects_either_cap() {
        let (ac, _clock) = engine(QuotaConfig { max_media_per_day: 1, ..steady() });
        ac.check_media().unwrap();
        let stats = ac.stats();
        assert_eq!((stats.messages, stats.media), (1, 1));
        assert_eq!(
            ac.check_media(),
            Err(Denial::DailyLimit { category: Category::Media, limit: 1 })
        );
        assert!(ac.check_message().is_ok(), "plain messages still have budget");

        let (ac, _clock) = engine(QuotaConfig { max_messages_per_day: 1, ..steady() });
        ac.check_message().unwrap();
        assert_eq!(
            ac.check_media(),
            Err(Denial::DailyLimit { category: Category::Messages, limit: 1 })
        );
    }

    #[test]
    fn back_to_back_messages_are_spaced_by_the_interval() {
        let (ac, clock) = engine(QuotaConfig { min_message_interval: Duration::from_secs(3), ..steady() });
        assert_eq!(ac.check_message(), Ok(Duration::ZERO));
        assert_eq!(ac.check_message(), Ok(Duration::from_secs(3)));
        assert_eq!(ac.check_message(), Ok(Duration::from_secs(6)), "queued behind the previous grant");

        clock.advance(TimeDelta::seconds(10));
        assert_eq!(ac.check_message(), Ok(Duration::ZERO));
        clock.advance(TimeDelta::seconds(1));
        assert_eq!(ac.check_message(), Ok(Duration::from_secs(2)));
    }

    #[test]
    fn jittered_delays_stay_in_band() {
        let (ac, clock) = engine(QuotaConfig { min_message_interval: Duration::from_secs(2), ..QuotaConfig::default() });
        let first = ac.check_message().unwrap();
        assert!(first <= Duration::from_millis(IDLE_JITTER_MS));

        clock.advance(TimeDelta::seconds(60));
        ac.check_message().unwrap();
        let paced = ac.check_message().unwrap();
        // The previous grant may itself carry up to 500ms of idle jitter.
        assert!(paced >= Duration::from_secs(1), "{paced:?}");
        assert!(paced <= Duration::from_millis(3750), "{paced:?}");
    }

    #[test]
    fn denial_reasons_read_well() {
        let d = Denial::DailyLimit { category: Category::Friends, limit: 20 };
        assert_eq!(d.to_string(), "daily friend operation limit of 20 reached");
        let until = noon();
        assert!(Denial::SilencePeriod { until }.to_string().starts_with("in silence period until 2024-06-01"));
    }
}
