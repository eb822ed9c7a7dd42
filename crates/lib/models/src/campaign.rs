use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Days, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{BroadcastTranslation, CampaignID, CampaignUUID, FlowID, GroupID, PointID, PointUUID};

/// Delivery hour value meaning "fire at the computed minute".
pub const NO_DELIVERY_HOUR: i32 = -1;

#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: CampaignID,
    pub uuid: CampaignUUID,
    pub name: String,
    pub group_id: GroupID,
    pub points: Vec<CampaignPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl OffsetUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
            Self::Weeks => "weeks",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minutes" | "M" => Some(Self::Minutes),
            "hours" | "H" => Some(Self::Hours),
            "days" | "D" => Some(Self::Days),
            "weeks" | "W" => Some(Self::Weeks),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    Interrupt,
    Skip,
    Passive,
}

impl StartMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Skip => "skip",
            Self::Passive => "passive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "interrupt" | "I" => Some(Self::Interrupt),
            "skip" | "S" => Some(Self::Skip),
            "passive" | "P" => Some(Self::Passive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointStatus {
    Scheduling,
    Ready,
}

impl PointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduling => "scheduling",
            Self::Ready => "ready",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduling" | "S" => Some(Self::Scheduling),
            "ready" | "R" => Some(Self::Ready),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PointAction {
    Flow {
        flow_id: FlowID,
    },
    Broadcast {
        translations: BTreeMap<String, BroadcastTranslation>,
        base_language: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignPoint {
    pub id: PointID,
    pub uuid: PointUUID,
    pub campaign_id: CampaignID,
    /// Key of the contact field (or `created_on` / `last_seen_on`) the point is relative to.
    pub relative_to: String,
    pub offset: i32,
    pub unit: OffsetUnit,
    pub delivery_hour: i32,
    pub action: PointAction,
    pub start_mode: StartMode,
    pub status: PointStatus,
    pub fire_version: i32,
}

impl CampaignPoint {
    pub fn flow_id(&self) -> Option<FlowID> {
        match &self.action {
            PointAction::Flow { flow_id } => Some(*flow_id),
            PointAction::Broadcast { .. } => None,
        }
    }

    /// When this point fires for a contact whose relative-to value is `start`,
    /// or `None` if that time has already passed.
    ///
    /// The start is rounded up to the next whole minute in the contact's timezone,
    /// the offset applied (days and weeks as calendar days), then the delivery hour
    /// replaces the time of day if one is set.
    pub fn schedule_for(
        &self,
        tz: Tz,
        now: DateTime<Utc>,
        start: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let start = start.with_timezone(&tz);
        let mut scheduled = if start.second() > 0 || start.nanosecond() > 0 {
            (start + chrono::Duration::seconds(60))
                .with_second(0)?
                .with_nanosecond(0)?
        } else {
            start
        };

        let offset = i64::from(self.offset);
        scheduled = match self.unit {
            OffsetUnit::Minutes => scheduled + chrono::Duration::minutes(offset),
            OffsetUnit::Hours => scheduled + chrono::Duration::hours(offset),
            OffsetUnit::Days => add_days(scheduled, offset)?,
            OffsetUnit::Weeks => add_days(scheduled, offset * 7)?,
        };

        if self.delivery_hour != NO_DELIVERY_HOUR {
            scheduled = tz
                .with_ymd_and_hms(
                    scheduled.year(),
                    scheduled.month(),
                    scheduled.day(),
                    u32::try_from(self.delivery_hour).ok()?,
                    0,
                    0,
                )
                .earliest()?;
        }

        let scheduled = scheduled.with_timezone(&Utc);
        (scheduled >= now).then_some(scheduled)
    }
}

fn add_days(at: DateTime<Tz>, days: i64) -> Option<DateTime<Tz>> {
    if days >= 0 {
        at.checked_add_days(Days::new(days.unsigned_abs()))
    } else {
        at.checked_sub_days(Days::new(days.unsigned_abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(offset: i32, unit: OffsetUnit, delivery_hour: i32) -> CampaignPoint {
        CampaignPoint {
            id: PointID(1),
            uuid: PointUUID::new(),
            campaign_id: CampaignID(1),
            relative_to: "joined".to_string(),
            offset,
            unit,
            delivery_hour,
            action: PointAction::Flow { flow_id: FlowID(1) },
            start_mode: StartMode::Interrupt,
            status: PointStatus::Ready,
            fire_version: 1,
        }
    }

    #[test]
    fn schedule_for_rounds_to_next_minute() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2025, 1, 2, 10, 30, 15).unwrap();
        let fire = point(5, OffsetUnit::Minutes, NO_DELIVERY_HOUR)
            .schedule_for(Tz::UTC, now, start)
            .unwrap();
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 1, 2, 10, 36, 0).unwrap());
    }

    #[test]
    fn schedule_for_applies_delivery_hour_in_contact_timezone() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2025, 1, 2, 20, 0, 0).unwrap();
        let tz: Tz = "America/Guayaquil".parse().unwrap();
        let fire = point(1, OffsetUnit::Days, 9)
            .schedule_for(tz, now, start)
            .unwrap();
        // 20:00Z is 15:00 local on Jan 2, plus a day, at 09:00 local (UTC-5)
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 1, 3, 14, 0, 0).unwrap());
    }

    #[test]
    fn schedule_for_skips_past_times() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            point(-1, OffsetUnit::Weeks, NO_DELIVERY_HOUR).schedule_for(Tz::UTC, now, start),
            None
        );
    }
}
