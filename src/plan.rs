//! Weekly activity plans.
//!
//! A plan is a week of workouts keyed by day. Plans are stored as immutable
//! records; the backend tools (generate, add workout, delete workout) create
//! or replace records through [`PlanService`], and the newest record covering
//! today is the active plan.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::llm::{self, object_schema, system_message, user_message, LlmClient};
use crate::messages::AnnotatedMessage;
use crate::prompts;
use crate::store::{ChatStore, PlanRecord};

pub const VALID_WORKOUT_TYPES: [&str; 12] = [
    "walking",
    "running",
    "cycling",
    "swimming",
    "hiking",
    "yoga",
    "pilates",
    "strength training",
    "dancing",
    "rowing",
    "basketball",
    "soccer",
];

pub const DAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

/// A scheduled workout can only be removed more than this far ahead of its
/// start time.
const DELETE_LOCK_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workout {
    pub id: String,
    #[serde(rename = "type")]
    pub workout_type: String,
    /// 24h clock, "HH:MM".
    pub time_start: String,
    pub duration_min: u32,
    pub intensity: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyPlan {
    #[serde(default)]
    pub workouts_by_day: BTreeMap<String, Vec<Workout>>,
}

impl WeeklyPlan {
    pub fn total_workouts(&self) -> usize {
        self.workouts_by_day.values().map(Vec::len).sum()
    }

    pub fn describe(&self) -> String {
        DAYS.iter()
            .filter_map(|day| {
                let workouts = self.workouts_by_day.get(*day)?;
                if workouts.is_empty() {
                    return None;
                }
                let entries = workouts
                    .iter()
                    .map(|w| {
                        format!(
                            "{} at {} ({} min, {} intensity)",
                            w.workout_type, w.time_start, w.duration_min, w.intensity
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                Some(format!("{}: {}", day, entries))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Arguments of the `addWorkout` backend tool.
#[derive(Debug, Clone, Deserialize)]
pub struct AddWorkoutArgs {
    pub day: String,
    #[serde(rename = "type")]
    pub workout_type: String,
    pub time_start: String,
    pub duration_min: u32,
    #[serde(default = "default_intensity")]
    pub intensity: String,
    #[serde(default)]
    pub location: Option<String>,
}

fn default_intensity() -> String {
    "moderate".to_string()
}

/// Arguments of the `deleteWorkout` backend tool.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteWorkoutArgs {
    pub day: String,
    #[serde(rename = "type")]
    pub workout_type: String,
    #[serde(default)]
    pub time_start: Option<String>,
}

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    /// Builds a week plan from the conversation. Returns the plan (or `None`
    /// when the conversation does not support one yet) and a message for the
    /// user.
    async fn generate_plan(
        &self,
        uid: &str,
        history: &[AnnotatedMessage],
        memory: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<(Option<WeeklyPlan>, String)>;
}

pub struct PlanService {
    store: Arc<ChatStore>,
}

impl PlanService {
    pub fn new(store: Arc<ChatStore>) -> Self {
        Self { store }
    }

    pub fn active_plan(&self, uid: &str, now: DateTime<Utc>, tz: &Tz) -> Result<Option<PlanRecord>> {
        let today = now.with_timezone(tz).date_naive();
        self.store.active_plan_for_date(uid, today)
    }

    pub fn save_generated(
        &self,
        uid: &str,
        chat_state: &str,
        plan: WeeklyPlan,
        revision_message: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<PlanRecord> {
        let record = PlanRecord {
            plan_id: Uuid::new_v4().to_string(),
            uid: uid.to_string(),
            chat_state: chat_state.to_string(),
            start_date,
            end_date,
            plan,
            revision_message: revision_message.to_string(),
            created_at: now,
        };
        self.store.save_plan(&record)?;
        Ok(record)
    }

    /// Adds a workout to the active plan. Fails when no plan is active or
    /// the workout type is unknown.
    pub fn add_workout(
        &self,
        uid: &str,
        args: AddWorkoutArgs,
        now: DateTime<Utc>,
        tz: &Tz,
    ) -> Result<(PlanRecord, String)> {
        let day = normalize_day(&args.day)?;
        let workout_type = normalize_workout_type(&args.workout_type)?;
        NaiveTime::parse_from_str(&args.time_start, "%H:%M")
            .with_context(|| format!("Invalid start time '{}'", args.time_start))?;

        let mut record = self
            .active_plan(uid, now, tz)?
            .context("No active weekly plan to add a workout to")?;

        record.plan.workouts_by_day.entry(day.clone()).or_default().push(Workout {
            id: Uuid::new_v4().to_string(),
            workout_type: workout_type.clone(),
            time_start: args.time_start.clone(),
            duration_min: args.duration_min,
            intensity: args.intensity,
            location: args.location,
            completed: false,
        });
        let message = format!("Added {} on {} at {}.", workout_type, day, args.time_start);
        record.revision_message = message.clone();
        record.created_at = now;
        self.store.save_plan(&record)?;
        Ok((record, message))
    }

    /// Removes a workout from the active plan, matching day + type and the
    /// start time when given. A workout starting within the next 24 hours is
    /// locked.
    pub fn delete_workout(
        &self,
        uid: &str,
        args: DeleteWorkoutArgs,
        now: DateTime<Utc>,
        tz: &Tz,
    ) -> Result<(PlanRecord, String)> {
        let day = normalize_day(&args.day)?;
        let workout_type = normalize_workout_type(&args.workout_type)?;

        let mut record = self
            .active_plan(uid, now, tz)?
            .context("No active weekly plan to delete a workout from")?;

        let workouts = record
            .plan
            .workouts_by_day
            .get_mut(&day)
            .with_context(|| format!("No workouts scheduled on {}", day))?;

        let position = workouts
            .iter()
            .position(|w| {
                w.workout_type == workout_type
                    && args
                        .time_start
                        .as_deref()
                        .map(|t| t == w.time_start)
                        .unwrap_or(true)
            })
            .with_context(|| format!("No {} workout found on {}", workout_type, day))?;

        let starts_at = workout_start(
            record.start_date,
            record.end_date,
            &day,
            &workouts[position].time_start,
            tz,
        )?;
        if let Some(starts_at) = starts_at {
            let lead = starts_at - now;
            if lead > Duration::zero() && lead <= Duration::hours(DELETE_LOCK_HOURS) {
                bail!(
                    "The {} on {} starts within 24 hours and can no longer be removed",
                    workout_type,
                    day
                );
            }
        }

        workouts.remove(position);
        if workouts.is_empty() {
            record.plan.workouts_by_day.remove(&day);
        }
        let message = format!("Removed {} on {}.", workout_type, day);
        record.revision_message = message.clone();
        record.created_at = now;
        self.store.save_plan(&record)?;
        Ok((record, message))
    }

    /// Text block for system prompts: recent plans, newest first.
    pub fn plan_history_text(&self, uid: &str) -> Result<String> {
        let records = self.store.plan_history(uid, 4)?;
        let blocks = records
            .iter()
            .map(|record| {
                let mut block = format!(
                    "Week {} to {} ({} workouts)",
                    record.start_date,
                    record.end_date,
                    record.plan.total_workouts()
                );
                if !record.revision_message.is_empty() {
                    block.push_str(&format!(", last change: {}", record.revision_message));
                }
                block.push('\n');
                block.push_str(&record.plan.describe());
                block
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(blocks)
    }

    pub fn ambient_history_text(&self, uid: &str) -> Result<String> {
        Ok(self.store.ambient_entries(uid, 10)?.join("\n"))
    }
}

/// Wire payload rendered by the client's plan widget. The exact key set
/// {message, revision_message, plan} also marks stored tool replies for
/// replay re-typing.
pub fn widget_payload(record: &PlanRecord, message: &str) -> Value {
    json!({
        "message": message,
        "revision_message": record.revision_message,
        "plan": {
            "startDate": record.start_date.to_string(),
            "endDate": record.end_date.to_string(),
            "workoutsByDay": record.plan.workouts_by_day,
        },
    })
}

fn normalize_day(day: &str) -> Result<String> {
    let day = day.trim().to_ascii_lowercase();
    if !DAYS.contains(&day.as_str()) {
        bail!("Unknown day '{}'", day);
    }
    Ok(day)
}

fn normalize_workout_type(workout_type: &str) -> Result<String> {
    let workout_type = workout_type.trim().to_ascii_lowercase();
    if !VALID_WORKOUT_TYPES.contains(&workout_type.as_str()) {
        bail!(
            "Unknown workout type '{}'. Valid types: {}",
            workout_type,
            VALID_WORKOUT_TYPES.join(", ")
        );
    }
    Ok(workout_type)
}

fn weekday_for(day: &str) -> Weekday {
    match day {
        "monday" => Weekday::Mon,
        "tuesday" => Weekday::Tue,
        "wednesday" => Weekday::Wed,
        "thursday" => Weekday::Thu,
        "friday" => Weekday::Fri,
        "saturday" => Weekday::Sat,
        _ => Weekday::Sun,
    }
}

/// Local start datetime of a workout within the plan week, if the named day
/// falls inside the plan's date range.
fn workout_start(
    plan_start: NaiveDate,
    plan_end: NaiveDate,
    day: &str,
    time_start: &str,
    tz: &Tz,
) -> Result<Option<DateTime<Utc>>> {
    let weekday = weekday_for(day);
    let mut date = plan_start;
    while date <= plan_end {
        if date.weekday() == weekday {
            let time = NaiveTime::parse_from_str(time_start, "%H:%M")
                .with_context(|| format!("Invalid start time '{}'", time_start))?;
            let local = tz
                .from_local_datetime(&date.and_time(time))
                .earliest()
                .with_context(|| format!("Nonexistent local time {} {}", date, time_start))?;
            return Ok(Some(local.with_timezone(&Utc)));
        }
        date += Duration::days(1);
    }
    Ok(None)
}

/// Plan generation over the structured-output API.
pub struct LlmPlanGenerator {
    llm: Arc<dyn LlmClient>,
}

#[derive(Debug, Deserialize)]
struct RawGeneratedPlan {
    message: String,
    days: Vec<RawGeneratedDay>,
}

#[derive(Debug, Deserialize)]
struct RawGeneratedDay {
    day: String,
    workouts: Vec<RawGeneratedWorkout>,
}

#[derive(Debug, Deserialize)]
struct RawGeneratedWorkout {
    #[serde(rename = "type")]
    workout_type: String,
    time_start: String,
    duration_min: u32,
    intensity: String,
}

impl LlmPlanGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn plan_schema() -> Value {
        object_schema(json!({
            "message": {"type": "string"},
            "days": {
                "type": "array",
                "items": object_schema(json!({
                    "day": {"type": "string", "enum": DAYS},
                    "workouts": {
                        "type": "array",
                        "items": object_schema(json!({
                            "type": {"type": "string", "enum": VALID_WORKOUT_TYPES},
                            "time_start": {"type": "string"},
                            "duration_min": {"type": "integer"},
                            "intensity": {"type": "string", "enum": ["low", "moderate", "high"]},
                        })),
                    },
                })),
            },
        }))
    }
}

#[async_trait]
impl PlanGenerator for LlmPlanGenerator {
    async fn generate_plan(
        &self,
        uid: &str,
        history: &[AnnotatedMessage],
        memory: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<(Option<WeeklyPlan>, String)> {
        tracing::debug!("Generating weekly plan for {}", uid);

        let instructions = format!(
            "{}\n\nBuild a weekly activity plan for the week {} to {} based on \
             what the user agreed to in the conversation below. Only schedule \
             workouts the user actually committed to. If the conversation does \
             not contain an agreed goal yet, return an empty day list and say \
             what is still missing.",
            prompts::PERSONA,
            start_date,
            end_date
        );
        let mut context = prompts::render_history(history);
        if !memory.is_empty() {
            context = format!("Previous conversations:\n{}\n\n{}", memory, context);
        }

        let raw: RawGeneratedPlan = llm::structured(
            self.llm.as_ref(),
            vec![system_message(instructions), user_message(context)],
            "weekly_plan",
            Self::plan_schema(),
        )
        .await?;

        if raw.days.iter().all(|day| day.workouts.is_empty()) {
            return Ok((None, raw.message));
        }

        let mut plan = WeeklyPlan::default();
        for raw_day in raw.days {
            let day = normalize_day(&raw_day.day)?;
            for workout in raw_day.workouts {
                plan.workouts_by_day.entry(day.clone()).or_default().push(Workout {
                    id: Uuid::new_v4().to_string(),
                    workout_type: normalize_workout_type(&workout.workout_type)?,
                    time_start: workout.time_start,
                    duration_min: workout.duration_min,
                    intensity: workout.intensity,
                    location: None,
                    completed: false,
                });
            }
        }
        Ok((Some(plan), raw.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn service() -> (PlanService, Arc<ChatStore>) {
        let store = Arc::new(ChatStore::in_memory().unwrap());
        store.ensure_user("u1").unwrap();
        (PlanService::new(Arc::clone(&store)), store)
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    fn monday_week() -> (NaiveDate, NaiveDate) {
        // 2026-03-02 is a Monday.
        ("2026-03-02".parse().unwrap(), "2026-03-08".parse().unwrap())
    }

    fn seeded_plan(service: &PlanService, now: DateTime<Utc>) -> PlanRecord {
        let (start, end) = monday_week();
        let mut plan = WeeklyPlan::default();
        plan.workouts_by_day.insert(
            "friday".to_string(),
            vec![Workout {
                id: "w1".to_string(),
                workout_type: "running".to_string(),
                time_start: "07:00".to_string(),
                duration_min: 30,
                intensity: "moderate".to_string(),
                location: None,
                completed: false,
            }],
        );
        service
            .save_generated("u1", "onboarding", plan, "first plan", start, end, now)
            .unwrap()
    }

    #[test]
    fn add_workout_rejects_unknown_types() {
        let (service, _store) = service();
        let now = utc(2026, 3, 2, 9);
        seeded_plan(&service, now);

        let err = service
            .add_workout(
                "u1",
                AddWorkoutArgs {
                    day: "tuesday".to_string(),
                    workout_type: "base jumping".to_string(),
                    time_start: "07:00".to_string(),
                    duration_min: 30,
                    intensity: "high".to_string(),
                    location: None,
                },
                now,
                &chrono_tz::UTC,
            )
            .unwrap_err();
        assert!(err.to_string().contains("Unknown workout type"));
    }

    #[test]
    fn add_workout_appends_to_the_active_plan() {
        let (service, store) = service();
        let now = utc(2026, 3, 2, 9);
        seeded_plan(&service, now);

        let (record, message) = service
            .add_workout(
                "u1",
                AddWorkoutArgs {
                    day: "Wednesday".to_string(),
                    workout_type: "Yoga".to_string(),
                    time_start: "18:30".to_string(),
                    duration_min: 45,
                    intensity: "low".to_string(),
                    location: Some("home".to_string()),
                },
                now,
                &chrono_tz::UTC,
            )
            .unwrap();
        assert!(message.contains("yoga"));
        assert_eq!(record.plan.total_workouts(), 2);

        let active = store
            .active_plan_for_date("u1", "2026-03-04".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(active.plan.workouts_by_day["wednesday"].len(), 1);
    }

    #[test]
    fn delete_refuses_workouts_starting_within_24_hours() {
        let (service, _store) = service();
        // Thursday 10:00 UTC; the Friday 07:00 run starts in 21 hours.
        let now = utc(2026, 3, 5, 10);
        seeded_plan(&service, now);

        let err = service
            .delete_workout(
                "u1",
                DeleteWorkoutArgs {
                    day: "friday".to_string(),
                    workout_type: "running".to_string(),
                    time_start: None,
                },
                now,
                &chrono_tz::UTC,
            )
            .unwrap_err();
        assert!(err.to_string().contains("within 24 hours"));
    }

    #[test]
    fn delete_removes_a_workout_with_enough_lead_time() {
        let (service, _store) = service();
        // Monday 09:00; Friday 07:00 is days away.
        let now = utc(2026, 3, 2, 9);
        seeded_plan(&service, now);

        let (record, message) = service
            .delete_workout(
                "u1",
                DeleteWorkoutArgs {
                    day: "friday".to_string(),
                    workout_type: "running".to_string(),
                    time_start: Some("07:00".to_string()),
                },
                now,
                &chrono_tz::UTC,
            )
            .unwrap();
        assert!(message.contains("Removed"));
        assert_eq!(record.plan.total_workouts(), 0);
    }

    #[test]
    fn widget_payload_carries_the_replay_marker_keys() {
        let (service, _store) = service();
        let now = utc(2026, 3, 2, 9);
        let record = seeded_plan(&service, now);
        let payload = widget_payload(&record, "Here is your plan!");
        let keys: Vec<&str> = payload.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["message", "plan", "revision_message"]);
        assert_eq!(payload["plan"]["startDate"], json!("2026-03-02"));
    }

    #[test]
    fn plan_history_text_mentions_revisions() {
        let (service, _store) = service();
        let now = utc(2026, 3, 2, 9);
        seeded_plan(&service, now);
        let text = service.plan_history_text("u1").unwrap();
        assert!(text.contains("2026-03-02"));
        assert!(text.contains("first plan"));
        assert!(text.contains("running at 07:00"));
    }
}
