// ═══════════════════════════════════════════════════════════════════
// Integration Tests: HabitLedger facade end to end
// ═══════════════════════════════════════════════════════════════════

use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc, Weekday};

use habit_ledger_core::clock::FixedClock;
use habit_ledger_core::errors::CoreError;
use habit_ledger_core::models::event::{Event, EventPatch};
use habit_ledger_core::models::export::{ExportDocument, ExportedEvent, ExportedPrice};
use habit_ledger_core::models::ledger::Ledger;
use habit_ledger_core::models::period::{DateRange, Granularity};
use habit_ledger_core::models::price::PriceConfig;
use habit_ledger_core::models::settings::Settings;
use habit_ledger_core::models::stats::StreakRule;
use habit_ledger_core::services::cache_service::{CancelToken, SubscriptionId};
use habit_ledger_core::storage::backend::MemoryBackend;
use habit_ledger_core::storage::manager::SnapshotManager;
use habit_ledger_core::HabitLedger;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn at(y: i32, m: u32, day: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, day, h, min, 0).unwrap()
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// Empty UTC ledger whose "now" is `now`.
fn ledger_at(now: DateTime<Utc>) -> (HabitLedger, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::new(now));
    (HabitLedger::with_clock(clock.clone()), clock)
}

/// Scenario A data: three events around a single 12.00 / 20 price.
fn scenario_a() -> HabitLedger {
    let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
    ledger.add_price(12.0, 20, "USD", at(2024, 1, 1, 0, 0)).unwrap();
    ledger.append_event(at(2024, 2, 1, 8, 0), None).unwrap();
    ledger.append_event(at(2024, 2, 1, 20, 0), None).unwrap();
    ledger.append_event(at(2024, 2, 2, 9, 0), None).unwrap();
    ledger
}

// ═══════════════════════════════════════════════════════════════════
// Scenarios
// ═══════════════════════════════════════════════════════════════════

mod scenarios {
    use super::*;

    #[test]
    fn scenario_a_single_day_bucket() {
        let ledger = scenario_a();
        let bucket = ledger.get_bucket(d(2024, 2, 1));
        assert_eq!(bucket.count, 2);
        assert!(approx(bucket.cost, 1.20));
        assert!(!bucket.cost_undefined);
    }

    #[test]
    fn scenario_b_price_change_is_not_retroactive() {
        let ledger = scenario_a();
        // Warm the cache before the change lands
        let _ = ledger.get_bucket(d(2024, 2, 1));
        let _ = ledger.get_bucket(d(2024, 2, 2));

        ledger.add_price(14.0, 20, "USD", at(2024, 2, 2, 0, 0)).unwrap();

        let feb1 = ledger.get_bucket(d(2024, 2, 1));
        let feb2 = ledger.get_bucket(d(2024, 2, 2));
        assert!(approx(feb1.cost, 1.20));
        assert!(approx(feb2.cost, 0.70));

        let range = DateRange::new(d(2024, 2, 1), d(2024, 2, 3)).unwrap();
        let stats = ledger.get_period_stats(range, Granularity::Day).unwrap();
        assert!(approx(stats.total_cost, 1.90));
    }

    #[test]
    fn scenario_c_week_crossing_month_is_one_period() {
        let ledger = scenario_a();
        let stats = ledger.get_stats_for(d(2024, 2, 1), Granularity::Week).unwrap();

        assert_eq!(stats.range, DateRange::new(d(2024, 1, 29), d(2024, 2, 5)).unwrap());
        assert_eq!(stats.breakdown.len(), 1);
        assert_eq!(stats.breakdown[0].range.num_days(), 7);
        assert_eq!(stats.total_count, 3);
    }

    #[test]
    fn scenario_d_zero_previous_has_no_percent() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        for day in 1..=5 {
            ledger.append_event(at(2024, 2, day, 9, 0), None).unwrap();
        }

        let result = ledger
            .compare_with_previous(DateRange::month_containing(d(2024, 2, 1)), Granularity::Month)
            .unwrap();
        assert_eq!(result.current.total_count, 5);
        assert_eq!(result.previous.total_count, 0);
        assert_eq!(result.previous.range, DateRange::month_containing(d(2024, 1, 1)));
        assert_eq!(result.comparison.delta_count, 5);
        assert!(result.comparison.percent_change.is_none());
    }

    #[test]
    fn empty_and_future_ranges_are_zeroed() {
        let ledger = scenario_a();
        let empty = DateRange::new(d(2024, 2, 1), d(2024, 2, 1)).unwrap();
        let future = DateRange::month_containing(d(2025, 1, 1));

        for range in [empty, future] {
            let stats = ledger.get_period_stats(range, Granularity::Day).unwrap();
            assert_eq!(stats.total_count, 0);
            assert_eq!(stats.total_cost, 0.0);
            assert!(stats.peak_day.is_none());
        }
    }

    #[test]
    fn events_before_any_price_flag_cost_undefined() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        ledger.append_event(at(2024, 2, 1, 8, 0), None).unwrap();
        let stats = ledger
            .get_period_stats(DateRange::month_containing(d(2024, 2, 1)), Granularity::Month)
            .unwrap();

        assert_eq!(stats.total_count, 1);
        assert_eq!(stats.total_cost, 0.0);
        assert!(stats.cost_undefined);
        assert!(stats.currency.is_none());
    }

    #[test]
    fn peak_day_and_first_last_event() {
        let ledger = scenario_a();
        let stats = ledger
            .get_period_stats(DateRange::month_containing(d(2024, 2, 1)), Granularity::Week)
            .unwrap();

        assert_eq!(stats.peak_day.as_ref().map(|b| b.date), Some(d(2024, 2, 1)));
        assert_eq!(stats.first_event_at, Some(at(2024, 2, 1, 8, 0)));
        assert_eq!(stats.last_event_at, Some(at(2024, 2, 2, 9, 0)));
        assert_eq!(stats.elapsed_days, 29);
    }

    #[test]
    fn century_cap_on_stats_range() {
        let ledger = scenario_a();
        let err = ledger.get_period_stats(DateRange::all(), Granularity::Month).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "range"));
    }

    #[test]
    fn comparison_at_first_representable_day() {
        let ledger = scenario_a();
        let range = DateRange::new(NaiveDate::MIN, NaiveDate::MIN.succ_opt().unwrap()).unwrap();

        let result = ledger.compare_with_previous(range, Granularity::Week).unwrap();
        assert_eq!(result.current.total_count, 0);
        assert_eq!(result.current.breakdown.len(), 1);
        assert!(result.previous.range.is_empty());
        assert_eq!(result.comparison.percent_change, None);
    }
}

// ═══════════════════════════════════════════════════════════════════
// Mutations & cache invalidation
// ═══════════════════════════════════════════════════════════════════

mod mutations {
    use super::*;

    #[test]
    fn append_after_cached_read_is_visible() {
        let ledger = scenario_a();
        assert_eq!(ledger.get_bucket(d(2024, 2, 1)).count, 2);
        ledger.append_event(at(2024, 2, 1, 22, 0), None).unwrap();
        assert_eq!(ledger.get_bucket(d(2024, 2, 1)).count, 3);
    }

    #[test]
    fn update_across_days_refreshes_both() {
        let ledger = scenario_a();
        let range = DateRange::new(d(2024, 2, 1), d(2024, 2, 4)).unwrap();
        let _ = ledger.get_buckets(range).unwrap();

        let first = ledger.query_events(at(2024, 2, 1, 0, 0), at(2024, 2, 2, 0, 0))[0].clone();
        ledger
            .update_event(first.id, EventPatch::occurred_at(at(2024, 2, 3, 8, 0)))
            .unwrap();

        let counts: Vec<u32> = ledger.get_buckets(range).unwrap().iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![1, 1, 1]);
    }

    #[test]
    fn delete_then_readd_restores_bucket_exactly() {
        let ledger = scenario_a();
        let before = ledger.get_bucket(d(2024, 2, 1));

        let victim = ledger.events_on(d(2024, 2, 1))[1].clone();
        ledger.delete_event(victim.id).unwrap();
        assert_eq!(ledger.get_bucket(d(2024, 2, 1)).count, 1);

        ledger.append_event(victim.occurred_at, victim.note.clone()).unwrap();
        assert_eq!(ledger.get_bucket(d(2024, 2, 1)), before);
    }

    #[test]
    fn future_event_rejected_with_field() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let err = ledger.append_event(at(2024, 3, 2, 0, 0), None).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "occurred_at"));
        assert_eq!(ledger.event_count(), 0);
    }

    #[test]
    fn log_now_uses_clock() {
        let (ledger, clock) = ledger_at(at(2024, 3, 1, 12, 0));
        clock.advance(Duration::hours(2));
        let event = ledger.log_now(Some("on a walk".into())).unwrap();
        assert_eq!(event.occurred_at, at(2024, 3, 1, 14, 0));
        assert_eq!(ledger.get_event(event.id).unwrap().note.as_deref(), Some("on a walk"));
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let ledger = scenario_a();
        let id = uuid::Uuid::new_v4();
        assert!(matches!(ledger.delete_event(id), Err(CoreError::NotFound { .. })));
        assert!(matches!(ledger.get_price_config(id), Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn price_config_lookup_and_resolution() {
        let ledger = scenario_a();
        let config = ledger.add_price(14.0, 20, "usd", at(2024, 2, 2, 0, 0)).unwrap();
        assert_eq!(ledger.get_price_config(config.id).unwrap().currency, "USD");
        assert_eq!(
            ledger.resolve_price_at(at(2024, 2, 5, 0, 0)).map(|c| c.id),
            Some(config.id)
        );
        assert!(ledger.resolve_price_at(at(2023, 6, 1, 0, 0)).is_none());
        assert_eq!(ledger.price_timeline().len(), 2);
    }

    #[test]
    fn second_currency_rejected() {
        let ledger = scenario_a();
        let err = ledger.add_price(50.0, 20, "PLN", at(2024, 2, 10, 0, 0)).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "currency"));
        assert_eq!(ledger.price_timeline().len(), 1);
    }

    #[test]
    fn opened_over_backend() {
        let clock = Arc::new(FixedClock::new(at(2024, 3, 1, 0, 0)));
        let backend = MemoryBackend::with_events(vec![
            Event::new(at(2024, 2, 2, 8, 0)),
            Event::new(at(2024, 2, 1, 8, 0)),
        ]);
        let ledger = HabitLedger::open(Box::new(backend), Settings::default(), clock).unwrap();
        assert_eq!(ledger.event_count(), 2);
        assert_eq!(ledger.get_bucket(d(2024, 2, 1)).count, 1);
    }
}

// ═══════════════════════════════════════════════════════════════════
// Subscriptions
// ═══════════════════════════════════════════════════════════════════

mod subscriptions {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn recorder(ledger: &HabitLedger, range: DateRange) -> (Arc<Mutex<Vec<DateRange>>>, SubscriptionId) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = ledger.on_invalidated(range, move |r| sink.lock().unwrap().push(r));
        (seen, id)
    }

    #[test]
    fn append_notifies_only_its_day() {
        let ledger = scenario_a();
        let (feb, _) = recorder(&ledger, DateRange::month_containing(d(2024, 2, 1)));
        let (jan, _) = recorder(&ledger, DateRange::month_containing(d(2024, 1, 1)));

        ledger.append_event(at(2024, 2, 10, 9, 0), None).unwrap();

        assert_eq!(*feb.lock().unwrap(), vec![DateRange::day(d(2024, 2, 10))]);
        assert!(jan.lock().unwrap().is_empty());
    }

    #[test]
    fn price_change_notifies_until_next_config() {
        let ledger = scenario_a();
        ledger.add_price(14.0, 20, "USD", at(2024, 3, 1, 0, 0)).unwrap();
        let (seen, _) = recorder(&ledger, DateRange::all());

        ledger.add_price(13.0, 20, "USD", at(2024, 2, 10, 0, 0)).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![DateRange::new(d(2024, 2, 10), d(2024, 3, 2)).unwrap()]
        );
    }

    #[test]
    fn unsubscribed_callback_is_silent() {
        let ledger = scenario_a();
        let (seen, id) = recorder(&ledger, DateRange::all());
        assert!(ledger.unsubscribe(id));
        ledger.append_event(at(2024, 2, 10, 9, 0), None).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn callback_may_add_a_price() {
        let ledger = Arc::new(scenario_a());
        let fired = Arc::new(AtomicBool::new(false));
        let (handle, flag) = (Arc::downgrade(&ledger), Arc::clone(&fired));
        ledger.on_invalidated(DateRange::all(), move |_| {
            if !flag.swap(true, Ordering::SeqCst) {
                if let Some(ledger) = handle.upgrade() {
                    ledger.add_price(15.0, 20, "USD", at(2024, 2, 20, 0, 0)).unwrap();
                }
            }
        });

        ledger.add_price(13.0, 20, "USD", at(2024, 2, 10, 0, 0)).unwrap();

        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(ledger.price_timeline().len(), 3);
        assert!(approx(ledger.resolve_price_at(at(2024, 2, 25, 0, 0)).unwrap().amount_per_bundle, 15.0));
    }

    #[test]
    fn callback_may_add_a_price_during_import() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let ledger = Arc::new(ledger);
        let fired = Arc::new(AtomicBool::new(false));
        let (handle, flag) = (Arc::downgrade(&ledger), Arc::clone(&fired));
        ledger.on_invalidated(DateRange::all(), move |_| {
            if !flag.swap(true, Ordering::SeqCst) {
                if let Some(ledger) = handle.upgrade() {
                    ledger.add_price(15.0, 20, "USD", at(2024, 2, 20, 0, 0)).unwrap();
                }
            }
        });

        let doc = ExportDocument {
            events: vec![ExportedEvent {
                id: uuid::Uuid::new_v4().to_string(),
                occurred_at: "2024-02-01T08:00:00Z".into(),
                note: None,
            }],
            price_history: vec![ExportedPrice {
                effective_from: "2024-01-01T00:00:00Z".into(),
                amount_per_bundle: 12.0,
                units_per_bundle: 20,
                currency: "USD".into(),
            }],
        };
        let summary = ledger.import_document(doc).unwrap();

        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(summary.events, 1);
        assert_eq!(ledger.event_count(), 1);
        assert_eq!(ledger.price_timeline().len(), 2);
        assert!(approx(ledger.get_bucket(d(2024, 2, 1)).cost, 0.6));
    }

    #[test]
    fn settings_change_notifies_everyone() {
        let ledger = scenario_a();
        let feb = DateRange::month_containing(d(2024, 2, 1));
        let (seen, _) = recorder(&ledger, feb);

        let settings = Settings {
            timezone: "Europe/Warsaw".into(),
            ..Settings::default()
        };
        ledger.set_settings(settings).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![feb]);
    }
}

// ═══════════════════════════════════════════════════════════════════
// Settings
// ═══════════════════════════════════════════════════════════════════

mod settings {
    use super::*;

    #[test]
    fn time_zone_change_moves_events_between_days() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        ledger.append_event(at(2024, 2, 1, 23, 30), None).unwrap();
        assert_eq!(ledger.get_bucket(d(2024, 2, 1)).count, 1);

        ledger
            .set_settings(Settings {
                timezone: "Europe/Warsaw".into(),
                ..Settings::default()
            })
            .unwrap();

        assert_eq!(ledger.get_bucket(d(2024, 2, 1)).count, 0);
        assert_eq!(ledger.get_bucket(d(2024, 2, 2)).count, 1);
        assert_eq!(ledger.events_on(d(2024, 2, 2)).len(), 1);
    }

    #[test]
    fn invalid_settings_leave_old_ones() {
        let ledger = scenario_a();
        let err = ledger
            .set_settings(Settings {
                timezone: "Nowhere/Special".into(),
                ..Settings::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert_eq!(ledger.get_settings(), Settings::default());
    }

    #[test]
    fn sunday_week_start() {
        let ledger = scenario_a();
        ledger
            .set_settings(Settings {
                week_start: Weekday::Sun,
                ..Settings::default()
            })
            .unwrap();
        let stats = ledger.get_stats_for(d(2024, 2, 1), Granularity::Week).unwrap();
        assert_eq!(stats.range.start, d(2024, 1, 28));
    }
}

// ═══════════════════════════════════════════════════════════════════
// Streaks
// ═══════════════════════════════════════════════════════════════════

mod streaks {
    use super::*;

    #[test]
    fn five_days_then_a_miss() {
        let (ledger, clock) = ledger_at(at(2024, 2, 5, 21, 0));
        for day in 1..=5 {
            ledger.append_event(at(2024, 2, day, 9, 0), None).unwrap();
        }

        let streak = ledger.compute_streak(StreakRule::AtLeastOneEvent);
        assert_eq!(streak.current_length, 5);
        assert_eq!(streak.longest_length, 5);

        clock.advance(Duration::days(1));
        let streak = ledger.compute_streak(StreakRule::AtLeastOneEvent);
        assert_eq!(streak.current_length, 0);
        assert_eq!(streak.longest_length, 5);
        assert_eq!(streak.broken_at, Some(d(2024, 2, 6)));
    }

    #[test]
    fn tracking_since_extends_history() {
        let (ledger, _clock) = ledger_at(at(2024, 2, 5, 21, 0));
        ledger
            .set_settings(Settings {
                tracking_since: Some(d(2024, 1, 30)),
                ..Settings::default()
            })
            .unwrap();
        for day in 1..=5 {
            ledger.append_event(at(2024, 2, day, 9, 0), None).unwrap();
        }

        let abstinence = ledger.compute_streak(StreakRule::abstinence());
        assert_eq!(abstinence.current_length, 0);
        assert_eq!(abstinence.longest_length, 2);
        assert_eq!(abstinence.longest_started_on, Some(d(2024, 1, 30)));
    }

    #[test]
    fn empty_ledger_has_no_logging_streak() {
        let (ledger, _clock) = ledger_at(at(2024, 2, 5, 21, 0));
        let streak = ledger.compute_streak(StreakRule::AtLeastOneEvent);
        assert_eq!(streak.current_length, 0);
        assert_eq!(streak.longest_length, 0);
    }

    #[test]
    fn daily_limit_goal() {
        let (ledger, _clock) = ledger_at(at(2024, 2, 3, 21, 0));
        for (day, n) in [(1, 4), (2, 2), (3, 1)] {
            for h in 0..n {
                ledger.append_event(at(2024, 2, day, 8 + h, 0), None).unwrap();
            }
        }
        let streak = ledger.compute_streak(StreakRule::WithinDailyLimit { max_events: 2 });
        assert_eq!(streak.current_length, 2);
        assert_eq!(streak.broken_at, Some(d(2024, 2, 1)));
    }
}

// ═══════════════════════════════════════════════════════════════════
// Export / Import
// ═══════════════════════════════════════════════════════════════════

mod export_import {
    use super::*;

    fn field_of(err: CoreError) -> String {
        match err {
            CoreError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn json_uses_flat_camel_case_schema() {
        let ledger = scenario_a();
        let json = ledger.export_to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["events"].as_array().unwrap().len(), 3);
        assert!(value["events"][0]["occurredAt"].is_string());
        assert_eq!(value["priceHistory"][0]["unitsPerBundle"], 20);
        assert_eq!(value["priceHistory"][0]["currency"], "USD");
    }

    #[test]
    fn export_then_import_reproduces_stats() {
        let source = scenario_a();
        source.add_price(14.0, 20, "USD", at(2024, 2, 2, 0, 0)).unwrap();
        let json = source.export_to_json().unwrap();

        let (target, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let summary = target.import_from_json(&json).unwrap();
        assert_eq!(summary.events, 3);
        assert_eq!(summary.prices, 2);

        let range = DateRange::month_containing(d(2024, 2, 1));
        let a = source.get_period_stats(range, Granularity::Week).unwrap();
        let b = target.get_period_stats(range, Granularity::Week).unwrap();
        assert_eq!(a, b);
        assert_eq!(source.export_document(), target.export_document());
    }

    #[test]
    fn malformed_timestamp_rejects_whole_batch() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let doc = ExportDocument {
            events: vec![
                ExportedEvent {
                    id: uuid::Uuid::new_v4().to_string(),
                    occurred_at: "2024-02-01T08:00:00Z".into(),
                    note: None,
                },
                ExportedEvent {
                    id: uuid::Uuid::new_v4().to_string(),
                    occurred_at: "yesterday".into(),
                    note: None,
                },
            ],
            price_history: vec![],
        };

        assert_eq!(field_of(ledger.import_document(doc).unwrap_err()), "events[1].occurredAt");
        assert_eq!(ledger.event_count(), 0);
    }

    #[test]
    fn invalid_price_rejects_events_too() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let doc = ExportDocument {
            events: vec![ExportedEvent {
                id: uuid::Uuid::new_v4().to_string(),
                occurred_at: "2024-02-01T08:00:00Z".into(),
                note: None,
            }],
            price_history: vec![ExportedPrice {
                effective_from: "2024-01-01T00:00:00Z".into(),
                amount_per_bundle: 12.0,
                units_per_bundle: 0,
                currency: "USD".into(),
            }],
        };

        assert_eq!(
            field_of(ledger.import_document(doc).unwrap_err()),
            "priceHistory[0].unitsPerBundle"
        );
        assert_eq!(ledger.event_count(), 0);
        assert!(ledger.price_timeline().is_empty());
    }

    #[test]
    fn negative_units_rejected() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let json = r#"{
            "events": [],
            "priceHistory": [
                {"effectiveFrom": "2024-01-01T00:00:00Z", "amountPerBundle": 12.0, "unitsPerBundle": -20, "currency": "USD"}
            ]
        }"#;
        assert_eq!(
            field_of(ledger.import_from_json(json).unwrap_err()),
            "priceHistory[0].unitsPerBundle"
        );
    }

    #[test]
    fn duplicate_id_against_existing_rejects_prices_too() {
        let ledger = scenario_a();
        let existing = ledger.events_on(d(2024, 2, 2))[0].clone();
        let doc = ExportDocument {
            events: vec![ExportedEvent {
                id: existing.id.to_string(),
                occurred_at: "2024-02-03T08:00:00Z".into(),
                note: None,
            }],
            price_history: vec![ExportedPrice {
                effective_from: "2024-02-10T00:00:00Z".into(),
                amount_per_bundle: 15.0,
                units_per_bundle: 20,
                currency: "USD".into(),
            }],
        };

        assert_eq!(field_of(ledger.import_document(doc).unwrap_err()), "events[0].id");
        assert_eq!(ledger.event_count(), 3);
        assert_eq!(ledger.price_timeline().len(), 1);
    }

    #[test]
    fn future_record_rejected() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let doc = ExportDocument {
            events: vec![ExportedEvent {
                id: uuid::Uuid::new_v4().to_string(),
                occurred_at: "2030-01-01T00:00:00Z".into(),
                note: None,
            }],
            price_history: vec![],
        };
        assert_eq!(field_of(ledger.import_document(doc).unwrap_err()), "events[0].occurredAt");
    }

    #[test]
    fn not_json_is_deserialization_error() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        assert!(matches!(
            ledger.import_from_json("{\"events\": 4"),
            Err(CoreError::Deserialization(_))
        ));
    }

    #[test]
    fn mistyped_price_field_is_named() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let json = r#"{
            "events": [
                {"id": "6f1c1f4e-2b0a-4a57-9a43-0d1b8f7c2e11", "occurredAt": "2024-02-01T08:00:00Z"}
            ],
            "priceHistory": [
                {"effectiveFrom": "2024-01-01T00:00:00Z", "amountPerBundle": "twelve", "unitsPerBundle": 20, "currency": "USD"}
            ]
        }"#;

        assert_eq!(
            field_of(ledger.import_from_json(json).unwrap_err()),
            "priceHistory[0].amountPerBundle"
        );
        assert_eq!(ledger.event_count(), 0);
        assert!(ledger.price_timeline().is_empty());
    }

    #[test]
    fn missing_event_field_is_named() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let json = r#"{
            "events": [
                {"id": "6f1c1f4e-2b0a-4a57-9a43-0d1b8f7c2e11", "occurredAt": "2024-02-01T08:00:00Z"},
                {"id": "0b7e5f0c-7d64-4c1e-8f0e-3c5a9d2b4a10", "note": "no time"}
            ],
            "priceHistory": []
        }"#;

        assert_eq!(
            field_of(ledger.import_from_json(json).unwrap_err()),
            "events[1].occurredAt"
        );
        assert_eq!(ledger.event_count(), 0);
    }

    #[test]
    fn fractional_units_and_non_object_records_rejected() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let json = r#"{
            "events": [],
            "priceHistory": [
                {"effectiveFrom": "2024-01-01T00:00:00Z", "amountPerBundle": 12.0, "unitsPerBundle": 2.5, "currency": "USD"}
            ]
        }"#;
        assert_eq!(
            field_of(ledger.import_from_json(json).unwrap_err()),
            "priceHistory[0].unitsPerBundle"
        );

        let json = r#"{"events": ["2024-02-01T08:00:00Z"], "priceHistory": []}"#;
        assert_eq!(field_of(ledger.import_from_json(json).unwrap_err()), "events[0]");

        let json = r#"{"events": {}, "priceHistory": []}"#;
        assert_eq!(field_of(ledger.import_from_json(json).unwrap_err()), "events");
    }

    #[test]
    fn missing_lists_import_as_empty() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let summary = ledger.import_from_json(r#"{"priceHistory": []}"#).unwrap();
        assert_eq!(summary.events, 0);
        assert_eq!(summary.prices, 0);
    }

    #[test]
    fn import_invalidates_cached_costs() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        ledger.append_event(at(2024, 2, 1, 8, 0), None).unwrap();
        assert!(ledger.get_bucket(d(2024, 2, 1)).cost_undefined);

        let doc = ExportDocument {
            events: vec![],
            price_history: vec![ExportedPrice {
                effective_from: "2024-01-01T00:00:00Z".into(),
                amount_per_bundle: 12.0,
                units_per_bundle: 20,
                currency: "USD".into(),
            }],
        };
        ledger.import_document(doc).unwrap();

        let bucket = ledger.get_bucket(d(2024, 2, 1));
        assert!(!bucket.cost_undefined);
        assert!(approx(bucket.cost, 0.6));
    }
}

// ═══════════════════════════════════════════════════════════════════
// Snapshots
// ═══════════════════════════════════════════════════════════════════

mod snapshots {
    use super::*;

    #[test]
    fn snapshot_round_trip() {
        let ledger = scenario_a();
        ledger
            .set_settings(Settings {
                week_start: Weekday::Sun,
                ..Settings::default()
            })
            .unwrap();
        let bytes = ledger.save_snapshot().unwrap();

        let clock = Arc::new(FixedClock::new(at(2024, 3, 1, 12, 0)));
        let restored = HabitLedger::open_snapshot(&bytes, clock).unwrap();
        assert_eq!(restored.event_count(), 3);
        assert_eq!(restored.get_settings().week_start, Weekday::Sun);
        assert!(approx(restored.get_bucket(d(2024, 2, 1)).cost, 1.2));
    }

    #[test]
    fn snapshot_file_round_trip() {
        let ledger = scenario_a();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("habits.hblg");
        let path_str = path.to_str().unwrap();

        ledger.save_snapshot_file(path_str).unwrap();
        let clock = Arc::new(FixedClock::new(at(2024, 3, 1, 12, 0)));
        let restored = HabitLedger::open_snapshot_file(path_str, clock).unwrap();
        assert_eq!(restored.export_document(), ledger.export_document());
    }

    #[test]
    fn unreadable_snapshot_is_fatal() {
        let clock = Arc::new(FixedClock::new(at(2024, 3, 1, 12, 0)));
        let err = HabitLedger::open_snapshot(b"HBLG\x01\x00garbage", clock).unwrap_err();
        assert!(err.is_fatal());
        assert!(!err.is_retriable());
    }

    #[test]
    fn duplicate_ids_in_snapshot_are_corrupt() {
        let event = Event::new(at(2024, 2, 1, 8, 0));
        let ledger = Ledger {
            events: vec![event.clone(), event],
            ..Ledger::default()
        };
        let bytes = SnapshotManager::save_to_bytes(&ledger).unwrap();

        let clock = Arc::new(FixedClock::new(at(2024, 3, 1, 12, 0)));
        let err = HabitLedger::open_snapshot(&bytes, clock).unwrap_err();
        assert!(matches!(err, CoreError::CorruptStore(_)));
    }

    #[test]
    fn invalid_price_in_snapshot_is_corrupt() {
        let mut price = PriceConfig::new(12.0, 20, "USD", at(2024, 1, 1, 0, 0)).unwrap();
        price.units_per_bundle = 0;
        let ledger = Ledger {
            prices: vec![price],
            ..Ledger::default()
        };
        let bytes = SnapshotManager::save_to_bytes(&ledger).unwrap();

        let clock = Arc::new(FixedClock::new(at(2024, 3, 1, 12, 0)));
        assert!(matches!(
            HabitLedger::open_snapshot(&bytes, clock),
            Err(CoreError::CorruptStore(_))
        ));
    }
}

// ═══════════════════════════════════════════════════════════════════
// Cancellation & concurrency
// ═══════════════════════════════════════════════════════════════════

mod concurrency {
    use super::*;
    use habit_ledger_core::clock::Clock;

    type Hook = Box<dyn FnOnce() + Send>;

    /// Fixed clock that runs a one-off action the next time it is read.
    /// Stats reads consult the clock after taking their snapshot, so the
    /// action lands inside that read.
    struct HookClock {
        now: DateTime<Utc>,
        hook: Mutex<Option<Hook>>,
    }

    impl HookClock {
        fn new(now: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                now,
                hook: Mutex::new(None),
            })
        }

        fn arm(&self, action: impl FnOnce() + Send + 'static) {
            *self.hook.lock().unwrap() = Some(Box::new(action));
        }
    }

    impl Clock for HookClock {
        fn now(&self) -> DateTime<Utc> {
            let hook = self.hook.lock().unwrap().take();
            if let Some(action) = hook {
                action();
            }
            self.now
        }
    }

    fn hooked_ledger() -> (Arc<HabitLedger>, Arc<HookClock>) {
        let clock = HookClock::new(at(2024, 3, 1, 12, 0));
        let ledger = Arc::new(HabitLedger::with_clock(clock.clone()));
        ledger.add_price(12.0, 20, "USD", at(2024, 1, 1, 0, 0)).unwrap();
        ledger.append_event(at(2024, 2, 1, 8, 0), None).unwrap();
        (ledger, clock)
    }

    fn first_week() -> DateRange {
        DateRange::new(d(2024, 2, 1), d(2024, 2, 8)).unwrap()
    }

    #[test]
    fn cancelling_mid_run_commits_nothing() {
        let (ledger, clock) = hooked_ledger();
        ledger.append_event(at(2024, 2, 10, 8, 0), None).unwrap();
        ledger.get_buckets(first_week()).unwrap();
        assert_eq!(ledger.cached_days(), 7);

        // Fires after the run has started: the first week is served from
        // the cache, the first day needing work sees the cancellation
        let token = CancelToken::new();
        let trigger = token.clone();
        clock.arm(move || trigger.cancel());

        let month = DateRange::month_containing(d(2024, 2, 1));
        let err = ledger
            .get_period_stats_cancellable(month, Granularity::Week, &token)
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert_eq!(ledger.cached_days(), 7);

        let stats = ledger.get_period_stats(month, Granularity::Week).unwrap();
        assert_eq!(stats.total_count, 2);
        assert_eq!(ledger.cached_days(), 29);
    }

    #[test]
    fn write_during_warm_read_leaves_no_stale_bucket() {
        let (ledger, clock) = hooked_ledger();
        ledger.get_buckets(first_week()).unwrap();
        assert_eq!(ledger.cached_days(), 7);

        let handle = Arc::downgrade(&ledger);
        clock.arm(move || {
            if let Some(ledger) = handle.upgrade() {
                ledger.append_event(at(2024, 2, 15, 9, 0), None).unwrap();
            }
        });

        // The read saw the log before the append and stays consistent with it
        let month = DateRange::month_containing(d(2024, 2, 1));
        let stats = ledger.get_period_stats(month, Granularity::Week).unwrap();
        assert_eq!(stats.total_count, 1);
        assert_eq!(stats.breakdown.iter().map(|s| s.count).sum::<u64>(), 1);
        assert_eq!(ledger.cached_days(), 7);

        assert_eq!(ledger.get_bucket(d(2024, 2, 15)).count, 1);
        let after = ledger.get_period_stats(month, Granularity::Week).unwrap();
        assert_eq!(after.total_count, 2);
        assert!(approx(after.total_cost, 1.2));
    }

    #[test]
    fn write_during_cold_read_commits_nothing() {
        let (ledger, clock) = hooked_ledger();
        let handle = Arc::downgrade(&ledger);
        clock.arm(move || {
            if let Some(ledger) = handle.upgrade() {
                ledger.append_event(at(2024, 2, 3, 9, 0), None).unwrap();
            }
        });

        let buckets = ledger.get_buckets(first_week()).unwrap();
        assert_eq!(buckets.iter().map(|b| b.count).sum::<u32>(), 1);
        assert_eq!(ledger.cached_days(), 0);

        assert_eq!(ledger.get_bucket(d(2024, 2, 3)).count, 1);
        assert_eq!(ledger.get_buckets(first_week()).unwrap().iter().map(|b| b.count).sum::<u32>(), 2);
    }

    #[test]
    fn cancelled_aggregation_returns_cancelled() {
        let ledger = scenario_a();
        let token = CancelToken::new();
        token.cancel();

        let range = DateRange::month_containing(d(2024, 2, 1));
        let err = ledger
            .get_period_stats_cancellable(range, Granularity::Week, &token)
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));

        let stats = ledger.get_period_stats(range, Granularity::Week).unwrap();
        assert_eq!(stats.total_count, 3);
    }

    #[test]
    fn live_token_completes() {
        let ledger = scenario_a();
        let token = CancelToken::new();
        let stats = ledger
            .get_period_stats_cancellable(DateRange::month_containing(d(2024, 2, 1)), Granularity::Day, &token)
            .unwrap();
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.breakdown.len(), 29);
    }

    #[test]
    fn concurrent_appends_are_all_kept() {
        let (ledger, _clock) = ledger_at(at(2024, 3, 1, 12, 0));
        let ledger = Arc::new(ledger);
        ledger.add_price(12.0, 20, "USD", at(2024, 1, 1, 0, 0)).unwrap();

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for i in 0..50u32 {
                        let day = 1 + (w * 50 + i) % 28;
                        ledger.append_event(at(2024, 2, day, 12, 0), None).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                let range = DateRange::month_containing(d(2024, 2, 1));
                for _ in 0..50 {
                    let stats = ledger.get_period_stats(range, Granularity::Week).unwrap();
                    let sum: u64 = stats.breakdown.iter().map(|s| s.count).sum();
                    assert_eq!(sum, stats.total_count);
                }
            })
        };

        for handle in writers {
            handle.join().unwrap();
        }
        reader.join().unwrap();

        let stats = ledger
            .get_period_stats(DateRange::month_containing(d(2024, 2, 1)), Granularity::Week)
            .unwrap();
        assert_eq!(ledger.event_count(), 400);
        assert_eq!(stats.total_count, 400);
        assert!(approx(stats.total_cost, 400.0 * 0.6));
    }
}
