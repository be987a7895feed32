//! End-to-end pipeline test against a mock simulator: prepare a group,
//! schedule it through the local backend, and assemble combined outputs.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use firestarr::aggregate::Aggregator;
use firestarr::prepare::{self, Scenario};
use firestarr::reconcile::FireGroup;
use firestarr::run::Run;
use firestarr::sched::{Backend, Scheduler, SimTask, TaskOutcome};
use firestarr_fwi::{HourlyWeather, Startup};
use firestarr_geo::raster::{PixelTransform, Raster};
use firestarr_geo::{geotiff, Crs};
use firestarr_sources::types::{FireStatus, StationDaily};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;

fn group(name: &str) -> FireGroup {
    FireGroup {
        name: name.to_string(),
        zone: 15,
        north: true,
        geometry: geo::Geometry::Point(geo::Point::new(-93.0, 52.0)),
        lat: 52.0,
        lon: -93.0,
        area_ha: 25.0,
        status: FireStatus::OutOfControl,
        datetime: None,
        region_id: "ON".to_string(),
        priority: 1,
        duration_days: 3,
        members: vec![name.to_string()],
    }
}

fn station() -> StationDaily {
    StationDaily {
        date: NaiveDate::from_ymd_opt(2024, 6, 14).unwrap(),
        lat: 52.1,
        lon: -93.2,
        ffmc: 88.0,
        dmc: 35.0,
        dc: 250.0,
    }
}

fn hourly_rows(from: NaiveDateTime, hours: usize) -> Vec<HourlyWeather> {
    (0..hours)
        .map(|i| HourlyWeather {
            datetime: from + Duration::hours(i as i64),
            temp: 21.0,
            rh: 40.0,
            ws: 12.0,
            wd: 270.0,
            prec: 0.0,
        })
        .collect()
}

/// Prepare a real group folder, then swap sim.sh for a mock that copies
/// pre-rendered rasters into place.
fn prepare_mock_group(run: &Run, name: &str, template_dir: &Path) -> SimTask {
    let g = group(name);
    let dir = run.group_dir(name);
    let today = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
    let start = today.and_hms_opt(0, 0, 0).unwrap();
    let rows = hourly_rows(start, 73);
    let stream_end = rows.last().unwrap().datetime;

    let spec = prepare::build_spec(&g, &station(), 0.0, -6, None, today, stream_end, false)
        .unwrap();
    let scenarios = vec![Scenario {
        model: "geps".to_string(),
        id: "0".to_string(),
        rows,
    }];
    let startup = Startup {
        ffmc: 88.0,
        dmc: 35.0,
        dc: 250.0,
        apcp_prev: 0.0,
    };
    let indexed = prepare::index_scenarios(scenarios, startup).unwrap();
    prepare::write_group_files(&g, &dir, &spec, &indexed, "tbd").unwrap();

    // the template holds one raster per expected output name
    let mut script = String::from("#!/bin/bash\n");
    for output in spec.expected_outputs() {
        script.push_str(&format!(
            "cp {} {}\n",
            template_dir.join(&output).display(),
            output
        ));
    }
    fs::write(dir.join("sim.sh"), script).unwrap();

    SimTask {
        fire_name: name.to_string(),
        dir,
        priority: g.priority,
        region_id: g.region_id,
        duration_days: g.duration_days,
        area_ha: g.area_ha,
    }
}

fn render_templates(template_dir: &Path, dates: &[&str]) {
    fs::create_dir_all(template_dir).unwrap();
    for (i, date) in dates.iter().enumerate() {
        let mut raster = Raster::filled(
            12,
            12,
            0.0,
            PixelTransform {
                origin_x: 630_000.0,
                origin_y: 5_770_000.0,
                pixel_width: 100.0,
                pixel_height: 100.0,
            },
            Crs::Utm {
                zone: 15,
                north: true,
            },
        );
        for row in 4..8 {
            for col in 4..8 {
                raster.set(col, row, 0.5 + 0.1 * i as f32);
            }
        }
        geotiff::write_raster(
            &template_dir.join(format!("probability_{date}.tif")),
            &raster,
        )
        .unwrap();
    }
}

fn scheduler() -> Scheduler {
    Scheduler::new(
        Backend::Local {
            permits: Arc::new(Semaphore::new(2)),
        },
        3,
        false,
    )
}

#[tokio::test]
async fn test_full_local_run_produces_combined_outputs() {
    let base = tempfile::tempdir().unwrap();
    let run = Run::create(base.path(), "m3", 14).unwrap();
    let template_dir = base.path().join("template");
    render_templates(&template_dir, &["2024-06-16", "2024-06-17"]);

    let task = prepare_mock_group(&run, "15N_63577", &template_dir);
    assert!(task.dir.join("15N_63577_wx.csv").exists());
    assert!(task.dir.join("firestarr_15N_63577.geojson").exists());

    let results = scheduler()
        .run_all(vec![task], |finished| {
            let aggregator = Aggregator::new(&run);
            for result in finished {
                if result.outcome != TaskOutcome::Failed {
                    aggregator.collect_group(&result.task.fire_name, &result.task.dir)?;
                }
            }
            aggregator.merge_all()?;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, TaskOutcome::Done);

    let aggregator = Aggregator::new(&run);
    let combined = aggregator.merge_all().unwrap();
    assert_eq!(combined.len(), 2);
    let first = geotiff::read_raster(&combined[0]).unwrap();
    assert_eq!(first.crs, Crs::LambertCanada);
    assert!(first.data.iter().any(|v| *v > 0.4));

    let zip_path = aggregator.zip_combined().unwrap();
    assert!(zip_path.exists());
    assert!(fs::metadata(&zip_path).unwrap().len() > 0);
}

#[tokio::test]
async fn test_resumed_run_skips_completed_groups() {
    let base = tempfile::tempdir().unwrap();
    let run = Run::create(base.path(), "m3", 14).unwrap();
    let template_dir = base.path().join("template");
    render_templates(&template_dir, &["2024-06-16", "2024-06-17"]);

    let task = prepare_mock_group(&run, "15N_63577", &template_dir);
    let first = scheduler()
        .run_all(vec![task.clone()], |_| Ok(()))
        .await
        .unwrap();
    assert_eq!(first[0].outcome, TaskOutcome::Done);

    // resume: same folder, outputs already on disk
    let reopened = Run::open(&run.dir, 14).unwrap();
    let again = prepare::read_spec(&reopened.group_dir("15N_63577"), "15N_63577").unwrap();
    assert_eq!(again.fire_name, "15N_63577");
    let second = scheduler().run_all(vec![task], |_| Ok(())).await.unwrap();
    assert_eq!(second[0].outcome, TaskOutcome::Skipped);
    assert_eq!(second[0].attempts, 0);
}

#[tokio::test]
async fn test_empty_run_completes_with_empty_combined() {
    let base = tempfile::tempdir().unwrap();
    let run = Run::create(base.path(), "m3", 14).unwrap();

    let results = scheduler().run_all(vec![], |_| Ok(())).await.unwrap();
    assert!(results.is_empty());

    let aggregator = Aggregator::new(&run);
    let combined = aggregator.merge_all().unwrap();
    assert!(combined.is_empty());
    let zip_path = aggregator.zip_combined().unwrap();
    assert!(zip_path.exists());
}
