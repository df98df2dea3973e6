mod common;

use common::SyntheticEvent;
use mop::constants::MICROLENSING;
use mop::coordinator::JobQueueCoordinator;
use mop::fit::{FitParams, ModelFitter};
use mop::harvest::{ingest_events, ingest_series, EventCatalog};
use mop::liveness::is_alive;
use mop::photometry::PhotometrySeries;
use mop::priority::planet_priority;
use mop::scheduler::memory::MemoryScheduler;
use mop::store::memory::MemoryStore;
use mop::store::{DataType, Store};
use mop::strategy::{StrategySelector, TapPolicy, TapSelection};
use mop::target::{ObservingMode, SkyLocation, TimescaleCategory};
use mop::time::{jd_to_mjd, FixedClock};
use mop::visibility::observatories::SiteRegistry;
use mop::visibility::{VisibilityOracle, VisibilityParams};

// bulge season, evening in Chile
const NOW: f64 = 2459000.5;

fn photometry_table(event: &SyntheticEvent, from: f64, to: f64) -> String {
    let mut table = String::from("# time filter magnitude error\n");
    let mut jd = from;
    while jd <= to {
        // MJD in the first half, JD in the second
        let time = if jd < event.t0 { jd_to_mjd(jd) } else { jd };
        table.push_str(&format!("{time:.5} I {:.5} 0.01\n", event.magnitude(jd)));
        jd += 0.5;
    }
    table
}

fn ingest(store: &dyn Store) {
    let catalog = EventCatalog::from([
        ("OGLE-2020-BLG-0100".to_string(), (270.5, -28.0)),
        ("OGLE-2020-BLG-0200".to_string(), (268.14, -29.03)),
    ]);
    ingest_events(store, &catalog).unwrap();
    // idempotent
    assert_eq!(ingest_events(store, &catalog).unwrap().len(), 2);
    assert_eq!(store.find(&Default::default()).unwrap().len(), 2);

    let event = SyntheticEvent {
        t0: NOW - 2.0,
        u0: 0.05,
        te: 30.0,
        source_mag: 17.0,
        blend_mag: 18.0,
    };
    for name in catalog.keys() {
        let table = photometry_table(&event, NOW - 60.0, NOW - 0.25);
        let series = PhotometrySeries::from_table(name, "upload", &table).unwrap();
        assert!(ingest_series(store, name, &series).unwrap() > 100);
        assert_eq!(ingest_series(store, name, &series).unwrap(), 0);
    }
}

#[test]
fn test_fit_then_tap_pass() {
    let store = MemoryStore::new();
    ingest(&store);

    let fitter = ModelFitter::new(FitParams::builder().fit_parallax(false).build().unwrap()).unwrap();
    let clock = FixedClock(NOW);
    let queue = JobQueueCoordinator::new(&store, &fitter, &clock, 4.0).unwrap();
    queue.backfill_last_fit().unwrap();
    assert_eq!(queue.run().unwrap().fitted, 2);

    let oracle = VisibilityOracle::new(SiteRegistry::lco_network(), VisibilityParams::default());
    let scheduler = MemoryScheduler::new();
    let selector = StrategySelector::new(&store, &scheduler, &oracle, TapPolicy::default(), true);

    let report = selector.run(&TapSelection::AllAlive, NOW).unwrap();
    assert_eq!(report.evaluated, 2);
    assert_eq!(report.submitted, 2);

    let outside = store.get("OGLE-2020-BLG-0100").unwrap();
    assert_eq!(outside.extras.classification.as_deref(), Some(MICROLENSING));
    assert_eq!(outside.extras.sky_location, Some(SkyLocation::OutsideHcz));
    assert_eq!(outside.extras.observing_mode, Some(ObservingMode::PriorityStellarEvent));
    assert_eq!(outside.extras.category, Some(TimescaleCategory::StellarPlanet));
    assert!(outside.extras.planet_priority_error.unwrap() > 0.0);

    let inside = store.get("OGLE-2020-BLG-0200").unwrap();
    assert_eq!(inside.extras.sky_location, Some(SkyLocation::InHcz));
    assert_eq!(inside.extras.observing_mode, Some(ObservingMode::No));
    assert!(inside.extras.planet_priority.is_some());

    // a second pass on unchanged events requests nothing new
    let again = selector.run(&TapSelection::AllAlive, NOW + 0.1).unwrap();
    assert_eq!(again.submitted, 0);
    assert_eq!(again.duplicates, 2);
    let pending = scheduler.pending();
    assert_eq!(pending.len(), 2);
    assert_eq!(
        pending.iter().filter(|(_, c)| c.filter == "ip").count(),
        1,
        "exactly one request per filter"
    );
    assert_eq!(
        store
            .data("OGLE-2020-BLG-0100", Some(DataType::TapPriority))
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn test_liveness_and_priority_properties() {
    assert!(is_alive(2459100.0, Some(2459000.0), Some(50.0)));
    assert!(!is_alive(2459101.0, Some(2459000.0), Some(50.0)));
    assert!(!is_alive(2459000.0, Some(2459000.0), Some(0.0)));
    assert!(!is_alive(2459000.0, None, Some(20.0)));

    let peak = planet_priority(2459000.0, 2459000.0, 0.1, 20.0);
    for dt in [-10.0, -1.0, -0.1, 0.1, 1.0, 10.0] {
        assert!(planet_priority(2459000.0 + dt, 2459000.0, 0.1, 20.0) < peak);
    }
}
