use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use simsweep_core::{
    consolidate, expand, plan, BaseDefaults, CaseId, CaseOutcome, CaseState,
    ConsolidatedStatusRegistry, Overrides, ParamValue, RegistryBuilder, NoopRenderer,
    StatusStore, SweepError, SweepRegistry, ValueSpec,
};

fn temp_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "simsweep_it_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&root).expect("temp dir");
    root
}

fn ldo_defaults() -> BaseDefaults {
    let mut base = BaseDefaults::new();
    base.insert("vdda".into(), ParamValue::Float(3.3));
    base.insert("temp".into(), ParamValue::Int(27));
    base.insert("iload".into(), ParamValue::Str("1m".into()));
    base
}

fn corner_sweep() -> Overrides {
    let mut sweep = Overrides::new();
    sweep.insert(
        "vdda".into(),
        ValueSpec::List(vec![ParamValue::Float(3.0), ParamValue::Float(3.3)]),
    );
    sweep.insert(
        "temp".into(),
        ValueSpec::List(vec![ParamValue::Int(-40), ParamValue::Int(25)]),
    );
    sweep
}

fn wide_sweep() -> Overrides {
    let mut sweep = corner_sweep();
    sweep.insert(
        "iload".into(),
        ValueSpec::List(vec!["1m".into(), "5m".into(), "10m".into()]),
    );
    sweep
}

#[test]
fn corner_scenario_assigns_ids_by_expansion_order() {
    let root = temp_root("corners");
    let cases = expand(&ldo_defaults(), &corner_sweep()).expect("expand");
    let registry = RegistryBuilder::new(root.join("corners"))
        .build(cases, &NoopRenderer)
        .expect("build");

    let reloaded = SweepRegistry::load(registry.location()).expect("load");
    assert_eq!(reloaded.len(), 4);
    let first = reloaded.get(CaseId(1)).expect("case 1");
    assert_eq!(first.assignment["vdda"], ParamValue::Float(3.0));
    assert_eq!(first.assignment["temp"], ParamValue::Int(-40));
    let last = reloaded.get(CaseId(4)).expect("case 4");
    assert_eq!(last.assignment["vdda"], ParamValue::Float(3.3));
    assert_eq!(last.assignment["temp"], ParamValue::Int(25));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn unknown_parameter_produces_no_registry() {
    let root = temp_root("closure");
    let mut sweep = corner_sweep();
    sweep.insert("vref".into(), ValueSpec::List(vec![ParamValue::Float(1.2)]));
    let err = expand(&ldo_defaults(), &sweep).expect_err("closed world");
    assert!(matches!(err, SweepError::Configuration { ref key, .. } if key == "vref"));
    assert!(fs::read_dir(&root).expect("list").next().is_none());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn parallel_workers_scatter_then_one_pass_gathers() {
    let root = temp_root("parallel");
    let cases = expand(&ldo_defaults(), &wide_sweep()).expect("expand");
    assert_eq!(cases.len(), 12);
    let registry = Arc::new(
        RegistryBuilder::new(root.join("wide"))
            .build(cases, &NoopRenderer)
            .expect("build"),
    );
    let todo = plan(&registry, None);
    assert_eq!(todo.len(), 12);

    // case 7's worker is killed before reporting; every third case fails
    let handles: Vec<_> = todo
        .into_iter()
        .filter(|id| *id != CaseId(7))
        .map(|id| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let store = StatusStore::new(registry.location());
                let case = registry.get(id).expect("planned case exists");
                let outcome = if id.0 % 3 == 0 {
                    CaseOutcome::Failed {
                        duration: Duration::from_millis(u64::from(id.0)),
                        error: format!("case {} did not converge", id),
                    }
                } else {
                    CaseOutcome::Completed {
                        duration: Duration::from_millis(u64::from(id.0)),
                    }
                };
                store.write_status(case, &outcome).expect("write status");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker");
    }

    let consolidated = consolidate(&registry).expect("consolidate");
    assert_eq!(consolidated.len(), registry.len());
    let ids: Vec<u32> = consolidated.statuses().iter().map(|s| s.case_id.0).collect();
    assert_eq!(ids, (1..=12).collect::<Vec<u32>>());
    assert_eq!(
        consolidated.get(CaseId(7)).expect("case 7").status,
        CaseState::Pending
    );

    let progress = consolidated.progress();
    assert_eq!(progress.total, 12);
    assert_eq!(progress.failed, 4);
    assert_eq!(progress.pending, 1);
    assert_eq!(progress.completed, 7);

    let loaded = ConsolidatedStatusRegistry::load(registry.location())
        .expect("load")
        .expect("present");
    let retry: Vec<u32> = plan(&registry, Some(&loaded)).iter().map(|c| c.0).collect();
    assert_eq!(retry, vec![3, 6, 7, 9, 12]);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn duplicate_assignment_resolves_to_one_whole_record() {
    let root = temp_root("duplicate");
    let cases = expand(&ldo_defaults(), &corner_sweep()).expect("expand");
    let registry = Arc::new(
        RegistryBuilder::new(root.join("dup"))
            .build(cases, &NoopRenderer)
            .expect("build"),
    );

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let store = StatusStore::new(registry.location());
                let case = registry.get(CaseId(2)).expect("case 2");
                for attempt in 0..20 {
                    let outcome = if (worker + attempt) % 2 == 0 {
                        CaseOutcome::Completed {
                            duration: Duration::from_millis(5),
                        }
                    } else {
                        CaseOutcome::Failed {
                            duration: Duration::from_millis(5),
                            error: format!("worker {worker} attempt {attempt}"),
                        }
                    };
                    store.write_status(case, &outcome).expect("write");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker");
    }

    let consolidated = consolidate(&registry).expect("consolidate");
    let row = consolidated.get(CaseId(2)).expect("row");
    assert!(row.note.is_none(), "record must parse cleanly: {:?}", row);
    assert_ne!(row.status, CaseState::Pending);
    let _ = fs::remove_dir_all(root);
}
