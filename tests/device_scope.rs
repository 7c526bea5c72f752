mod common;

use common::{StubbornModel, linear_cohort};
use std::panic::AssertUnwindSafe;
use sundial::algo::device::{ComputeContext, Device, DeviceManager, DeviceMovable, Precision};
use sundial::algo::fit_algorithm;
use sundial::io::dataset::Dataset;
use sundial::models::lme::LmeModel;
use sundial::models::parameters::{ParameterValue, scalar};
use sundial::{AlgorithmSettings, Data, Error, Model, Progression};

fn small_dataset() -> Dataset {
    let (data, _) = linear_cohort(3, 3, 0.05, 2);
    Dataset::new(&data, None).unwrap()
}

#[test]
fn accelerator_runs_restore_devices_and_round_to_single_precision() {
    let (data, _) = linear_cohort(20, 5, 0.05, 13);
    let mut progression = Progression::new("lme").unwrap();
    let settings = AlgorithmSettings::new("lme_fit").unwrap().with_device("cuda:0");
    let fit = progression.fit(&data, &settings).unwrap();

    assert!(progression.model().device().is_default_type());
    assert_eq!(fit.noise_std, fit.noise_std as f32 as f64);
    for value in progression.model().parameters().values() {
        match value {
            ParameterValue::Scalar(v) => assert!(v.is_nan() || *v == *v as f32 as f64),
            ParameterValue::Vector(vs) => {
                assert!(vs.iter().all(|v| v.is_nan() || *v == *v as f32 as f64))
            }
            ParameterValue::Matrix(rows) => assert!(rows
                .iter()
                .flatten()
                .all(|v| v.is_nan() || *v == *v as f32 as f64)),
        }
    }

    let cpu = AlgorithmSettings::new("lme_fit").unwrap();
    let mut reference = Progression::new("lme").unwrap();
    reference.fit(&data, &cpu).unwrap();
    let mean = scalar(&reference.model().parameters(), "ages_mean").unwrap();
    assert_ne!(mean, mean as f32 as f64);
}

#[test]
fn failing_runs_still_restore_devices() {
    let mut data = Data::new(vec!["score".into()]).unwrap();
    data.add_individual("a", vec![(60.0, vec![0.1])]).unwrap();
    data.add_individual("b", vec![(60.0, vec![0.2])]).unwrap();
    let mut dataset = Dataset::new(&data, None).unwrap();
    let mut model = LmeModel::new();
    let settings = AlgorithmSettings::new("lme_fit").unwrap().with_device("cuda");
    let mut algorithm = fit_algorithm(&settings).unwrap();

    let err = algorithm.run(&mut model, &mut dataset).unwrap_err();
    assert!(err.is_input_error());
    assert!(model.device().is_default_type());
    assert!(dataset.device().is_default_type());
    assert!(!model.is_initialized());
}

#[test]
fn the_body_sees_the_target_context() {
    let mut model = StubbornModel::new(None);
    let mut dataset = small_dataset();
    let manager = DeviceManager::new("cuda:1".parse().unwrap());
    assert!(manager.requires_migration());

    let seen = manager
        .scope(&mut model, &mut dataset, |model, dataset, ctx| {
            assert_eq!(model.device().to_string(), "cuda:1");
            assert_eq!(dataset.device().to_string(), "cuda:1");
            Ok(ctx.clone())
        })
        .unwrap();
    assert_eq!(seen.precision, Precision::Float32);
    assert_eq!(model.moves, vec![Device::cuda(Some(1)), Device::cpu()]);
    assert_eq!(*dataset.device(), Device::cpu());

    let cpu_manager = DeviceManager::new(Device::cpu());
    let seen = cpu_manager
        .scope(&mut model, &mut dataset, |_, _, ctx| Ok(ctx.clone()))
        .unwrap();
    assert_eq!(seen, ComputeContext::default());
    assert_eq!(model.moves.len(), 2);
}

#[test]
fn a_failing_body_is_reported_after_restoration() {
    let mut model = StubbornModel::new(None);
    let mut dataset = small_dataset();
    let manager = DeviceManager::new(Device::cuda(None));
    let result: sundial::Result<()> = manager.scope(&mut model, &mut dataset, |_, _, _| {
        Err(Error::Numeric("diverged".into()))
    });
    assert!(matches!(result, Err(Error::Numeric(_))));
    assert!(model.device().is_default_type());
    assert!(dataset.device().is_default_type());
}

#[test]
fn a_panicking_body_still_restores_devices() {
    let mut model = StubbornModel::new(None);
    let mut dataset = small_dataset();
    let manager = DeviceManager::new(Device::cuda(None));
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let _: sundial::Result<()> = manager.scope(&mut model, &mut dataset, |_, _, _| {
            panic!("body blew up")
        });
    }));
    assert!(outcome.is_err());
    assert_eq!(model.moves, vec![Device::cuda(None), Device::cpu()]);
    assert!(model.device().is_default_type());
    assert!(dataset.device().is_default_type());
}

#[test]
fn nested_scopes_are_refused() {
    let mut model = StubbornModel::new(None);
    model.move_to_device(&Device::cuda(None)).unwrap();
    let mut dataset = small_dataset();
    let manager = DeviceManager::new(Device::cuda(None));
    let result = manager.scope(&mut model, &mut dataset, |_, _, _| Ok(()));
    assert!(matches!(result, Err(Error::Device(_))));
}

#[test]
fn failed_entry_migration_is_an_error() {
    let mut model = StubbornModel::new(Some(Device::cuda(None)));
    let mut dataset = small_dataset();
    let manager = DeviceManager::new(Device::cuda(None));
    let mut ran = false;
    let result = manager.scope(&mut model, &mut dataset, |_, _, _| {
        ran = true;
        Ok(())
    });
    assert!(matches!(result, Err(Error::Device(_))));
    assert!(!ran);
    assert!(model.device().is_default_type());
}

#[test]
#[should_panic(expected = "invariant violated")]
fn failed_restoration_panics() {
    let mut model = StubbornModel::new(Some(Device::cpu()));
    let mut dataset = small_dataset();
    let manager = DeviceManager::new(Device::cuda(None));
    let _ = manager.scope(&mut model, &mut dataset, |_, _, _| Ok(()));
}
