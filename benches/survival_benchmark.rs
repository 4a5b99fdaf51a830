use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nafld_survival::{CoxModel, KaplanMeier, SurvivalData, Ties};
use nafld_survival::logrank::{weighted_log_rank, Weighting};
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

fn generate_synthetic_data(n_samples: usize, n_features: usize) -> SurvivalData {
    let mut rng = StdRng::seed_from_u64(42);

    let mut covariates_vec = Vec::with_capacity(n_samples * n_features);
    for _ in 0..(n_samples * n_features) {
        covariates_vec.push(rng.gen_range(-2.0..2.0));
    }
    let covariates = Array2::from_shape_vec((n_samples, n_features), covariates_vec).unwrap();

    let mut times = Vec::with_capacity(n_samples);
    let mut events = Vec::with_capacity(n_samples);

    let true_coefficients = Array1::from(vec![0.5, -0.3, 0.2]);

    for i in 0..n_samples {
        let n_coef = n_features.min(3);
        let linear_pred: f64 = covariates.row(i).slice(ndarray::s![0..n_coef])
            .dot(&true_coefficients.slice(ndarray::s![0..n_coef]));

        // whole days, so tied event times show up the way they do in follow-up data
        let hazard = linear_pred.exp();
        let time = (-(1.0 - rng.r#gen::<f64>()).ln() / (0.001 * hazard)).ceil();
        let censoring_time = rng.gen_range(200.0..4000.0_f64).ceil();

        if time < censoring_time {
            times.push(time);
            events.push(true);
        } else {
            times.push(censoring_time);
            events.push(false);
        }
    }

    SurvivalData::new(times, events, covariates).unwrap()
}

fn benchmark_cox_fitting(c: &mut Criterion) {
    let mut group = c.benchmark_group("cox_fitting");

    for &n_samples in [500, 2000, 10000].iter() {
        for ties in [Ties::Breslow, Ties::Efron] {
            group.bench_with_input(
                BenchmarkId::from_parameter(format!("{}_{}", n_samples, ties)),
                &n_samples,
                |b, &n_samples| {
                    let data = generate_synthetic_data(n_samples, 3);
                    let model = CoxModel::new().with_ties(ties);
                    b.iter(|| model.max_loglik(black_box(&data)).unwrap());
                },
            );
        }
    }

    group.finish();
}

fn benchmark_kaplan_meier(c: &mut Criterion) {
    let mut group = c.benchmark_group("kaplan_meier");

    for &n_samples in [1000, 10000, 50000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(n_samples),
            &n_samples,
            |b, &n_samples| {
                let data = generate_synthetic_data(n_samples, 1);
                b.iter(|| KaplanMeier::new().fit_data(black_box(&data)).unwrap());
            },
        );
    }

    group.finish();
}

fn benchmark_log_rank(c: &mut Criterion) {
    let data = generate_synthetic_data(10000, 1);
    let times = data.times().to_vec();
    let events = data.events().to_vec();
    let labels: Vec<Option<u8>> = data
        .covariates()
        .column(0)
        .iter()
        .map(|&x| Some(if x < -1.0 { 0 } else if x < 1.0 { 1 } else { 2 }))
        .collect();

    c.bench_function("log_rank_3_strata", |b| {
        b.iter(|| {
            weighted_log_rank("x", black_box(&times), &events, &labels, Weighting::PetoPeto).unwrap()
        })
    });
}

criterion_group!(benches, benchmark_cox_fitting, benchmark_kaplan_meier, benchmark_log_rank);
criterion_main!(benches);
